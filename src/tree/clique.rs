//! Elimination-tree nodes.

use crate::core::key::Key;
use crate::linalg::conditional::GaussianConditional;
use crate::linalg::factor::JacobianFactor;

/// Arena index of a clique. Ids are reused after a clique is destroyed, so
/// they must never be held across an update.
pub type CliqueId = usize;

/// A node of the elimination tree: a conditional density over the frontal
/// variables given the separator variables.
///
/// A clique is owned by the tree arena; the parent field is a non-owning
/// back-reference used for upward traversal only.
#[derive(Debug)]
pub struct Clique {
    /// Frontal variables, in elimination order.
    pub(crate) frontals: Vec<Key>,
    /// Separator variables, shared with the parent.
    pub(crate) separator: Vec<Key>,
    /// One conditional per frontal, parallel to `frontals`.
    pub(crate) conditionals: Vec<GaussianConditional>,
    /// Marginal on the separator summarizing everything in this subtree;
    /// reused as the boundary factor when the subtree is orphaned.
    pub(crate) cached: Option<JacobianFactor>,
    pub(crate) parent: Option<CliqueId>,
    pub(crate) children: Vec<CliqueId>,
}

impl Clique {
    pub fn frontals(&self) -> &[Key] {
        &self.frontals
    }

    pub fn separator(&self) -> &[Key] {
        &self.separator
    }

    pub fn conditionals(&self) -> &[GaussianConditional] {
        &self.conditionals
    }

    /// The cached boundary factor over the separator, if any.
    pub fn cached_factor(&self) -> Option<&JacobianFactor> {
        self.cached.as_ref()
    }

    pub fn parent(&self) -> Option<CliqueId> {
        self.parent
    }

    pub fn children(&self) -> &[CliqueId] {
        &self.children
    }

    /// Whether `key` is one of this clique's frontal variables.
    pub fn is_frontal(&self, key: Key) -> bool {
        self.frontals.contains(&key)
    }

    /// Whether `key` appears anywhere in the clique (frontal or separator).
    pub fn involves(&self, key: Key) -> bool {
        self.frontals.contains(&key) || self.separator.contains(&key)
    }

    /// Frontal and separator variables together.
    pub fn variables(&self) -> impl Iterator<Item = Key> + '_ {
        self.frontals
            .iter()
            .chain(self.separator.iter())
            .copied()
    }
}
