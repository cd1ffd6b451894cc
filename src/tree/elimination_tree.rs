//! Incremental maintenance of the clique tree.

use std::collections::{BTreeSet, HashMap, HashSet};

use nalgebra as na;
use tracing::trace;

use crate::core::key::Key;
use crate::core::ordering::Ordering;
use crate::error::{SmootherError, SmootherResult};
use crate::linalg::eliminate::EliminationOutput;
use crate::tree::clique::{Clique, CliqueId};

/// Key-addressed access to correction vectors during backsubstitution.
///
/// Implemented by the smoother's permuted delta storage and, for scratch
/// solves, by a plain map.
pub trait DeltaStore {
    fn get(&self, key: Key) -> Option<&na::DVector<f64>>;
    fn set(&mut self, key: Key, value: na::DVector<f64>);
}

impl DeltaStore for HashMap<Key, na::DVector<f64>> {
    fn get(&self, key: Key) -> Option<&na::DVector<f64>> {
        HashMap::get(self, &key)
    }

    fn set(&mut self, key: Key, value: na::DVector<f64>) {
        self.insert(key, value);
    }
}

/// Outcome of a mark-and-cut pass.
pub struct RemovedTop {
    /// Frontal keys of every removed clique: the structural closure of the
    /// marked set.
    pub affected_keys: BTreeSet<Key>,
    /// Number of cliques removed.
    pub removed_cliques: usize,
    /// Still-valid subtrees detached from removed cliques, to be reattached
    /// after re-elimination.
    pub orphans: Vec<CliqueId>,
}

/// The persistent factorized representation: a forest of cliques over all
/// live variables.
///
/// Cliques are exclusively owned by the arena; parent links are plain ids
/// used for traversal, so no reference cycles can form. Frontal sets
/// partition the live variables: every variable belongs to exactly one
/// clique as a frontal.
#[derive(Default)]
pub struct EliminationTree {
    nodes: Vec<Option<Clique>>,
    free: Vec<CliqueId>,
    roots: Vec<CliqueId>,
    clique_of: HashMap<Key, CliqueId>,
}

impl EliminationTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live cliques.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all live cliques.
    pub fn ids(&self) -> impl Iterator<Item = CliqueId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(id, n)| n.as_ref().map(|_| id))
    }

    /// Root cliques of the forest.
    pub fn roots(&self) -> &[CliqueId] {
        &self.roots
    }

    pub fn clique(&self, id: CliqueId) -> Option<&Clique> {
        self.nodes.get(id).and_then(|n| n.as_ref())
    }

    /// The clique whose frontal set contains `key`.
    pub fn clique_containing(&self, key: Key) -> Option<CliqueId> {
        self.clique_of.get(&key).copied()
    }

    /// Cliques from `id` up to (and including) its root.
    pub fn path_to_root(&self, id: CliqueId) -> Vec<CliqueId> {
        let mut path = vec![id];
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            path.push(parent);
            current = parent;
        }
        path
    }

    fn node(&self, id: CliqueId) -> &Clique {
        self.nodes[id].as_ref().expect("stale clique id")
    }

    fn node_mut(&mut self, id: CliqueId) -> &mut Clique {
        self.nodes[id].as_mut().expect("stale clique id")
    }

    fn alloc(&mut self, clique: Clique) -> CliqueId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(clique);
                id
            }
            None => {
                self.nodes.push(Some(clique));
                self.nodes.len() - 1
            }
        }
    }

    /// Mark-and-cut: remove every clique containing a marked key plus all
    /// its ancestors, detaching still-valid child subtrees as orphans.
    ///
    /// Marked keys without a clique (variables not yet eliminated) are
    /// ignored. Orphans keep their cached boundary factors and must be
    /// reattached via [`Self::attach_orphans`] before the update completes.
    pub fn remove_top(&mut self, marked: &BTreeSet<Key>) -> RemovedTop {
        let mut affected: HashSet<CliqueId> = HashSet::new();
        for &key in marked {
            let Some(seed) = self.clique_of.get(&key).copied() else {
                continue;
            };
            let mut id = seed;
            // Everything on the path to the root depends transitively on
            // this clique and must be recomputed.
            while affected.insert(id) {
                match self.node(id).parent {
                    Some(parent) => id = parent,
                    None => break,
                }
            }
        }

        let mut orphans = Vec::new();
        let mut affected_keys = BTreeSet::new();
        for &id in &affected {
            for &child in self.node(id).children.iter() {
                if !affected.contains(&child) {
                    orphans.push(child);
                }
            }
        }
        for &id in &orphans {
            self.node_mut(id).parent = None;
        }
        for &id in &affected {
            let clique = self.nodes[id].take().expect("stale clique id");
            for &key in &clique.frontals {
                self.clique_of.remove(&key);
                affected_keys.insert(key);
            }
            self.free.push(id);
        }
        self.roots.retain(|id| !affected.contains(id));

        trace!(
            removed = affected.len(),
            orphans = orphans.len(),
            "cut affected top of the tree"
        );
        RemovedTop {
            affected_keys,
            removed_cliques: affected.len(),
            orphans,
        }
    }

    /// Insert the output of a partial elimination as new cliques.
    ///
    /// Conditionals are processed in reverse elimination order; a
    /// conditional is merged into the clique of its earliest-eliminated
    /// parent when its parent set is exactly that clique's variable set,
    /// otherwise it founds a child clique with its parents as separator.
    /// Returns the ids of the newly created cliques.
    pub fn add_eliminated(
        &mut self,
        output: EliminationOutput,
        ordering: &Ordering,
    ) -> SmootherResult<Vec<CliqueId>> {
        let EliminationOutput {
            conditionals,
            marginals,
        } = output;
        let mut created = Vec::new();

        let mut pairs: Vec<_> = conditionals.into_iter().zip(marginals).collect();
        while let Some((conditional, marginal)) = pairs.pop() {
            let key = conditional.key();
            if conditional.parents().is_empty() {
                let id = self.alloc(Clique {
                    frontals: vec![key],
                    separator: Vec::new(),
                    conditionals: vec![conditional],
                    cached: None,
                    parent: None,
                    children: Vec::new(),
                });
                self.roots.push(id);
                self.clique_of.insert(key, id);
                created.push(id);
                continue;
            }

            let parent_rep = conditional
                .parents()
                .iter()
                .copied()
                .min_by_key(|k| ordering.position(*k))
                .expect("parents checked non-empty");
            let parent_id = self.clique_of.get(&parent_rep).copied().ok_or_else(|| {
                SmootherError::InternalInvariantViolation(format!(
                    "conditional on {key} has parent {parent_rep} with no clique"
                ))
            })?;

            let parent = self.node(parent_id);
            let parent_size = parent.frontals.len() + parent.separator.len();
            let merge = conditional.parents().len() == parent_size
                && conditional.parents().iter().all(|&p| parent.involves(p));
            if merge {
                let clique = self.node_mut(parent_id);
                clique.frontals.insert(0, key);
                clique.conditionals.insert(0, conditional);
                self.clique_of.insert(key, parent_id);
            } else {
                let separator = conditional.parents().to_vec();
                let id = self.alloc(Clique {
                    frontals: vec![key],
                    separator,
                    conditionals: vec![conditional],
                    cached: marginal,
                    parent: Some(parent_id),
                    children: Vec::new(),
                });
                self.node_mut(parent_id).children.push(id);
                self.clique_of.insert(key, id);
                created.push(id);
            }
        }
        Ok(created)
    }

    /// Reattach orphaned subtrees below the freshly eliminated cliques.
    ///
    /// An orphan belongs under the clique whose variable set contains its
    /// entire separator; a miss means the marking or ordering logic broke a
    /// structural invariant.
    pub fn attach_orphans(
        &mut self,
        orphans: &[CliqueId],
        ordering: &Ordering,
    ) -> SmootherResult<()> {
        for &orphan in orphans {
            let separator = self.node(orphan).separator.clone();
            if separator.is_empty() {
                self.roots.push(orphan);
                continue;
            }
            let anchor = separator
                .iter()
                .copied()
                .min_by_key(|k| ordering.position(*k))
                .expect("separator checked non-empty");
            let parent_id = self.clique_of.get(&anchor).copied().ok_or_else(|| {
                SmootherError::InternalInvariantViolation(format!(
                    "orphan separator variable {anchor} has no clique after re-elimination"
                ))
            })?;
            let parent = self.node(parent_id);
            for &key in &separator {
                if !parent.involves(key) {
                    return Err(SmootherError::InternalInvariantViolation(format!(
                        "orphan separator variable {key} is not covered by its new parent clique"
                    )));
                }
            }
            self.node_mut(orphan).parent = Some(parent_id);
            self.node_mut(parent_id).children.push(orphan);
        }
        Ok(())
    }

    /// Propagate the new partial solution down from the freshly eliminated
    /// cliques, stopping where changes fall below `threshold`.
    ///
    /// New cliques are always resolved; descent below any clique continues
    /// only while that clique's own frontal-delta change exceeds the
    /// threshold. Returns the number of variables recomputed.
    pub fn backsub_wildfire(
        &self,
        new_cliques: &HashSet<CliqueId>,
        threshold: f64,
        delta: &mut dyn DeltaStore,
    ) -> SmootherResult<usize> {
        let mut count = 0;
        let mut stack: Vec<CliqueId> = self
            .roots
            .iter()
            .copied()
            .filter(|id| new_cliques.contains(id))
            .collect();
        while let Some(id) = stack.pop() {
            let clique = self.node(id);
            let mut max_change = 0.0_f64;
            for conditional in clique.conditionals.iter().rev() {
                let value = conditional.solve(|k| delta.get(k))?;
                let change = match delta.get(conditional.key()) {
                    Some(old) => (&value - old).amax(),
                    None => value.amax(),
                };
                max_change = max_change.max(change);
                delta.set(conditional.key(), value);
                count += 1;
            }
            for &child in &clique.children {
                if new_cliques.contains(&child) || max_change > threshold {
                    stack.push(child);
                }
            }
        }
        Ok(count)
    }

    /// Frontal keys of every clique that involves (as frontal or separator)
    /// any key in `mask`.
    ///
    /// Used when relinearizing: a factor touching a relinearized variable
    /// was incorporated in some clique that involves that variable, so all
    /// such cliques must be invalidated for their factors to be re-linearized
    /// at the updated point. One sweep suffices: a surviving clique cannot
    /// involve a masked variable anywhere in its subtree, because the clique
    /// holding that variable and all its ancestors are removed.
    pub fn frontals_of_involved_cliques(&self, mask: &BTreeSet<Key>) -> BTreeSet<Key> {
        let mut frontals = BTreeSet::new();
        for id in self.ids() {
            let clique = self.node(id);
            if clique.variables().any(|k| mask.contains(&k)) {
                frontals.extend(clique.frontals.iter().copied());
            }
        }
        frontals
    }

    /// Full top-to-bottom backsubstitution, ignoring any threshold.
    ///
    /// Solves every variable of the forest into a fresh map; the stored
    /// delta is untouched.
    pub fn solve_full(&self) -> SmootherResult<HashMap<Key, na::DVector<f64>>> {
        let mut solution: HashMap<Key, na::DVector<f64>> = HashMap::new();
        let mut stack: Vec<CliqueId> = self.roots.clone();
        while let Some(id) = stack.pop() {
            let clique = self.node(id);
            for conditional in clique.conditionals.iter().rev() {
                let value = conditional.solve(|k| solution.get(&k))?;
                solution.insert(conditional.key(), value);
            }
            stack.extend_from_slice(&clique.children);
        }
        Ok(solution)
    }

    /// Validate the structural invariants of the forest against the set of
    /// live variables. Used by tests and debug checks after every update.
    pub fn check_invariants(&self, live_keys: &BTreeSet<Key>) -> SmootherResult<()> {
        let mut seen_frontals: HashSet<Key> = HashSet::new();
        for id in self.ids() {
            let clique = self.node(id);
            for &key in &clique.frontals {
                if !seen_frontals.insert(key) {
                    return Err(SmootherError::InternalInvariantViolation(format!(
                        "variable {key} is frontal in more than one clique"
                    )));
                }
                if self.clique_of.get(&key) != Some(&id) {
                    return Err(SmootherError::InternalInvariantViolation(format!(
                        "clique lookup for {key} is stale"
                    )));
                }
            }
            match clique.parent {
                Some(parent_id) => {
                    let parent = self.node(parent_id);
                    if !parent.children.contains(&id) {
                        return Err(SmootherError::InternalInvariantViolation(
                            "parent link without matching child link".to_string(),
                        ));
                    }
                    for &key in &clique.separator {
                        if !parent.involves(key) {
                            return Err(SmootherError::InternalInvariantViolation(format!(
                                "separator variable {key} is not covered by the parent clique"
                            )));
                        }
                    }
                }
                None => {
                    if !self.roots.contains(&id) {
                        return Err(SmootherError::InternalInvariantViolation(
                            "parentless clique missing from the root list".to_string(),
                        ));
                    }
                }
            }
            for &child in &clique.children {
                if self.node(child).parent != Some(id) {
                    return Err(SmootherError::InternalInvariantViolation(
                        "child link without matching parent link".to_string(),
                    ));
                }
            }
        }
        if &seen_frontals.iter().copied().collect::<BTreeSet<_>>() != live_keys {
            return Err(SmootherError::InternalInvariantViolation(
                "clique frontals do not partition the live variable set".to_string(),
            ));
        }
        Ok(())
    }
}
