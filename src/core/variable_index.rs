//! Variable-to-factor adjacency bookkeeping.

use std::collections::{BTreeSet, HashMap};

use crate::core::graph::FactorId;
use crate::core::key::Key;
use crate::error::{SmootherError, SmootherResult};

/// Per-variable index entry: tangent dimension and referencing factors.
#[derive(Clone, Debug)]
pub struct VariableEntry {
    dim: usize,
    factors: Vec<FactorId>,
}

impl VariableEntry {
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn factors(&self) -> &[FactorId] {
        &self.factors
    }
}

/// Maps each variable to its dimension and the set of factors that
/// reference it.
///
/// Grows incrementally as variables and factors are registered. Factors are
/// never removed by the core algorithm, only superseded inside the
/// elimination tree, so no removal operation exists here.
#[derive(Clone, Debug, Default)]
pub struct VariableIndex {
    entries: HashMap<Key, VariableEntry>,
}

impl VariableIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed variables.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.entries.contains_key(&key)
    }

    /// Register a new variable with an empty factor set.
    pub fn add_variable(&mut self, key: Key, dim: usize) -> SmootherResult<()> {
        if self.entries.contains_key(&key) {
            return Err(SmootherError::InvalidInput(format!(
                "variable {key} is already indexed"
            )));
        }
        self.entries.insert(
            key,
            VariableEntry {
                dim,
                factors: Vec::new(),
            },
        );
        Ok(())
    }

    /// Register a factor under every variable it touches.
    ///
    /// Fails with `InconsistentGraph` if the factor references a key that
    /// has not been registered.
    pub fn add_factor(&mut self, id: FactorId, keys: &[Key]) -> SmootherResult<()> {
        for key in keys {
            if !self.entries.contains_key(key) {
                return Err(SmootherError::InconsistentGraph(format!(
                    "factor {id} references unregistered variable {key}"
                )));
            }
        }
        for key in keys {
            let entry = self.entries.get_mut(key).ok_or_else(|| {
                SmootherError::InconsistentGraph(format!(
                    "factor {id} references unregistered variable {key}"
                ))
            })?;
            entry.factors.push(id);
        }
        Ok(())
    }

    /// Entry for `key`, if indexed.
    pub fn entry(&self, key: Key) -> Option<&VariableEntry> {
        self.entries.get(&key)
    }

    /// Tangent dimension of `key`, if indexed.
    pub fn dim(&self, key: Key) -> Option<usize> {
        self.entries.get(&key).map(|e| e.dim)
    }

    /// Ids of all factors referencing any of the given keys, deduplicated
    /// and sorted.
    pub fn factors_affecting<'a, I>(&self, keys: I) -> BTreeSet<FactorId>
    where
        I: IntoIterator<Item = &'a Key>,
    {
        let mut ids = BTreeSet::new();
        for key in keys {
            if let Some(entry) = self.entries.get(key) {
                ids.extend(entry.factors.iter().copied());
            }
        }
        ids
    }
}
