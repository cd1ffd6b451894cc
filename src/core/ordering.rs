//! Bidirectional mapping between symbolic keys and elimination positions.

use std::collections::HashMap;

use crate::core::key::Key;
use crate::error::{SmootherError, SmootherResult};

/// Maps every live variable to a compact integer elimination position and
/// back.
///
/// Positions form a dense gap-free range `0..len()`. The mapping grows only
/// by appending fresh positions for new variables; an update may locally
/// permute the positions of the re-eliminated subset, which preserves
/// bijectivity by construction.
#[derive(Clone, Debug, Default)]
pub struct Ordering {
    position_of: HashMap<Key, usize>,
    key_at: Vec<Key>,
}

impl Ordering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of variables in the ordering.
    pub fn len(&self) -> usize {
        self.key_at.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_at.is_empty()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.position_of.contains_key(&key)
    }

    /// Append a new variable at the next free position.
    pub fn push(&mut self, key: Key) -> SmootherResult<usize> {
        if self.position_of.contains_key(&key) {
            return Err(SmootherError::InvalidInput(format!(
                "variable {key} is already in the ordering"
            )));
        }
        let position = self.key_at.len();
        self.key_at.push(key);
        self.position_of.insert(key, position);
        Ok(position)
    }

    /// Position of `key`, if present.
    pub fn position(&self, key: Key) -> Option<usize> {
        self.position_of.get(&key).copied()
    }

    /// Key at `position`, if in range.
    pub fn key(&self, position: usize) -> Option<Key> {
        self.key_at.get(position).copied()
    }

    /// Reassign an ascending set of positions to the given keys, in order.
    ///
    /// `keys` must be exactly the keys currently occupying `positions` (in
    /// any order); the i-th key moves to the i-th position. Used to apply a
    /// fill-reducing elimination order to the affected subset without
    /// touching the rest of the ordering.
    pub fn permute_local(&mut self, positions: &[usize], keys: &[Key]) -> SmootherResult<()> {
        if positions.len() != keys.len() {
            return Err(SmootherError::InternalInvariantViolation(format!(
                "local permutation size mismatch: {} positions, {} keys",
                positions.len(),
                keys.len()
            )));
        }
        for (&position, &key) in positions.iter().zip(keys) {
            let old = self.position_of.get(&key).copied();
            match old {
                Some(old) if positions.binary_search(&old).is_ok() => {}
                _ => {
                    return Err(SmootherError::InternalInvariantViolation(format!(
                        "key {key} is not part of the permuted position set"
                    )));
                }
            }
            self.key_at[position] = key;
            self.position_of.insert(key, position);
        }
        debug_assert!(self.is_bijective());
        Ok(())
    }

    /// All keys in position order.
    pub fn keys(&self) -> &[Key] {
        &self.key_at
    }

    fn is_bijective(&self) -> bool {
        self.key_at.len() == self.position_of.len()
            && self
                .key_at
                .iter()
                .enumerate()
                .all(|(i, k)| self.position_of.get(k) == Some(&i))
    }
}
