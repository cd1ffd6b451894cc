//! The linearization point: current best-known value of every variable.

use std::collections::HashMap;

use nalgebra as na;

use crate::core::key::Key;
use crate::error::{SmootherError, SmootherResult};

/// Value assignment for a set of variables, keyed by [`Key`].
///
/// Values are stored as dense vectors; composing a value with a correction
/// (`theta ⊕ delta`) is vector addition. Measurement models that operate on
/// wrapped quantities (angles and the like) handle normalization inside
/// their residuals.
#[derive(Clone, Debug, Default)]
pub struct Values {
    values: HashMap<Key, na::DVector<f64>>,
}

impl Values {
    /// Create an empty value assignment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no variables are present.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether `key` has a value.
    pub fn contains(&self, key: Key) -> bool {
        self.values.contains_key(&key)
    }

    /// Insert a value for a new variable.
    ///
    /// Fails with `InvalidInput` if the variable already has a value.
    pub fn insert(&mut self, key: Key, value: na::DVector<f64>) -> SmootherResult<()> {
        if self.values.contains_key(&key) {
            return Err(SmootherError::InvalidInput(format!(
                "variable {key} already has a value"
            )));
        }
        self.values.insert(key, value);
        Ok(())
    }

    /// Overwrite the value of an existing variable.
    pub fn update(&mut self, key: Key, value: na::DVector<f64>) -> SmootherResult<()> {
        match self.values.get_mut(&key) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(SmootherError::InvalidInput(format!(
                "variable {key} has no value to update"
            ))),
        }
    }

    /// The value of `key`, if present.
    pub fn get(&self, key: Key) -> Option<&na::DVector<f64>> {
        self.values.get(&key)
    }

    /// Dimension of `key`'s value, if present.
    pub fn dim(&self, key: Key) -> Option<usize> {
        self.values.get(&key).map(|v| v.len())
    }

    /// Apply a correction to one variable in place: `value ← value + delta`.
    pub fn retract_in_place(&mut self, key: Key, delta: &na::DVector<f64>) -> SmootherResult<()> {
        let value = self.values.get_mut(&key).ok_or_else(|| {
            SmootherError::InvalidInput(format!("variable {key} has no value to retract"))
        })?;
        if value.len() != delta.len() {
            return Err(SmootherError::InvalidInput(format!(
                "correction dimension {} does not match variable {key} dimension {}",
                delta.len(),
                value.len()
            )));
        }
        *value += delta;
        Ok(())
    }

    /// Iterate over all (key, value) pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &na::DVector<f64>)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    /// All keys, sorted for deterministic iteration.
    pub fn sorted_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.values.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}
