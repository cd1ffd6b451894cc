//! Permuted storage for the linear correction vector.

use nalgebra as na;

use crate::core::key::Key;
use crate::core::ordering::Ordering;
use crate::tree::DeltaStore;

/// The as-yet-unapplied linear correction for every variable, indexed by
/// ordering position through an explicit permutation.
///
/// Corrections live in a flat slot arena; a position-to-slot table is the
/// only thing rewritten when the ordering is locally permuted, so reordering
/// never moves vector data.
#[derive(Clone, Debug, Default)]
pub struct Delta {
    slots: Vec<na::DVector<f64>>,
    slot_of: Vec<usize>,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of variables with a correction entry.
    pub fn len(&self) -> usize {
        self.slot_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slot_of.is_empty()
    }

    /// Append a zero entry of the given dimension for a newly added
    /// variable; its correction stays zero until the variable's clique has
    /// been eliminated.
    pub fn push(&mut self, dim: usize) {
        self.slots.push(na::DVector::zeros(dim));
        self.slot_of.push(self.slots.len() - 1);
    }

    /// Correction at an ordering position.
    pub fn get(&self, position: usize) -> &na::DVector<f64> {
        &self.slots[self.slot_of[position]]
    }

    /// Overwrite the correction at an ordering position.
    pub fn set(&mut self, position: usize, value: na::DVector<f64>) {
        let slot = self.slot_of[position];
        debug_assert_eq!(self.slots[slot].len(), value.len());
        self.slots[slot] = value;
    }

    /// Reset the correction at an ordering position to zero, preserving its
    /// dimension. Done exactly when the variable is relinearized.
    pub fn zero(&mut self, position: usize) {
        let slot = self.slot_of[position];
        self.slots[slot].fill(0.0);
    }

    /// Infinity norm of the correction at an ordering position.
    pub fn max_abs(&self, position: usize) -> f64 {
        self.get(position).amax()
    }

    /// Rewire the permutation after a local reordering: the entry that was
    /// at `source_positions[i]` is now addressed by `positions[i]`. Slot
    /// data does not move.
    pub fn permute_local(&mut self, positions: &[usize], source_positions: &[usize]) {
        debug_assert_eq!(positions.len(), source_positions.len());
        let moved: Vec<usize> = source_positions.iter().map(|&p| self.slot_of[p]).collect();
        for (&position, slot) in positions.iter().zip(moved) {
            self.slot_of[position] = slot;
        }
    }
}

/// Key-addressed view of a [`Delta`] through an [`Ordering`], used during
/// backsubstitution.
pub struct PermutedDelta<'a> {
    delta: &'a mut Delta,
    ordering: &'a Ordering,
}

impl<'a> PermutedDelta<'a> {
    pub fn new(delta: &'a mut Delta, ordering: &'a Ordering) -> Self {
        PermutedDelta { delta, ordering }
    }
}

impl DeltaStore for PermutedDelta<'_> {
    fn get(&self, key: Key) -> Option<&na::DVector<f64>> {
        self.ordering.position(key).map(|p| self.delta.get(p))
    }

    fn set(&mut self, key: Key, value: na::DVector<f64>) {
        let position = self
            .ordering
            .position(key)
            .expect("backsubstitution wrote a key outside the ordering");
        self.delta.set(position, value);
    }
}
