//! The incremental update orchestrator and its configuration.
//!
//! [`IncrementalSmoother`] ties the pieces together: it consumes batches of
//! new factors and variables, decides what part of the elimination tree to
//! invalidate, relinearizes drifted variables, re-eliminates the affected
//! subgraph, and propagates the correction with wildfire-limited
//! backsubstitution.

use crate::core::key::Key;
use crate::core::ordering::Ordering;
use crate::core::variable_index::VariableIndex;

pub mod delta;
pub mod incremental;

pub use delta::Delta;
pub use incremental::IncrementalSmoother;

/// Configuration for the incremental smoother.
///
/// One immutable value passed at construction; there are no hidden global
/// defaults.
#[derive(Debug, Clone)]
pub struct SmootherParams {
    /// Continue propagating the linear correction during backsubstitution
    /// only while changes are above this magnitude.
    pub wildfire_threshold: f64,
    /// Relinearize a variable when the infinity norm of its correction
    /// exceeds this threshold.
    pub relinearize_threshold: f64,
    /// Check relinearization thresholds only every this many update calls.
    pub relinearize_skip: usize,
    /// Master switch for relinearization.
    pub enable_relinearization: bool,
    /// Evaluate the total nonlinear error before and after each update.
    /// Costs two full-graph error evaluations per call.
    pub evaluate_nonlinear_error: bool,
}

impl Default for SmootherParams {
    fn default() -> Self {
        Self {
            wildfire_threshold: 0.001,
            relinearize_threshold: 0.1,
            relinearize_skip: 10,
            enable_relinearization: true,
            evaluate_nonlinear_error: false,
        }
    }
}

impl SmootherParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the wildfire backsubstitution stop magnitude.
    pub fn with_wildfire_threshold(mut self, threshold: f64) -> Self {
        self.wildfire_threshold = threshold;
        self
    }

    /// Set the per-variable relinearization trigger.
    pub fn with_relinearize_threshold(mut self, threshold: f64) -> Self {
        self.relinearize_threshold = threshold;
        self
    }

    /// Set the relinearization check cadence in update calls.
    pub fn with_relinearize_skip(mut self, skip: usize) -> Self {
        self.relinearize_skip = skip;
        self
    }

    /// Enable or disable relinearization entirely.
    pub fn with_relinearization(mut self, enabled: bool) -> Self {
        self.enable_relinearization = enabled;
        self
    }

    /// Enable or disable nonlinear error evaluation in update results.
    pub fn with_error_evaluation(mut self, enabled: bool) -> Self {
        self.evaluate_nonlinear_error = enabled;
        self
    }
}

/// Report of the work performed by one update call.
///
/// The error fields are present only when
/// [`SmootherParams::evaluate_nonlinear_error`] is set; absence is distinct
/// from a computed value of zero.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    /// Total nonlinear error before the update, with new factors and
    /// variables already included at their initial values.
    pub error_before: Option<f64>,
    /// Total nonlinear error after relinearization and backsubstitution.
    pub error_after: Option<f64>,
    /// Variables whose linearization point was refreshed this call:
    /// corrections above threshold plus variables sharing a factor with one.
    pub variables_relinearized: usize,
    /// Variables re-eliminated while repairing the affected top of the tree.
    pub variables_reeliminated: usize,
}

/// Pluggable elimination-order heuristic for the affected variable subset.
///
/// Given the affected keys (in current position order), implementations
/// return the order in which to eliminate them. The result must be a
/// permutation of the input; the core makes no other assumption, so any
/// fill-reducing heuristic can be plugged in.
pub trait OrderingStrategy: Send + Sync {
    fn order(&self, affected: &[Key], index: &VariableIndex, ordering: &Ordering) -> Vec<Key>;
}

/// Default strategy: keep the affected variables in their current relative
/// order, which places newly added variables last.
#[derive(Debug, Clone, Default)]
pub struct NaturalOrdering;

impl OrderingStrategy for NaturalOrdering {
    fn order(&self, affected: &[Key], _index: &VariableIndex, _ordering: &Ordering) -> Vec<Key> {
        affected.to_vec()
    }
}
