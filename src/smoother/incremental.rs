//! The incremental update orchestrator.

use std::collections::{BTreeSet, HashSet};

use nalgebra as na;
use tracing::debug;

use crate::core::factors::NonlinearFactor;
use crate::core::graph::{FactorId, NonlinearFactorGraph};
use crate::core::key::Key;
use crate::core::ordering::Ordering;
use crate::core::values::Values;
use crate::core::variable_index::VariableIndex;
use crate::error::{SmootherError, SmootherResult};
use crate::linalg::eliminate::eliminate_partial;
use crate::smoother::delta::{Delta, PermutedDelta};
use crate::smoother::{NaturalOrdering, OrderingStrategy, SmootherParams, UpdateResult};
use crate::tree::elimination_tree::EliminationTree;

/// Incrementally maintained solution of a growing nonlinear least-squares
/// problem.
///
/// One update call runs the full cycle synchronously: register inputs, mark
/// the invalidated region, cut and re-eliminate the affected top of the
/// tree, relinearize drifted variables, and propagate the correction. All
/// state is exclusively owned here; `update` takes `&mut self`, the estimate
/// readers take `&self`, and callers sharing an instance across threads must
/// serialize access themselves.
pub struct IncrementalSmoother {
    params: SmootherParams,
    ordering_strategy: Box<dyn OrderingStrategy>,
    /// Current linearization point of every variable.
    theta: Values,
    ordering: Ordering,
    variable_index: VariableIndex,
    /// All nonlinear factors ever added, kept for relinearization.
    factors: NonlinearFactorGraph,
    tree: EliminationTree,
    delta: Delta,
    update_count: usize,
    last_affected_variable_count: usize,
    last_affected_factor_count: usize,
    last_affected_clique_count: usize,
    last_affected_marked_count: usize,
    last_backsub_variable_count: usize,
    last_nnz_top: usize,
}

impl Default for IncrementalSmoother {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalSmoother {
    /// Create an empty smoother with default parameters.
    pub fn new() -> Self {
        Self::with_params(SmootherParams::default())
    }

    /// Create an empty smoother with the given parameters.
    pub fn with_params(params: SmootherParams) -> Self {
        IncrementalSmoother {
            params,
            ordering_strategy: Box::new(NaturalOrdering),
            theta: Values::new(),
            ordering: Ordering::new(),
            variable_index: VariableIndex::new(),
            factors: NonlinearFactorGraph::new(),
            tree: EliminationTree::new(),
            delta: Delta::new(),
            update_count: 0,
            last_affected_variable_count: 0,
            last_affected_factor_count: 0,
            last_affected_clique_count: 0,
            last_affected_marked_count: 0,
            last_backsub_variable_count: 0,
            last_nnz_top: 0,
        }
    }

    /// Replace the elimination-order heuristic for affected subsets.
    pub fn with_ordering_strategy(mut self, strategy: Box<dyn OrderingStrategy>) -> Self {
        self.ordering_strategy = strategy;
        self
    }

    /// Add new factors and variables, updating the solution incrementally.
    ///
    /// `new_values` must contain exactly the variables referenced by
    /// `new_factors` that are not already in the system; any mismatch fails
    /// with `InvalidInput` before the smoother is touched. With
    /// `force_relinearize`, drifted variables are relinearized regardless of
    /// the configured cadence.
    pub fn update(
        &mut self,
        new_factors: Vec<Box<dyn NonlinearFactor>>,
        new_values: &Values,
        force_relinearize: bool,
    ) -> SmootherResult<UpdateResult> {
        self.validate_inputs(&new_factors, new_values)?;
        self.update_count += 1;

        // Register inputs: factors into the retained graph, variables into
        // ordering, linearization point, index, and delta.
        let new_factor_keys: Vec<Vec<Key>> =
            new_factors.iter().map(|f| f.keys().to_vec()).collect();
        let mut new_factor_ids = Vec::with_capacity(new_factors.len());
        for factor in new_factors {
            new_factor_ids.push(self.factors.push(factor));
        }
        for key in new_values.sorted_keys() {
            let value = new_values
                .get(key)
                .cloned()
                .ok_or_else(|| SmootherError::InvalidInput(format!("missing value for {key}")))?;
            self.ordering.push(key)?;
            self.variable_index.add_variable(key, value.len())?;
            self.delta.push(value.len());
            self.theta.insert(key, value)?;
        }
        for (id, keys) in new_factor_ids.iter().zip(&new_factor_keys) {
            self.variable_index.add_factor(*id, keys)?;
        }

        let error_before = if self.params.evaluate_nonlinear_error {
            Some(self.factors.error(&self.calculate_estimate()?)?)
        } else {
            None
        };

        // Mark: variables touched by new factors, plus relinearization
        // candidates on eligible calls.
        let mut marked: BTreeSet<Key> = new_factor_keys.iter().flatten().copied().collect();
        let skip = self.params.relinearize_skip.max(1);
        let relinearize_now = self.params.enable_relinearization
            && (force_relinearize || self.update_count % skip == 0);
        let mut fold_keys: BTreeSet<Key> = BTreeSet::new();
        if relinearize_now {
            let mut relin_keys: BTreeSet<Key> = BTreeSet::new();
            for position in 0..self.ordering.len() {
                if self.delta.max_abs(position) > self.params.relinearize_threshold {
                    if let Some(key) = self.ordering.key(position) {
                        relin_keys.insert(key);
                    }
                }
            }
            // A refreshed linearization point invalidates every factor
            // touching the variable, so the variables sharing those factors
            // are relinearized with it, and every clique incorporating one
            // of those factors is invalidated.
            fold_keys = relin_keys.clone();
            if !relin_keys.is_empty() {
                for id in self.variable_index.factors_affecting(relin_keys.iter()) {
                    if let Some(factor) = self.factors.get(id) {
                        fold_keys.extend(factor.keys().iter().copied());
                    }
                }
                marked.extend(self.tree.frontals_of_involved_cliques(&fold_keys));
                marked.extend(fold_keys.iter().copied());
            }
        }
        self.last_affected_marked_count = marked.len();

        if marked.is_empty() {
            return self.finish_noop(error_before);
        }

        // Cut the invalidated top out of the tree; the frontal closure of
        // the removed cliques joins the affected set.
        let removed = self.tree.remove_top(&marked);
        let mut affected = removed.affected_keys.clone();
        affected.extend(marked.iter().copied());
        self.last_affected_clique_count = removed.removed_cliques;
        self.last_affected_variable_count = affected.len();

        // Relinearize: fold accumulated corrections into the linearization
        // point and reset them.
        for &key in &fold_keys {
            let position = self.ordering.position(key).ok_or_else(|| {
                SmootherError::InternalInvariantViolation(format!(
                    "relinearization candidate {key} has no ordering position"
                ))
            })?;
            let correction = self.delta.get(position).clone();
            self.theta.retract_in_place(key, &correction)?;
            self.delta.zero(position);
        }

        // Gather the affected linear system: factors fully inside the
        // affected set re-linearized at the current point (this includes the
        // new factors), plus the cached boundary factors of the orphans.
        let candidate_ids = self.variable_index.factors_affecting(affected.iter());
        let inside_ids: Vec<FactorId> = candidate_ids
            .into_iter()
            .filter(|&id| {
                self.factors
                    .get(id)
                    .map(|f| f.keys().iter().all(|k| affected.contains(k)))
                    .unwrap_or(false)
            })
            .collect();
        let mut linear = self.factors.linearize_subset(&inside_ids, &self.theta)?;
        self.last_affected_factor_count = inside_ids.len();
        for &orphan in &removed.orphans {
            let cached = self
                .tree
                .clique(orphan)
                .and_then(|c| c.cached_factor())
                .ok_or_else(|| {
                    SmootherError::InternalInvariantViolation(
                        "orphaned subtree has no cached boundary factor".to_string(),
                    )
                })?;
            linear.push(cached.clone());
        }

        // Choose an elimination order for the affected subset and apply it
        // as a local permutation of positions; delta slots follow their keys
        // through the permutation table.
        let mut affected_vec: Vec<Key> = affected.iter().copied().collect();
        affected_vec.sort_by_key(|k| self.ordering.position(*k));
        let positions = self.positions_of(&affected_vec)?;
        let elim_order =
            self.ordering_strategy
                .order(&affected_vec, &self.variable_index, &self.ordering);
        let order_set: BTreeSet<Key> = elim_order.iter().copied().collect();
        if elim_order.len() != affected_vec.len() || order_set != affected {
            return Err(SmootherError::InternalInvariantViolation(
                "ordering strategy did not return a permutation of the affected variables"
                    .to_string(),
            ));
        }
        let source_positions = self.positions_of(&elim_order)?;
        self.ordering.permute_local(&positions, &elim_order)?;
        self.delta.permute_local(&positions, &source_positions);

        // Re-eliminate and splice the new cliques back in.
        let output = eliminate_partial(linear, &elim_order, &self.ordering)?;
        self.last_nnz_top = output.conditionals.iter().map(|c| c.nnz()).sum();
        let created = self.tree.add_eliminated(output, &self.ordering)?;
        self.tree.attach_orphans(&removed.orphans, &self.ordering)?;

        // Propagate the new partial solution, stopping at the wildfire
        // frontier.
        let new_set: HashSet<usize> = created.iter().copied().collect();
        let mut view = PermutedDelta::new(&mut self.delta, &self.ordering);
        self.last_backsub_variable_count =
            self.tree
                .backsub_wildfire(&new_set, self.params.wildfire_threshold, &mut view)?;

        if cfg!(debug_assertions) {
            let live: BTreeSet<Key> = self.ordering.keys().iter().copied().collect();
            self.tree.check_invariants(&live)?;
        }

        let error_after = if self.params.evaluate_nonlinear_error {
            Some(self.factors.error(&self.calculate_estimate()?)?)
        } else {
            None
        };

        debug!(
            update = self.update_count,
            marked = self.last_affected_marked_count,
            affected = self.last_affected_variable_count,
            relinearized = fold_keys.len(),
            cliques_removed = self.last_affected_clique_count,
            backsubstituted = self.last_backsub_variable_count,
            "incremental update"
        );

        Ok(UpdateResult {
            error_before,
            error_after,
            variables_relinearized: fold_keys.len(),
            variables_reeliminated: affected.len(),
        })
    }

    /// Finish an update that touched nothing.
    fn finish_noop(&mut self, error_before: Option<f64>) -> SmootherResult<UpdateResult> {
        self.last_affected_variable_count = 0;
        self.last_affected_factor_count = 0;
        self.last_affected_clique_count = 0;
        self.last_backsub_variable_count = 0;
        self.last_nnz_top = 0;
        let error_after = if self.params.evaluate_nonlinear_error {
            Some(self.factors.error(&self.calculate_estimate()?)?)
        } else {
            None
        };
        debug!(update = self.update_count, "no-op incremental update");
        Ok(UpdateResult {
            error_before,
            error_after,
            variables_relinearized: 0,
            variables_reeliminated: 0,
        })
    }

    fn positions_of(&self, keys: &[Key]) -> SmootherResult<Vec<usize>> {
        keys.iter()
            .map(|k| {
                self.ordering.position(*k).ok_or_else(|| {
                    SmootherError::InternalInvariantViolation(format!(
                        "affected variable {k} has no ordering position"
                    ))
                })
            })
            .collect()
    }

    /// Validate the caller contract before touching any state.
    fn validate_inputs(
        &self,
        new_factors: &[Box<dyn NonlinearFactor>],
        new_values: &Values,
    ) -> SmootherResult<()> {
        for (key, _) in new_values.iter() {
            if self.theta.contains(key) {
                return Err(SmootherError::InvalidInput(format!(
                    "variable {key} is already part of the system"
                )));
            }
        }
        let mut referenced: BTreeSet<Key> = BTreeSet::new();
        for factor in new_factors {
            let keys = factor.keys();
            if keys.is_empty() {
                return Err(SmootherError::InvalidInput(
                    "factor touches no variables".to_string(),
                ));
            }
            let mut seen: BTreeSet<Key> = BTreeSet::new();
            for &key in keys {
                if !seen.insert(key) {
                    return Err(SmootherError::InvalidInput(format!(
                        "factor references variable {key} more than once"
                    )));
                }
                if !self.theta.contains(key) && !new_values.contains(key) {
                    return Err(SmootherError::InvalidInput(format!(
                        "factor references unknown variable {key}"
                    )));
                }
                referenced.insert(key);
            }
        }
        for (key, _) in new_values.iter() {
            if !referenced.contains(&key) {
                return Err(SmootherError::InvalidInput(format!(
                    "new variable {key} is not referenced by any new factor"
                )));
            }
        }
        Ok(())
    }

    /// The current linearization point.
    pub fn linearization_point(&self) -> &Values {
        &self.theta
    }

    /// The current estimate of all variables, using the possibly
    /// wildfire-stale correction from the last update.
    pub fn calculate_estimate(&self) -> SmootherResult<Values> {
        let mut estimate = self.theta.clone();
        for (position, key) in self.ordering.keys().iter().enumerate() {
            estimate.retract_in_place(*key, self.delta.get(position))?;
        }
        Ok(estimate)
    }

    /// The current estimate of a single variable. Cheaper than
    /// [`Self::calculate_estimate`]; reads the same possibly-stale
    /// correction.
    pub fn calculate_estimate_for(&self, key: Key) -> SmootherResult<na::DVector<f64>> {
        let value = self.theta.get(key).ok_or_else(|| {
            SmootherError::InvalidInput(format!("unknown variable {key}"))
        })?;
        let position = self.ordering.position(key).ok_or_else(|| {
            SmootherError::InternalInvariantViolation(format!("variable {key} has no position"))
        })?;
        Ok(value + self.delta.get(position))
    }

    /// The exact solution of the last-eliminated linear system: a full
    /// top-to-bottom backsubstitution ignoring the wildfire threshold,
    /// combined with the linearization point. Stored state is untouched.
    pub fn calculate_best_estimate(&self) -> SmootherResult<Values> {
        let full = self.tree.solve_full()?;
        let mut estimate = self.theta.clone();
        for (key, correction) in &full {
            estimate.retract_in_place(*key, correction)?;
        }
        Ok(estimate)
    }

    /// The correction entry of one variable, if the variable exists.
    pub fn delta_entry(&self, key: Key) -> Option<&na::DVector<f64>> {
        self.ordering.position(key).map(|p| self.delta.get(p))
    }

    /// The correction vector from the last update.
    pub fn delta(&self) -> &Delta {
        &self.delta
    }

    /// The current elimination ordering.
    pub fn ordering(&self) -> &Ordering {
        &self.ordering
    }

    /// The retained nonlinear factors.
    pub fn factors(&self) -> &NonlinearFactorGraph {
        &self.factors
    }

    /// The elimination tree.
    pub fn tree(&self) -> &EliminationTree {
        &self.tree
    }

    /// The configuration this smoother was constructed with.
    pub fn params(&self) -> &SmootherParams {
        &self.params
    }

    /// Number of update calls so far.
    pub fn update_count(&self) -> usize {
        self.update_count
    }

    /// Number of live variables.
    pub fn len(&self) -> usize {
        self.ordering.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordering.is_empty()
    }

    /// Variables in the affected closure of the last update.
    pub fn last_affected_variable_count(&self) -> usize {
        self.last_affected_variable_count
    }

    /// Factors re-linearized during the last update.
    pub fn last_affected_factor_count(&self) -> usize {
        self.last_affected_factor_count
    }

    /// Cliques removed during the last update.
    pub fn last_affected_clique_count(&self) -> usize {
        self.last_affected_clique_count
    }

    /// Marked variables at the start of the last update.
    pub fn last_affected_marked_count(&self) -> usize {
        self.last_affected_marked_count
    }

    /// Variables recomputed by backsubstitution during the last update.
    pub fn last_backsub_variable_count(&self) -> usize {
        self.last_backsub_variable_count
    }

    /// Structural nonzeros of the re-eliminated top of the system.
    pub fn last_nnz_top(&self) -> usize {
        self.last_nnz_top
    }
}
