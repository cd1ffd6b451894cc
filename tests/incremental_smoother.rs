//! End-to-end tests of the incremental smoother: update scenarios,
//! wildfire/relinearization behavior, and structural invariants.

use std::collections::BTreeSet;

use nalgebra::{dvector, DMatrix, DVector};

use apex_smoother::core::factors::{BetweenFactor, BetweenFactorSE2, NonlinearFactor, PriorFactor};
use apex_smoother::core::key::Key;
use apex_smoother::core::noise::DiagonalNoise;
use apex_smoother::core::ordering::Ordering;
use apex_smoother::core::values::Values;
use apex_smoother::core::variable_index::VariableIndex;
use apex_smoother::smoother::{IncrementalSmoother, OrderingStrategy, SmootherParams};
use apex_smoother::SmootherError;

fn x(i: u64) -> Key {
    Key::symbol('x', i)
}

fn check_tree(smoother: &IncrementalSmoother) {
    let live: BTreeSet<Key> = smoother.ordering().keys().iter().copied().collect();
    smoother.tree().check_invariants(&live).unwrap();
}

fn assert_values_close(a: &Values, b: &Values, tolerance: f64) {
    assert_eq!(a.len(), b.len());
    for (key, value) in a.iter() {
        let other = b.get(key).unwrap();
        assert!(
            (value - other).norm() <= tolerance,
            "variable {key} differs: {value} vs {other}"
        );
    }
}

/// A single two-row factor anchoring one scalar variable and constraining a
/// second relative to it.
struct AnchoredOffsetFactor {
    keys: [Key; 2],
    anchor: f64,
    offset: f64,
}

impl NonlinearFactor for AnchoredOffsetFactor {
    fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn dim(&self) -> usize {
        2
    }

    fn residual_with_jacobian(&self, params: &[DVector<f64>]) -> (DVector<f64>, DMatrix<f64>) {
        let a = params[0][0];
        let b = params[1][0];
        let residual = dvector![a - self.anchor, b - a - self.offset];
        let mut jacobian = DMatrix::zeros(2, 2);
        jacobian[(0, 0)] = 1.0;
        jacobian[(1, 0)] = -1.0;
        jacobian[(1, 1)] = 1.0;
        (residual, jacobian)
    }
}

/// Eliminate the affected subset in reverse position order; exercises the
/// local-permutation path of ordering and delta.
struct ReverseOrdering;

impl OrderingStrategy for ReverseOrdering {
    fn order(&self, affected: &[Key], _index: &VariableIndex, _ordering: &Ordering) -> Vec<Key> {
        let mut order = affected.to_vec();
        order.reverse();
        order
    }
}

/// Measurements of a five-pose planar trajectory with a prior on the first
/// pose, plus deliberately imperfect initial values.
fn se2_chain() -> (Vec<Box<dyn NonlinearFactor>>, Values) {
    let noise = || DiagonalNoise::isotropic(3, 0.1);
    let factors: Vec<Box<dyn NonlinearFactor>> = vec![
        Box::new(PriorFactor::new(x(0), dvector![0.0, 0.0, 0.0]).with_noise(noise())),
        Box::new(BetweenFactorSE2::new(x(0), x(1), 1.0, 0.0, 0.3).with_noise(noise())),
        Box::new(BetweenFactorSE2::new(x(1), x(2), 1.0, 0.0, 0.3).with_noise(noise())),
        Box::new(BetweenFactorSE2::new(x(2), x(3), 1.0, 0.0, 0.3).with_noise(noise())),
        Box::new(BetweenFactorSE2::new(x(3), x(4), 1.0, 0.0, 0.3).with_noise(noise())),
    ];
    let initials = [
        dvector![0.02, -0.01, 0.01],
        dvector![1.05, 0.08, 0.33],
        dvector![1.98, 0.52, 0.58],
        dvector![2.80, 1.15, 0.93],
        dvector![3.35, 1.95, 1.22],
    ];
    let mut values = Values::new();
    for (i, initial) in initials.iter().enumerate() {
        values.insert(x(i as u64), initial.clone()).unwrap();
    }
    (factors, values)
}

/// Feed the chain one pose at a time. Returns the per-update counts of
/// relinearized variables.
fn run_chain_incrementally(smoother: &mut IncrementalSmoother, force_relin: bool) -> Vec<usize> {
    let (factors, values) = se2_chain();
    let mut relinearized = Vec::new();
    for (i, factor) in factors.into_iter().enumerate() {
        let mut step = Values::new();
        // Factor i introduces pose i (the prior brings x0, each between
        // brings its second endpoint).
        let key = x(i as u64);
        step.insert(key, values.get(key).unwrap().clone()).unwrap();
        let result = smoother.update(vec![factor], &step, force_relin).unwrap();
        relinearized.push(result.variables_relinearized);
        check_tree(smoother);
    }
    relinearized
}

#[test]
fn test_noop_update_changes_nothing() {
    let mut smoother = IncrementalSmoother::new();
    run_chain_incrementally(&mut smoother, false);

    let estimate = smoother.calculate_estimate().unwrap();
    let theta = smoother.linearization_point().clone();
    let ordering_len = smoother.ordering().len();
    let cliques = smoother.tree().len();

    let result = smoother.update(vec![], &Values::new(), false).unwrap();
    assert_eq!(result.variables_relinearized, 0);
    assert_eq!(result.variables_reeliminated, 0);
    assert_eq!(smoother.last_affected_variable_count(), 0);
    assert_eq!(smoother.last_backsub_variable_count(), 0);

    assert_values_close(&smoother.calculate_estimate().unwrap(), &estimate, 0.0);
    assert_values_close(smoother.linearization_point(), &theta, 0.0);
    assert_eq!(smoother.ordering().len(), ordering_len);
    assert_eq!(smoother.tree().len(), cliques);
}

#[test]
fn test_wildfire_zero_threshold_is_exact() {
    let params = SmootherParams::new().with_wildfire_threshold(0.0);
    let mut smoother = IncrementalSmoother::with_params(params);
    run_chain_incrementally(&mut smoother, false);

    let estimate = smoother.calculate_estimate().unwrap();
    let best = smoother.calculate_best_estimate().unwrap();
    // Full propagation is forced, so the stored delta already is the exact
    // solution of the last linear system.
    assert_values_close(&estimate, &best, 0.0);
}

#[test]
fn test_wildfire_threshold_limits_backsubstitution() {
    let exact = {
        let params = SmootherParams::new().with_wildfire_threshold(0.0);
        let mut smoother = IncrementalSmoother::with_params(params);
        run_chain_incrementally(&mut smoother, false);
        smoother
    };
    let lazy = {
        let params = SmootherParams::new().with_wildfire_threshold(1e6);
        let mut smoother = IncrementalSmoother::with_params(params);
        run_chain_incrementally(&mut smoother, false);
        smoother
    };
    // A huge threshold stops propagation at the freshly eliminated cliques.
    assert!(lazy.last_backsub_variable_count() <= exact.last_backsub_variable_count());
    // The stale delta is repaired by an explicit full backsubstitution.
    assert_values_close(
        &lazy.calculate_best_estimate().unwrap(),
        &exact.calculate_best_estimate().unwrap(),
        1e-8,
    );
}

#[test]
fn test_relinearization_monotonicity() {
    let totals: Vec<usize> = [0.5, 0.01]
        .iter()
        .map(|&threshold| {
            let params = SmootherParams::new().with_relinearize_threshold(threshold);
            let mut smoother = IncrementalSmoother::with_params(params);
            run_chain_incrementally(&mut smoother, true).iter().sum()
        })
        .collect();
    // Lowering the threshold can only sweep in more variables.
    assert!(totals[1] >= totals[0]);
}

#[test]
fn test_batch_equivalence() {
    let params = || {
        SmootherParams::new()
            .with_wildfire_threshold(0.0)
            .with_relinearization(false)
    };

    let mut batch = IncrementalSmoother::with_params(params());
    let (factors, values) = se2_chain();
    batch.update(factors, &values, false).unwrap();
    check_tree(&batch);

    let mut incremental = IncrementalSmoother::with_params(params());
    run_chain_incrementally(&mut incremental, false);

    // Same factors, same linearization points, same elimination ordering:
    // the factored systems agree up to round-off.
    assert_values_close(
        &incremental.calculate_best_estimate().unwrap(),
        &batch.calculate_best_estimate().unwrap(),
        1e-8,
    );
}

#[test]
fn test_batch_equivalence_under_reversed_ordering() {
    let params = || {
        SmootherParams::new()
            .with_wildfire_threshold(0.0)
            .with_relinearization(false)
    };

    let mut batch = IncrementalSmoother::with_params(params());
    let (factors, values) = se2_chain();
    batch.update(factors, &values, false).unwrap();

    let mut reversed = IncrementalSmoother::with_params(params())
        .with_ordering_strategy(Box::new(ReverseOrdering));
    run_chain_incrementally(&mut reversed, false);

    // A different (valid) elimination order changes the tree, not the
    // solution, and the delta permutation keeps entries with their keys.
    assert_values_close(
        &reversed.calculate_best_estimate().unwrap(),
        &batch.calculate_best_estimate().unwrap(),
        1e-8,
    );
}

#[test]
fn test_two_variable_chain_scenario() {
    let a = Key::symbol('a', 0);
    let b = Key::symbol('b', 0);
    let c = Key::symbol('c', 0);
    let d = Key::symbol('d', 0);
    let mut smoother = IncrementalSmoother::new();

    // One factor relating the new variables a and b.
    let mut values = Values::new();
    values.insert(a, dvector![0.0]).unwrap();
    values.insert(b, dvector![0.0]).unwrap();
    let factor: Box<dyn NonlinearFactor> = Box::new(AnchoredOffsetFactor {
        keys: [a, b],
        anchor: 0.0,
        offset: 1.0,
    });
    let result = smoother.update(vec![factor], &values, false).unwrap();
    assert_eq!(result.variables_reeliminated, 2);
    assert_eq!(smoother.tree().len(), 1);
    check_tree(&smoother);

    // A new factor on b and a new variable c: the clique holding b is
    // re-eliminated. The first elimination merged a and b into one clique,
    // so a rides along here.
    let mut values = Values::new();
    values.insert(c, dvector![1.0]).unwrap();
    let factor: Box<dyn NonlinearFactor> = Box::new(BetweenFactor::new(b, c, dvector![1.0]));
    let result = smoother.update(vec![factor], &values, false).unwrap();
    assert_eq!(result.variables_reeliminated, 3);
    check_tree(&smoother);

    // Now a sits in its own leaf clique {a | b}. Extending the chain at c
    // touches only the top: a stays put.
    let mut values = Values::new();
    values.insert(d, dvector![3.0]).unwrap();
    let factor: Box<dyn NonlinearFactor> = Box::new(BetweenFactor::new(c, d, dvector![1.0]));
    let result = smoother.update(vec![factor], &values, false).unwrap();
    assert_eq!(result.variables_reeliminated, 3);
    assert_eq!(smoother.last_affected_clique_count(), 1);
    let a_clique = smoother.tree().clique_containing(a).unwrap();
    assert_eq!(smoother.tree().clique(a_clique).unwrap().frontals(), &[a]);
    check_tree(&smoother);

    let estimate = smoother.calculate_best_estimate().unwrap();
    for (key, expected) in [(a, 0.0), (b, 1.0), (c, 2.0), (d, 3.0)] {
        assert!((estimate.get(key).unwrap()[0] - expected).abs() < 1e-9);
    }
}

#[test]
fn test_relinearization_trigger_folds_delta() {
    // Large skip: relinearization only happens when forced.
    let params = SmootherParams::new().with_relinearize_skip(1000);
    let mut smoother = IncrementalSmoother::with_params(params);

    let mut values = Values::new();
    values.insert(x(0), dvector![0.0]).unwrap();
    let prior: Box<dyn NonlinearFactor> = Box::new(PriorFactor::new(x(0), dvector![0.0]));
    smoother.update(vec![prior], &values, false).unwrap();

    // x1 initialized far from its solution: its correction lands at 5.
    let mut values = Values::new();
    values.insert(x(1), dvector![0.0]).unwrap();
    let between: Box<dyn NonlinearFactor> = Box::new(BetweenFactor::new(x(0), x(1), dvector![5.0]));
    smoother.update(vec![between], &values, false).unwrap();
    assert!((smoother.delta_entry(x(1)).unwrap()[0] - 5.0).abs() < 1e-9);
    assert!((smoother.linearization_point().get(x(1)).unwrap()[0]).abs() < 1e-12);

    // Not eligible: nothing is relinearized.
    let result = smoother.update(vec![], &Values::new(), false).unwrap();
    assert_eq!(result.variables_relinearized, 0);
    assert!((smoother.delta_entry(x(1)).unwrap()[0] - 5.0).abs() < 1e-9);

    // Forced: x1 is over threshold, and x0 shares the between factor with
    // it, so both fold their corrections into the linearization point.
    let result = smoother.update(vec![], &Values::new(), true).unwrap();
    assert_eq!(result.variables_relinearized, 2);
    assert!((smoother.linearization_point().get(x(1)).unwrap()[0] - 5.0).abs() < 1e-9);
    assert!(smoother.delta_entry(x(1)).unwrap()[0].abs() < 1e-9);
    check_tree(&smoother);

    // The estimate itself is unchanged by moving the linearization point.
    let estimate = smoother.calculate_estimate().unwrap();
    assert!((estimate.get(x(1)).unwrap()[0] - 5.0).abs() < 1e-9);
}

#[test]
fn test_error_evaluation_is_optional_and_decreases() {
    let params = SmootherParams::new().with_error_evaluation(true);
    let mut smoother = IncrementalSmoother::with_params(params);
    let mut values = Values::new();
    values.insert(x(0), dvector![2.0, -1.0]).unwrap();
    let prior: Box<dyn NonlinearFactor> = Box::new(PriorFactor::new(x(0), dvector![0.0, 0.0]));
    let result = smoother.update(vec![prior], &values, false).unwrap();

    let before = result.error_before.unwrap();
    let after = result.error_after.unwrap();
    assert!(before > 1.0);
    assert!(after < 1e-9);

    // Off by default: the fields stay absent rather than zero.
    let mut plain = IncrementalSmoother::new();
    let mut values = Values::new();
    values.insert(x(0), dvector![1.0]).unwrap();
    let prior: Box<dyn NonlinearFactor> = Box::new(PriorFactor::new(x(0), dvector![1.0]));
    let result = plain.update(vec![prior], &values, false).unwrap();
    assert!(result.error_before.is_none());
    assert!(result.error_after.is_none());
}

#[test]
fn test_clique_partition_invariant_across_updates() {
    let mut smoother = IncrementalSmoother::new();
    run_chain_incrementally(&mut smoother, false);

    // A loop closure far from the newest pose invalidates everything up to
    // the root; the partition must survive.
    let closure: Box<dyn NonlinearFactor> = Box::new(
        BetweenFactorSE2::new(x(0), x(4), 3.3, 2.0, 1.2).with_noise(DiagonalNoise::isotropic(3, 0.5)),
    );
    let result = smoother.update(vec![closure], &Values::new(), false).unwrap();
    assert!(result.variables_reeliminated >= 2);
    check_tree(&smoother);

    let frontal_total: usize = smoother
        .tree()
        .ids()
        .map(|id| smoother.tree().clique(id).unwrap().frontals().len())
        .sum();
    assert_eq!(frontal_total, smoother.ordering().len());
}

#[test]
fn test_degeneracy_reports_offending_variable() {
    let mut smoother = IncrementalSmoother::new();
    let mut values = Values::new();
    values.insert(x(0), dvector![0.0]).unwrap();
    values.insert(x(1), dvector![0.0]).unwrap();
    let factor: Box<dyn NonlinearFactor> = Box::new(BetweenFactor::new(x(0), x(1), dvector![1.0]));
    let err = smoother.update(vec![factor], &values, false).unwrap_err();
    match err {
        SmootherError::NumericalDegeneracy { key } => assert_eq!(key, x(1)),
        other => panic!("expected degeneracy, got {other}"),
    }
}
