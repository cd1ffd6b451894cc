//! Symbolic-then-numeric partial elimination.
//!
//! Eliminates the given variables one at a time, in the given order, from a
//! linear factor graph restricted to the affected subgraph. Each step stacks
//! every live factor touching the variable into a dense augmented system,
//! runs a Householder QR, peels off the conditional rows, and feeds the
//! remaining marginal back into the working graph.

use std::collections::HashMap;

use nalgebra as na;

use crate::core::key::Key;
use crate::core::ordering::Ordering;
use crate::error::{SmootherError, SmootherResult};
use crate::linalg::conditional::GaussianConditional;
use crate::linalg::factor::JacobianFactor;

/// Magnitude below which a conditional pivot counts as rank deficient.
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Result of a partial elimination pass.
#[derive(Debug)]
pub struct EliminationOutput {
    /// One conditional per eliminated variable, in elimination order.
    pub conditionals: Vec<GaussianConditional>,
    /// The marginal factor emitted by each elimination step, parallel to
    /// `conditionals`; `None` when the variable had no remaining neighbors.
    /// The marginal of a clique's last frontal is that clique's cached
    /// boundary factor.
    pub marginals: Vec<Option<JacobianFactor>>,
}

/// Eliminate `elim_keys` (in order) from `factors`.
///
/// Every key referenced by `factors` must be in `elim_keys`; the caller
/// guarantees this by construction of the affected subgraph (factors that
/// straddle the affected boundary stay summarized inside orphan boundary
/// factors and never enter here).
pub fn eliminate_partial(
    factors: Vec<JacobianFactor>,
    elim_keys: &[Key],
    ordering: &Ordering,
) -> SmootherResult<EliminationOutput> {
    let mut slots: Vec<Option<JacobianFactor>> = factors.into_iter().map(Some).collect();
    let mut buckets: HashMap<Key, Vec<usize>> = HashMap::new();
    for (slot, factor) in slots.iter().enumerate() {
        for &key in factor.as_ref().map(|f| f.keys()).unwrap_or(&[]) {
            buckets.entry(key).or_default().push(slot);
        }
    }

    let mut conditionals = Vec::with_capacity(elim_keys.len());
    let mut marginals = Vec::with_capacity(elim_keys.len());

    for &v in elim_keys {
        let involved: Vec<JacobianFactor> = buckets
            .remove(&v)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|slot| slots[slot].take())
            .collect();
        if involved.is_empty() {
            return Err(SmootherError::NumericalDegeneracy { key: v });
        }

        let (conditional, marginal) = eliminate_one(v, &involved, ordering)?;
        if let Some(marginal) = &marginal {
            let slot = slots.len();
            slots.push(Some(marginal.clone()));
            for &key in marginal.keys() {
                buckets.entry(key).or_default().push(slot);
            }
        }
        conditionals.push(conditional);
        marginals.push(marginal);
    }

    if slots.iter().any(|slot| slot.is_some()) {
        return Err(SmootherError::InternalInvariantViolation(
            "elimination left unconsumed factors in the affected subgraph".to_string(),
        ));
    }

    Ok(EliminationOutput {
        conditionals,
        marginals,
    })
}

/// Eliminate a single variable from the factors that touch it.
fn eliminate_one(
    v: Key,
    involved: &[JacobianFactor],
    ordering: &Ordering,
) -> SmootherResult<(GaussianConditional, Option<JacobianFactor>)> {
    // Union of the remaining keys, in current elimination-position order.
    let mut rest: Vec<Key> = Vec::new();
    for factor in involved {
        for &key in factor.keys() {
            if key != v && !rest.contains(&key) {
                rest.push(key);
            }
        }
    }
    for key in &rest {
        if ordering.position(*key).is_none() {
            return Err(SmootherError::InternalInvariantViolation(format!(
                "variable {key} in the affected subgraph has no ordering position"
            )));
        }
    }
    rest.sort_unstable_by_key(|k| ordering.position(*k));

    let v_dim = involved[0]
        .dim_of(v)
        .ok_or(SmootherError::NumericalDegeneracy { key: v })?;
    let rest_dims: Vec<usize> = rest
        .iter()
        .map(|&key| {
            involved
                .iter()
                .find_map(|f| f.dim_of(key))
                .expect("key collected from these factors")
        })
        .collect();
    let rest_total: usize = rest_dims.iter().sum();

    let total_rows: usize = involved.iter().map(|f| f.rows()).sum();
    if total_rows < v_dim {
        return Err(SmootherError::NumericalDegeneracy { key: v });
    }

    // Column layout: [v | rest... | rhs].
    let total_cols = v_dim + rest_total + 1;
    let mut col_of: HashMap<Key, usize> = HashMap::new();
    let mut col = v_dim;
    for (key, dim) in rest.iter().zip(&rest_dims) {
        col_of.insert(*key, col);
        col += dim;
    }

    let mut stacked = na::DMatrix::<f64>::zeros(total_rows, total_cols);
    let mut row = 0;
    for factor in involved {
        let rows = factor.rows();
        for (key, block) in factor.keys().iter().zip(factor.blocks()) {
            let col = if *key == v { 0 } else { col_of[key] };
            stacked
                .view_mut((row, col), (rows, block.ncols()))
                .copy_from(block);
        }
        stacked
            .view_mut((row, total_cols - 1), (rows, 1))
            .copy_from(factor.rhs());
        row += rows;
    }

    let r = stacked.qr().r();

    for i in 0..v_dim {
        let pivot = r[(i, i)];
        if !pivot.is_finite() || pivot.abs() < PIVOT_TOLERANCE {
            return Err(SmootherError::NumericalDegeneracy { key: v });
        }
    }
    if r.iter().any(|x| !x.is_finite()) {
        return Err(SmootherError::NumericalDegeneracy { key: v });
    }

    let r_block = r.view((0, 0), (v_dim, v_dim)).into_owned();
    let s_blocks: Vec<na::DMatrix<f64>> = rest
        .iter()
        .zip(&rest_dims)
        .map(|(key, dim)| r.view((0, col_of[key]), (v_dim, *dim)).into_owned())
        .collect();
    let d = r.view((0, total_cols - 1), (v_dim, 1)).column(0).into_owned();
    let conditional = GaussianConditional::new(v, r_block, rest.clone(), s_blocks, d);

    // Rows past the frontal block form the marginal on the remaining keys;
    // rows whose pivot falls in the rhs column carry pure error and are
    // dropped.
    let marginal_end = r.nrows().min(v_dim + rest_total);
    let marginal = if rest.is_empty() || marginal_end <= v_dim {
        None
    } else {
        let rows = marginal_end - v_dim;
        let blocks: Vec<na::DMatrix<f64>> = rest
            .iter()
            .zip(&rest_dims)
            .map(|(key, dim)| r.view((v_dim, col_of[key]), (rows, *dim)).into_owned())
            .collect();
        let rhs = r
            .view((v_dim, total_cols - 1), (rows, 1))
            .column(0)
            .into_owned();
        Some(JacobianFactor::new(rest, blocks, rhs))
    };

    Ok((conditional, marginal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{dmatrix, dvector};
    use std::collections::HashMap;

    fn solve_chain(output: &EliminationOutput) -> HashMap<Key, na::DVector<f64>> {
        let mut solution: HashMap<Key, na::DVector<f64>> = HashMap::new();
        for conditional in output.conditionals.iter().rev() {
            let value = conditional.solve(|k| solution.get(&k)).unwrap();
            solution.insert(conditional.key(), value);
        }
        solution
    }

    #[test]
    fn test_single_variable_prior() {
        let x0 = Key::symbol('x', 0);
        let mut ordering = Ordering::new();
        ordering.push(x0).unwrap();
        let prior = JacobianFactor::new(vec![x0], vec![dmatrix![1.0]], dvector![3.0]);
        let output = eliminate_partial(vec![prior], &[x0], &ordering).unwrap();
        assert_eq!(output.conditionals.len(), 1);
        assert!(output.marginals[0].is_none());
        let solution = solve_chain(&output);
        assert!((solution[&x0][0] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_two_variable_chain_matches_normal_equations() {
        let x0 = Key::symbol('x', 0);
        let x1 = Key::symbol('x', 1);
        let mut ordering = Ordering::new();
        ordering.push(x0).unwrap();
        ordering.push(x1).unwrap();

        // prior: x0 = 1; between: x1 - x0 = 2. Exact solution (1, 3).
        let prior = JacobianFactor::new(vec![x0], vec![dmatrix![1.0]], dvector![1.0]);
        let between = JacobianFactor::new(
            vec![x0, x1],
            vec![dmatrix![-1.0], dmatrix![1.0]],
            dvector![2.0],
        );
        let output = eliminate_partial(vec![prior, between], &[x0, x1], &ordering).unwrap();

        // Eliminating x0 leaves a marginal on x1; x1's own elimination
        // consumes it, so its marginal is empty.
        assert!(output.marginals[0].is_some());
        assert!(output.marginals[1].is_none());
        assert_eq!(output.conditionals[0].parents(), &[x1]);

        let solution = solve_chain(&output);
        assert!((solution[&x0][0] - 1.0).abs() < 1e-9);
        assert!((solution[&x1][0] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_unconstrained_variable_is_degenerate() {
        let x0 = Key::symbol('x', 0);
        let x1 = Key::symbol('x', 1);
        let mut ordering = Ordering::new();
        ordering.push(x0).unwrap();
        ordering.push(x1).unwrap();
        let prior = JacobianFactor::new(vec![x0], vec![dmatrix![1.0]], dvector![0.0]);
        let err = eliminate_partial(vec![prior], &[x0, x1], &ordering).unwrap_err();
        assert!(matches!(
            err,
            SmootherError::NumericalDegeneracy { key } if key == x1
        ));
    }

    #[test]
    fn test_zero_jacobian_is_degenerate() {
        let x0 = Key::symbol('x', 0);
        let mut ordering = Ordering::new();
        ordering.push(x0).unwrap();
        let flat = JacobianFactor::new(vec![x0], vec![dmatrix![0.0]], dvector![1.0]);
        let err = eliminate_partial(vec![flat], &[x0], &ordering).unwrap_err();
        assert!(matches!(
            err,
            SmootherError::NumericalDegeneracy { key } if key == x0
        ));
    }

    #[test]
    fn test_multidimensional_elimination() {
        let x0 = Key::symbol('x', 0);
        let x1 = Key::symbol('x', 1);
        let mut ordering = Ordering::new();
        ordering.push(x0).unwrap();
        ordering.push(x1).unwrap();

        // 2-d prior on x0 and a 2-d offset to x1. Solution: x0 = (1, 2),
        // x1 = (2, 1).
        let prior = JacobianFactor::new(
            vec![x0],
            vec![na::DMatrix::identity(2, 2)],
            dvector![1.0, 2.0],
        );
        let between = JacobianFactor::new(
            vec![x0, x1],
            vec![-na::DMatrix::identity(2, 2), na::DMatrix::identity(2, 2)],
            dvector![1.0, -1.0],
        );
        let output = eliminate_partial(vec![prior, between], &[x0, x1], &ordering).unwrap();
        let solution = solve_chain(&output);
        assert!((&solution[&x0] - dvector![1.0, 2.0]).norm() < 1e-9);
        assert!((&solution[&x1] - dvector![2.0, 1.0]).norm() < 1e-9);
    }
}
