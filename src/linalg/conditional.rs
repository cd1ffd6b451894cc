//! Gaussian conditional densities in square-root form.

use nalgebra as na;

use crate::core::key::Key;
use crate::error::{SmootherError, SmootherResult};

/// The conditional density `p(δᵥ | parents)` produced when variable `v` is
/// eliminated: `R δᵥ + Σⱼ Sⱼ δ_pⱼ = d`, with `R` upper triangular.
#[derive(Clone, Debug)]
pub struct GaussianConditional {
    key: Key,
    r: na::DMatrix<f64>,
    parents: Vec<Key>,
    s_blocks: Vec<na::DMatrix<f64>>,
    rhs: na::DVector<f64>,
}

impl GaussianConditional {
    pub fn new(
        key: Key,
        r: na::DMatrix<f64>,
        parents: Vec<Key>,
        s_blocks: Vec<na::DMatrix<f64>>,
        rhs: na::DVector<f64>,
    ) -> Self {
        debug_assert_eq!(r.nrows(), r.ncols());
        debug_assert_eq!(r.nrows(), rhs.len());
        debug_assert_eq!(parents.len(), s_blocks.len());
        GaussianConditional {
            key,
            r,
            parents,
            s_blocks,
            rhs,
        }
    }

    /// The frontal variable this conditional solves for.
    pub fn key(&self) -> Key {
        self.key
    }

    /// Dimension of the frontal variable.
    pub fn dim(&self) -> usize {
        self.rhs.len()
    }

    /// The conditioning variables, each either a later frontal of the same
    /// clique or a separator variable.
    pub fn parents(&self) -> &[Key] {
        &self.parents
    }

    /// Solve `δᵥ = R⁻¹ (d − Σⱼ Sⱼ δ_pⱼ)` given parent solutions.
    ///
    /// `parent_value` must return the already-computed correction for every
    /// parent key.
    pub fn solve<'a, F>(&self, mut parent_value: F) -> SmootherResult<na::DVector<f64>>
    where
        F: FnMut(Key) -> Option<&'a na::DVector<f64>>,
    {
        let mut y = self.rhs.clone();
        for (parent, s) in self.parents.iter().zip(&self.s_blocks) {
            let value = parent_value(*parent).ok_or_else(|| {
                SmootherError::InternalInvariantViolation(format!(
                    "backsubstitution reached {} before its parent {parent} was solved",
                    self.key
                ))
            })?;
            y -= s * value;
        }
        self.r.solve_upper_triangular(&y).ok_or_else(|| {
            SmootherError::NumericalDegeneracy { key: self.key }
        })
    }

    /// Structural nonzero count of the conditional's rows: the triangular
    /// frontal block plus the dense parent blocks.
    pub fn nnz(&self) -> usize {
        let d = self.dim();
        let parent_cols: usize = self.s_blocks.iter().map(|s| s.ncols()).sum();
        d * (d + 1) / 2 + d * parent_cols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn test_solve_without_parents() {
        // 2 x = 4  ->  x = 2
        let conditional = GaussianConditional::new(
            Key::symbol('x', 0),
            dmatrix![2.0],
            vec![],
            vec![],
            dvector![4.0],
        );
        let solution = conditional.solve(|_| None).unwrap();
        assert!((solution[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_solve_with_parent() {
        // x + 0.5 p = 1, p = 2  ->  x = 0
        let parent = Key::symbol('p', 0);
        let conditional = GaussianConditional::new(
            Key::symbol('x', 0),
            dmatrix![1.0],
            vec![parent],
            vec![dmatrix![0.5]],
            dvector![1.0],
        );
        let p_value = dvector![2.0];
        let solution = conditional.solve(|k| (k == parent).then_some(&p_value)).unwrap();
        assert!(solution[0].abs() < 1e-12);
    }

    #[test]
    fn test_missing_parent_is_invariant_violation() {
        let conditional = GaussianConditional::new(
            Key::symbol('x', 0),
            dmatrix![1.0],
            vec![Key::symbol('p', 0)],
            vec![dmatrix![1.0]],
            dvector![0.0],
        );
        let err = conditional.solve(|_| None).unwrap_err();
        assert!(matches!(err, SmootherError::InternalInvariantViolation(_)));
    }

    #[test]
    fn test_nnz_counts_triangle_and_parents() {
        let conditional = GaussianConditional::new(
            Key::symbol('x', 0),
            na::DMatrix::identity(3, 3),
            vec![Key::symbol('p', 0)],
            vec![na::DMatrix::zeros(3, 2)],
            na::DVector::zeros(3),
        );
        assert_eq!(conditional.nnz(), 6 + 6);
    }
}
