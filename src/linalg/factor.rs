//! Whitened linear (Gaussian) factors in Jacobian form.

use nalgebra as na;

use crate::core::key::Key;

/// A linear factor `½‖Σᵢ Aᵢ δᵢ − b‖²` over a set of variables.
///
/// One coefficient block per key, all with the same row count. Produced by
/// linearizing a nonlinear factor at the current linearization point, or as
/// the marginal/boundary output of elimination.
#[derive(Clone, Debug)]
pub struct JacobianFactor {
    keys: Vec<Key>,
    blocks: Vec<na::DMatrix<f64>>,
    rhs: na::DVector<f64>,
}

impl JacobianFactor {
    /// Assemble from explicit per-key blocks.
    pub fn new(keys: Vec<Key>, blocks: Vec<na::DMatrix<f64>>, rhs: na::DVector<f64>) -> Self {
        debug_assert_eq!(keys.len(), blocks.len());
        debug_assert!(blocks.iter().all(|b| b.nrows() == rhs.len()));
        JacobianFactor { keys, blocks, rhs }
    }

    /// Split a wide Jacobian into per-key blocks using the parameter
    /// dimensions, negating the residual into the right-hand side
    /// (`r + JΔ ≈ 0` becomes `JΔ = -r`).
    pub fn from_wide_jacobian(
        keys: &[Key],
        params: &[na::DVector<f64>],
        jacobian: na::DMatrix<f64>,
        residual: na::DVector<f64>,
    ) -> Self {
        let rows = residual.len();
        let mut blocks = Vec::with_capacity(keys.len());
        let mut col = 0;
        for param in params {
            let width = param.len();
            blocks.push(jacobian.view((0, col), (rows, width)).into_owned());
            col += width;
        }
        debug_assert_eq!(col, jacobian.ncols());
        JacobianFactor {
            keys: keys.to_vec(),
            blocks,
            rhs: -residual,
        }
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Row (residual) count.
    pub fn rows(&self) -> usize {
        self.rhs.len()
    }

    pub fn rhs(&self) -> &na::DVector<f64> {
        &self.rhs
    }

    /// Coefficient block of `key`, if this factor touches it.
    pub fn block(&self, key: Key) -> Option<&na::DMatrix<f64>> {
        self.keys
            .iter()
            .position(|&k| k == key)
            .map(|i| &self.blocks[i])
    }

    /// Blocks in key order.
    pub fn blocks(&self) -> &[na::DMatrix<f64>] {
        &self.blocks
    }

    pub fn involves(&self, key: Key) -> bool {
        self.keys.contains(&key)
    }

    /// Column dimension of `key` inside this factor.
    pub fn dim_of(&self, key: Key) -> Option<usize> {
        self.block(key).map(|b| b.ncols())
    }
}
