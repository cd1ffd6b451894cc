//! Measurement noise models.

use nalgebra as na;

/// Diagonal Gaussian noise model with per-row standard deviations.
///
/// Whitening scales residual and Jacobian rows by `1/sigma`, so downstream
/// linear algebra can treat every factor as unit-covariance.
#[derive(Clone, Debug)]
pub struct DiagonalNoise {
    inv_sigmas: na::DVector<f64>,
}

impl DiagonalNoise {
    /// Create a noise model from per-dimension standard deviations.
    ///
    /// # Panics
    /// Panics if any sigma is not strictly positive; a non-positive sigma is
    /// a construction bug, not a runtime condition.
    pub fn from_sigmas(sigmas: na::DVector<f64>) -> Self {
        assert!(
            sigmas.iter().all(|&s| s > 0.0 && s.is_finite()),
            "noise sigmas must be positive and finite"
        );
        DiagonalNoise {
            inv_sigmas: sigmas.map(|s| 1.0 / s),
        }
    }

    /// Isotropic noise: the same sigma for every dimension.
    pub fn isotropic(dim: usize, sigma: f64) -> Self {
        Self::from_sigmas(na::DVector::from_element(dim, sigma))
    }

    /// Residual dimension this model applies to.
    pub fn dim(&self) -> usize {
        self.inv_sigmas.len()
    }

    /// Scale residual and Jacobian rows by the inverse sigmas.
    pub fn whiten_in_place(&self, residual: &mut na::DVector<f64>, jacobian: &mut na::DMatrix<f64>) {
        debug_assert_eq!(residual.len(), self.inv_sigmas.len());
        debug_assert_eq!(jacobian.nrows(), self.inv_sigmas.len());
        for i in 0..self.inv_sigmas.len() {
            let w = self.inv_sigmas[i];
            residual[i] *= w;
            for j in 0..jacobian.ncols() {
                jacobian[(i, j)] *= w;
            }
        }
    }
}
