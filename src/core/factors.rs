//! Nonlinear measurement factors.
//!
//! A factor relates one or more variables through a measurement. The engine
//! only requires the capability set below: report the touched keys, evaluate
//! the whitened residual and Jacobian at a value assignment, and (derived
//! from that) evaluate the scalar error. Domain-specific factor libraries
//! implement [`NonlinearFactor`] on top of these; the small set shipped here
//! covers priors, linear offsets, and planar relative-pose measurements.

use nalgebra as na;

use crate::core::key::Key;
use crate::core::noise::DiagonalNoise;

/// A nonlinear measurement constraint over a set of variables.
///
/// Implementations return *whitened* residuals and Jacobians: any noise
/// model is folded in before the engine sees the linearization. The wide
/// Jacobian has one column block per key, in `keys()` order, with block
/// widths equal to the variable dimensions.
pub trait NonlinearFactor: Send + Sync {
    /// The variable keys this factor touches, in parameter order.
    fn keys(&self) -> &[Key];

    /// Residual dimension.
    fn dim(&self) -> usize;

    /// Whitened residual and wide Jacobian at the given parameter values
    /// (one vector per key, in `keys()` order).
    fn residual_with_jacobian(
        &self,
        params: &[na::DVector<f64>],
    ) -> (na::DVector<f64>, na::DMatrix<f64>);

    /// Nonlinear error `0.5 * ||r||^2` at the given parameter values.
    fn error(&self, params: &[na::DVector<f64>]) -> f64 {
        let (residual, _) = self.residual_with_jacobian(params);
        0.5 * residual.norm_squared()
    }
}

/// Unary prior anchoring a variable to a fixed value.
#[derive(Debug, Clone)]
pub struct PriorFactor {
    keys: [Key; 1],
    prior: na::DVector<f64>,
    noise: Option<DiagonalNoise>,
}

impl PriorFactor {
    pub fn new(key: Key, prior: na::DVector<f64>) -> Self {
        PriorFactor {
            keys: [key],
            prior,
            noise: None,
        }
    }

    pub fn with_noise(mut self, noise: DiagonalNoise) -> Self {
        assert_eq!(noise.dim(), self.prior.len());
        self.noise = Some(noise);
        self
    }
}

impl NonlinearFactor for PriorFactor {
    fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn dim(&self) -> usize {
        self.prior.len()
    }

    fn residual_with_jacobian(
        &self,
        params: &[na::DVector<f64>],
    ) -> (na::DVector<f64>, na::DMatrix<f64>) {
        let n = self.prior.len();
        let mut residual = &params[0] - &self.prior;
        let mut jacobian = na::DMatrix::<f64>::identity(n, n);
        if let Some(noise) = &self.noise {
            noise.whiten_in_place(&mut residual, &mut jacobian);
        }
        (residual, jacobian)
    }
}

/// Binary factor constraining the vector difference of two variables.
#[derive(Debug, Clone)]
pub struct BetweenFactor {
    keys: [Key; 2],
    measured: na::DVector<f64>,
    noise: Option<DiagonalNoise>,
}

impl BetweenFactor {
    /// Constrain `x1 - x0` to equal `measured`.
    pub fn new(key0: Key, key1: Key, measured: na::DVector<f64>) -> Self {
        BetweenFactor {
            keys: [key0, key1],
            measured,
            noise: None,
        }
    }

    pub fn with_noise(mut self, noise: DiagonalNoise) -> Self {
        assert_eq!(noise.dim(), self.measured.len());
        self.noise = Some(noise);
        self
    }
}

impl NonlinearFactor for BetweenFactor {
    fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn dim(&self) -> usize {
        self.measured.len()
    }

    fn residual_with_jacobian(
        &self,
        params: &[na::DVector<f64>],
    ) -> (na::DVector<f64>, na::DMatrix<f64>) {
        let n = self.measured.len();
        let mut residual = &params[1] - &params[0] - &self.measured;
        let mut jacobian = na::DMatrix::<f64>::zeros(n, 2 * n);
        for i in 0..n {
            jacobian[(i, i)] = -1.0;
            jacobian[(i, n + i)] = 1.0;
        }
        if let Some(noise) = &self.noise {
            noise.whiten_in_place(&mut residual, &mut jacobian);
        }
        (residual, jacobian)
    }
}

/// Wrap an angle to (-pi, pi].
fn wrap_angle(theta: f64) -> f64 {
    let mut wrapped = theta % (2.0 * std::f64::consts::PI);
    if wrapped > std::f64::consts::PI {
        wrapped -= 2.0 * std::f64::consts::PI;
    } else if wrapped <= -std::f64::consts::PI {
        wrapped += 2.0 * std::f64::consts::PI;
    }
    wrapped
}

/// Planar relative-pose measurement between two `[x, y, theta]` poses.
///
/// The translation residual is expressed in the frame of the first pose, so
/// the factor is genuinely nonlinear in `theta0` and its linearization moves
/// with the linearization point.
#[derive(Debug, Clone)]
pub struct BetweenFactorSE2 {
    keys: [Key; 2],
    pub dx: f64,
    pub dy: f64,
    pub dtheta: f64,
    noise: Option<DiagonalNoise>,
}

impl BetweenFactorSE2 {
    pub fn new(key0: Key, key1: Key, dx: f64, dy: f64, dtheta: f64) -> Self {
        BetweenFactorSE2 {
            keys: [key0, key1],
            dx,
            dy,
            dtheta,
            noise: None,
        }
    }

    pub fn with_noise(mut self, noise: DiagonalNoise) -> Self {
        assert_eq!(noise.dim(), 3);
        self.noise = Some(noise);
        self
    }
}

impl NonlinearFactor for BetweenFactorSE2 {
    fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn dim(&self) -> usize {
        3
    }

    fn residual_with_jacobian(
        &self,
        params: &[na::DVector<f64>],
    ) -> (na::DVector<f64>, na::DMatrix<f64>) {
        let p0 = &params[0];
        let p1 = &params[1];
        let (s, c) = p0[2].sin_cos();

        let ex = p1[0] - p0[0];
        let ey = p1[1] - p0[1];

        // Relative translation in the frame of pose 0.
        let rx = c * ex + s * ey;
        let ry = -s * ex + c * ey;

        let mut residual = na::dvector![
            rx - self.dx,
            ry - self.dy,
            wrap_angle(p1[2] - p0[2] - self.dtheta)
        ];

        let mut jacobian = na::DMatrix::<f64>::zeros(3, 6);
        // d(residual)/d(pose0)
        jacobian[(0, 0)] = -c;
        jacobian[(0, 1)] = -s;
        jacobian[(0, 2)] = -s * ex + c * ey;
        jacobian[(1, 0)] = s;
        jacobian[(1, 1)] = -c;
        jacobian[(1, 2)] = -c * ex - s * ey;
        jacobian[(2, 2)] = -1.0;
        // d(residual)/d(pose1)
        jacobian[(0, 3)] = c;
        jacobian[(0, 4)] = s;
        jacobian[(1, 3)] = -s;
        jacobian[(1, 4)] = c;
        jacobian[(2, 5)] = 1.0;

        if let Some(noise) = &self.noise {
            noise.whiten_in_place(&mut residual, &mut jacobian);
        }
        (residual, jacobian)
    }
}
