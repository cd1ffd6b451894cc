//! The append-only nonlinear factor graph.

use nalgebra as na;
use rayon::prelude::*;

use crate::core::factors::NonlinearFactor;
use crate::core::values::Values;
use crate::error::{SmootherError, SmootherResult};
use crate::linalg::JacobianFactor;

/// Index of a factor in the retained graph.
pub type FactorId = usize;

/// All original nonlinear measurement constraints ever added.
///
/// Factors are only appended; superseded linearizations are replaced inside
/// the elimination tree, never here. The retained graph is the source of
/// truth for relinearization and for nonlinear error evaluation.
#[derive(Default)]
pub struct NonlinearFactorGraph {
    factors: Vec<Box<dyn NonlinearFactor>>,
}

impl NonlinearFactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained factors.
    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    /// Append a factor, returning its id.
    pub fn push(&mut self, factor: Box<dyn NonlinearFactor>) -> FactorId {
        self.factors.push(factor);
        self.factors.len() - 1
    }

    /// The factor with the given id.
    pub fn get(&self, id: FactorId) -> Option<&dyn NonlinearFactor> {
        self.factors.get(id).map(|f| f.as_ref())
    }

    /// Iterate over all factors with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (FactorId, &dyn NonlinearFactor)> {
        self.factors.iter().enumerate().map(|(i, f)| (i, f.as_ref()))
    }

    /// Gather the parameter vectors of `factor` from a value assignment.
    fn params_for(
        factor: &dyn NonlinearFactor,
        values: &Values,
    ) -> SmootherResult<Vec<na::DVector<f64>>> {
        factor
            .keys()
            .iter()
            .map(|&key| {
                values.get(key).cloned().ok_or_else(|| {
                    SmootherError::InconsistentGraph(format!(
                        "factor references variable {key} with no value"
                    ))
                })
            })
            .collect()
    }

    /// Total nonlinear error of the whole graph at `values`.
    pub fn error(&self, values: &Values) -> SmootherResult<f64> {
        let mut total = 0.0;
        for factor in &self.factors {
            let params = Self::params_for(factor.as_ref(), values)?;
            total += factor.error(&params);
        }
        Ok(total)
    }

    /// Linearize the factors with the given ids at `values`.
    ///
    /// Produces one [`JacobianFactor`] per id, in id order. Linearization of
    /// independent factors is embarrassingly parallel and runs on the rayon
    /// pool.
    pub fn linearize_subset(
        &self,
        ids: &[FactorId],
        values: &Values,
    ) -> SmootherResult<Vec<JacobianFactor>> {
        ids.par_iter()
            .map(|&id| {
                let factor = self.factors[id].as_ref();
                let params = Self::params_for(factor, values)?;
                let (residual, jacobian) = factor.residual_with_jacobian(&params);
                Ok(JacobianFactor::from_wide_jacobian(
                    factor.keys(),
                    &params,
                    jacobian,
                    residual,
                ))
            })
            .collect()
    }
}
