//! Linear-Gaussian building blocks and the elimination kernel.
//!
//! Everything in this module operates on already-linearized quantities:
//! - [`JacobianFactor`]: a whitened linear factor `½‖Σ Aᵢ δᵢ − b‖²`
//! - [`GaussianConditional`]: a conditional density `p(δᵥ | parents)` in
//!   square-root form
//! - [`eliminate_partial`]: symbolic-then-numeric elimination of a linear
//!   factor graph restricted to an affected variable subset
//!
//! Per-variable elimination is dense (nalgebra QR); sparsity is exploited
//! structurally through the elimination tree, not inside a single variable's
//! local system.

pub mod conditional;
pub mod eliminate;
pub mod factor;

pub use conditional::GaussianConditional;
pub use eliminate::{eliminate_partial, EliminationOutput};
pub use factor::JacobianFactor;
