//! Core problem-description components for the apex-smoother library
//!
//! This module contains the fundamental building blocks the incremental
//! engine operates on:
//! - Symbolic variable keys
//! - The linearization point (current best value of every variable)
//! - Noise models and nonlinear measurement factors
//! - The append-only nonlinear factor graph
//! - Incremental bookkeeping: elimination ordering and variable index

pub mod factors;
pub mod graph;
pub mod key;
pub mod noise;
pub mod ordering;
pub mod values;
pub mod variable_index;

pub use factors::NonlinearFactor;
pub use graph::{FactorId, NonlinearFactorGraph};
pub use key::Key;
pub use ordering::Ordering;
pub use values::Values;
pub use variable_index::VariableIndex;
