//! Incremental nonlinear least-squares smoothing for SLAM and sensor fusion.
//!
//! This crate maintains the solution of a growing nonlinear least-squares
//! problem as new measurements and unknowns arrive. Instead of re-solving
//! from scratch, it keeps a persistent elimination-tree factorization of the
//! joint system and repairs only the part invalidated by each batch of new
//! factors:
//! - targeted re-elimination of the affected top of the tree, with detached
//!   subtrees summarized by cached boundary factors,
//! - threshold-driven relinearization of variables whose accumulated linear
//!   correction has drifted too far from their linearization point,
//! - partial ("wildfire") backsubstitution that stops propagating once
//!   corrections fall below a configurable magnitude.
//!
//! The entry point is [`smoother::IncrementalSmoother`]; measurements are
//! supplied as [`core::factors::NonlinearFactor`] implementations.

pub mod core;
pub mod error;
pub mod linalg;
pub mod logger;
pub mod smoother;
pub mod tree;

pub use error::{SmootherError, SmootherResult};
pub use logger::{init_logger, init_logger_with_level};
pub use smoother::{IncrementalSmoother, SmootherParams, UpdateResult};
