//! The persistent elimination-tree factorization.
//!
//! A tree of cliques, each holding a conditional density over its frontal
//! variables given its separator. The tree is repaired incrementally:
//! [`EliminationTree::remove_top`] cuts out the part invalidated by a set of
//! marked variables, detached-but-valid subtrees ride along as orphans with
//! cached boundary factors, and freshly eliminated cliques are spliced back
//! in with [`EliminationTree::add_eliminated`] /
//! [`EliminationTree::attach_orphans`].

pub mod clique;
pub mod elimination_tree;

pub use clique::{Clique, CliqueId};
pub use elimination_tree::{DeltaStore, EliminationTree, RemovedTop};
