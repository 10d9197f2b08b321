//! Incremental likelihood evaluation on a dependency graph of cached values.

pub mod graph;
pub mod likelihood;

pub use graph::{DataflowGraph, Operation, ValueId};
pub use likelihood::DataflowLikelihood;
