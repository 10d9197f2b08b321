//! Shared primitives, traits, and utilities for the Cyanea bioinformatics ecosystem.
//!
//! `cyanea-core` provides the foundation that the other Cyanea crates build on:
//!
//! - **Error types** — [`CyaneaError`] and [`Result`] for structured error handling
//! - **Parameters** — [`Parameter`], [`ParameterList`] and interval [`Constraint`]s
//! - **Traits** — shared abstractions like [`Summarizable`]

pub mod error;
pub mod param;
pub mod traits;

pub use error::{CyaneaError, Result};
pub use param::{Constraint, Parameter, ParameterList};
pub use traits::*;
