//! Tunables of the likelihood engines and the substitution counter.

use cyanea_core::{Constraint, CyaneaError, Result};

/// Configuration shared by [`NonHomogeneousTreeLikelihood`](crate::NonHomogeneousTreeLikelihood)
/// and [`DataflowLikelihood`](crate::DataflowLikelihood).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LikelihoodConfig {
    /// Compress identical subtree columns into shared patterns.
    pub use_patterns: bool,
    /// Lower bound of branch-length parameters; shorter tree lengths are raised to it.
    pub min_branch_length: f64,
    /// Upper bound of branch-length parameters.
    pub max_branch_length: f64,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        Self {
            use_patterns: true,
            min_branch_length: 1e-6,
            max_branch_length: 10_000.0,
        }
    }
}

impl LikelihoodConfig {
    /// Check the bounds are usable.
    pub fn validate(&self) -> Result<()> {
        if !(self.min_branch_length >= 0.0) || !(self.max_branch_length > self.min_branch_length) {
            return Err(CyaneaError::InvalidInput(format!(
                "invalid branch length bounds [{}, {}]",
                self.min_branch_length, self.max_branch_length
            )));
        }
        Ok(())
    }

    /// Constraint attached to every branch-length parameter.
    pub fn branch_length_constraint(&self) -> Constraint {
        Constraint::interval(self.min_branch_length, self.max_branch_length, false, false)
    }
}

/// Configuration of [`DecompositionSubstitutionCount`](crate::DecompositionSubstitutionCount).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CountingConfig {
    /// Number of branch lengths whose count matrices are kept. The most
    /// recent one is always kept.
    pub cache_capacity: usize,
}

impl Default for CountingConfig {
    fn default() -> Self {
        Self { cache_capacity: 8 }
    }
}
