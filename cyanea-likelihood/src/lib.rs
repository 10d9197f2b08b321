//! Non-homogeneous phylogenetic likelihood for the Cyanea bioinformatics ecosystem.
//!
//! - **Substitution models**: reversible N-state, nucleotide and word models,
//!   plus mixtures over discretised parameter distributions
//! - **Model sets**: node-to-model assignment with tied parameters
//! - **Pruning engine**: likelihood, first and second derivatives with
//!   dirty-path recomputation and site-pattern compression
//! - **Dataflow layer**: cached forward/backward values with
//!   dependency-driven invalidation
//! - **Substitution mapping**: spectral expected counts per branch and type

pub mod alphabet;
pub mod config;
pub mod counting;
pub mod dataflow;
pub mod distribution;
pub mod likelihood_data;
pub mod linalg;
pub mod model;
pub mod model_set;
pub mod pruning;
pub mod sites;
pub mod tree;

pub use alphabet::Alphabet;
pub use config::{CountingConfig, LikelihoodConfig};
pub use counting::{
    branch_substitution_counts, DecompositionSubstitutionCount, ExhaustiveSubstitutionRegister,
    SubstitutionRegister, TotalSubstitutionRegister, TsTvSubstitutionRegister,
};
pub use dataflow::DataflowLikelihood;
pub use distribution::{
    ConstantDistribution, DiscreteDistribution, GammaDiscreteDistribution,
    SimpleDiscreteDistribution,
};
pub use likelihood_data::LikelihoodData;
pub use linalg::EigenDecomposition;
pub use model::{
    mixture::MixtureOfSubstitutionModels,
    reversible::ReversibleModel,
    word::WordModel,
    SubstitutionModel,
};
pub use model_set::{ModelId, RootFrequencies, SubstitutionModelSet};
pub use pruning::NonHomogeneousTreeLikelihood;
pub use sites::{Alignment, SitePatterns};
pub use tree::{NodeId, PhyloTree};
