//! Mixtures of one base model over discretised parameter distributions.
//!
//! Every base-model parameter gets a distribution: the user-supplied one, or
//! a constant fixed at the current value. One sub-model is instantiated per
//! combination of categories (cartesian product, first parameter name in
//! lexical order varying fastest), weighted by the product of the category
//! probabilities.
//!
//! Exposed parameters:
//! - a mixed parameter `kappa` with a gamma distribution exposes
//!   `kappa_Gamma.alpha`, bounded by both the distribution's and the
//!   model's constraints;
//! - a constant parameter keeps its name `kappa` and the model's constraint.

use std::collections::BTreeMap;

use cyanea_core::{CyaneaError, Parameter, ParameterList, Result};
use ndarray::{Array1, Array2};
use tracing::debug;

use super::SubstitutionModel;
use crate::alphabet::Alphabet;
use crate::distribution::{ConstantDistribution, DiscreteDistribution};
use crate::linalg::EigenDecomposition;

#[derive(Debug, Clone)]
pub struct MixtureOfSubstitutionModels {
    name: String,
    alphabet: Alphabet,
    distributions: BTreeMap<String, Box<dyn DiscreteDistribution>>,
    models: Vec<Box<dyn SubstitutionModel>>,
    probabilities: Vec<f64>,
    params: ParameterList,
    freqs: Array1<f64>,
    generator: Array2<f64>,
}

impl MixtureOfSubstitutionModels {
    /// Mix `base` over `distributions`, keyed by base-model parameter name.
    pub fn new(
        base: Box<dyn SubstitutionModel>,
        mut distributions: BTreeMap<String, Box<dyn DiscreteDistribution>>,
    ) -> Result<Self> {
        if let Some(unknown) = distributions
            .keys()
            .find(|k| !base.parameters().has_parameter(k))
        {
            return Err(CyaneaError::ParameterNotFound(format!(
                "{} has no parameter '{}' to mix over",
                base.name(),
                unknown
            )));
        }

        let mut dists: BTreeMap<String, Box<dyn DiscreteDistribution>> = BTreeMap::new();
        for p in base.parameters() {
            let dist = match distributions.remove(p.name()) {
                Some(d) => d,
                None => Box::new(ConstantDistribution::new(p.value())) as Box<dyn DiscreteDistribution>,
            };
            if let Some(c) = p.constraint() {
                if !c.includes(dist.lower_bound(), dist.upper_bound()) {
                    return Err(CyaneaError::InvalidInput(format!(
                        "bad distribution for {}: support [{}, {}] not within {}",
                        p.name(),
                        dist.lower_bound(),
                        dist.upper_bound(),
                        c
                    )));
                }
            }
            dists.insert(p.name().to_string(), dist);
        }

        let mut params = ParameterList::new();
        for (pname, dist) in &dists {
            let model_param = base
                .parameters()
                .get(pname)
                .ok_or_else(|| CyaneaError::ParameterNotFound(pname.clone()))?;
            if dist.is_constant() {
                let mut exposed = Parameter::new(pname.clone(), dist.categories()[0]);
                exposed.set_constraint(model_param.constraint().copied());
                params.add(exposed)?;
            } else {
                for dp in dist.parameters() {
                    let mut exposed = Parameter::new(
                        format!("{}_{}.{}", pname, dist.name(), dp.name()),
                        dp.value(),
                    );
                    let constraint = match (dp.constraint(), model_param.constraint()) {
                        (Some(a), Some(b)) => Some(*a & *b),
                        (Some(a), None) => Some(*a),
                        (None, b) => b.copied(),
                    };
                    exposed.set_constraint(constraint);
                    params.add(exposed)?;
                }
            }
        }

        let count: usize = dists.values().map(|d| d.n_categories()).product();
        debug!(base = base.name(), combinations = count, "building model mixture");
        let n = base.n_states();
        let mut mixture = Self {
            name: format!("Mixture({})", base.name()),
            alphabet: base.alphabet().clone(),
            models: (0..count).map(|_| base.clone()).collect(),
            probabilities: vec![1.0 / count as f64; count],
            distributions: dists,
            params,
            freqs: Array1::zeros(n),
            generator: Array2::zeros((n, n)),
        };
        mixture.update_matrices()?;
        Ok(mixture)
    }

    pub fn n_models(&self) -> usize {
        self.models.len()
    }

    pub fn model(&self, i: usize) -> Option<&dyn SubstitutionModel> {
        self.models.get(i).map(|m| m.as_ref())
    }

    /// Probability of every sub-model, summing to one.
    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    /// Distribution attached to the base-model parameter `name`.
    pub fn distribution(&self, name: &str) -> Option<&dyn DiscreteDistribution> {
        self.distributions.get(name).map(|d| d.as_ref())
    }

    /// Pull exposed values into the distributions, then push category
    /// values into every sub-model and recompute weights and frequencies.
    fn update_matrices(&mut self) -> Result<()> {
        for (pname, dist) in self.distributions.iter_mut() {
            let mut own = ParameterList::new();
            if dist.is_constant() {
                own.add(Parameter::new("value", self.params.value(pname)?))?;
            } else {
                let prefix = format!("{}_{}.", pname, dist.name());
                for p in self.params.iter() {
                    if let Some(base) = p.name().strip_prefix(&prefix) {
                        own.add(Parameter::new(base, p.value()))?;
                    }
                }
            }
            dist.set_parameter_values(&own)?;
        }

        for (i, model) in self.models.iter_mut().enumerate() {
            let mut j = i;
            let mut proba = 1.0;
            let mut values = ParameterList::new();
            for (pname, dist) in &self.distributions {
                let n_cat = dist.n_categories();
                let l = j % n_cat;
                proba *= dist.probabilities()[l];
                values.add(Parameter::new(pname.clone(), dist.categories()[l]))?;
                j /= n_cat;
            }
            model.set_parameter_values(&values)?;
            self.probabilities[i] = proba;
        }

        self.freqs.fill(0.0);
        self.generator.fill(0.0);
        for (p, m) in self.probabilities.iter().zip(&self.models) {
            self.freqs.scaled_add(*p, m.frequencies());
            self.generator.scaled_add(*p, m.generator());
        }
        Ok(())
    }
}

impl SubstitutionModel for MixtureOfSubstitutionModels {
    fn name(&self) -> &str {
        &self.name
    }

    fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    /// Probability-weighted sum of the sub-model frequencies.
    fn frequencies(&self) -> &Array1<f64> {
        &self.freqs
    }

    /// Probability-weighted sum of the sub-model generators.
    fn generator(&self) -> &Array2<f64> {
        &self.generator
    }

    fn eigen(&self) -> Option<&EigenDecomposition> {
        None
    }

    fn components(&self) -> Option<Vec<(f64, &dyn SubstitutionModel)>> {
        Some(
            self.probabilities
                .iter()
                .zip(&self.models)
                .map(|(p, m)| (*p, m.as_ref()))
                .collect(),
        )
    }

    fn parameters(&self) -> &ParameterList {
        &self.params
    }

    fn set_parameter_values(&mut self, params: &ParameterList) -> Result<bool> {
        let changed = self.params.match_values(params)?;
        if changed.is_empty() {
            return Ok(false);
        }
        self.update_matrices()?;
        Ok(true)
    }

    fn set_frequencies(&mut self, _freqs: &[f64]) -> Result<()> {
        Err(CyaneaError::Unsupported(
            "frequencies of a model mixture are derived from its sub-models".into(),
        ))
    }

    fn box_clone(&self) -> Box<dyn SubstitutionModel> {
        Box::new(self.clone())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::distribution::GammaDiscreteDistribution;
    use crate::model::reversible::ReversibleModel;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn weights_and_frequencies_sum_to_one(
            alpha in 0.1f64..10.0,
            n_kappa in 1usize..4,
            n_theta in 1usize..4,
        ) {
            let mut d: BTreeMap<String, Box<dyn DiscreteDistribution>> = BTreeMap::new();
            d.insert("kappa".into(), Box::new(GammaDiscreteDistribution::new(n_kappa, alpha).unwrap()));
            let values: Vec<f64> = (0..n_theta).map(|i| 0.2 + 0.6 * i as f64 / n_theta as f64).collect();
            let probs = vec![1.0 / n_theta as f64; n_theta];
            d.insert(
                "theta".into(),
                Box::new(crate::distribution::SimpleDiscreteDistribution::new(values, probs).unwrap()),
            );
            let m = MixtureOfSubstitutionModels::new(Box::new(ReversibleModel::t92(2.0, 0.5).unwrap()), d).unwrap();
            prop_assert_eq!(m.n_models(), n_kappa * n_theta);
            prop_assert!((m.probabilities().iter().sum::<f64>() - 1.0).abs() < 1e-9);
            prop_assert!((m.frequencies().sum() - 1.0).abs() < 1e-9);
        }
    }
}
