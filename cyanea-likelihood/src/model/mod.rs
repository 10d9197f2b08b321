//! Substitution models: continuous-time Markov processes over an alphabet.
//!
//! Capabilities are queried, not downcast: [`SubstitutionModel::eigen`]
//! exposes a real spectral decomposition for diagonalisable reversible
//! models, and [`SubstitutionModel::components`] exposes the weighted
//! sub-models of a mixture.

pub mod mixture;
pub mod reversible;
pub mod word;

use core::fmt;

use cyanea_core::{CyaneaError, ParameterList, Result};
use ndarray::{Array1, Array2};

use crate::alphabet::Alphabet;
use crate::linalg::EigenDecomposition;

/// A substitution process with transition probabilities `P(t) = exp(Qt)`.
pub trait SubstitutionModel: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn alphabet(&self) -> &Alphabet;

    fn n_states(&self) -> usize {
        self.alphabet().size()
    }

    /// Stationary frequencies.
    fn frequencies(&self) -> &Array1<f64>;

    /// Generator Q, rows summing to zero.
    fn generator(&self) -> &Array2<f64>;

    /// Real spectral decomposition of Q, when one exists.
    fn eigen(&self) -> Option<&EigenDecomposition>;

    /// `(probability, sub-model)` pairs for mixtures.
    fn components(&self) -> Option<Vec<(f64, &dyn SubstitutionModel)>> {
        None
    }

    /// Free parameters, named without namespace.
    fn parameters(&self) -> &ParameterList;

    /// Copy the values of every shared name and recompute.
    ///
    /// Returns whether any value changed.
    fn set_parameter_values(&mut self, params: &ParameterList) -> Result<bool>;

    /// Replace the stationary frequencies.
    fn set_frequencies(&mut self, _freqs: &[f64]) -> Result<()> {
        Err(CyaneaError::Unsupported(format!(
            "frequencies of {} cannot be set directly",
            self.name()
        )))
    }

    fn box_clone(&self) -> Box<dyn SubstitutionModel>;

    /// P(t).
    fn transition_probs(&self, t: f64) -> Array2<f64> {
        spectral_or_mixed(self, t, EigenDecomposition::transition, |m, t| m.transition_probs(t))
    }

    /// dP/dt.
    fn d_transition_probs(&self, t: f64) -> Array2<f64> {
        spectral_or_mixed(self, t, EigenDecomposition::d_transition, |m, t| {
            m.d_transition_probs(t)
        })
    }

    /// d²P/dt².
    fn d2_transition_probs(&self, t: f64) -> Array2<f64> {
        spectral_or_mixed(self, t, EigenDecomposition::d2_transition, |m, t| {
            m.d2_transition_probs(t)
        })
    }
}

impl Clone for Box<dyn SubstitutionModel> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Spectral reconstruction when available, else the weighted sum over
/// mixture components.
fn spectral_or_mixed<M: SubstitutionModel + ?Sized>(
    model: &M,
    t: f64,
    spectral: fn(&EigenDecomposition, f64) -> Array2<f64>,
    mixed: fn(&dyn SubstitutionModel, f64) -> Array2<f64>,
) -> Array2<f64> {
    if let Some(eig) = model.eigen() {
        return spectral(eig, t);
    }
    let n = model.n_states();
    let mut out = Array2::<f64>::zeros((n, n));
    if let Some(components) = model.components() {
        for (p, m) in components {
            out.scaled_add(p, &mixed(m, t));
        }
    }
    out
}

/// Check a frequency vector: right length, non-negative, summing to one.
pub(crate) fn check_frequencies(freqs: &[f64], n: usize) -> Result<Array1<f64>> {
    if freqs.len() != n {
        return Err(CyaneaError::Incompatible(format!(
            "{} frequencies for {} states",
            freqs.len(),
            n
        )));
    }
    if freqs.iter().any(|&f| !(f >= 0.0)) {
        return Err(CyaneaError::InvalidInput("frequencies must be non-negative".into()));
    }
    let total: f64 = freqs.iter().sum();
    if (total - 1.0).abs() > 1e-6 {
        return Err(CyaneaError::InvalidInput(format!(
            "frequencies sum to {}, expected 1",
            total
        )));
    }
    Ok(Array1::from(freqs.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::reversible::ReversibleModel;

    #[test]
    fn frequency_checks() {
        assert!(check_frequencies(&[0.5, 0.5], 2).is_ok());
        assert!(matches!(
            check_frequencies(&[0.5, 0.5], 4),
            Err(CyaneaError::Incompatible(_))
        ));
        assert!(check_frequencies(&[0.7, 0.7], 2).is_err());
        assert!(check_frequencies(&[1.5, -0.5], 2).is_err());
    }

    #[test]
    fn boxed_models_clone_deeply() {
        let m: Box<dyn SubstitutionModel> = Box::new(ReversibleModel::k80(2.0).unwrap());
        let mut c = m.clone();
        let mut p = ParameterList::new();
        p.add(cyanea_core::Parameter::new("kappa", 5.0)).unwrap();
        assert!(c.set_parameter_values(&p).unwrap());
        assert_eq!(m.parameters().value("kappa").unwrap(), 2.0);
        assert_eq!(c.parameters().value("kappa").unwrap(), 5.0);
    }
}
