//! Time-reversible models built from exchangeabilities and frequencies.
//!
//! Every generator is normalised to a mean substitution rate of one, so
//! branch lengths are in expected substitutions per site.

use cyanea_core::{Constraint, CyaneaError, Parameter, ParameterList, Result};
use ndarray::{Array1, Array2};

use super::{check_frequencies, SubstitutionModel};
use crate::alphabet::Alphabet;
use crate::linalg::{build_rate_matrix, EigenDecomposition};

/// GTR relative rates, in the order A<->C, A<->G, A<->T, C<->G, C<->T.
/// G<->T is fixed to one.
pub const GTR_RATE_NAMES: [&str; 5] = ["rAC", "rAG", "rAT", "rCG", "rCT"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    EqualRate,
    K80,
    T92,
    Hky85,
    Gtr,
}

/// A reversible model of one of the classic families.
#[derive(Debug, Clone)]
pub struct ReversibleModel {
    family: Family,
    name: String,
    alphabet: Alphabet,
    params: ParameterList,
    freqs: Array1<f64>,
    generator: Array2<f64>,
    eigen: EigenDecomposition,
}

impl ReversibleModel {
    /// Equal rates between all states of `alphabet` and uniform frequencies
    /// (JC69 for DNA).
    pub fn equal_rate(alphabet: Alphabet) -> Result<Self> {
        let n = alphabet.size();
        if n < 2 {
            return Err(CyaneaError::InvalidInput("alphabet needs at least two states".into()));
        }
        let name = format!("EqualRate{}", n);
        Self::build(
            Family::EqualRate,
            name,
            alphabet,
            ParameterList::new(),
            Array1::from_elem(n, 1.0 / n as f64),
        )
    }

    /// Kimura two-parameter model.
    pub fn k80(kappa: f64) -> Result<Self> {
        let mut params = ParameterList::new();
        params.add(Parameter::constrained("kappa", kappa, Constraint::positive())?)?;
        Self::build(
            Family::K80,
            "K80".into(),
            Alphabet::Dna,
            params,
            Array1::from_elem(4, 0.25),
        )
    }

    /// Tamura 1992: transition/transversion ratio and GC content.
    pub fn t92(kappa: f64, theta: f64) -> Result<Self> {
        let mut params = ParameterList::new();
        params.add(Parameter::constrained("kappa", kappa, Constraint::positive())?)?;
        params.add(Parameter::constrained("theta", theta, Constraint::open_unit())?)?;
        Self::build(
            Family::T92,
            "T92".into(),
            Alphabet::Dna,
            params,
            t92_frequencies(theta),
        )
    }

    /// HKY85 with fixed stationary frequencies.
    pub fn hky85(kappa: f64, freqs: [f64; 4]) -> Result<Self> {
        let mut params = ParameterList::new();
        params.add(Parameter::constrained("kappa", kappa, Constraint::positive())?)?;
        let freqs = check_frequencies(&freqs, 4)?;
        Self::build(Family::Hky85, "HKY85".into(), Alphabet::Dna, params, freqs)
    }

    /// General time-reversible model; `rates` follow [`GTR_RATE_NAMES`].
    pub fn gtr(rates: [f64; 5], freqs: [f64; 4]) -> Result<Self> {
        let mut params = ParameterList::new();
        for (name, &r) in GTR_RATE_NAMES.iter().zip(rates.iter()) {
            params.add(Parameter::constrained(*name, r, Constraint::positive())?)?;
        }
        let freqs = check_frequencies(&freqs, 4)?;
        Self::build(Family::Gtr, "GTR".into(), Alphabet::Dna, params, freqs)
    }

    fn build(
        family: Family,
        name: String,
        alphabet: Alphabet,
        params: ParameterList,
        freqs: Array1<f64>,
    ) -> Result<Self> {
        let exch = exchangeabilities(family, alphabet.size(), &params)?;
        let generator = build_rate_matrix(&exch, &freqs);
        let eigen = EigenDecomposition::from_reversible(&generator, &freqs)?;
        Ok(Self {
            family,
            name,
            alphabet,
            params,
            freqs,
            generator,
            eigen,
        })
    }

    fn update(&mut self) -> Result<()> {
        if self.family == Family::T92 {
            self.freqs = t92_frequencies(self.params.value("theta")?);
        }
        let exch = exchangeabilities(self.family, self.alphabet.size(), &self.params)?;
        self.generator = build_rate_matrix(&exch, &self.freqs);
        self.eigen = EigenDecomposition::from_reversible(&self.generator, &self.freqs)?;
        Ok(())
    }
}

impl SubstitutionModel for ReversibleModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    fn frequencies(&self) -> &Array1<f64> {
        &self.freqs
    }

    fn generator(&self) -> &Array2<f64> {
        &self.generator
    }

    fn eigen(&self) -> Option<&EigenDecomposition> {
        Some(&self.eigen)
    }

    fn parameters(&self) -> &ParameterList {
        &self.params
    }

    fn set_parameter_values(&mut self, params: &ParameterList) -> Result<bool> {
        let changed = self.params.match_values(params)?;
        if changed.is_empty() {
            return Ok(false);
        }
        self.update()?;
        Ok(true)
    }

    fn set_frequencies(&mut self, freqs: &[f64]) -> Result<()> {
        match self.family {
            Family::Hky85 | Family::Gtr => {
                self.freqs = check_frequencies(freqs, self.alphabet.size())?;
                self.update()
            }
            _ => Err(CyaneaError::Unsupported(format!(
                "{} has fixed frequencies",
                self.name
            ))),
        }
    }

    fn box_clone(&self) -> Box<dyn SubstitutionModel> {
        Box::new(self.clone())
    }
}

fn t92_frequencies(theta: f64) -> Array1<f64> {
    let at = (1.0 - theta) / 2.0;
    let gc = theta / 2.0;
    Array1::from(vec![at, gc, gc, at])
}

/// A<->G and C<->T.
fn is_transition(i: usize, j: usize) -> bool {
    matches!((i.min(j), i.max(j)), (0, 2) | (1, 3))
}

fn exchangeabilities(family: Family, n: usize, params: &ParameterList) -> Result<Array2<f64>> {
    let mut s = Array2::<f64>::zeros((n, n));
    match family {
        Family::EqualRate => {
            s.fill(1.0);
        }
        Family::K80 | Family::T92 | Family::Hky85 => {
            let kappa = params.value("kappa")?;
            for i in 0..4 {
                for j in 0..4 {
                    s[[i, j]] = if is_transition(i, j) { kappa } else { 1.0 };
                }
            }
        }
        Family::Gtr => {
            let pairs = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3)];
            s[[2, 3]] = 1.0;
            s[[3, 2]] = 1.0;
            for ((i, j), name) in pairs.iter().zip(GTR_RATE_NAMES.iter()) {
                let r = params.value(name)?;
                s[[*i, *j]] = r;
                s[[*j, *i]] = r;
            }
        }
    }
    for i in 0..n {
        s[[i, i]] = 0.0;
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_models() -> Vec<ReversibleModel> {
        vec![
            ReversibleModel::equal_rate(Alphabet::Dna).unwrap(),
            ReversibleModel::equal_rate(Alphabet::Protein).unwrap(),
            ReversibleModel::k80(3.0).unwrap(),
            ReversibleModel::t92(2.0, 0.6).unwrap(),
            ReversibleModel::hky85(2.0, [0.3, 0.2, 0.2, 0.3]).unwrap(),
            ReversibleModel::gtr([1.0, 2.0, 0.5, 0.8, 3.0], [0.1, 0.2, 0.3, 0.4]).unwrap(),
        ]
    }

    #[test]
    fn jc69_closed_form() {
        let m = ReversibleModel::equal_rate(Alphabet::Dna).unwrap();
        for &t in &[0.01, 0.1, 0.5, 2.0] {
            let p = m.transition_probs(t);
            let e = (-4.0 * t / 3.0).exp();
            let same = 0.25 + 0.75 * e;
            let diff = 0.25 - 0.25 * e;
            for i in 0..4 {
                for j in 0..4 {
                    let expected = if i == j { same } else { diff };
                    assert!(
                        (p[[i, j]] - expected).abs() < 1e-12,
                        "JC69 mismatch at ({},{}) t={}: {} vs {}",
                        i,
                        j,
                        t,
                        p[[i, j]],
                        expected
                    );
                }
            }
        }
    }

    #[test]
    fn p_zero_is_identity() {
        for m in all_models() {
            let p = m.transition_probs(0.0);
            let n = m.n_states();
            for i in 0..n {
                for j in 0..n {
                    let expected = if i == j { 1.0 } else { 0.0 };
                    assert!(
                        (p[[i, j]] - expected).abs() < 1e-9,
                        "{} P(0)[{}][{}] = {}",
                        m.name(),
                        i,
                        j,
                        p[[i, j]]
                    );
                }
            }
        }
    }

    #[test]
    fn rows_sum_to_one() {
        for m in all_models() {
            for &t in &[0.01, 0.3, 1.0, 5.0] {
                for (i, row) in m.transition_probs(t).rows().into_iter().enumerate() {
                    assert!(
                        (row.sum() - 1.0).abs() < 1e-9,
                        "{} row {} sums to {} at t = {}",
                        m.name(),
                        i,
                        row.sum(),
                        t
                    );
                }
            }
        }
    }

    #[test]
    fn derivative_matches_finite_difference() {
        let m = ReversibleModel::hky85(4.0, [0.35, 0.15, 0.2, 0.3]).unwrap();
        let (t, h) = (0.4, 1e-5);
        let d = m.d_transition_probs(t);
        let d2 = m.d2_transition_probs(t);
        let fd = (m.transition_probs(t + h) - m.transition_probs(t - h)) / (2.0 * h);
        let fd2 = (m.d_transition_probs(t + h) - m.d_transition_probs(t - h)) / (2.0 * h);
        for ((i, j), x) in d.indexed_iter() {
            assert!((x - fd[[i, j]]).abs() < 1e-7);
            assert!((d2[[i, j]] - fd2[[i, j]]).abs() < 1e-7);
        }
    }

    #[test]
    fn t92_frequencies_follow_theta() {
        let mut m = ReversibleModel::t92(2.0, 0.5).unwrap();
        let mut p = ParameterList::new();
        p.add(Parameter::new("theta", 0.7)).unwrap();
        assert!(m.set_parameter_values(&p).unwrap());
        assert!((m.frequencies()[1] - 0.35).abs() < 1e-12);
        assert!((m.frequencies()[0] - 0.15).abs() < 1e-12);
    }

    #[test]
    fn kappa_raises_transitions() {
        let m = ReversibleModel::k80(5.0).unwrap();
        let p = m.transition_probs(0.1);
        assert!(p[[0, 2]] > p[[0, 1]]);
        assert!(p[[1, 3]] > p[[1, 2]]);
    }

    #[test]
    fn constraints_enforced() {
        assert!(ReversibleModel::k80(-1.0).is_err());
        assert!(ReversibleModel::t92(1.0, 1.0).is_err());
        assert!(ReversibleModel::hky85(1.0, [0.5, 0.5, 0.5, 0.5]).is_err());
        let mut m = ReversibleModel::k80(1.0).unwrap();
        let mut p = ParameterList::new();
        p.add(Parameter::new("kappa", 0.0)).unwrap();
        assert!(m.set_parameter_values(&p).is_err());
        assert_eq!(m.parameters().value("kappa").unwrap(), 1.0);
    }

    #[test]
    fn fixed_frequencies_cannot_be_set() {
        let mut jc = ReversibleModel::equal_rate(Alphabet::Dna).unwrap();
        assert!(matches!(
            jc.set_frequencies(&[0.1, 0.2, 0.3, 0.4]),
            Err(CyaneaError::Unsupported(_))
        ));
        let mut hky = ReversibleModel::hky85(2.0, [0.25; 4]).unwrap();
        hky.set_frequencies(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(hky.frequencies()[3], 0.4);
    }
}
