//! Reversible models over words of letters, one letter model per position.
//!
//! Only single-letter changes have a non-zero rate. The rate of changing
//! letter `a` to `b` at position `p` is `rho_p · Q_p(a, b)`, where the
//! position rates `rho` are built from relative rates `relrate1..relrate{L-1}`
//! by stick breaking. Word frequencies are products of letter frequencies.

use cyanea_core::{Constraint, CyaneaError, Parameter, ParameterList, Result};
use ndarray::{Array1, Array2};

use super::SubstitutionModel;
use crate::alphabet::Alphabet;
use crate::linalg::{normalize_rate_matrix, EigenDecomposition};

#[derive(Debug, Clone)]
pub struct WordModel {
    name: String,
    alphabet: Alphabet,
    positions: Vec<Box<dyn SubstitutionModel>>,
    shared: bool,
    params: ParameterList,
    rates: Vec<f64>,
    freqs: Array1<f64>,
    generator: Array2<f64>,
    eigen: EigenDecomposition,
}

impl WordModel {
    /// One distinct model per position, left to right. Parameters of
    /// position `i` (1-based) are exposed as `"{i}_{name}"`.
    pub fn new(models: Vec<Box<dyn SubstitutionModel>>) -> Result<Self> {
        Self::build(models, false)
    }

    /// The same model at every one of `length` positions; its parameters
    /// are shared and keep their names.
    pub fn uniform(model: Box<dyn SubstitutionModel>, length: usize) -> Result<Self> {
        let models = (0..length).map(|_| model.clone()).collect();
        Self::build(models, true)
    }

    fn build(positions: Vec<Box<dyn SubstitutionModel>>, shared: bool) -> Result<Self> {
        let first = positions
            .first()
            .ok_or_else(|| CyaneaError::InvalidInput("word model needs at least one position".into()))?;
        let letters = first.alphabet().clone();
        for m in &positions {
            if *m.alphabet() != letters {
                return Err(CyaneaError::Incompatible(format!(
                    "position models mix alphabets {:?} and {:?}",
                    letters,
                    m.alphabet()
                )));
            }
            if m.eigen().is_none() {
                return Err(CyaneaError::Unsupported(format!(
                    "{} is not a diagonalisable reversible model",
                    m.name()
                )));
            }
        }
        let length = positions.len();
        let alphabet = Alphabet::word(letters, length)?;

        let mut params = ParameterList::new();
        if shared {
            params.add_all(first.parameters())?;
        } else {
            for (i, m) in positions.iter().enumerate() {
                for p in m.parameters() {
                    let mut p = p.clone();
                    p.set_name(format!("{}_{}", i + 1, p.name()));
                    params.add(p)?;
                }
            }
        }
        for i in 1..length {
            let even = 1.0 / (length - i + 1) as f64;
            params.add(Parameter::constrained(
                format!("relrate{}", i),
                even,
                Constraint::open_unit(),
            )?)?;
        }

        let name = format!(
            "Word({})",
            positions
                .iter()
                .map(|m| m.name().to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        let (rates, freqs, generator, eigen) = assemble(&alphabet, &positions, &params)?;
        Ok(Self {
            name,
            alphabet,
            positions,
            shared,
            params,
            rates,
            freqs,
            generator,
            eigen,
        })
    }

    /// Relative rate `rho` of every position; they sum to one.
    pub fn position_rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn length(&self) -> usize {
        self.positions.len()
    }

    fn update(&mut self) -> Result<()> {
        let (rates, freqs, generator, eigen) =
            assemble(&self.alphabet, &self.positions, &self.params)?;
        self.rates = rates;
        self.freqs = freqs;
        self.generator = generator;
        self.eigen = eigen;
        Ok(())
    }
}

/// Position rates, word frequencies, generator and its decomposition.
fn assemble(
    alphabet: &Alphabet,
    positions: &[Box<dyn SubstitutionModel>],
    params: &ParameterList,
) -> Result<(Vec<f64>, Array1<f64>, Array2<f64>, EigenDecomposition)> {
    let length = positions.len();
    let mut rates = Vec::with_capacity(length);
    let mut rest = 1.0;
    for i in 1..length {
        let r = params.value(&format!("relrate{}", i))?;
        rates.push(rest * r);
        rest *= 1.0 - r;
    }
    rates.push(rest);

    let n = alphabet.size();
    let base = positions[0].n_states();
    let mut freqs = Array1::<f64>::zeros(n);
    let mut q = Array2::<f64>::zeros((n, n));
    for w in 0..n {
        let letters = alphabet.letter_states(w);
        freqs[w] = letters
            .iter()
            .zip(positions)
            .map(|(&a, m)| m.frequencies()[a])
            .product();
        let mut out = 0.0;
        for (pos, (&a, m)) in letters.iter().zip(positions).enumerate() {
            let stride = base.pow((length - 1 - pos) as u32);
            let lq = m.generator();
            for b in 0..base {
                if b == a {
                    continue;
                }
                let rate = rates[pos] * lq[[a, b]];
                q[[w, w - a * stride + b * stride]] = rate;
                out += rate;
            }
        }
        q[[w, w]] = -out;
    }
    normalize_rate_matrix(&mut q, &freqs);
    let eigen = EigenDecomposition::from_reversible(&q, &freqs)?;
    Ok((rates, freqs, q, eigen))
}

impl SubstitutionModel for WordModel {
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
        if self.shared {
            for m in &mut self.positions {
                m.set_parameter_values(&self.params)?;
            }
        } else {
            for (i, m) in self.positions.iter_mut().enumerate() {
                let prefix = format!("{}_", i + 1);
                let own: ParameterList = self
                    .params
                    .iter()
                    .filter_map(|p| {
                        p.name()
                            .strip_prefix(&prefix)
                            .map(|base| Parameter::new(base, p.value()))
                    })
                    .collect();
                m.set_parameter_values(&own)?;
            }
        }
        self.update()?;
        Ok(true)
    }

    fn box_clone(&self) -> Box<dyn SubstitutionModel> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::reversible::ReversibleModel;

    fn codon_k80() -> WordModel {
        WordModel::uniform(Box::new(ReversibleModel::k80(2.0).unwrap()), 3).unwrap()
    }

    #[test]
    fn shape_and_parameters() {
        let m = codon_k80();
        assert_eq!(m.n_states(), 64);
        assert_eq!(m.parameters().names(), vec!["kappa", "relrate1", "relrate2"]);
        let rho = m.position_rates();
        assert!(rho.iter().all(|&r| (r - 1.0 / 3.0).abs() < 1e-12));
        assert!((m.frequencies().sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn only_single_letter_changes() {
        let m = WordModel::uniform(Box::new(ReversibleModel::k80(2.0).unwrap()), 2).unwrap();
        let q = m.generator();
        // AA -> CC changes two letters.
        assert_eq!(q[[0, 5]], 0.0);
        assert!(q[[0, 1]] > 0.0);
        assert!(q[[0, 4]] > 0.0);
        for row in q.rows() {
            assert!(row.sum().abs() < 1e-12);
        }
    }

    #[test]
    fn transition_rows_sum_to_one() {
        let m = codon_k80();
        let p = m.transition_probs(0.3);
        for row in p.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-8);
        }
    }

    #[test]
    fn distinct_positions_are_namespaced() {
        let m = WordModel::new(vec![
            Box::new(ReversibleModel::k80(2.0).unwrap()),
            Box::new(ReversibleModel::hky85(3.0, [0.1, 0.2, 0.3, 0.4]).unwrap()),
        ])
        .unwrap();
        assert_eq!(m.parameters().names(), vec!["1_kappa", "2_kappa", "relrate1"]);
        // AC has frequency 0.25 * 0.2.
        assert!((m.frequencies()[1] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn parameter_updates_reach_positions() {
        let mut m = WordModel::new(vec![
            Box::new(ReversibleModel::k80(2.0).unwrap()),
            Box::new(ReversibleModel::k80(2.0).unwrap()),
        ])
        .unwrap();
        let before = m.generator().clone();
        let mut p = ParameterList::new();
        p.add(Parameter::new("2_kappa", 8.0)).unwrap();
        p.add(Parameter::new("relrate1", 0.2)).unwrap();
        assert!(m.set_parameter_values(&p).unwrap());
        assert_ne!(&before, m.generator());
        assert!((m.position_rates()[0] - 0.2).abs() < 1e-12);
        assert!((m.position_rates()[1] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn mixed_alphabets_rejected() {
        let r = WordModel::new(vec![
            Box::new(ReversibleModel::k80(2.0).unwrap()),
            Box::new(ReversibleModel::equal_rate(Alphabet::Binary).unwrap()),
        ]);
        assert!(matches!(r, Err(CyaneaError::Incompatible(_))));
    }
}
