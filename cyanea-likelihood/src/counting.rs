//! Expected substitution counts along a branch, conditioned on its end states.
//!
//! A register splits the off-diagonal generator entries into substitution
//! types. For a reversible generator `Q = V · diag(λ) · Vinv` and a type `k`
//! with rate matrix `B_k`, the expected number of type-`k` events on a branch
//! of length `t` that starts in `i` and ends in `j` is
//!
//! ```text
//! N_k(t)[i][j] = (V · (J(t) ⊙ (Vinv · B_k · V)) · Vinv)[i][j] / P(t)[i][j]
//! J(t)[a][b]   = (exp(λa·t) - exp(λb·t)) / (λa - λb),   or t·exp(λa·t) if λa = λb
//! ```
//!
//! Count matrices are cached per branch length.

use std::collections::VecDeque;
use std::fmt;

use cyanea_core::{CyaneaError, Result, Summarizable};
use ndarray::Array2;
use tracing::debug;

use crate::alphabet::Alphabet;
use crate::config::CountingConfig;
use crate::linalg::EigenDecomposition;
use crate::model::SubstitutionModel;
use crate::model_set::{ModelId, SubstitutionModelSet};
use crate::tree::{NodeId, PhyloTree};

/// Relative gap below which two eigenvalues are treated as equal.
const EIGEN_TIE: f64 = 1e-10;

/// Classification of state changes into numbered substitution types.
///
/// Types are numbered `1..=n_types()`. Type 0 means "not counted", and is
/// always returned for `from == to`.
pub trait SubstitutionRegister: fmt::Debug + Send + Sync {
    fn alphabet(&self) -> &Alphabet;

    fn n_types(&self) -> usize;

    /// Type of a change from `from` to `to`.
    fn type_of(&self, from: usize, to: usize) -> usize;

    /// Human-readable label of a type.
    fn type_name(&self, kind: usize) -> String;

    fn box_clone(&self) -> Box<dyn SubstitutionRegister>;
}

impl Clone for Box<dyn SubstitutionRegister> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Every substitution is of type 1.
#[derive(Debug, Clone)]
pub struct TotalSubstitutionRegister {
    alphabet: Alphabet,
}

impl TotalSubstitutionRegister {
    pub fn new(alphabet: Alphabet) -> Self {
        Self { alphabet }
    }
}

impl SubstitutionRegister for TotalSubstitutionRegister {
    fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    fn n_types(&self) -> usize {
        1
    }

    fn type_of(&self, from: usize, to: usize) -> usize {
        usize::from(from != to)
    }

    fn type_name(&self, _kind: usize) -> String {
        "total".into()
    }

    fn box_clone(&self) -> Box<dyn SubstitutionRegister> {
        Box::new(self.clone())
    }
}

/// Transitions (type 1) and transversions (type 2) of nucleotides.
#[derive(Debug, Clone)]
pub struct TsTvSubstitutionRegister {
    alphabet: Alphabet,
}

impl TsTvSubstitutionRegister {
    /// Fails with [`CyaneaError::Incompatible`] unless `alphabet` is DNA or RNA.
    pub fn new(alphabet: Alphabet) -> Result<Self> {
        match alphabet {
            Alphabet::Dna | Alphabet::Rna => Ok(Self { alphabet }),
            other => Err(CyaneaError::Incompatible(format!(
                "transition/transversion register needs nucleotides, got {:?}",
                other
            ))),
        }
    }
}

impl SubstitutionRegister for TsTvSubstitutionRegister {
    fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    fn n_types(&self) -> usize {
        2
    }

    fn type_of(&self, from: usize, to: usize) -> usize {
        if from == to {
            0
        } else if from % 2 == to % 2 {
            // A=0, G=2 are purines; C=1, T/U=3 are pyrimidines.
            1
        } else {
            2
        }
    }

    fn type_name(&self, kind: usize) -> String {
        match kind {
            1 => "transition".into(),
            2 => "transversion".into(),
            _ => "none".into(),
        }
    }

    fn box_clone(&self) -> Box<dyn SubstitutionRegister> {
        Box::new(self.clone())
    }
}

/// One type per ordered pair of distinct states.
///
/// Pair `(i, j)` is type `i·(n-1) + j' + 1` where `j'` skips the diagonal.
#[derive(Debug, Clone)]
pub struct ExhaustiveSubstitutionRegister {
    alphabet: Alphabet,
}

impl ExhaustiveSubstitutionRegister {
    pub fn new(alphabet: Alphabet) -> Self {
        Self { alphabet }
    }

    fn pair(&self, kind: usize) -> Option<(usize, usize)> {
        let n = self.alphabet.size();
        if kind == 0 || kind > self.n_types() {
            return None;
        }
        let k = kind - 1;
        let from = k / (n - 1);
        let rest = k % (n - 1);
        let to = if rest >= from { rest + 1 } else { rest };
        Some((from, to))
    }
}

impl SubstitutionRegister for ExhaustiveSubstitutionRegister {
    fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    fn n_types(&self) -> usize {
        let n = self.alphabet.size();
        n * n.saturating_sub(1)
    }

    fn type_of(&self, from: usize, to: usize) -> usize {
        if from == to {
            return 0;
        }
        let n = self.alphabet.size();
        let column = if to > from { to - 1 } else { to };
        from * (n - 1) + column + 1
    }

    fn type_name(&self, kind: usize) -> String {
        match self.pair(kind) {
            Some((from, to)) => format!(
                "{}->{}",
                self.alphabet.symbol(from),
                self.alphabet.symbol(to)
            ),
            None => "none".into(),
        }
    }

    fn box_clone(&self) -> Box<dyn SubstitutionRegister> {
        Box::new(self.clone())
    }
}

/// Spectral substitution counter for reversible models.
#[derive(Debug, Clone)]
pub struct DecompositionSubstitutionCount {
    register: Box<dyn SubstitutionRegister>,
    model_name: String,
    eigen: EigenDecomposition,
    /// `Vinv · B_k · V` for every type, index `k - 1`.
    inside: Vec<Array2<f64>>,
    /// Most recently used lengths at the back.
    cache: VecDeque<(u64, Vec<Array2<f64>>)>,
    config: CountingConfig,
}

impl DecompositionSubstitutionCount {
    /// Build a counter for `model` under `register`.
    ///
    /// The register alphabet must match the model's, and the model must
    /// expose an eigendecomposition.
    pub fn new(
        model: &dyn SubstitutionModel,
        register: Box<dyn SubstitutionRegister>,
        config: CountingConfig,
    ) -> Result<Self> {
        let (eigen, inside) = decompose(model, register.as_ref())?;
        Ok(Self {
            model_name: model.name().to_string(),
            register,
            eigen,
            inside,
            cache: VecDeque::new(),
            config,
        })
    }

    pub fn register(&self) -> &dyn SubstitutionRegister {
        self.register.as_ref()
    }

    pub fn n_types(&self) -> usize {
        self.register.n_types()
    }

    /// Number of branch lengths currently cached.
    pub fn cached_lengths(&self) -> usize {
        self.cache.len()
    }

    /// Switch to another model, dropping every cached count.
    pub fn set_substitution_model(&mut self, model: &dyn SubstitutionModel) -> Result<()> {
        let (eigen, inside) = decompose(model, self.register.as_ref())?;
        self.eigen = eigen;
        self.inside = inside;
        self.model_name = model.name().to_string();
        self.cache.clear();
        Ok(())
    }

    /// Matrix of expected type-`kind` counts for every pair of end states.
    pub fn all_numbers_of_substitutions(&mut self, length: f64, kind: usize) -> Result<Array2<f64>> {
        self.check_type(kind)?;
        let counts = self.counts(length)?;
        Ok(counts[kind - 1].clone())
    }

    /// Expected type-`kind` count on a branch from `from` to `to`.
    pub fn number_of_substitutions(
        &mut self,
        from: usize,
        to: usize,
        length: f64,
        kind: usize,
    ) -> Result<f64> {
        self.check_type(kind)?;
        self.check_states(from, to)?;
        let counts = self.counts(length)?;
        Ok(counts[kind - 1][[from, to]])
    }

    /// Expected counts of every type on a branch from `from` to `to`.
    pub fn numbers_for_each_type(&mut self, from: usize, to: usize, length: f64) -> Result<Vec<f64>> {
        self.check_states(from, to)?;
        let counts = self.counts(length)?;
        Ok(counts.iter().map(|m| m[[from, to]]).collect())
    }

    fn check_type(&self, kind: usize) -> Result<()> {
        if kind == 0 || kind > self.n_types() {
            return Err(CyaneaError::OutOfRange(format!(
                "substitution type {} not in 1..={}",
                kind,
                self.n_types()
            )));
        }
        Ok(())
    }

    fn check_states(&self, from: usize, to: usize) -> Result<()> {
        let n = self.eigen.n_states();
        if from >= n || to >= n {
            return Err(CyaneaError::OutOfRange(format!(
                "states ({}, {}) for a {}-state model",
                from, to, n
            )));
        }
        Ok(())
    }

    fn counts(&mut self, length: f64) -> Result<&[Array2<f64>]> {
        if !(length >= 0.0) || !length.is_finite() {
            return Err(CyaneaError::OutOfRange(format!(
                "branch length must be non-negative, got {}",
                length
            )));
        }
        let key = length.to_bits();
        match self.cache.iter().position(|(k, _)| *k == key) {
            Some(pos) => {
                if let Some(hit) = self.cache.remove(pos) {
                    self.cache.push_back(hit);
                }
            }
            None => {
                debug!(length, model = %self.model_name, "computing substitution counts");
                let counts = self.compute(length);
                while self.cache.len() >= self.config.cache_capacity.max(1) {
                    self.cache.pop_front();
                }
                self.cache.push_back((key, counts));
            }
        }
        Ok(self.cache.back().map(|(_, m)| m.as_slice()).unwrap_or(&[]))
    }

    fn compute(&self, length: f64) -> Vec<Array2<f64>> {
        let lambda = self.eigen.eigenvalues();
        let n = lambda.len();
        let mut j = Array2::<f64>::zeros((n, n));
        for a in 0..n {
            for b in 0..n {
                let (la, lb) = (lambda[a], lambda[b]);
                let scale = la.abs().max(lb.abs()).max(1.0);
                j[[a, b]] = if (la - lb).abs() <= EIGEN_TIE * scale {
                    length * (0.5 * (la + lb) * length).exp()
                } else {
                    ((la * length).exp() - (lb * length).exp()) / (la - lb)
                };
            }
        }

        let v = self.eigen.right_eigenvectors();
        let v_inv = self.eigen.left_eigenvectors();
        let p = self.eigen.transition(length);

        self.inside
            .iter()
            .map(|inside| {
                let mut m = v.dot(&(&j * inside)).dot(v_inv);
                m.zip_mut_with(&p, |c, &pij| {
                    let x = *c / pij;
                    *c = if x.is_nan() || x < 0.0 { 0.0 } else { x };
                });
                m
            })
            .collect()
    }
}

impl Summarizable for DecompositionSubstitutionCount {
    fn summary(&self) -> String {
        format!(
            "DecompositionSubstitutionCount: {}, {} types, {} cached lengths",
            self.model_name,
            self.n_types(),
            self.cache.len()
        )
    }
}

fn decompose(
    model: &dyn SubstitutionModel,
    register: &dyn SubstitutionRegister,
) -> Result<(EigenDecomposition, Vec<Array2<f64>>)> {
    if model.alphabet() != register.alphabet() {
        return Err(CyaneaError::Incompatible(format!(
            "register alphabet {:?} does not match {} alphabet {:?}",
            register.alphabet(),
            model.name(),
            model.alphabet()
        )));
    }
    let eigen = model.eigen().cloned().ok_or_else(|| {
        CyaneaError::Unsupported(format!(
            "{} has no eigendecomposition; spectral counting needs a reversible model",
            model.name()
        ))
    })?;

    let q = model.generator();
    let n = q.nrows();
    let v = eigen.right_eigenvectors();
    let v_inv = eigen.left_eigenvectors();
    let inside = (1..=register.n_types())
        .map(|kind| {
            let mut b = Array2::<f64>::zeros((n, n));
            for from in 0..n {
                for to in 0..n {
                    if from != to && register.type_of(from, to) == kind {
                        b[[from, to]] = q[[from, to]];
                    }
                }
            }
            v_inv.dot(&b).dot(v)
        })
        .collect();
    Ok((eigen, inside))
}

/// Count matrices of every branch of `tree`, one per substitution type.
///
/// Branches sharing a model reuse one counter. The result is in pre-order.
pub fn branch_substitution_counts(
    tree: &PhyloTree,
    model_set: &SubstitutionModelSet,
    register: &dyn SubstitutionRegister,
    config: &CountingConfig,
) -> Result<Vec<(NodeId, Vec<Array2<f64>>)>> {
    let mut counters: Vec<(ModelId, DecompositionSubstitutionCount)> = Vec::new();
    let mut out = Vec::new();
    for node in tree.iter_preorder() {
        let Some(length) = tree.branch_length(node) else {
            continue;
        };
        if tree.parent(node).is_none() {
            continue;
        }
        let id = model_set.model_id_for_node(node).ok_or_else(|| {
            CyaneaError::OutOfRange(format!("node {} has no model assigned", node))
        })?;
        let slot = match counters.iter().position(|(m, _)| *m == id) {
            Some(slot) => slot,
            None => {
                let counter = DecompositionSubstitutionCount::new(
                    model_set.model(id)?,
                    register.box_clone(),
                    config.clone(),
                )?;
                counters.push((id, counter));
                counters.len() - 1
            }
        };
        let counter = &mut counters[slot].1;
        let per_type = (1..=counter.n_types())
            .map(|kind| counter.all_numbers_of_substitutions(length, kind))
            .collect::<Result<Vec<_>>>()?;
        out.push((node, per_type));
    }
    debug!(branches = out.len(), models = counters.len(), "mapped substitutions");
    Ok(out)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::model::reversible::ReversibleModel;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn tstv_counts_non_negative_and_split_total(
            kappa in 0.2f64..20.0,
            t in 0.01f64..5.0,
        ) {
            let model = ReversibleModel::k80(kappa).unwrap();
            let mut split = DecompositionSubstitutionCount::new(
                &model,
                Box::new(TsTvSubstitutionRegister::new(Alphabet::Dna).unwrap()),
                CountingConfig::default(),
            ).unwrap();
            let mut total = DecompositionSubstitutionCount::new(
                &model,
                Box::new(TotalSubstitutionRegister::new(Alphabet::Dna)),
                CountingConfig::default(),
            ).unwrap();
            for i in 0..4 {
                for j in 0..4 {
                    let parts = split.numbers_for_each_type(i, j, t).unwrap();
                    let all = total.number_of_substitutions(i, j, t, 1).unwrap();
                    prop_assert!(parts.iter().all(|&x| x >= 0.0));
                    let sum: f64 = parts.iter().sum();
                    prop_assert!((sum - all).abs() <= 1e-8 * (1.0 + all.abs()));
                }
            }
        }
    }
}
