//! Aligned sequences and their compression into distinct site patterns.

use std::collections::HashMap;

use cyanea_core::{CyaneaError, Result, Summarizable};
use tracing::debug;

use crate::alphabet::Alphabet;

/// Named, equal-length sequences over one alphabet.
#[derive(Debug, Clone)]
pub struct Alignment {
    alphabet: Alphabet,
    names: Vec<String>,
    sequences: Vec<Vec<u8>>,
}

impl Alignment {
    pub fn new(alphabet: Alphabet) -> Self {
        Self {
            alphabet,
            names: Vec::new(),
            sequences: Vec::new(),
        }
    }

    /// Build an alignment from `(name, sequence)` pairs.
    pub fn from_sequences<'a, I>(alphabet: Alphabet, sequences: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut aln = Self::new(alphabet);
        for (name, seq) in sequences {
            aln.add_sequence(name, seq.as_bytes())?;
        }
        Ok(aln)
    }

    /// Append a sequence. Names must be unique, lengths equal, and every
    /// symbol valid for the alphabet.
    pub fn add_sequence(&mut self, name: &str, seq: &[u8]) -> Result<()> {
        if self.names.iter().any(|n| n == name) {
            return Err(CyaneaError::InvalidInput(format!("duplicate sequence name '{}'", name)));
        }
        if let Some(first) = self.sequences.first() {
            if first.len() != seq.len() {
                return Err(CyaneaError::InvalidInput(format!(
                    "sequence '{}' has length {}, expected {}",
                    name,
                    seq.len(),
                    first.len()
                )));
            }
        }
        self.alphabet.encode_sequence(seq)?;
        self.names.push(name.to_string());
        self.sequences.push(seq.to_ascii_uppercase());
        Ok(())
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn n_sequences(&self) -> usize {
        self.sequences.len()
    }

    /// Number of sites, counted in alphabet states (codons for a 3-letter word alphabet).
    pub fn n_sites(&self) -> usize {
        self.sequences
            .first()
            .map_or(0, |s| s.len() / self.alphabet.symbol_width())
    }

    /// Symbol of sequence `seq` at `site`.
    pub fn symbol(&self, seq: usize, site: usize) -> &[u8] {
        let w = self.alphabet.symbol_width();
        &self.sequences[seq][site * w..(site + 1) * w]
    }
}

impl Summarizable for Alignment {
    fn summary(&self) -> String {
        format!(
            "Alignment: {} sequences x {} sites",
            self.n_sequences(),
            self.n_sites()
        )
    }
}

/// Distinct alignment columns with their multiplicities.
///
/// Leaf likelihood vectors are stored per sequence and per pattern.
#[derive(Debug, Clone)]
pub struct SitePatterns {
    alphabet: Alphabet,
    names: Vec<String>,
    symbols: Vec<Vec<Vec<u8>>>,
    encoded: Vec<Vec<Vec<f64>>>,
    weights: Vec<f64>,
    site_to_pattern: Vec<usize>,
}

impl SitePatterns {
    /// Compress an alignment. Patterns are numbered by first occurrence.
    pub fn from_alignment(aln: &Alignment) -> Result<Self> {
        if aln.n_sequences() == 0 || aln.n_sites() == 0 {
            return Err(CyaneaError::InvalidInput("empty alignment".into()));
        }
        let n_seq = aln.n_sequences();
        let mut index: HashMap<Vec<&[u8]>, usize> = HashMap::new();
        let mut symbols: Vec<Vec<Vec<u8>>> = vec![Vec::new(); n_seq];
        let mut weights = Vec::new();
        let mut site_to_pattern = Vec::with_capacity(aln.n_sites());

        for site in 0..aln.n_sites() {
            let column: Vec<&[u8]> = (0..n_seq).map(|s| aln.symbol(s, site)).collect();
            let next = weights.len();
            let pattern = *index.entry(column.clone()).or_insert(next);
            if pattern == next {
                weights.push(0.0);
                for (s, sym) in column.iter().enumerate() {
                    symbols[s].push(sym.to_vec());
                }
            }
            weights[pattern] += 1.0;
            site_to_pattern.push(pattern);
        }

        let encoded = symbols
            .iter()
            .map(|seq| {
                seq.iter()
                    .map(|sym| aln.alphabet().encode(sym))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            sites = aln.n_sites(),
            patterns = weights.len(),
            "compressed alignment into site patterns"
        );

        Ok(Self {
            alphabet: aln.alphabet().clone(),
            names: aln.names().to_vec(),
            symbols,
            encoded,
            weights,
            site_to_pattern,
        })
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn sequence_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn n_patterns(&self) -> usize {
        self.weights.len()
    }

    pub fn n_sites(&self) -> usize {
        self.site_to_pattern.len()
    }

    /// Number of sites collapsed into each pattern.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Pattern index of every alignment site.
    pub fn site_to_pattern(&self) -> &[usize] {
        &self.site_to_pattern
    }

    /// Raw symbol of sequence `seq` in `pattern`.
    pub fn symbol(&self, seq: usize, pattern: usize) -> &[u8] {
        &self.symbols[seq][pattern]
    }

    /// State-likelihood vector of sequence `seq` in `pattern`.
    pub fn leaf_likelihoods(&self, seq: usize, pattern: usize) -> &[f64] {
        &self.encoded[seq][pattern]
    }
}
