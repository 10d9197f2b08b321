//! State alphabets and observation encoding.
//!
//! An observed character maps to a state-likelihood vector: one-hot for an
//! unambiguous state, ones over every compatible state for ambiguity codes,
//! gaps and unknown characters.

use cyanea_core::{CyaneaError, Result};

const DNA_LETTERS: &[u8] = b"ACGT";
const RNA_LETTERS: &[u8] = b"ACGU";
const PROTEIN_LETTERS: &[u8] = b"ARNDCQEGHILKMFPSTWYV";

/// A finite state alphabet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Alphabet {
    /// A=0, C=1, G=2, T=3.
    Dna,
    /// A=0, C=1, G=2, U=3.
    Rna,
    /// The 20 amino acids in `ARNDCQEGHILKMFPSTWYV` order.
    Protein,
    /// 0 and 1.
    Binary,
    /// Words of `length` letters over a letter alphabet, the first letter
    /// being the most significant digit of the state index.
    Word { letters: Box<Alphabet>, length: usize },
}

impl Alphabet {
    /// Word alphabet of `length` letters over `letters`.
    pub fn word(letters: Alphabet, length: usize) -> Result<Self> {
        if length == 0 {
            return Err(CyaneaError::InvalidInput("word length must be positive".into()));
        }
        if matches!(letters, Alphabet::Word { .. }) {
            return Err(CyaneaError::InvalidInput("nested word alphabets are not supported".into()));
        }
        Ok(Alphabet::Word {
            letters: Box::new(letters),
            length,
        })
    }

    /// Number of states.
    pub fn size(&self) -> usize {
        match self {
            Alphabet::Dna | Alphabet::Rna => 4,
            Alphabet::Protein => 20,
            Alphabet::Binary => 2,
            Alphabet::Word { letters, length } => letters.size().pow(*length as u32),
        }
    }

    /// Number of characters consumed by one state.
    pub fn symbol_width(&self) -> usize {
        match self {
            Alphabet::Word { length, .. } => *length,
            _ => 1,
        }
    }

    /// Letter states making up a word state, most significant first.
    ///
    /// For letter alphabets this is the state itself.
    pub fn letter_states(&self, state: usize) -> Vec<usize> {
        match self {
            Alphabet::Word { letters, length } => {
                let base = letters.size();
                let mut out = vec![0; *length];
                let mut rest = state;
                for pos in (0..*length).rev() {
                    out[pos] = rest % base;
                    rest /= base;
                }
                out
            }
            _ => vec![state],
        }
    }

    /// Printable symbol of a state.
    pub fn symbol(&self, state: usize) -> String {
        match self {
            Alphabet::Dna => (DNA_LETTERS[state] as char).to_string(),
            Alphabet::Rna => (RNA_LETTERS[state] as char).to_string(),
            Alphabet::Protein => (PROTEIN_LETTERS[state] as char).to_string(),
            Alphabet::Binary => state.to_string(),
            Alphabet::Word { letters, .. } => self
                .letter_states(state)
                .into_iter()
                .map(|s| letters.symbol(s))
                .collect(),
        }
    }

    /// Encode one symbol (of `symbol_width()` characters) into a
    /// state-likelihood vector.
    pub fn encode(&self, symbol: &[u8]) -> Result<Vec<f64>> {
        if symbol.len() != self.symbol_width() {
            return Err(CyaneaError::InvalidInput(format!(
                "symbol of width {} for alphabet of width {}",
                symbol.len(),
                self.symbol_width()
            )));
        }
        match self {
            Alphabet::Word { letters, .. } => {
                let mut acc = vec![1.0];
                for &c in symbol {
                    let letter = letters.encode(&[c])?;
                    let mut next = Vec::with_capacity(acc.len() * letter.len());
                    for &a in &acc {
                        for &l in &letter {
                            next.push(a * l);
                        }
                    }
                    acc = next;
                }
                Ok(acc)
            }
            _ => {
                let compatible = self.compatible_states(symbol[0])?;
                let mut v = vec![0.0; self.size()];
                for s in compatible {
                    v[s] = 1.0;
                }
                Ok(v)
            }
        }
    }

    /// Encode a whole sequence, one vector per state position.
    pub fn encode_sequence(&self, seq: &[u8]) -> Result<Vec<Vec<f64>>> {
        let width = self.symbol_width();
        if seq.len() % width != 0 {
            return Err(CyaneaError::InvalidInput(format!(
                "sequence length {} is not a multiple of the symbol width {}",
                seq.len(),
                width
            )));
        }
        seq.chunks(width).map(|c| self.encode(c)).collect()
    }

    fn compatible_states(&self, c: u8) -> Result<Vec<usize>> {
        let c = c.to_ascii_uppercase();
        let all = || (0..self.size()).collect::<Vec<_>>();
        let states = match self {
            Alphabet::Dna | Alphabet::Rna => {
                let t_or_u = if *self == Alphabet::Dna { b'T' } else { b'U' };
                match c {
                    b'A' => vec![0],
                    b'C' => vec![1],
                    b'G' => vec![2],
                    x if x == t_or_u => vec![3],
                    b'R' => vec![0, 2],
                    b'Y' => vec![1, 3],
                    b'S' => vec![1, 2],
                    b'W' => vec![0, 3],
                    b'K' => vec![2, 3],
                    b'M' => vec![0, 1],
                    b'B' => vec![1, 2, 3],
                    b'D' => vec![0, 2, 3],
                    b'H' => vec![0, 1, 3],
                    b'V' => vec![0, 1, 2],
                    b'N' | b'-' | b'?' | b'X' | b'.' => all(),
                    _ => return Err(unknown(c, self)),
                }
            }
            Alphabet::Protein => match c {
                b'B' => vec![2, 3],
                b'Z' => vec![5, 6],
                b'J' => vec![9, 10],
                b'X' | b'-' | b'?' | b'*' | b'.' => all(),
                _ => match PROTEIN_LETTERS.iter().position(|&l| l == c) {
                    Some(s) => vec![s],
                    None => return Err(unknown(c, self)),
                },
            },
            Alphabet::Binary => match c {
                b'0' => vec![0],
                b'1' => vec![1],
                b'-' | b'?' | b'N' => all(),
                _ => return Err(unknown(c, self)),
            },
            Alphabet::Word { .. } => return Err(unknown(c, self)),
        };
        Ok(states)
    }
}

fn unknown(c: u8, alphabet: &Alphabet) -> CyaneaError {
    CyaneaError::InvalidInput(format!(
        "character '{}' is not valid for alphabet {:?}",
        c as char, alphabet
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(Alphabet::Dna.size(), 4);
        assert_eq!(Alphabet::Protein.size(), 20);
        assert_eq!(Alphabet::word(Alphabet::Dna, 3).unwrap().size(), 64);
    }

    #[test]
    fn dna_one_hot_and_ambiguity() {
        assert_eq!(Alphabet::Dna.encode(b"g").unwrap(), vec![0.0, 0.0, 1.0, 0.0]);
        assert_eq!(Alphabet::Dna.encode(b"R").unwrap(), vec![1.0, 0.0, 1.0, 0.0]);
        assert_eq!(Alphabet::Dna.encode(b"-").unwrap(), vec![1.0; 4]);
        assert!(Alphabet::Dna.encode(b"U").is_err());
        assert_eq!(Alphabet::Rna.encode(b"U").unwrap(), vec![0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn word_encoding_is_product_of_letters() {
        let w = Alphabet::word(Alphabet::Dna, 2).unwrap();
        let v = w.encode(b"CG").unwrap();
        assert_eq!(v.iter().filter(|&&x| x == 1.0).count(), 1);
        assert_eq!(v[4 + 2], 1.0);
        let amb = w.encode(b"CN").unwrap();
        assert_eq!(amb.iter().sum::<f64>(), 4.0);
        assert_eq!(w.letter_states(6), vec![1, 2]);
        assert_eq!(w.symbol(6), "CG");
    }

    #[test]
    fn sequence_width_checked() {
        let w = Alphabet::word(Alphabet::Dna, 3).unwrap();
        assert!(w.encode_sequence(b"ACGT").is_err());
        assert_eq!(w.encode_sequence(b"ACGTTT").unwrap().len(), 2);
    }

    #[test]
    fn protein_symbols_round_trip() {
        for s in 0..20 {
            let sym = Alphabet::Protein.symbol(s);
            let v = Alphabet::Protein.encode(sym.as_bytes()).unwrap();
            assert_eq!(v[s], 1.0);
        }
    }
}
