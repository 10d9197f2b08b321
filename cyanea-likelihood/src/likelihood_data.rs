//! Conditional likelihood arrays of every tree node.
//!
//! Each node owns arrays shaped `[pattern][rate class][state]`. Patterns are
//! compressed per subtree: two alignment columns share a node pattern when
//! they agree on every leaf below that node, so lower nodes usually hold far
//! fewer patterns than the root. Every non-root node stores the link from
//! its parent's patterns to its own.

use std::collections::HashMap;

use cyanea_core::{CyaneaError, Result};
use ndarray::{Array3, Axis};
use tracing::debug;

use crate::sites::SitePatterns;
use crate::tree::{NodeId, PhyloTree};

/// Which of the three parallel arrays of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Likelihood,
    FirstDerivative,
    SecondDerivative,
}

/// Arrays of a single node.
#[derive(Debug, Clone)]
pub struct NodeData {
    likelihoods: Array3<f64>,
    d_likelihoods: Array3<f64>,
    d2_likelihoods: Array3<f64>,
    father_to_son: Vec<usize>,
}

impl NodeData {
    pub fn n_patterns(&self) -> usize {
        self.likelihoods.len_of(Axis(0))
    }

    pub fn array(&self, slot: Slot) -> &Array3<f64> {
        match slot {
            Slot::Likelihood => &self.likelihoods,
            Slot::FirstDerivative => &self.d_likelihoods,
            Slot::SecondDerivative => &self.d2_likelihoods,
        }
    }

    pub fn array_mut(&mut self, slot: Slot) -> &mut Array3<f64> {
        match slot {
            Slot::Likelihood => &mut self.likelihoods,
            Slot::FirstDerivative => &mut self.d_likelihoods,
            Slot::SecondDerivative => &mut self.d2_likelihoods,
        }
    }

    /// Pattern of this node for every pattern of its parent. Empty at the root.
    pub fn father_to_son(&self) -> &[usize] {
        &self.father_to_son
    }
}

/// Per-node arrays plus the root pattern map.
#[derive(Debug, Clone)]
pub struct LikelihoodData {
    nodes: Vec<NodeData>,
    root_weights: Vec<f64>,
    root_patterns: Vec<usize>,
    n_classes: usize,
    n_states: usize,
}

impl LikelihoodData {
    /// Allocate arrays for `tree` and fill the leaves from `patterns`.
    ///
    /// Leaves are matched to sequences by name. With `use_patterns` off,
    /// every alignment site keeps its own column at every node.
    pub fn new(
        tree: &PhyloTree,
        patterns: &SitePatterns,
        n_classes: usize,
        use_patterns: bool,
    ) -> Result<Self> {
        if n_classes == 0 {
            return Err(CyaneaError::InvalidInput("at least one rate class is required".into()));
        }
        let n_states = patterns.alphabet().size();

        // Columns are distinct alignment patterns, or raw sites.
        let columns: Vec<usize> = if use_patterns {
            (0..patterns.n_patterns()).collect()
        } else {
            patterns.site_to_pattern().to_vec()
        };
        let n_columns = columns.len();

        let mut column_to_local: Vec<Vec<usize>> = vec![Vec::new(); tree.node_count()];
        let mut local_counts = vec![0usize; tree.node_count()];
        let mut leaf_sequence: HashMap<NodeId, usize> = HashMap::new();

        for id in tree.iter_postorder() {
            let children = tree.children(id);
            if children.is_empty() {
                let name = tree.name(id).ok_or_else(|| {
                    CyaneaError::InvalidInput(format!("leaf {} has no name", id))
                })?;
                let seq = patterns.sequence_index(name).ok_or_else(|| {
                    CyaneaError::InvalidInput(format!("no sequence for leaf '{}'", name))
                })?;
                leaf_sequence.insert(id, seq);
            }
            let (map, count) = if !use_patterns {
                ((0..n_columns).collect(), n_columns)
            } else if children.is_empty() {
                let seq = leaf_sequence[&id];
                compress(columns.iter().map(|&p| patterns.symbol(seq, p).to_vec()))
            } else {
                compress((0..n_columns).map(|col| {
                    children
                        .iter()
                        .map(|&c| column_to_local[c][col])
                        .collect::<Vec<_>>()
                }))
            };
            column_to_local[id] = map;
            local_counts[id] = count;
        }

        let mut nodes = Vec::with_capacity(tree.node_count());
        for id in 0..tree.node_count() {
            let n = local_counts[id];
            let mut likelihoods = Array3::<f64>::zeros((n, n_classes, n_states));
            if let Some(&seq) = leaf_sequence.get(&id) {
                for (col, &pattern) in columns.iter().enumerate() {
                    let local = column_to_local[id][col];
                    let encoded = patterns.leaf_likelihoods(seq, pattern);
                    for c in 0..n_classes {
                        for (x, &v) in encoded.iter().enumerate() {
                            likelihoods[[local, c, x]] = v;
                        }
                    }
                }
            }
            let father_to_son = match tree.parent(id) {
                Some(parent) => {
                    let mut links = vec![0usize; local_counts[parent]];
                    for col in 0..n_columns {
                        links[column_to_local[parent][col]] = column_to_local[id][col];
                    }
                    links
                }
                None => Vec::new(),
            };
            nodes.push(NodeData {
                d_likelihoods: Array3::zeros(likelihoods.raw_dim()),
                d2_likelihoods: Array3::zeros(likelihoods.raw_dim()),
                likelihoods,
                father_to_son,
            });
        }

        let root = tree.root();
        let mut root_weights = vec![0.0; local_counts[root]];
        let column_weight = |col: usize| {
            if use_patterns {
                patterns.weights()[col]
            } else {
                1.0
            }
        };
        for col in 0..n_columns {
            root_weights[column_to_local[root][col]] += column_weight(col);
        }
        let root_patterns = patterns
            .site_to_pattern()
            .iter()
            .enumerate()
            .map(|(site, &p)| column_to_local[root][if use_patterns { p } else { site }])
            .collect();

        debug!(
            sites = patterns.n_sites(),
            root_patterns = local_counts[root],
            classes = n_classes,
            "initialised likelihood arrays"
        );

        Ok(Self {
            nodes,
            root_weights,
            root_patterns,
            n_classes,
            n_states,
        })
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn n_sites(&self) -> usize {
        self.root_patterns.len()
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeData> {
        self.nodes
            .get(id)
            .ok_or_else(|| CyaneaError::OutOfRange(format!("node {} has no likelihood data", id)))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut NodeData> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| CyaneaError::OutOfRange(format!("node {} has no likelihood data", id)))
    }

    /// Number of compressed patterns at `id`.
    pub fn n_patterns(&self, id: NodeId) -> Result<usize> {
        self.node(id).map(NodeData::n_patterns)
    }

    /// Number of sites behind each root pattern.
    pub fn root_weights(&self) -> &[f64] {
        &self.root_weights
    }

    /// Root pattern of an alignment site.
    pub fn root_pattern(&self, site: usize) -> Result<usize> {
        self.root_patterns.get(site).copied().ok_or_else(|| {
            CyaneaError::OutOfRange(format!("site {} of {}", site, self.root_patterns.len()))
        })
    }
}

/// Number keys by first occurrence.
fn compress<K, I>(keys: I) -> (Vec<usize>, usize)
where
    K: std::hash::Hash + Eq,
    I: Iterator<Item = K>,
{
    let mut seen: HashMap<K, usize> = HashMap::new();
    let map = keys
        .map(|k| {
            let next = seen.len();
            *seen.entry(k).or_insert(next)
        })
        .collect();
    (map, seen.len())
}
