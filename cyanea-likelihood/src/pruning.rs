//! Felsenstein pruning over a non-homogeneous model set.
//!
//! Every non-root node carries the model its branch evolves under. The
//! engine keeps one transition matrix per node and rate class, recomputes
//! only what a parameter change touches, and differentiates with respect to
//! branch lengths by substituting `dP/dt` (or `d²P/dt²`) on one edge and
//! recomputing the path from that edge to the root.
//!
//! Branch lengths are exposed as parameters `BrLen{id}`. When the root has
//! exactly two children, their two edges are replaced by the total length
//! `BrLenRoot` and the fraction `RootPosition` of it carried by the first
//! child.

use std::collections::BTreeSet;

use cyanea_core::{Constraint, CyaneaError, Parameter, ParameterList, Result, Summarizable};
use ndarray::{Array2, Array3, Axis};
use tracing::{debug, trace};

use crate::config::LikelihoodConfig;
use crate::distribution::DiscreteDistribution;
use crate::likelihood_data::{LikelihoodData, Slot};
use crate::model_set::SubstitutionModelSet;
use crate::sites::SitePatterns;
use crate::tree::{NodeId, PhyloTree};

const ROOT_LENGTH: &str = "BrLenRoot";
const ROOT_POSITION: &str = "RootPosition";

/// Which transition matrices an edge contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Order {
    Zero,
    First,
    Second,
}

/// One child's contribution to its parent's array.
struct Factor<'a> {
    values: &'a Array3<f64>,
    links: &'a [usize],
    matrices: &'a [Array2<f64>],
}

/// Likelihood of aligned sequences on a tree whose branches may evolve
/// under different substitution models.
#[derive(Debug, Clone)]
pub struct NonHomogeneousTreeLikelihood {
    tree: PhyloTree,
    model_set: SubstitutionModelSet,
    rate_dist: Box<dyn DiscreteDistribution>,
    config: LikelihoodConfig,
    branch_params: ParameterList,
    rate_params: ParameterList,
    params: ParameterList,
    root_edges: Option<(NodeId, NodeId)>,
    branch_lengths: Vec<f64>,
    pxy: Vec<Vec<Array2<f64>>>,
    dpxy: Vec<Vec<Array2<f64>>>,
    d2pxy: Vec<Vec<Array2<f64>>>,
    data: Option<LikelihoodData>,
}

impl NonHomogeneousTreeLikelihood {
    /// Build the engine. Branch lengths outside the configured bounds are
    /// moved onto them; data is attached later with [`set_data`](Self::set_data).
    pub fn new(
        mut tree: PhyloTree,
        model_set: SubstitutionModelSet,
        rate_dist: Box<dyn DiscreteDistribution>,
        config: LikelihoodConfig,
    ) -> Result<Self> {
        config.validate()?;
        model_set.validate(&tree)?;

        let n = tree.node_count();
        let mut branch_lengths = vec![0.0; n];
        for id in tree.branch_ids() {
            let raw = tree.branch_length(id).unwrap_or(config.min_branch_length);
            let len = raw.max(config.min_branch_length).min(config.max_branch_length);
            if len != raw {
                debug!(node = id, from = raw, to = len, "branch length moved into bounds");
                tree.set_branch_length(id, len)?;
            }
            branch_lengths[id] = len;
        }

        let root_children = tree.children(tree.root());
        let root_edges = match root_children {
            [a, b] => Some((*a, *b)),
            _ => None,
        };

        let constraint = config.branch_length_constraint();
        let mut branch_params = ParameterList::new();
        for id in tree.branch_ids() {
            if matches!(root_edges, Some((a, b)) if id == a || id == b) {
                continue;
            }
            branch_params.add(Parameter::constrained(
                format!("BrLen{}", id),
                branch_lengths[id],
                constraint,
            )?)?;
        }
        if let Some((a, b)) = root_edges {
            let total = branch_lengths[a] + branch_lengths[b];
            let position = if total > 0.0 { branch_lengths[a] / total } else { 0.5 };
            branch_params.add(Parameter::constrained(
                ROOT_LENGTH,
                total,
                Constraint::at_least(config.min_branch_length),
            )?)?;
            branch_params.add(Parameter::constrained(
                ROOT_POSITION,
                position,
                Constraint::closed_unit(),
            )?)?;
        }

        let mut rate_params = ParameterList::new();
        if !rate_dist.is_constant() {
            for p in rate_dist.parameters() {
                let mut p = p.clone();
                p.set_name(format!("{}.{}", rate_dist.name(), p.name()));
                rate_params.add(p)?;
            }
        }

        let mut params = branch_params.clone();
        params.add_all(model_set.parameters())?;
        params.add_all(&rate_params)?;

        let mut engine = Self {
            tree,
            model_set,
            rate_dist,
            config,
            branch_params,
            rate_params,
            params,
            root_edges,
            branch_lengths,
            pxy: vec![Vec::new(); n],
            dpxy: vec![Vec::new(); n],
            d2pxy: vec![Vec::new(); n],
            data: None,
        };
        engine.compute_all_transition_probabilities()?;
        Ok(engine)
    }

    /// Attach sequence data and compute the likelihood.
    pub fn set_data(&mut self, patterns: &SitePatterns) -> Result<()> {
        if patterns.alphabet() != self.model_set.alphabet() {
            return Err(CyaneaError::Incompatible(format!(
                "data alphabet {:?} does not match model alphabet {:?}",
                patterns.alphabet(),
                self.model_set.alphabet()
            )));
        }
        self.data = Some(LikelihoodData::new(
            &self.tree,
            patterns,
            self.rate_dist.n_categories(),
            self.config.use_patterns,
        )?);
        self.compute_tree_likelihood()
    }

    pub fn tree(&self) -> &PhyloTree {
        &self.tree
    }

    pub fn model_set(&self) -> &SubstitutionModelSet {
        &self.model_set
    }

    pub fn rate_distribution(&self) -> &dyn DiscreteDistribution {
        self.rate_dist.as_ref()
    }

    pub fn likelihood_data(&self) -> Option<&LikelihoodData> {
        self.data.as_ref()
    }

    pub fn n_classes(&self) -> usize {
        self.rate_dist.n_categories()
    }

    /// Branch, model-set and rate parameters, in that order.
    pub fn parameters(&self) -> &ParameterList {
        &self.params
    }

    pub fn branch_length_parameters(&self) -> &ParameterList {
        &self.branch_params
    }

    pub fn substitution_model_parameters(&self) -> &ParameterList {
        self.model_set.parameters()
    }

    pub fn rate_distribution_parameters(&self) -> &ParameterList {
        &self.rate_params
    }

    /// Transition matrices of the branch above `node`, one per rate class.
    pub fn transition_probabilities(&self, node: NodeId) -> Result<&[Array2<f64>]> {
        match self.pxy.get(node) {
            Some(m) if !m.is_empty() => Ok(m),
            _ => Err(CyaneaError::OutOfRange(format!("node {} has no branch", node))),
        }
    }

    // ---- likelihood ------------------------------------------------------

    pub fn likelihood(&self) -> Result<f64> {
        let values = self.root_values(Slot::Likelihood)?;
        let data = self.data()?;
        let mut l = 1.0;
        for site in 0..data.n_sites() {
            l *= values[data.root_pattern(site)?];
        }
        Ok(l)
    }

    pub fn log_likelihood(&self) -> Result<f64> {
        let values = self.root_values(Slot::Likelihood)?;
        let weights = self.data()?.root_weights();
        Ok(values
            .iter()
            .zip(weights)
            .map(|(&l, &w)| w * clamped_ln(l))
            .sum())
    }

    /// `-log L`, the quantity minimised by optimisers.
    pub fn value(&self) -> Result<f64> {
        Ok(-self.log_likelihood()?)
    }

    pub fn likelihood_for_site(&self, site: usize) -> Result<f64> {
        let data = self.data()?;
        let pattern = data.root_pattern(site)?;
        let root = data.node(self.tree.root())?.array(Slot::Likelihood);
        Ok(self.pattern_value(root, pattern))
    }

    pub fn log_likelihood_for_site(&self, site: usize) -> Result<f64> {
        Ok(clamped_ln(self.likelihood_for_site(site)?))
    }

    /// Log-likelihood of every alignment site.
    pub fn site_log_likelihoods(&self) -> Result<Vec<f64>> {
        let values = self.root_values(Slot::Likelihood)?;
        let data = self.data()?;
        (0..data.n_sites())
            .map(|site| Ok(clamped_ln(values[data.root_pattern(site)?])))
            .collect()
    }

    /// Likelihood of `site` conditional on rate class `class`.
    pub fn likelihood_for_site_and_class(&self, site: usize, class: usize) -> Result<f64> {
        let root = self.root_array_at(site, class)?;
        let freqs = self.model_set.root_frequencies();
        Ok(root.iter().zip(freqs).map(|(l, f)| l * f).sum())
    }

    /// Likelihood of `site` given rate class `class` and root state `state`.
    pub fn likelihood_for_site_class_and_state(
        &self,
        site: usize,
        class: usize,
        state: usize,
    ) -> Result<f64> {
        let root = self.root_array_at(site, class)?;
        root.get(state).copied().ok_or_else(|| {
            CyaneaError::OutOfRange(format!("state {} of {}", state, root.len()))
        })
    }

    // ---- parameters ------------------------------------------------------

    pub fn set_parameter_value(&mut self, name: &str, value: f64) -> Result<()> {
        if !self.params.has_parameter(name) {
            return Err(CyaneaError::ParameterNotFound(name.to_string()));
        }
        let mut list = ParameterList::new();
        list.add(Parameter::new(name, value))?;
        self.set_parameter_values(&list)
    }

    /// Copy every known value from `params` and update what changed.
    pub fn set_parameter_values(&mut self, params: &ParameterList) -> Result<()> {
        let changed = self.params.match_values(params)?;
        self.fire_parameter_changed(&changed)
    }

    /// Push `changed` into branch lengths, the model set and the rate
    /// distribution, then recompute the affected transition matrices and
    /// the likelihood arrays above them.
    pub fn fire_parameter_changed(&mut self, changed: &ParameterList) -> Result<()> {
        if changed.is_empty() {
            return Ok(());
        }
        self.params.match_values(changed)?;
        let mut touched: BTreeSet<NodeId> = BTreeSet::new();

        let branch_changed = self.branch_params.match_values(changed)?;
        let mut root_changed = false;
        for p in &branch_changed {
            if p.name() == ROOT_LENGTH || p.name() == ROOT_POSITION {
                root_changed = true;
            } else if let Some(id) = branch_node(p.name()) {
                self.set_branch(id, p.value())?;
                touched.insert(id);
            }
        }
        if root_changed {
            if let Some((a, b)) = self.root_edges {
                let len = self.branch_params.value(ROOT_LENGTH)?;
                let pos = self.branch_params.value(ROOT_POSITION)?;
                self.set_branch(a, len * pos)?;
                self.set_branch(b, len * (1.0 - pos))?;
                touched.insert(a);
                touched.insert(b);
            }
        }

        let change = self.model_set.set_parameter_values(changed)?;
        for id in &change.models {
            touched.extend(self.model_set.nodes_with_model(*id));
        }

        if !self.rate_params.match_values(changed)?.is_empty() {
            let prefix = format!("{}.", self.rate_dist.name());
            let own: ParameterList = self
                .rate_params
                .iter()
                .filter_map(|p| {
                    p.name()
                        .strip_prefix(&prefix)
                        .map(|base| Parameter::new(base, p.value()))
                })
                .collect();
            self.rate_dist.set_parameter_values(&own)?;
            touched.extend(self.tree.branch_ids());
        }

        for &id in &touched {
            self.compute_transition_probabilities(id)?;
        }
        if self.data.is_some() {
            self.recompute_above(&touched)?;
        }
        Ok(())
    }

    // ---- derivatives -----------------------------------------------------

    /// First derivative of `-log L` with respect to a branch parameter.
    pub fn first_order_derivative(&mut self, name: &str) -> Result<f64> {
        self.check_derivable(name)?;
        let l = self.root_values(Slot::Likelihood)?;
        let weights = self.data()?.root_weights().to_vec();
        let (d, _) = self.branch_derivatives(name, false)?;
        Ok(-weighted_sum(&weights, |i| d[i] / l[i]))
    }

    /// Second derivative of `-log L` with respect to a branch parameter.
    ///
    /// For the root parameters the cross term between the two root edges
    /// is computed exactly, with both edges differentiated at once.
    pub fn second_order_derivative(&mut self, name: &str) -> Result<f64> {
        self.check_derivable(name)?;
        let l = self.root_values(Slot::Likelihood)?;
        let weights = self.data()?.root_weights().to_vec();
        let (d, d2) = self.branch_derivatives(name, true)?;
        Ok(-weighted_sum(&weights, |i| {
            let ratio = d[i] / l[i];
            d2[i] / l[i] - ratio * ratio
        }))
    }

    fn check_derivable(&self, name: &str) -> Result<()> {
        if !self.params.has_parameter(name) {
            return Err(CyaneaError::ParameterNotFound(name.to_string()));
        }
        if self.rate_params.has_parameter(name) {
            return Err(CyaneaError::Unsupported(format!(
                "derivative with respect to rate distribution parameter '{}'",
                name
            )));
        }
        if self.model_set.parameters().has_parameter(name) {
            return Err(CyaneaError::Unsupported(format!(
                "derivative with respect to substitution model parameter '{}'",
                name
            )));
        }
        Ok(())
    }

    /// Per-pattern `dL` and, when asked, `d²L` for branch parameter `name`.
    fn branch_derivatives(&mut self, name: &str, second: bool) -> Result<(Vec<f64>, Vec<f64>)> {
        if name == ROOT_LENGTH || name == ROOT_POSITION {
            let (a, b) = self
                .root_edges
                .ok_or_else(|| CyaneaError::ParameterNotFound(name.to_string()))?;
            let (u, v) = if name == ROOT_LENGTH {
                let pos = self.branch_params.value(ROOT_POSITION)?;
                (pos, 1.0 - pos)
            } else {
                let len = self.branch_params.value(ROOT_LENGTH)?;
                (len, -len)
            };
            let da = self.edge_values(&[(a, Order::First)], Slot::FirstDerivative)?;
            let db = self.edge_values(&[(b, Order::First)], Slot::FirstDerivative)?;
            let d = combine2(&da, &db, u, v);
            if !second {
                return Ok((d, Vec::new()));
            }
            let daa = self.edge_values(&[(a, Order::Second)], Slot::SecondDerivative)?;
            let dbb = self.edge_values(&[(b, Order::Second)], Slot::SecondDerivative)?;
            let dab = self.edge_values(
                &[(a, Order::First), (b, Order::First)],
                Slot::SecondDerivative,
            )?;
            let d2 = (0..d.len())
                .map(|i| u * u * daa[i] + 2.0 * u * v * dab[i] + v * v * dbb[i])
                .collect();
            return Ok((d, d2));
        }

        let id = branch_node(name).ok_or_else(|| CyaneaError::ParameterNotFound(name.to_string()))?;
        let d = self.edge_values(&[(id, Order::First)], Slot::FirstDerivative)?;
        let d2 = if second {
            self.edge_values(&[(id, Order::Second)], Slot::SecondDerivative)?
        } else {
            Vec::new()
        };
        Ok((d, d2))
    }

    /// Substitute derivative matrices on `edges` (siblings), propagate into
    /// `slot` up to the root and read the per-pattern root values.
    fn edge_values(&mut self, edges: &[(NodeId, Order)], slot: Slot) -> Result<Vec<f64>> {
        self.dirty_path(edges, slot)?;
        self.root_values(slot)
    }

    fn dirty_path(&mut self, edges: &[(NodeId, Order)], slot: Slot) -> Result<()> {
        let first = edges
            .first()
            .ok_or_else(|| CyaneaError::InvalidInput("no edge to differentiate".into()))?;
        let father = self
            .tree
            .parent(first.0)
            .ok_or_else(|| CyaneaError::OutOfRange(format!("node {} has no branch", first.0)))?;

        self.update_node(father, slot, |child| {
            let order = edges
                .iter()
                .find(|(e, _)| *e == child)
                .map_or(Order::Zero, |&(_, o)| o);
            (Slot::Likelihood, order)
        })?;
        let ancestors = self.tree.ancestors(father);
        let mut below = father;
        for &node in &ancestors {
            let path = below;
            self.update_node(node, slot, move |child| {
                if child == path {
                    (slot, Order::Zero)
                } else {
                    (Slot::Likelihood, Order::Zero)
                }
            })?;
            below = node;
        }
        trace!(edges = edges.len(), nodes = ancestors.len() + 1, "dirty path recomputed");
        Ok(())
    }

    // ---- recursion -------------------------------------------------------

    fn compute_all_transition_probabilities(&mut self) -> Result<()> {
        for id in self.tree.branch_ids() {
            self.compute_transition_probabilities(id)?;
        }
        Ok(())
    }

    fn compute_transition_probabilities(&mut self, id: NodeId) -> Result<()> {
        let model = self.model_set.model_for_node(id)?;
        let len = self.branch_lengths[id];
        let rates = self.rate_dist.categories();
        self.pxy[id] = rates.iter().map(|&r| model.transition_probs(r * len)).collect();
        self.dpxy[id] = rates
            .iter()
            .map(|&r| model.d_transition_probs(r * len) * r)
            .collect();
        self.d2pxy[id] = rates
            .iter()
            .map(|&r| model.d2_transition_probs(r * len) * (r * r))
            .collect();
        Ok(())
    }

    fn compute_tree_likelihood(&mut self) -> Result<()> {
        let order: Vec<NodeId> = self
            .tree
            .iter_postorder()
            .filter(|&id| !self.tree.children(id).is_empty())
            .collect();
        for id in order {
            self.update_node(id, Slot::Likelihood, |_| (Slot::Likelihood, Order::Zero))?;
        }
        Ok(())
    }

    /// Recompute the likelihood arrays of every ancestor of `touched`.
    fn recompute_above(&mut self, touched: &BTreeSet<NodeId>) -> Result<()> {
        let mut dirty = BTreeSet::new();
        for &id in touched {
            if let Some(parent) = self.tree.parent(id) {
                dirty.insert(parent);
                dirty.extend(self.tree.ancestors(parent));
            }
        }
        let order: Vec<NodeId> = self
            .tree
            .iter_postorder()
            .filter(|id| dirty.contains(id))
            .collect();
        for &id in &order {
            self.update_node(id, Slot::Likelihood, |_| (Slot::Likelihood, Order::Zero))?;
        }
        trace!(nodes = order.len(), "likelihood arrays recomputed");
        Ok(())
    }

    /// Rebuild `target` of `node` from its children; `input` picks which
    /// array of each child and which of its edge matrices are used.
    fn update_node<F>(&mut self, node: NodeId, target: Slot, input: F) -> Result<()>
    where
        F: Fn(NodeId) -> (Slot, Order),
    {
        let data = self.data()?;
        let mut factors = Vec::with_capacity(self.tree.children(node).len());
        for &child in self.tree.children(node) {
            let (slot, order) = input(child);
            let son = data.node(child)?;
            factors.push(Factor {
                values: son.array(slot),
                links: son.father_to_son(),
                matrices: self.matrices(child, order),
            });
        }
        let out = combine(
            &factors,
            data.n_patterns(node)?,
            data.n_classes(),
            data.n_states(),
        );
        *self.data_mut()?.node_mut(node)?.array_mut(target) = out;
        Ok(())
    }

    fn matrices(&self, id: NodeId, order: Order) -> &[Array2<f64>] {
        match order {
            Order::Zero => &self.pxy[id],
            Order::First => &self.dpxy[id],
            Order::Second => &self.d2pxy[id],
        }
    }

    fn set_branch(&mut self, id: NodeId, len: f64) -> Result<()> {
        self.tree.set_branch_length(id, len)?;
        self.branch_lengths[id] = len;
        Ok(())
    }

    // ---- root readout ----------------------------------------------------

    /// Value of `slot` at every root pattern, mixed over root states and
    /// rate classes.
    fn root_values(&self, slot: Slot) -> Result<Vec<f64>> {
        let root = self.data()?.node(self.tree.root())?.array(slot);
        Ok((0..root.len_of(Axis(0)))
            .map(|i| self.pattern_value(root, i))
            .collect())
    }

    fn pattern_value(&self, root: &Array3<f64>, pattern: usize) -> f64 {
        let freqs = self.model_set.root_frequencies();
        self.rate_dist
            .probabilities()
            .iter()
            .enumerate()
            .map(|(c, &pc)| {
                let l: f64 = (0..freqs.len()).map(|x| freqs[x] * root[[pattern, c, x]]).sum();
                pc * l
            })
            .sum()
    }

    fn root_array_at(&self, site: usize, class: usize) -> Result<Vec<f64>> {
        let data = self.data()?;
        if class >= data.n_classes() {
            return Err(CyaneaError::OutOfRange(format!(
                "rate class {} of {}",
                class,
                data.n_classes()
            )));
        }
        let pattern = data.root_pattern(site)?;
        let root = data.node(self.tree.root())?.array(Slot::Likelihood);
        Ok((0..data.n_states()).map(|x| root[[pattern, class, x]]).collect())
    }

    fn data(&self) -> Result<&LikelihoodData> {
        self.data
            .as_ref()
            .ok_or_else(|| CyaneaError::InvalidInput("no sequence data attached".into()))
    }

    fn data_mut(&mut self) -> Result<&mut LikelihoodData> {
        self.data
            .as_mut()
            .ok_or_else(|| CyaneaError::InvalidInput("no sequence data attached".into()))
    }
}

impl Summarizable for NonHomogeneousTreeLikelihood {
    fn summary(&self) -> String {
        format!(
            "NonHomogeneousTreeLikelihood: {} nodes, {} models, {} rate classes, {} parameters",
            self.tree.node_count(),
            self.model_set.n_models(),
            self.n_classes(),
            self.params.len()
        )
    }
}

/// Node id of a `BrLen{id}` parameter.
fn branch_node(name: &str) -> Option<NodeId> {
    name.strip_prefix("BrLen")?.parse().ok()
}

/// `ln(l)`, with a negative `l` from round-off treated as zero.
fn clamped_ln(l: f64) -> f64 {
    if l < 0.0 {
        debug!(likelihood = l, "negative site likelihood clamped to zero");
        return f64::NEG_INFINITY;
    }
    l.ln()
}

fn weighted_sum<F: Fn(usize) -> f64>(weights: &[f64], f: F) -> f64 {
    weights.iter().enumerate().map(|(i, &w)| w * f(i)).sum()
}

fn combine2(a: &[f64], b: &[f64], u: f64, v: f64) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| u * x + v * y).collect()
}

/// Product over children of `Σ_y P(x, y) · child(y)`, per pattern and class.
fn combine(factors: &[Factor<'_>], n_patterns: usize, n_classes: usize, n_states: usize) -> Array3<f64> {
    let pattern = |i: usize| -> Array2<f64> {
        let mut out = Array2::<f64>::ones((n_classes, n_states));
        for f in factors {
            let j = f.links[i];
            for c in 0..n_classes {
                let p = &f.matrices[c];
                for x in 0..n_states {
                    let mut sum = 0.0;
                    for y in 0..n_states {
                        sum += p[[x, y]] * f.values[[j, c, y]];
                    }
                    out[[c, x]] *= sum;
                }
            }
        }
        out
    };

    #[cfg(feature = "parallel")]
    let rows: Vec<Array2<f64>> = {
        use rayon::prelude::*;
        (0..n_patterns).into_par_iter().map(pattern).collect()
    };

    #[cfg(not(feature = "parallel"))]
    let rows: Vec<Array2<f64>> = (0..n_patterns).map(pattern).collect();

    let mut out = Array3::<f64>::zeros((n_patterns, n_classes, n_states));
    for (i, row) in rows.iter().enumerate() {
        out.index_axis_mut(Axis(0), i).assign(row);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alphabet::Alphabet;
    use crate::distribution::{ConstantDistribution, GammaDiscreteDistribution};
    use crate::model::reversible::ReversibleModel;
    use crate::model::SubstitutionModel;
    use crate::model_set::RootFrequencies;
    use crate::sites::Alignment;

    // ((a:0.1,b:0.2):0.05,(c:0.3,d:0.1):0.15)
    fn rooted_tree() -> PhyloTree {
        let mut tree = PhyloTree::new();
        let ab = tree.add_child(0, None, Some(0.05)).unwrap();
        let cd = tree.add_child(0, None, Some(0.15)).unwrap();
        tree.add_leaf(ab, "a", 0.1).unwrap();
        tree.add_leaf(ab, "b", 0.2).unwrap();
        tree.add_leaf(cd, "c", 0.3).unwrap();
        tree.add_leaf(cd, "d", 0.1).unwrap();
        tree
    }

    fn patterns() -> SitePatterns {
        let aln = Alignment::from_sequences(
            Alphabet::Dna,
            [
                ("a", "ACGTTACGRA"),
                ("b", "ACGTTACGAA"),
                ("c", "ACTTAACG-A"),
                ("d", "GCTTAACCGA"),
            ],
        )
        .unwrap();
        SitePatterns::from_alignment(&aln).unwrap()
    }

    fn hky() -> Box<dyn SubstitutionModel> {
        Box::new(ReversibleModel::hky85(2.5, [0.3, 0.2, 0.2, 0.3]).unwrap())
    }

    fn engine(rates: Box<dyn DiscreteDistribution>) -> NonHomogeneousTreeLikelihood {
        let tree = rooted_tree();
        let set = SubstitutionModelSet::homogeneous(hky(), &tree).unwrap();
        let mut lik =
            NonHomogeneousTreeLikelihood::new(tree, set, rates, LikelihoodConfig::default()).unwrap();
        lik.set_data(&patterns()).unwrap();
        lik
    }

    fn gamma_engine() -> NonHomogeneousTreeLikelihood {
        engine(Box::new(GammaDiscreteDistribution::new(4, 0.7).unwrap()))
    }

    fn central_difference(lik: &mut NonHomogeneousTreeLikelihood, name: &str, h: f64) -> (f64, f64) {
        let x = lik.parameters().value(name).unwrap();
        let f0 = lik.value().unwrap();
        lik.set_parameter_value(name, x + h).unwrap();
        let fp = lik.value().unwrap();
        lik.set_parameter_value(name, x - h).unwrap();
        let fm = lik.value().unwrap();
        lik.set_parameter_value(name, x).unwrap();
        ((fp - fm) / (2.0 * h), (fp - 2.0 * f0 + fm) / (h * h))
    }

    #[test]
    fn parameter_names() {
        let lik = gamma_engine();
        let names = lik.parameters().names();
        assert!(names.contains(&"BrLen3".to_string()));
        assert!(names.contains(&"BrLenRoot".to_string()));
        assert!(names.contains(&"RootPosition".to_string()));
        assert!(!names.contains(&"BrLen1".to_string()));
        assert!(names.contains(&"kappa_1".to_string()));
        assert!(names.contains(&"Gamma.alpha".to_string()));
        let root = lik.parameters().value("BrLenRoot").unwrap();
        assert!((root - 0.2).abs() < 1e-12);
        let pos = lik.parameters().value("RootPosition").unwrap();
        assert!((pos - 0.25).abs() < 1e-12);
    }

    #[test]
    fn likelihood_matches_log_likelihood() {
        let lik = gamma_engine();
        let ll = lik.log_likelihood().unwrap();
        assert!(ll.is_finite() && ll < 0.0, "log-likelihood {}", ll);
        let l = lik.likelihood().unwrap();
        assert!(
            (l - ll.exp()).abs() <= 1e-9 * ll.exp(),
            "likelihood {} vs exp(log) {}",
            l,
            ll.exp()
        );
        let per_site: f64 = lik.site_log_likelihoods().unwrap().iter().sum();
        assert!((per_site - ll).abs() < 1e-10);
    }

    #[test]
    fn compression_does_not_change_value() {
        let tree = rooted_tree();
        let set = SubstitutionModelSet::homogeneous(hky(), &tree).unwrap();
        let config = LikelihoodConfig {
            use_patterns: false,
            ..LikelihoodConfig::default()
        };
        let rates = Box::new(GammaDiscreteDistribution::new(4, 0.7).unwrap());
        let mut plain = NonHomogeneousTreeLikelihood::new(tree, set, rates, config).unwrap();
        plain.set_data(&patterns()).unwrap();
        let compressed = gamma_engine();
        let a = plain.log_likelihood().unwrap();
        let b = compressed.log_likelihood().unwrap();
        assert!((a - b).abs() < 1e-10, "{} vs {}", a, b);
    }

    #[test]
    fn class_and_state_accessors_agree() {
        let lik = gamma_engine();
        let probs = lik.rate_distribution().probabilities().to_vec();
        let freqs = lik.model_set().root_frequencies().clone();
        for site in [0, 4, 9] {
            let mut total = 0.0;
            for (c, pc) in probs.iter().enumerate() {
                let by_state: f64 = (0..4)
                    .map(|x| freqs[x] * lik.likelihood_for_site_class_and_state(site, c, x).unwrap())
                    .sum();
                let by_class = lik.likelihood_for_site_and_class(site, c).unwrap();
                assert!((by_state - by_class).abs() < 1e-14);
                total += pc * by_class;
            }
            assert!((total - lik.likelihood_for_site(site).unwrap()).abs() < 1e-14);
        }
        assert!(lik.likelihood_for_site(10).is_err());
        assert!(lik.likelihood_for_site_and_class(0, 4).is_err());
    }

    #[test]
    fn branch_derivatives_match_finite_differences() {
        let mut lik = gamma_engine();
        for name in ["BrLen3", "BrLen4", "BrLen5", "BrLen6", "BrLenRoot", "RootPosition"] {
            let d1 = lik.first_order_derivative(name).unwrap();
            let d2 = lik.second_order_derivative(name).unwrap();
            let (n1, n2) = central_difference(&mut lik, name, 1e-4);
            assert!((d1 - n1).abs() < 1e-5 * (1.0 + n1.abs()), "{}: d1 {} vs {}", name, d1, n1);
            assert!((d2 - n2).abs() < 1e-3 * (1.0 + n2.abs()), "{}: d2 {} vs {}", name, d2, n2);
        }
    }

    #[test]
    fn derivatives_leave_likelihood_untouched() {
        let mut lik = gamma_engine();
        let before = lik.log_likelihood().unwrap();
        lik.second_order_derivative("BrLen4").unwrap();
        lik.second_order_derivative("RootPosition").unwrap();
        assert_eq!(before, lik.log_likelihood().unwrap());
    }

    #[test]
    fn unsupported_derivatives() {
        let mut lik = gamma_engine();
        assert!(matches!(
            lik.first_order_derivative("kappa_1"),
            Err(CyaneaError::Unsupported(_))
        ));
        assert!(matches!(
            lik.second_order_derivative("Gamma.alpha"),
            Err(CyaneaError::Unsupported(_))
        ));
        assert!(matches!(
            lik.first_order_derivative("BrLen99"),
            Err(CyaneaError::ParameterNotFound(_))
        ));
    }

    #[test]
    fn incremental_update_matches_fresh_engine() {
        let mut lik = gamma_engine();
        lik.set_parameter_value("BrLen4", 0.4).unwrap();
        lik.set_parameter_value("kappa_1", 4.0).unwrap();
        lik.set_parameter_value("Gamma.alpha", 1.3).unwrap();
        lik.set_parameter_value("RootPosition", 0.6).unwrap();

        let mut tree = rooted_tree();
        tree.set_branch_length(4, 0.4).unwrap();
        tree.set_branch_length(1, 0.12).unwrap();
        tree.set_branch_length(2, 0.08).unwrap();
        let model = Box::new(ReversibleModel::hky85(4.0, [0.3, 0.2, 0.2, 0.3]).unwrap());
        let set = SubstitutionModelSet::homogeneous(model, &tree).unwrap();
        let rates = Box::new(GammaDiscreteDistribution::new(4, 1.3).unwrap());
        let mut fresh =
            NonHomogeneousTreeLikelihood::new(tree, set, rates, LikelihoodConfig::default()).unwrap();
        fresh.set_data(&patterns()).unwrap();

        let a = lik.log_likelihood().unwrap();
        let b = fresh.log_likelihood().unwrap();
        assert!((a - b).abs() < 1e-9, "incremental {} vs fresh {}", a, b);
        assert!((lik.tree().branch_length(1).unwrap() - 0.12).abs() < 1e-12);
    }

    #[test]
    fn non_homogeneous_root_frequencies() {
        let tree = rooted_tree();
        let root = RootFrequencies::stick_breaking(&[0.1, 0.4, 0.4, 0.1]).unwrap();
        let mut set = SubstitutionModelSet::new(Alphabet::Dna, root).unwrap();
        set.add_model(hky(), &[1, 3, 4], &["kappa"]).unwrap();
        set.add_model(Box::new(ReversibleModel::k80(1.5).unwrap()), &[2, 5, 6], &[])
            .unwrap();
        let mut lik = NonHomogeneousTreeLikelihood::new(
            tree,
            set,
            Box::new(ConstantDistribution::new(1.0)),
            LikelihoodConfig::default(),
        )
        .unwrap();
        lik.set_data(&patterns()).unwrap();
        let before = lik.log_likelihood().unwrap();
        lik.set_parameter_value("root.theta1", 0.3).unwrap();
        assert_ne!(before, lik.log_likelihood().unwrap());
        assert!(lik.rate_distribution_parameters().is_empty());
    }

    #[test]
    fn wrong_alphabet_rejected() {
        let tree = rooted_tree();
        let set = SubstitutionModelSet::homogeneous(hky(), &tree).unwrap();
        let mut lik = NonHomogeneousTreeLikelihood::new(
            tree,
            set,
            Box::new(ConstantDistribution::new(1.0)),
            LikelihoodConfig::default(),
        )
        .unwrap();
        assert!(lik.log_likelihood().is_err());
        let aln = Alignment::from_sequences(
            Alphabet::Binary,
            [("a", "01"), ("b", "01"), ("c", "10"), ("d", "11")],
        )
        .unwrap();
        let binary = SitePatterns::from_alignment(&aln).unwrap();
        assert!(matches!(lik.set_data(&binary), Err(CyaneaError::Incompatible(_))));
    }
}
