//! Tree likelihood expressed on a [`DataflowGraph`].
//!
//! Values are `[state][pattern]` matrices, one per rate class:
//!
//! - conditional (forward) value at a node: product of the edge values of
//!   its children (speciation), or the observed states at a leaf
//! - edge value at the top of a branch: `P · conditional`, or a weighted
//!   sum over the components of a mixture model
//! - above (backward) value at a node: `Pᵀ · (above(parent) ⊙ siblings)`,
//!   with root frequencies above the root
//!
//! Rate classes meet at the root, and in marginal posteriors, through a
//! weighted sum. Graph nodes are created on first request.

use std::collections::{BTreeSet, HashMap};

use cyanea_core::{CyaneaError, Parameter, ParameterList, Result, Summarizable};
use ndarray::Array2;
use tracing::{debug, trace};

use super::graph::{DataflowGraph, Operation, ValueId};
use crate::config::LikelihoodConfig;
use crate::distribution::DiscreteDistribution;
use crate::model_set::SubstitutionModelSet;
use crate::sites::SitePatterns;
use crate::tree::{NodeId, PhyloTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Key {
    Leaf(NodeId),
    Transition(NodeId, usize, usize),
    Conditional(NodeId, usize),
    EdgeComponent(NodeId, usize, usize),
    Edge(NodeId, usize),
    RootPrior,
    RootClass(usize),
    Sites,
    ParentSide(NodeId, usize),
    AboveComponent(NodeId, usize, usize),
    Above(NodeId, usize),
    Joint(NodeId, usize),
    Marginal(NodeId),
}

enum Declaration {
    Input(Array2<f64>),
    Alias(Key),
    Computed(Operation, Vec<Key>),
}

/// Likelihood engine whose intermediate values live in a dataflow graph.
#[derive(Debug, Clone)]
pub struct DataflowLikelihood {
    tree: PhyloTree,
    model_set: SubstitutionModelSet,
    rate_dist: Box<dyn DiscreteDistribution>,
    patterns: SitePatterns,
    leaf_sequence: HashMap<NodeId, usize>,
    branch_lengths: Vec<f64>,
    branch_params: ParameterList,
    rate_params: ParameterList,
    params: ParameterList,
    graph: DataflowGraph,
    keys: HashMap<Key, ValueId>,
}

impl DataflowLikelihood {
    pub fn new(
        mut tree: PhyloTree,
        model_set: SubstitutionModelSet,
        rate_dist: Box<dyn DiscreteDistribution>,
        patterns: &SitePatterns,
        config: LikelihoodConfig,
    ) -> Result<Self> {
        config.validate()?;
        model_set.validate(&tree)?;
        if patterns.alphabet() != model_set.alphabet() {
            return Err(CyaneaError::Incompatible(format!(
                "data alphabet {:?} does not match model alphabet {:?}",
                patterns.alphabet(),
                model_set.alphabet()
            )));
        }

        let mut leaf_sequence = HashMap::new();
        for leaf in tree.leaves() {
            let name = tree
                .name(leaf)
                .ok_or_else(|| CyaneaError::InvalidInput(format!("leaf {} has no name", leaf)))?;
            let seq = patterns.sequence_index(name).ok_or_else(|| {
                CyaneaError::InvalidInput(format!("no sequence for leaf '{}'", name))
            })?;
            leaf_sequence.insert(leaf, seq);
        }

        let constraint = config.branch_length_constraint();
        let mut branch_lengths = vec![0.0; tree.node_count()];
        let mut branch_params = ParameterList::new();
        for id in tree.branch_ids() {
            let raw = tree.branch_length(id).unwrap_or(config.min_branch_length);
            let len = raw.max(config.min_branch_length).min(config.max_branch_length);
            if len != raw {
                tree.set_branch_length(id, len)?;
            }
            branch_lengths[id] = len;
            branch_params.add(Parameter::constrained(
                format!("BrLen{}", id),
                len,
                constraint,
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

        Ok(Self {
            tree,
            model_set,
            rate_dist,
            patterns: patterns.clone(),
            leaf_sequence,
            branch_lengths,
            branch_params,
            rate_params,
            params,
            graph: DataflowGraph::new(),
            keys: HashMap::new(),
        })
    }

    pub fn tree(&self) -> &PhyloTree {
        &self.tree
    }

    pub fn model_set(&self) -> &SubstitutionModelSet {
        &self.model_set
    }

    /// Branch lengths `BrLen{id}`, model-set and rate parameters.
    pub fn parameters(&self) -> &ParameterList {
        &self.params
    }

    pub fn n_classes(&self) -> usize {
        self.rate_dist.n_categories()
    }

    /// Number of graph nodes created so far.
    pub fn graph_size(&self) -> usize {
        self.graph.len()
    }

    pub fn recomputations(&self) -> usize {
        self.graph.recomputations()
    }

    pub fn invalidations(&self) -> usize {
        self.graph.invalidations()
    }

    pub fn reset_counters(&mut self) {
        self.graph.reset_counters();
    }

    // ---- values ----------------------------------------------------------

    /// Likelihood of every site pattern.
    pub fn pattern_likelihoods(&mut self) -> Result<Vec<f64>> {
        let sites = self.value(Key::Sites)?;
        Ok(sites.row(0).to_vec())
    }

    pub fn log_likelihood(&mut self) -> Result<f64> {
        let values = self.pattern_likelihoods()?;
        Ok(values
            .iter()
            .zip(self.patterns.weights())
            .map(|(&l, &w)| {
                if l < 0.0 {
                    debug!(likelihood = l, "negative site likelihood clamped to zero");
                    f64::NEG_INFINITY
                } else {
                    w * l.ln()
                }
            })
            .sum())
    }

    pub fn likelihood(&mut self) -> Result<f64> {
        let values = self.pattern_likelihoods()?;
        Ok(self
            .patterns
            .site_to_pattern()
            .iter()
            .map(|&p| values[p])
            .product())
    }

    /// Forward value below `node` for rate class `class`.
    pub fn conditional_likelihoods(&mut self, node: NodeId, class: usize) -> Result<Array2<f64>> {
        self.check_node_class(node, class)?;
        self.value(Key::Conditional(node, class)).cloned()
    }

    /// Backward value above `node` for rate class `class`: the probability
    /// of everything outside the subtree of `node`, per state of `node`.
    pub fn backward_likelihoods(&mut self, node: NodeId, class: usize) -> Result<Array2<f64>> {
        self.check_node_class(node, class)?;
        self.value(Key::Above(node, class)).cloned()
    }

    /// Posterior state probabilities at `node`, `[state][pattern]`, each
    /// column summing to one.
    pub fn marginal_posteriors(&mut self, node: NodeId) -> Result<Array2<f64>> {
        self.check_node_class(node, 0)?;
        let mut joint = self.value(Key::Marginal(node))?.clone();
        for mut column in joint.columns_mut() {
            let total = column.sum();
            if total > 0.0 {
                column /= total;
            }
        }
        Ok(joint)
    }

    // ---- updates ---------------------------------------------------------

    pub fn set_branch_length(&mut self, node: NodeId, length: f64) -> Result<()> {
        if length < 0.0 {
            return Err(CyaneaError::OutOfRange(format!(
                "negative branch length {} for node {}",
                length, node
            )));
        }
        let name = format!("BrLen{}", node);
        if !self.params.has_parameter(&name) {
            return Err(CyaneaError::OutOfRange(format!("node {} has no branch", node)));
        }
        let mut list = ParameterList::new();
        list.add(Parameter::new(name, length))?;
        self.set_parameter_values(&list)
    }

    /// Copy every known value from `params`; only the graph inputs they
    /// feed are rewritten, which invalidates exactly their dependents.
    pub fn set_parameter_values(&mut self, params: &ParameterList) -> Result<()> {
        let changed = self.params.match_values(params)?;
        if changed.is_empty() {
            return Ok(());
        }
        let mut touched = BTreeSet::new();
        for p in &self.branch_params.match_values(&changed)? {
            if let Some(id) = p.name().strip_prefix("BrLen").and_then(|s| s.parse().ok()) {
                self.tree.set_branch_length(id, p.value())?;
                self.branch_lengths[id] = p.value();
                touched.insert(id);
            }
        }

        let change = self.model_set.set_parameter_values(&changed)?;
        for id in &change.models {
            touched.extend(self.model_set.nodes_with_model(*id));
        }
        if change.root_frequencies {
            if let Some(&id) = self.keys.get(&Key::RootPrior) {
                let prior = self.root_prior();
                self.graph.set_input(id, prior)?;
            }
        }

        if !self.rate_params.match_values(&changed)?.is_empty() {
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
            self.refresh_class_weights()?;
            touched.extend(self.tree.branch_ids());
        }

        for &node in &touched {
            self.refresh_edge(node)?;
        }
        trace!(edges = touched.len(), "dataflow inputs rewritten");
        Ok(())
    }

    /// Rewrite the transition inputs and mixture weights of one branch.
    fn refresh_edge(&mut self, node: NodeId) -> Result<()> {
        let weights = self.component_weights(node)?;
        for class in 0..self.n_classes() {
            for k in 0..weights.len() {
                if let Some(&id) = self.keys.get(&Key::Transition(node, class, k)) {
                    let p = self.transition(node, class, k)?;
                    self.graph.set_input(id, p)?;
                }
            }
            if weights.len() > 1 {
                for key in [Key::Edge(node, class), Key::Above(node, class)] {
                    if let Some(&id) = self.keys.get(&key) {
                        self.graph.set_weights(id, weights.clone())?;
                    }
                }
            }
        }
        Ok(())
    }

    fn refresh_class_weights(&mut self) -> Result<()> {
        let probs = self.rate_dist.probabilities().to_vec();
        let mut keys = vec![Key::Sites];
        keys.extend(self.tree.iter_preorder().map(Key::Marginal));
        for key in keys {
            if let Some(&id) = self.keys.get(&key) {
                self.graph.set_weights(id, probs.clone())?;
            }
        }
        Ok(())
    }

    // ---- graph construction ----------------------------------------------

    fn value(&mut self, key: Key) -> Result<&Array2<f64>> {
        let id = self.ensure(key)?;
        let before = self.graph.recomputations();
        self.graph.value(id)?;
        trace!(
            recomputed = self.graph.recomputations() - before,
            "dataflow value requested"
        );
        self.graph.value(id)
    }

    /// Node of `key`, creating it and its missing dependencies.
    fn ensure(&mut self, key: Key) -> Result<ValueId> {
        let mut stack = vec![key];
        while let Some(&top) = stack.last() {
            if self.keys.contains_key(&top) {
                stack.pop();
                continue;
            }
            match self.declare(top)? {
                Declaration::Input(value) => {
                    let id = self.graph.add_input(value);
                    self.keys.insert(top, id);
                    stack.pop();
                }
                Declaration::Alias(target) => match self.keys.get(&target) {
                    Some(&id) => {
                        self.keys.insert(top, id);
                        stack.pop();
                    }
                    None => stack.push(target),
                },
                Declaration::Computed(op, deps) => {
                    let missing: Vec<Key> = deps
                        .iter()
                        .copied()
                        .filter(|d| !self.keys.contains_key(d))
                        .collect();
                    if missing.is_empty() {
                        let ids = deps.iter().map(|d| self.keys[d]).collect();
                        let id = self.graph.add(op, ids)?;
                        self.keys.insert(top, id);
                        stack.pop();
                    } else {
                        stack.extend(missing);
                    }
                }
            }
        }
        Ok(self.keys[&key])
    }

    fn declare(&self, key: Key) -> Result<Declaration> {
        let classes = self.rate_dist.probabilities().to_vec();
        Ok(match key {
            Key::Leaf(node) => Declaration::Input(self.leaf_values(node)?),
            Key::Transition(node, class, k) => Declaration::Input(self.transition(node, class, k)?),
            Key::RootPrior => Declaration::Input(self.root_prior()),
            Key::Conditional(node, class) => {
                let children = self.tree.children(node);
                if children.is_empty() {
                    Declaration::Alias(Key::Leaf(node))
                } else {
                    Declaration::Computed(
                        Operation::Product,
                        children.iter().map(|&c| Key::Edge(c, class)).collect(),
                    )
                }
            }
            Key::EdgeComponent(node, class, k) => Declaration::Computed(
                Operation::MatMul,
                vec![Key::Transition(node, class, k), Key::Conditional(node, class)],
            ),
            Key::Edge(node, class) => {
                let weights = self.component_weights(node)?;
                if weights.len() == 1 {
                    Declaration::Alias(Key::EdgeComponent(node, class, 0))
                } else {
                    Declaration::Computed(
                        Operation::WeightedSum(weights.clone()),
                        (0..weights.len())
                            .map(|k| Key::EdgeComponent(node, class, k))
                            .collect(),
                    )
                }
            }
            Key::RootClass(class) => Declaration::Computed(
                Operation::ColumnSum,
                vec![Key::Joint(self.tree.root(), class)],
            ),
            Key::Sites => Declaration::Computed(
                Operation::WeightedSum(classes.clone()),
                (0..classes.len()).map(Key::RootClass).collect(),
            ),
            Key::ParentSide(node, class) => {
                let parent = self.parent(node)?;
                let mut deps = vec![Key::Above(parent, class)];
                deps.extend(
                    self.tree
                        .children(parent)
                        .iter()
                        .filter(|&&s| s != node)
                        .map(|&s| Key::Edge(s, class)),
                );
                Declaration::Computed(Operation::Product, deps)
            }
            Key::AboveComponent(node, class, k) => Declaration::Computed(
                Operation::TransposedMatMul,
                vec![Key::Transition(node, class, k), Key::ParentSide(node, class)],
            ),
            Key::Above(node, class) => {
                if node == self.tree.root() {
                    Declaration::Alias(Key::RootPrior)
                } else {
                    let weights = self.component_weights(node)?;
                    if weights.len() == 1 {
                        Declaration::Alias(Key::AboveComponent(node, class, 0))
                    } else {
                        Declaration::Computed(
                            Operation::WeightedSum(weights.clone()),
                            (0..weights.len())
                                .map(|k| Key::AboveComponent(node, class, k))
                                .collect(),
                        )
                    }
                }
            }
            Key::Joint(node, class) => Declaration::Computed(
                Operation::Product,
                vec![Key::Above(node, class), Key::Conditional(node, class)],
            ),
            Key::Marginal(node) => Declaration::Computed(
                Operation::WeightedSum(classes.clone()),
                (0..classes.len()).map(|c| Key::Joint(node, c)).collect(),
            ),
        })
    }

    fn leaf_values(&self, node: NodeId) -> Result<Array2<f64>> {
        let seq = *self
            .leaf_sequence
            .get(&node)
            .ok_or_else(|| CyaneaError::OutOfRange(format!("node {} is not a leaf", node)))?;
        let n = self.model_set.n_states();
        let mut values = Array2::<f64>::zeros((n, self.patterns.n_patterns()));
        for p in 0..self.patterns.n_patterns() {
            for (x, &v) in self.patterns.leaf_likelihoods(seq, p).iter().enumerate() {
                values[[x, p]] = v;
            }
        }
        Ok(values)
    }

    fn root_prior(&self) -> Array2<f64> {
        let freqs = self.model_set.root_frequencies();
        let mut prior = Array2::<f64>::zeros((freqs.len(), self.patterns.n_patterns()));
        for mut column in prior.columns_mut() {
            column.assign(freqs);
        }
        prior
    }

    /// Mixture weights of the model on the branch above `node`; a single
    /// weight of one for plain models.
    fn component_weights(&self, node: NodeId) -> Result<Vec<f64>> {
        let model = self.model_set.model_for_node(node)?;
        Ok(match model.components() {
            Some(components) => components.iter().map(|(p, _)| *p).collect(),
            None => vec![1.0],
        })
    }

    fn transition(&self, node: NodeId, class: usize, k: usize) -> Result<Array2<f64>> {
        let model = self.model_set.model_for_node(node)?;
        let t = self.rate_dist.categories()[class] * self.branch_lengths[node];
        match model.components() {
            Some(components) => components
                .get(k)
                .map(|(_, m)| m.transition_probs(t))
                .ok_or_else(|| {
                    CyaneaError::OutOfRange(format!("component {} of {}", k, model.name()))
                }),
            None => Ok(model.transition_probs(t)),
        }
    }

    fn parent(&self, node: NodeId) -> Result<NodeId> {
        self.tree
            .parent(node)
            .ok_or_else(|| CyaneaError::OutOfRange(format!("node {} has no parent", node)))
    }

    fn check_node_class(&self, node: NodeId, class: usize) -> Result<()> {
        self.tree.check(node)?;
        if class >= self.n_classes() {
            return Err(CyaneaError::OutOfRange(format!(
                "rate class {} of {}",
                class,
                self.n_classes()
            )));
        }
        Ok(())
    }
}

impl Summarizable for DataflowLikelihood {
    fn summary(&self) -> String {
        format!(
            "DataflowLikelihood: {} nodes, {} patterns, {} graph values",
            self.tree.node_count(),
            self.patterns.n_patterns(),
            self.graph.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alphabet::Alphabet;
    use crate::distribution::{ConstantDistribution, GammaDiscreteDistribution};
    use crate::model::reversible::ReversibleModel;
    use crate::model::SubstitutionModel;
    use crate::pruning::NonHomogeneousTreeLikelihood;
    use crate::sites::Alignment;

    // ((a,b)ab,(c,d)cd)root
    fn tree() -> PhyloTree {
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

    fn model() -> Box<dyn SubstitutionModel> {
        Box::new(ReversibleModel::hky85(2.5, [0.3, 0.2, 0.2, 0.3]).unwrap())
    }

    fn dataflow(rates: Box<dyn DiscreteDistribution>) -> DataflowLikelihood {
        let tree = tree();
        let set = SubstitutionModelSet::homogeneous(model(), &tree).unwrap();
        DataflowLikelihood::new(tree, set, rates, &patterns(), LikelihoodConfig::default()).unwrap()
    }

    #[test]
    fn agrees_with_pruning() {
        let mut flow = dataflow(Box::new(GammaDiscreteDistribution::new(4, 0.7).unwrap()));
        let tree = tree();
        let set = SubstitutionModelSet::homogeneous(model(), &tree).unwrap();
        let mut pruning = NonHomogeneousTreeLikelihood::new(
            tree,
            set,
            Box::new(GammaDiscreteDistribution::new(4, 0.7).unwrap()),
            LikelihoodConfig::default(),
        )
        .unwrap();
        pruning.set_data(&patterns()).unwrap();
        let a = flow.log_likelihood().unwrap();
        let b = pruning.log_likelihood().unwrap();
        assert!((a - b).abs() < 1e-10, "dataflow {} vs pruning {}", a, b);
        let l = flow.likelihood().unwrap();
        assert!((l - a.exp()).abs() <= 1e-9 * a.exp());
    }

    #[test]
    fn branch_change_recomputes_path_to_root() {
        let mut flow = dataflow(Box::new(ConstantDistribution::new(1.0)));
        flow.log_likelihood().unwrap();
        let size = flow.graph_size();
        flow.reset_counters();

        flow.set_branch_length(3, 0.25).unwrap();
        // Edge(a), Conditional(ab), Edge(ab), Conditional(root), Joint(root),
        // RootClass, Sites.
        assert_eq!(flow.invalidations(), 7);
        flow.log_likelihood().unwrap();
        assert_eq!(flow.recomputations(), 7);
        assert_eq!(flow.graph_size(), size);
        assert!(7 < size);

        // Nothing changed: everything is cached.
        flow.reset_counters();
        flow.log_likelihood().unwrap();
        assert_eq!(flow.recomputations(), 0);
    }

    #[test]
    fn backward_values_follow_changes() {
        let mut flow = dataflow(Box::new(ConstantDistribution::new(1.0)));
        for node in 0..7 {
            flow.marginal_posteriors(node).unwrap();
        }
        flow.reset_counters();
        flow.set_branch_length(5, 0.5).unwrap();
        let stale = flow.invalidations();
        assert!(stale > 0 && stale < flow.graph_size());
        for node in 0..7 {
            flow.marginal_posteriors(node).unwrap();
        }
        assert_eq!(flow.recomputations(), stale);
    }

    #[test]
    fn marginals_are_distributions() {
        let mut flow = dataflow(Box::new(GammaDiscreteDistribution::new(3, 1.0).unwrap()));
        let sites = flow.pattern_likelihoods().unwrap();
        for node in 0..7 {
            let post = flow.marginal_posteriors(node).unwrap();
            for column in post.columns() {
                assert!((column.sum() - 1.0).abs() < 1e-12);
            }
            // Joint values integrate to the site likelihood at every node.
            let joint = flow.value(Key::Marginal(node)).unwrap().clone();
            for (p, column) in joint.columns().into_iter().enumerate() {
                assert!((column.sum() - sites[p]).abs() < 1e-10 * sites[p]);
            }
        }
        // Leaf a reads A at the first pattern.
        let leaf = flow.marginal_posteriors(3).unwrap();
        assert!((leaf[[0, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn parameter_changes_match_fresh_engine() {
        let mut flow = dataflow(Box::new(GammaDiscreteDistribution::new(4, 0.7).unwrap()));
        flow.log_likelihood().unwrap();
        let mut list = ParameterList::new();
        list.add(Parameter::new("kappa_1", 5.0)).unwrap();
        list.add(Parameter::new("Gamma.alpha", 2.0)).unwrap();
        list.add(Parameter::new("BrLen6", 0.3)).unwrap();
        flow.set_parameter_values(&list).unwrap();

        let mut t = tree();
        t.set_branch_length(6, 0.3).unwrap();
        let model = Box::new(ReversibleModel::hky85(5.0, [0.3, 0.2, 0.2, 0.3]).unwrap());
        let set = SubstitutionModelSet::homogeneous(model, &t).unwrap();
        let mut fresh = DataflowLikelihood::new(
            t,
            set,
            Box::new(GammaDiscreteDistribution::new(4, 2.0).unwrap()),
            &patterns(),
            LikelihoodConfig::default(),
        )
        .unwrap();
        let a = flow.log_likelihood().unwrap();
        let b = fresh.log_likelihood().unwrap();
        assert!((a - b).abs() < 1e-10, "updated {} vs fresh {}", a, b);
    }

    #[test]
    fn invalid_requests() {
        let mut flow = dataflow(Box::new(ConstantDistribution::new(1.0)));
        assert!(matches!(
            flow.set_branch_length(3, -0.1),
            Err(CyaneaError::OutOfRange(_))
        ));
        assert!(flow.set_branch_length(0, 0.1).is_err());
        assert!(flow.conditional_likelihoods(1, 1).is_err());
        assert!(flow.backward_likelihoods(42, 0).is_err());
    }
}
