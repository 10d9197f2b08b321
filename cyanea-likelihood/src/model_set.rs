//! Assignment of substitution models to tree nodes for non-homogeneous
//! likelihoods, with parameters tied across models.
//!
//! Models live in slots addressed by [`ModelId`]s that are never reused, so
//! removing a model does not renumber anything. Each node (except possibly
//! the root) carries exactly one model, which describes the branch above
//! it; a model may serve many nodes.
//!
//! Exposed parameters are the root-frequency parameters followed by the
//! model parameters, each renamed `base_k` with a per-base counter. A single
//! exposed parameter may feed several models (a tie).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use cyanea_core::{Constraint, CyaneaError, Parameter, ParameterList, Result};
use ndarray::Array1;
use tracing::debug;

use crate::alphabet::Alphabet;
use crate::model::{check_frequencies, SubstitutionModel};
use crate::tree::{NodeId, PhyloTree};

/// Stable identifier of a model slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModelId(usize);

impl ModelId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

/// Stationary distribution at the root of a non-homogeneous tree.
#[derive(Debug, Clone)]
pub struct RootFrequencies {
    freqs: Array1<f64>,
    params: ParameterList,
}

impl RootFrequencies {
    /// Fixed frequencies, no parameters.
    pub fn fixed(freqs: &[f64]) -> Result<Self> {
        Ok(Self {
            freqs: check_frequencies(freqs, freqs.len())?,
            params: ParameterList::new(),
        })
    }

    /// Free frequencies parameterised by stick breaking:
    /// `f_i = root.theta{i+1} · Π_{j<=i} (1 - root.theta{j})`, the last
    /// frequency taking the remainder.
    pub fn stick_breaking(initial: &[f64]) -> Result<Self> {
        let freqs = check_frequencies(initial, initial.len())?;
        let mut params = ParameterList::new();
        let mut rest = 1.0;
        for (i, &f) in initial.iter().take(initial.len().saturating_sub(1)).enumerate() {
            let theta = if rest > 0.0 { (f / rest).clamp(0.0, 1.0) } else { 0.5 };
            params.add(Parameter::constrained(
                format!("root.theta{}", i + 1),
                theta,
                Constraint::closed_unit(),
            )?)?;
            rest -= f;
        }
        let mut root = Self { freqs, params };
        root.update()?;
        Ok(root)
    }

    pub fn frequencies(&self) -> &Array1<f64> {
        &self.freqs
    }

    pub fn n_states(&self) -> usize {
        self.freqs.len()
    }

    pub fn parameters(&self) -> &ParameterList {
        &self.params
    }

    /// Returns whether any value changed.
    pub fn set_parameter_values(&mut self, params: &ParameterList) -> Result<bool> {
        let changed = self.params.match_values(params)?;
        if changed.is_empty() {
            return Ok(false);
        }
        self.update()?;
        Ok(true)
    }

    fn update(&mut self) -> Result<()> {
        if self.params.is_empty() {
            return Ok(());
        }
        let n = self.freqs.len();
        let mut rest = 1.0;
        for i in 0..n - 1 {
            let theta = self.params.value(&format!("root.theta{}", i + 1))?;
            self.freqs[i] = theta * rest;
            rest *= 1.0 - theta;
        }
        self.freqs[n - 1] = rest;
        Ok(())
    }
}

/// What a parameter update touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterChange {
    pub root_frequencies: bool,
    pub models: BTreeSet<ModelId>,
}

impl ParameterChange {
    pub fn is_empty(&self) -> bool {
        !self.root_frequencies && self.models.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ModelSlot {
    model: Box<dyn SubstitutionModel>,
    /// Internal copies of the tied parameters, under their base names.
    params: ParameterList,
}

#[derive(Debug, Clone)]
struct TiedParameter {
    external: String,
    base: String,
    models: Vec<ModelId>,
}

/// Models assigned to the nodes of a tree.
#[derive(Debug, Clone)]
pub struct SubstitutionModelSet {
    alphabet: Alphabet,
    slots: BTreeMap<ModelId, ModelSlot>,
    next_id: usize,
    node_to_model: BTreeMap<NodeId, ModelId>,
    tied: Vec<TiedParameter>,
    name_counts: HashMap<String, usize>,
    root: RootFrequencies,
    params: ParameterList,
}

impl SubstitutionModelSet {
    pub fn new(alphabet: Alphabet, root: RootFrequencies) -> Result<Self> {
        if root.n_states() != alphabet.size() {
            return Err(CyaneaError::Incompatible(format!(
                "{} root frequencies for {} states",
                root.n_states(),
                alphabet.size()
            )));
        }
        let params = root.parameters().clone();
        Ok(Self {
            alphabet,
            slots: BTreeMap::new(),
            next_id: 0,
            node_to_model: BTreeMap::new(),
            tied: Vec::new(),
            name_counts: HashMap::new(),
            root,
            params,
        })
    }

    /// A homogeneous set: one model on every non-root node of `tree`, all
    /// its parameters exposed, root frequencies fixed to the model's.
    pub fn homogeneous(model: Box<dyn SubstitutionModel>, tree: &PhyloTree) -> Result<Self> {
        let root = RootFrequencies::fixed(&model.frequencies().to_vec())?;
        let mut set = Self::new(model.alphabet().clone(), root)?;
        let names = model.parameters().names();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        set.add_model(model, &tree.branch_ids(), &names)?;
        Ok(set)
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    pub fn n_states(&self) -> usize {
        self.alphabet.size()
    }

    pub fn n_models(&self) -> usize {
        self.slots.len()
    }

    pub fn model_ids(&self) -> Vec<ModelId> {
        self.slots.keys().copied().collect()
    }

    pub fn model(&self, id: ModelId) -> Result<&dyn SubstitutionModel> {
        self.slot(id).map(|s| s.model.as_ref())
    }

    /// Model carried by the branch above `node`.
    pub fn model_for_node(&self, node: NodeId) -> Result<&dyn SubstitutionModel> {
        let id = self.model_id_for_node(node).ok_or_else(|| {
            CyaneaError::OutOfRange(format!("node {} has no model assigned", node))
        })?;
        self.model(id)
    }

    pub fn model_id_for_node(&self, node: NodeId) -> Option<ModelId> {
        self.node_to_model.get(&node).copied()
    }

    /// Nodes carrying model `id`.
    pub fn nodes_with_model(&self, id: ModelId) -> Vec<NodeId> {
        self.node_to_model
            .iter()
            .filter(|(_, &m)| m == id)
            .map(|(&n, _)| n)
            .collect()
    }

    /// Root-frequency parameters followed by the exposed model parameters.
    pub fn parameters(&self) -> &ParameterList {
        &self.params
    }

    pub fn root_frequencies(&self) -> &Array1<f64> {
        self.root.frequencies()
    }

    /// Models fed by the exposed parameter `name`.
    pub fn models_for_parameter(&self, name: &str) -> Option<&[ModelId]> {
        self.tied
            .iter()
            .find(|t| t.external == name)
            .map(|t| t.models.as_slice())
    }

    /// Add `model` on `nodes`, exposing the model parameters named in
    /// `new_params`. Nodes already assigned move to the new model.
    pub fn add_model(
        &mut self,
        model: Box<dyn SubstitutionModel>,
        nodes: &[NodeId],
        new_params: &[&str],
    ) -> Result<ModelId> {
        self.check_compatible(model.as_ref())?;
        let mut slot_params = ParameterList::new();
        for &name in new_params {
            let p = model.parameters().get(name).ok_or_else(|| {
                CyaneaError::ParameterNotFound(format!("{} has no parameter '{}'", model.name(), name))
            })?;
            slot_params.add(p.clone())?;
        }

        let id = ModelId(self.next_id);
        self.next_id += 1;
        for &node in nodes {
            self.node_to_model.insert(node, id);
        }
        for p in slot_params.iter() {
            let external = self.unique_name(p.name());
            let mut exposed = p.clone();
            exposed.set_name(external.clone());
            self.params.add(exposed)?;
            self.tied.push(TiedParameter {
                external,
                base: p.name().to_string(),
                models: vec![id],
            });
        }
        debug!(model = %id, name = model.name(), nodes = nodes.len(), "added model to set");
        self.slots.insert(
            id,
            ModelSlot {
                model,
                params: slot_params,
            },
        );
        Ok(id)
    }

    /// Replace the model in slot `id`, keeping its tied parameter values.
    pub fn set_model(&mut self, id: ModelId, mut model: Box<dyn SubstitutionModel>) -> Result<()> {
        self.check_compatible(model.as_ref())?;
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or_else(|| CyaneaError::OutOfRange(format!("no {}", id)))?;
        model.set_parameter_values(&slot.params)?;
        slot.model = model;
        Ok(())
    }

    /// Remove the model in slot `id` and unassign its nodes.
    ///
    /// Fails with `InvariantViolation`, leaving the set untouched, if some
    /// exposed parameter feeds only this model.
    pub fn remove_model(&mut self, id: ModelId) -> Result<Box<dyn SubstitutionModel>> {
        if !self.slots.contains_key(&id) {
            return Err(CyaneaError::OutOfRange(format!("no {}", id)));
        }
        if let Some(orphan) = self
            .tied
            .iter()
            .find(|t| t.models.iter().all(|&m| m == id))
        {
            return Err(CyaneaError::InvariantViolation(format!(
                "removing {} would orphan parameter {}",
                id, orphan.external
            )));
        }
        for t in &mut self.tied {
            t.models.retain(|&m| m != id);
        }
        self.node_to_model.retain(|_, m| *m != id);
        let slot = self
            .slots
            .remove(&id)
            .ok_or_else(|| CyaneaError::OutOfRange(format!("no {}", id)))?;
        if !self.check_orphan_parameters() {
            return Err(CyaneaError::InvariantViolation(format!(
                "orphan parameter after removing {}",
                id
            )));
        }
        debug!(model = %id, "removed model from set");
        Ok(slot.model)
    }

    /// Expose one parameter tied across the models of `nodes`.
    pub fn add_parameter(&mut self, param: &Parameter, nodes: &[NodeId]) -> Result<()> {
        let mut list = ParameterList::new();
        list.add(param.clone())?;
        self.add_parameters(&list, nodes)
    }

    /// Expose parameters, each tied across the models of `nodes`.
    pub fn add_parameters(&mut self, params: &ParameterList, nodes: &[NodeId]) -> Result<()> {
        let mut models = Vec::new();
        for &node in nodes {
            let id = self.model_id_for_node(node).ok_or_else(|| {
                CyaneaError::OutOfRange(format!("node {} has no model assigned", node))
            })?;
            if !models.contains(&id) {
                models.push(id);
            }
        }
        for &id in &models {
            let slot = self.slot(id)?;
            for p in params {
                if !slot.model.parameters().has_parameter(p.name()) {
                    return Err(CyaneaError::ParameterNotFound(format!(
                        "{} has no parameter '{}'",
                        slot.model.name(),
                        p.name()
                    )));
                }
            }
        }

        for p in params {
            let external = self.unique_name(p.name());
            let mut exposed = p.clone();
            exposed.set_name(external.clone());
            self.params.add(exposed)?;
            self.tied.push(TiedParameter {
                external,
                base: p.name().to_string(),
                models: models.clone(),
            });
        }
        for id in &models {
            if let Some(slot) = self.slots.get_mut(id) {
                for p in params {
                    match slot.params.get_mut(p.name()) {
                        Some(own) => own.set_value(p.value())?,
                        None => slot.params.add(p.clone())?,
                    }
                }
                slot.model.set_parameter_values(&slot.params)?;
            }
        }
        Ok(())
    }

    /// Set exposed parameter values and propagate them.
    pub fn set_parameter_values(&mut self, params: &ParameterList) -> Result<ParameterChange> {
        let changed = self.params.match_values(params)?;
        self.fire_parameter_changed(&changed)
    }

    /// Push changed exposed values into the root frequencies and into every
    /// model they feed; only those models recompute.
    pub fn fire_parameter_changed(&mut self, changed: &ParameterList) -> Result<ParameterChange> {
        let mut change = ParameterChange::default();
        if changed.is_empty() {
            return Ok(change);
        }
        change.root_frequencies = self.root.set_parameter_values(changed)?;

        for p in changed {
            let Some(tie) = self.tied.iter().find(|t| t.external == p.name()) else {
                continue;
            };
            for id in &tie.models {
                if let Some(slot) = self.slots.get_mut(id) {
                    slot.params.set_value(&tie.base, p.value())?;
                    change.models.insert(*id);
                }
            }
        }
        for id in &change.models {
            if let Some(slot) = self.slots.get_mut(id) {
                slot.model.set_parameter_values(&slot.params)?;
            }
        }
        Ok(change)
    }

    /// Every model is carried by at least one node.
    pub fn check_orphan_models(&self) -> bool {
        self.slots
            .keys()
            .all(|id| self.node_to_model.values().any(|m| m == id))
    }

    /// Every exposed model parameter feeds at least one model.
    pub fn check_orphan_parameters(&self) -> bool {
        self.tied.iter().all(|t| !t.models.is_empty())
    }

    /// Every non-root node of `tree` has a model.
    pub fn check_orphan_nodes(&self, tree: &PhyloTree) -> bool {
        tree.branch_ids()
            .iter()
            .all(|n| self.node_to_model.contains_key(n))
    }

    /// All three consistency checks, as an error naming the first failure.
    pub fn validate(&self, tree: &PhyloTree) -> Result<()> {
        if !self.check_orphan_models() {
            return Err(CyaneaError::InvariantViolation("a model is assigned to no node".into()));
        }
        if !self.check_orphan_parameters() {
            return Err(CyaneaError::InvariantViolation("a parameter feeds no model".into()));
        }
        if !self.check_orphan_nodes(tree) {
            return Err(CyaneaError::InvariantViolation("a tree node has no model".into()));
        }
        Ok(())
    }

    pub fn is_fully_set_up_for(&self, tree: &PhyloTree) -> bool {
        self.validate(tree).is_ok()
    }

    fn slot(&self, id: ModelId) -> Result<&ModelSlot> {
        self.slots
            .get(&id)
            .ok_or_else(|| CyaneaError::OutOfRange(format!("no {}", id)))
    }

    fn check_compatible(&self, model: &dyn SubstitutionModel) -> Result<()> {
        if *model.alphabet() != self.alphabet {
            return Err(CyaneaError::Incompatible(format!(
                "model alphabet {:?} differs from set alphabet {:?}",
                model.alphabet(),
                self.alphabet
            )));
        }
        if model.n_states() != self.n_states() {
            return Err(CyaneaError::Incompatible(format!(
                "model has {} states, set has {}",
                model.n_states(),
                self.n_states()
            )));
        }
        Ok(())
    }

    fn unique_name(&mut self, base: &str) -> String {
        let count = self.name_counts.entry(base.to_string()).or_insert(0);
        *count += 1;
        format!("{}_{}", base, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::reversible::ReversibleModel;

    fn tree() -> PhyloTree {
        // ((A,B)X,C)
        let mut t = PhyloTree::new();
        let x = t.add_child(0, Some("X".into()), Some(0.1)).unwrap();
        t.add_leaf(x, "A", 0.2).unwrap();
        t.add_leaf(x, "B", 0.3).unwrap();
        t.add_leaf(0, "C", 0.4).unwrap();
        t
    }

    fn two_model_set() -> (SubstitutionModelSet, ModelId, ModelId) {
        let root = RootFrequencies::fixed(&[0.25; 4]).unwrap();
        let mut set = SubstitutionModelSet::new(Alphabet::Dna, root).unwrap();
        let a = set
            .add_model(Box::new(ReversibleModel::k80(2.0).unwrap()), &[1, 2], &["kappa"])
            .unwrap();
        let b = set
            .add_model(Box::new(ReversibleModel::k80(3.0).unwrap()), &[3, 4], &[])
            .unwrap();
        (set, a, b)
    }

    #[test]
    fn unique_names_and_assignment() {
        let (mut set, a, b) = two_model_set();
        assert_eq!(set.parameters().names(), vec!["kappa_1"]);
        assert_eq!(set.model_id_for_node(2), Some(a));
        assert_eq!(set.nodes_with_model(b), vec![3, 4]);
        set.add_parameter(&Parameter::new("kappa", 3.0), &[3]).unwrap();
        assert_eq!(set.parameters().names(), vec!["kappa_1", "kappa_2"]);
        assert_eq!(set.models_for_parameter("kappa_2"), Some(&[b][..]));
        assert!(set.validate(&tree()).is_ok());
    }

    #[test]
    fn incompatible_models_rejected() {
        let (mut set, _, _) = two_model_set();
        let protein = ReversibleModel::equal_rate(Alphabet::Protein).unwrap();
        assert!(matches!(
            set.add_model(Box::new(protein), &[1], &[]),
            Err(CyaneaError::Incompatible(_))
        ));
        assert!(set
            .add_model(Box::new(ReversibleModel::k80(1.0).unwrap()), &[1], &["omega"])
            .is_err());
        assert_eq!(set.n_models(), 2);
    }

    #[test]
    fn parameter_change_reaches_only_tied_models() {
        let (mut set, a, b) = two_model_set();
        let mut p = ParameterList::new();
        p.add(Parameter::new("kappa_1", 5.0)).unwrap();
        let change = set.set_parameter_values(&p).unwrap();
        assert!(!change.root_frequencies);
        assert_eq!(change.models.iter().copied().collect::<Vec<_>>(), vec![a]);
        assert_eq!(set.model(a).unwrap().parameters().value("kappa").unwrap(), 5.0);
        assert_eq!(set.model(b).unwrap().parameters().value("kappa").unwrap(), 3.0);
        assert!(set.set_parameter_values(&p).unwrap().is_empty());
    }

    #[test]
    fn tie_across_two_models() {
        let (mut set, a, b) = two_model_set();
        set.add_parameter(&Parameter::new("kappa", 4.0), &[1, 3]).unwrap();
        assert_eq!(set.model(b).unwrap().parameters().value("kappa").unwrap(), 4.0);
        let mut p = ParameterList::new();
        p.add(Parameter::new("kappa_2", 7.0)).unwrap();
        let change = set.set_parameter_values(&p).unwrap();
        assert_eq!(change.models.len(), 2);
        assert_eq!(set.model(a).unwrap().parameters().value("kappa").unwrap(), 7.0);
        assert_eq!(set.model(b).unwrap().parameters().value("kappa").unwrap(), 7.0);
    }

    #[test]
    fn removal_that_orphans_a_parameter_fails() {
        let (mut set, a, b) = two_model_set();
        let r = set.remove_model(a);
        assert!(matches!(r, Err(CyaneaError::InvariantViolation(_))));
        assert_eq!(set.n_models(), 2);
        assert_eq!(set.model_id_for_node(1), Some(a));

        let removed = set.remove_model(b).unwrap();
        assert_eq!(removed.parameters().value("kappa").unwrap(), 3.0);
        assert_eq!(set.n_models(), 1);
        assert!(set.check_orphan_parameters());
        assert!(!set.check_orphan_nodes(&tree()));
        // Ids are never reused.
        let c = set
            .add_model(Box::new(ReversibleModel::k80(1.0).unwrap()), &[3, 4], &[])
            .unwrap();
        assert!(c > b);
        assert!(set.validate(&tree()).is_ok());
    }

    #[test]
    fn orphan_model_detected() {
        let (mut set, _, _) = two_model_set();
        set.add_model(Box::new(ReversibleModel::k80(1.0).unwrap()), &[], &[])
            .unwrap();
        assert!(!set.check_orphan_models());
        assert!(matches!(set.validate(&tree()), Err(CyaneaError::InvariantViolation(_))));
    }

    #[test]
    fn set_model_keeps_tied_values() {
        let (mut set, a, _) = two_model_set();
        set.set_model(a, Box::new(ReversibleModel::k80(9.0).unwrap())).unwrap();
        assert_eq!(set.model(a).unwrap().parameters().value("kappa").unwrap(), 2.0);
        assert!(matches!(
            set.set_model(ModelId(42), Box::new(ReversibleModel::k80(9.0).unwrap())),
            Err(CyaneaError::OutOfRange(_))
        ));
    }

    #[test]
    fn stick_breaking_root_frequencies() {
        let root = RootFrequencies::stick_breaking(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        for (i, &f) in [0.1, 0.2, 0.3, 0.4].iter().enumerate() {
            assert!((root.frequencies()[i] - f).abs() < 1e-12);
        }
        let mut set = SubstitutionModelSet::new(Alphabet::Dna, root).unwrap();
        assert_eq!(
            set.parameters().names(),
            vec!["root.theta1", "root.theta2", "root.theta3"]
        );
        let mut p = ParameterList::new();
        p.add(Parameter::new("root.theta1", 0.5)).unwrap();
        let change = set.set_parameter_values(&p).unwrap();
        assert!(change.root_frequencies);
        assert!((set.root_frequencies()[0] - 0.5).abs() < 1e-12);
        assert!((set.root_frequencies().sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn homogeneous_covers_every_branch() {
        let t = tree();
        let set = SubstitutionModelSet::homogeneous(Box::new(ReversibleModel::k80(2.0).unwrap()), &t)
            .unwrap();
        assert!(set.is_fully_set_up_for(&t));
        assert_eq!(set.parameters().names(), vec!["kappa_1"]);
    }
}
