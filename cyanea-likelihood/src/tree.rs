//! Rooted tree topology with branch lengths.
//!
//! Node ids are dense `usize` indices, stable for the life of the tree; the
//! root is always 0. Per-node data is kept in parallel columns. A node's
//! branch length is the length of the edge joining it to its parent, so
//! every non-root node identifies exactly one branch.

use cyanea_core::{CyaneaError, Result, Summarizable};

/// Index of a node.
pub type NodeId = usize;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhyloTree {
    parents: Vec<Option<NodeId>>,
    children: Vec<Vec<NodeId>>,
    lengths: Vec<Option<f64>>,
    names: Vec<Option<String>>,
}

impl PhyloTree {
    /// A tree holding only an unnamed root.
    pub fn new() -> Self {
        Self {
            parents: vec![None],
            children: vec![Vec::new()],
            lengths: vec![None],
            names: vec![None],
        }
    }

    /// Attach a new node below `parent`.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: Option<String>,
        branch_length: Option<f64>,
    ) -> Result<NodeId> {
        self.check(parent)?;
        if let Some(len) = branch_length {
            check_length(len)?;
        }
        let id = self.parents.len();
        self.parents.push(Some(parent));
        self.children.push(Vec::new());
        self.lengths.push(branch_length);
        self.names.push(name);
        self.children[parent].push(id);
        Ok(id)
    }

    pub fn add_leaf(&mut self, parent: NodeId, name: &str, branch_length: f64) -> Result<NodeId> {
        self.add_child(parent, Some(name.to_string()), Some(branch_length))
    }

    /// `OutOfRange` unless `id` is a node of this tree.
    pub fn check(&self, id: NodeId) -> Result<()> {
        if id < self.parents.len() {
            Ok(())
        } else {
            Err(CyaneaError::OutOfRange(format!(
                "node {} of a {}-node tree",
                id,
                self.parents.len()
            )))
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node_count(&self) -> usize {
        self.parents.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.children.iter().filter(|c| c.is_empty()).count()
    }

    pub fn leaves(&self) -> Vec<NodeId> {
        (0..self.node_count())
            .filter(|&id| self.children[id].is_empty())
            .collect()
    }

    /// Every non-root node, in id order: one per branch.
    pub fn branch_ids(&self) -> Vec<NodeId> {
        (1..self.node_count()).collect()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents.get(id).copied().flatten()
    }

    /// Children of `id`; empty for leaves and unknown ids.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.children.get(id).map_or(&[], Vec::as_slice)
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.names.get(id).and_then(Option::as_deref)
    }

    pub fn branch_length(&self, id: NodeId) -> Option<f64> {
        self.lengths.get(id).copied().flatten()
    }

    /// Set the length of the branch above `id`. Negative or NaN lengths
    /// are `OutOfRange`.
    pub fn set_branch_length(&mut self, id: NodeId, length: f64) -> Result<()> {
        self.check(id)?;
        check_length(length)?;
        self.lengths[id] = Some(length);
        Ok(())
    }

    /// Sum of all set branch lengths.
    pub fn total_length(&self) -> f64 {
        self.lengths.iter().flatten().sum()
    }

    /// Ancestors of `id`, nearest first, ending with the root.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        std::iter::successors(self.parent(id), |&p| self.parent(p)).collect()
    }

    /// Parents before children, siblings in insertion order.
    pub fn iter_preorder(&self) -> PreorderIter<'_> {
        PreorderIter {
            tree: self,
            stack: vec![self.root()],
        }
    }

    /// Children before parents, siblings in insertion order.
    pub fn iter_postorder(&self) -> PostorderIter<'_> {
        PostorderIter {
            tree: self,
            stack: vec![(self.root(), 0)],
        }
    }

    pub fn leaf_by_name(&self, name: &str) -> Option<NodeId> {
        self.leaves()
            .into_iter()
            .find(|&id| self.name(id) == Some(name))
    }
}

fn check_length(length: f64) -> Result<()> {
    if length >= 0.0 {
        Ok(())
    } else {
        Err(CyaneaError::OutOfRange(format!("branch length {}", length)))
    }
}

impl Default for PhyloTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Summarizable for PhyloTree {
    fn summary(&self) -> String {
        format!(
            "PhyloTree: {} leaves, {} branches, length {:.4}",
            self.leaf_count(),
            self.node_count() - 1,
            self.total_length()
        )
    }
}

pub struct PreorderIter<'a> {
    tree: &'a PhyloTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for PreorderIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        self.stack.extend(self.tree.children(id).iter().rev());
        Some(id)
    }
}

/// Walks with a stack of `(node, next child index)` frames.
pub struct PostorderIter<'a> {
    tree: &'a PhyloTree,
    stack: Vec<(NodeId, usize)>,
}

impl<'a> Iterator for PostorderIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        loop {
            let (id, next) = self.stack.last_mut()?;
            let id = *id;
            match self.tree.children(id).get(*next) {
                Some(&child) => {
                    *next += 1;
                    self.stack.push((child, 0));
                }
                None => {
                    self.stack.pop();
                    return Some(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ((a:0.1,b:0.2):0.3,(c:0.4,d:0.5):0.6)
    fn quartet() -> PhyloTree {
        let mut tree = PhyloTree::new();
        let ab = tree.add_child(0, None, Some(0.3)).unwrap();
        let cd = tree.add_child(0, None, Some(0.6)).unwrap();
        tree.add_leaf(ab, "a", 0.1).unwrap();
        tree.add_leaf(ab, "b", 0.2).unwrap();
        tree.add_leaf(cd, "c", 0.4).unwrap();
        tree.add_leaf(cd, "d", 0.5).unwrap();
        tree
    }

    #[test]
    fn unknown_parent_rejected() {
        let mut tree = PhyloTree::new();
        assert!(matches!(
            tree.add_child(3, None, None),
            Err(CyaneaError::OutOfRange(_))
        ));
        assert!(tree.check(0).is_ok());
        assert!(tree.children(3).is_empty());
    }

    #[test]
    fn lengths_are_checked() {
        let mut tree = quartet();
        assert!(tree.set_branch_length(3, -0.1).is_err());
        assert!(tree.set_branch_length(3, f64::NAN).is_err());
        assert_eq!(tree.branch_length(3), Some(0.1));
        tree.set_branch_length(3, 0.7).unwrap();
        assert_eq!(tree.branch_length(3), Some(0.7));
        assert!((tree.total_length() - 2.7).abs() < 1e-12);
    }

    #[test]
    fn shape() {
        let tree = quartet();
        assert_eq!(tree.node_count(), 7);
        assert_eq!(tree.leaves(), vec![3, 4, 5, 6]);
        assert_eq!(tree.branch_ids(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(tree.ancestors(5), vec![2, 0]);
        assert!(tree.ancestors(0).is_empty());
        assert_eq!(tree.leaf_by_name("c"), Some(5));
        assert_eq!(tree.leaf_by_name("x"), None);
    }

    #[test]
    fn traversal_orders() {
        let tree = quartet();
        let pre: Vec<NodeId> = tree.iter_preorder().collect();
        assert_eq!(pre, vec![0, 1, 3, 4, 2, 5, 6]);
        let post: Vec<NodeId> = tree.iter_postorder().collect();
        assert_eq!(post, vec![3, 4, 1, 5, 6, 2, 0]);
    }

    #[test]
    fn deep_caterpillar_is_walked_without_recursion() {
        let mut tree = PhyloTree::new();
        let mut inner = 0;
        for i in 0..100_000 {
            tree.add_leaf(inner, &format!("t{}", i), 0.01).unwrap();
            inner = tree.add_child(inner, None, Some(0.01)).unwrap();
        }
        assert_eq!(tree.iter_postorder().count(), tree.node_count());
        assert_eq!(tree.iter_postorder().last(), Some(0));
    }

    #[test]
    fn summary_line() {
        assert_eq!(quartet().summary(), "PhyloTree: 4 leaves, 6 branches, length 2.1000");
    }
}
