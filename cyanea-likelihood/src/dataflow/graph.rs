//! A DAG of cached matrix values with dependency-driven invalidation.
//!
//! Every node holds an optional cached value and a validity flag. Writing
//! an input marks the input's transitive dependents stale; reading a value
//! recomputes exactly the stale part of its dependency cone. Both walks
//! use an explicit stack, so deep trees never exhaust the call stack.
//!
//! The invariant kept by every mutation: a stale node has only stale
//! dependents.

use cyanea_core::{CyaneaError, Result};
use ndarray::{Array2, Axis};

/// Index of a node in a [`DataflowGraph`].
pub type ValueId = usize;

/// How a node derives its value from its dependencies.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Set from outside with [`DataflowGraph::set_input`].
    Input,
    /// Elementwise product of all dependencies.
    Product,
    /// `Σ_k w_k · dep_k`.
    WeightedSum(Vec<f64>),
    /// `dep_0 · dep_1`.
    MatMul,
    /// `dep_0ᵀ · dep_1`.
    TransposedMatMul,
    /// Column sums of `dep_0`, as a one-row matrix.
    ColumnSum,
}

impl Operation {
    fn check_arity(&self, n: usize) -> Result<()> {
        let ok = match self {
            Operation::Input => n == 0,
            Operation::Product => n >= 1,
            Operation::WeightedSum(w) => n >= 1 && w.len() == n,
            Operation::MatMul | Operation::TransposedMatMul => n == 2,
            Operation::ColumnSum => n == 1,
        };
        if ok {
            Ok(())
        } else {
            Err(CyaneaError::InvalidInput(format!(
                "{:?} cannot take {} dependencies",
                self, n
            )))
        }
    }
}

#[derive(Debug, Clone)]
struct Cell {
    op: Operation,
    deps: Vec<ValueId>,
    dependents: Vec<ValueId>,
    value: Array2<f64>,
    valid: bool,
}

/// Cached values linked by dependencies.
#[derive(Debug, Clone, Default)]
pub struct DataflowGraph {
    cells: Vec<Cell>,
    recomputations: usize,
    invalidations: usize,
}

impl DataflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Add an input node holding `value`.
    pub fn add_input(&mut self, value: Array2<f64>) -> ValueId {
        let id = self.cells.len();
        self.cells.push(Cell {
            op: Operation::Input,
            deps: Vec::new(),
            dependents: Vec::new(),
            value,
            valid: true,
        });
        id
    }

    /// Add a computed node over existing nodes. It starts stale.
    pub fn add(&mut self, op: Operation, deps: Vec<ValueId>) -> Result<ValueId> {
        if op == Operation::Input {
            return Err(CyaneaError::InvalidInput("inputs are added with add_input".into()));
        }
        op.check_arity(deps.len())?;
        let id = self.cells.len();
        for &d in &deps {
            self.cell(d)?;
        }
        for &d in &deps {
            self.cells[d].dependents.push(id);
        }
        self.cells.push(Cell {
            op,
            deps,
            dependents: Vec::new(),
            value: Array2::zeros((0, 0)),
            valid: false,
        });
        Ok(id)
    }

    pub fn operation(&self, id: ValueId) -> Result<&Operation> {
        self.cell(id).map(|c| &c.op)
    }

    pub fn dependencies(&self, id: ValueId) -> Result<&[ValueId]> {
        self.cell(id).map(|c| c.deps.as_slice())
    }

    pub fn is_valid(&self, id: ValueId) -> bool {
        self.cells.get(id).map_or(false, |c| c.valid)
    }

    /// Replace the value of an input node and invalidate its dependents.
    pub fn set_input(&mut self, id: ValueId, value: Array2<f64>) -> Result<()> {
        let cell = self.cell_mut(id)?;
        if cell.op != Operation::Input {
            return Err(CyaneaError::InvalidInput(format!("node {} is not an input", id)));
        }
        cell.value = value;
        self.invalidate_dependents(id);
        Ok(())
    }

    /// Replace the weights of a weighted-sum node and invalidate it.
    pub fn set_weights(&mut self, id: ValueId, weights: Vec<f64>) -> Result<()> {
        let cell = self.cell_mut(id)?;
        match &mut cell.op {
            Operation::WeightedSum(w) if w.len() == weights.len() => *w = weights,
            op => {
                return Err(CyaneaError::InvalidInput(format!(
                    "cannot set {} weights on {:?}",
                    weights.len(),
                    op
                )))
            }
        }
        self.invalidate(id);
        Ok(())
    }

    /// Mark `id` and everything depending on it stale.
    ///
    /// Returns how many nodes changed from valid to stale.
    pub fn invalidate(&mut self, id: ValueId) -> usize {
        if id >= self.cells.len() {
            return 0;
        }
        if self.cells[id].op == Operation::Input {
            return self.invalidate_dependents(id);
        }
        self.mark_stale(vec![id])
    }

    fn invalidate_dependents(&mut self, id: ValueId) -> usize {
        let start = self.cells[id].dependents.clone();
        self.mark_stale(start)
    }

    fn mark_stale(&mut self, mut stack: Vec<ValueId>) -> usize {
        let mut count = 0;
        while let Some(n) = stack.pop() {
            let cell = &mut self.cells[n];
            if !cell.valid {
                continue;
            }
            cell.valid = false;
            count += 1;
            stack.extend(cell.dependents.iter().copied());
        }
        self.invalidations += count;
        count
    }

    /// Current value of `id`, recomputing stale dependencies first.
    pub fn value(&mut self, id: ValueId) -> Result<&Array2<f64>> {
        self.cell(id)?;
        let mut stack = vec![id];
        while let Some(&top) = stack.last() {
            if self.cells[top].valid {
                stack.pop();
                continue;
            }
            let stale: Vec<ValueId> = self.cells[top]
                .deps
                .iter()
                .copied()
                .filter(|&d| !self.cells[d].valid)
                .collect();
            if !stale.is_empty() {
                stack.extend(stale);
                continue;
            }
            let value = self.compute(top)?;
            let cell = &mut self.cells[top];
            cell.value = value;
            cell.valid = true;
            self.recomputations += 1;
            stack.pop();
        }
        Ok(&self.cells[id].value)
    }

    /// Number of node evaluations since the last reset.
    pub fn recomputations(&self) -> usize {
        self.recomputations
    }

    /// Number of valid-to-stale transitions since the last reset.
    pub fn invalidations(&self) -> usize {
        self.invalidations
    }

    pub fn reset_counters(&mut self) {
        self.recomputations = 0;
        self.invalidations = 0;
    }

    fn compute(&self, id: ValueId) -> Result<Array2<f64>> {
        let cell = &self.cells[id];
        let deps: Vec<&Array2<f64>> = cell.deps.iter().map(|&d| &self.cells[d].value).collect();
        match &cell.op {
            Operation::Input => Ok(cell.value.clone()),
            Operation::Product => {
                let mut out = deps[0].clone();
                for d in &deps[1..] {
                    same_shape(id, &out, d)?;
                    out *= *d;
                }
                Ok(out)
            }
            Operation::WeightedSum(weights) => {
                let mut out = Array2::<f64>::zeros(deps[0].raw_dim());
                for (w, d) in weights.iter().zip(&deps) {
                    same_shape(id, &out, d)?;
                    out.scaled_add(*w, *d);
                }
                Ok(out)
            }
            Operation::MatMul => {
                inner_dims(id, deps[0].ncols(), deps[1].nrows())?;
                Ok(deps[0].dot(deps[1]))
            }
            Operation::TransposedMatMul => {
                inner_dims(id, deps[0].nrows(), deps[1].nrows())?;
                Ok(deps[0].t().dot(deps[1]))
            }
            Operation::ColumnSum => Ok(deps[0].sum_axis(Axis(0)).insert_axis(Axis(0))),
        }
    }

    fn cell(&self, id: ValueId) -> Result<&Cell> {
        self.cells
            .get(id)
            .ok_or_else(|| CyaneaError::OutOfRange(format!("no dataflow node {}", id)))
    }

    fn cell_mut(&mut self, id: ValueId) -> Result<&mut Cell> {
        self.cells
            .get_mut(id)
            .ok_or_else(|| CyaneaError::OutOfRange(format!("no dataflow node {}", id)))
    }
}

fn same_shape(id: ValueId, a: &Array2<f64>, b: &Array2<f64>) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(CyaneaError::Incompatible(format!(
            "node {} combines shapes {:?} and {:?}",
            id,
            a.shape(),
            b.shape()
        )));
    }
    Ok(())
}

fn inner_dims(id: ValueId, left: usize, right: usize) -> Result<()> {
    if left != right {
        return Err(CyaneaError::Incompatible(format!(
            "node {} multiplies inner dimensions {} and {}",
            id, left, right
        )));
    }
    Ok(())
}
