//! Named real-valued parameters with optional interval constraints.
//!
//! [`Parameter`] and [`ParameterList`] are the currency exchanged between
//! models, distributions and likelihood functions: every tunable quantity is
//! addressed by name, and every value write is checked against the
//! parameter's [`Constraint`].

use core::fmt;
use core::ops::BitAnd;

use crate::{CyaneaError, Result};

/// A real interval, each end open (strict) or closed.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Constraint {
    lower: f64,
    upper: f64,
    lower_strict: bool,
    upper_strict: bool,
}

impl Constraint {
    /// Interval between `lower` and `upper`; strict ends exclude the bound.
    pub fn interval(lower: f64, upper: f64, lower_strict: bool, upper_strict: bool) -> Self {
        Self {
            lower,
            upper,
            lower_strict,
            upper_strict,
        }
    }

    /// `]0, +inf[`
    pub fn positive() -> Self {
        Self::interval(0.0, f64::INFINITY, true, true)
    }

    /// `[min, +inf[`
    pub fn at_least(min: f64) -> Self {
        Self::interval(min, f64::INFINITY, false, true)
    }

    /// `]0, 1[`
    pub fn open_unit() -> Self {
        Self::interval(0.0, 1.0, true, true)
    }

    /// `[0, 1]`
    pub fn closed_unit() -> Self {
        Self::interval(0.0, 1.0, false, false)
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    /// Whether `value` lies inside the interval.
    pub fn is_correct(&self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        let above = if self.lower_strict {
            value > self.lower
        } else {
            value >= self.lower
        };
        let below = if self.upper_strict {
            value < self.upper
        } else {
            value <= self.upper
        };
        above && below
    }

    /// Whether the whole closed range `[min, max]` lies inside the interval.
    pub fn includes(&self, min: f64, max: f64) -> bool {
        min <= max && self.is_correct(min) && self.is_correct(max)
    }

    /// Intersection of two intervals.
    ///
    /// An empty intersection yields an interval with `lower > upper`, which
    /// accepts no value.
    pub fn intersect(&self, other: &Constraint) -> Constraint {
        let (lower, lower_strict) = if self.lower > other.lower {
            (self.lower, self.lower_strict)
        } else if other.lower > self.lower {
            (other.lower, other.lower_strict)
        } else {
            (self.lower, self.lower_strict || other.lower_strict)
        };
        let (upper, upper_strict) = if self.upper < other.upper {
            (self.upper, self.upper_strict)
        } else if other.upper < self.upper {
            (other.upper, other.upper_strict)
        } else {
            (self.upper, self.upper_strict || other.upper_strict)
        };
        Constraint::interval(lower, upper, lower_strict, upper_strict)
    }
}

impl BitAnd for Constraint {
    type Output = Constraint;

    fn bitand(self, rhs: Constraint) -> Constraint {
        self.intersect(&rhs)
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = if self.lower_strict { ']' } else { '[' };
        let close = if self.upper_strict { '[' } else { ']' };
        write!(f, "{}{}, {}{}", open, self.lower, self.upper, close)
    }
}

/// A named real value, optionally bounded by a [`Constraint`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Parameter {
    name: String,
    value: f64,
    constraint: Option<Constraint>,
}

impl Parameter {
    /// An unconstrained parameter.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            constraint: None,
        }
    }

    /// A constrained parameter; fails if `value` violates `constraint`.
    pub fn constrained(name: impl Into<String>, value: f64, constraint: Constraint) -> Result<Self> {
        let name = name.into();
        if !constraint.is_correct(value) {
            return Err(CyaneaError::Constraint {
                name,
                value,
                constraint: constraint.to_string(),
            });
        }
        Ok(Self {
            name,
            value,
            constraint: Some(constraint),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn constraint(&self) -> Option<&Constraint> {
        self.constraint.as_ref()
    }

    pub fn set_constraint(&mut self, constraint: Option<Constraint>) {
        self.constraint = constraint;
    }

    /// Set the value, checking it against the constraint.
    pub fn set_value(&mut self, value: f64) -> Result<()> {
        if let Some(c) = &self.constraint {
            if !c.is_correct(value) {
                return Err(CyaneaError::Constraint {
                    name: self.name.clone(),
                    value,
                    constraint: c.to_string(),
                });
            }
        }
        self.value = value;
        Ok(())
    }
}

/// An ordered list of uniquely named parameters.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParameterList {
    params: Vec<Parameter>,
}

impl ParameterList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Parameter> {
        self.params.iter()
    }

    /// Parameter names, in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name.clone()).collect()
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().find(|p| p.name == name)
    }

    /// Value of the parameter called `name`.
    pub fn value(&self, name: &str) -> Result<f64> {
        self.get(name)
            .map(Parameter::value)
            .ok_or_else(|| CyaneaError::ParameterNotFound(name.to_string()))
    }

    /// Set the value of the parameter called `name`.
    pub fn set_value(&mut self, name: &str, value: f64) -> Result<()> {
        self.get_mut(name)
            .ok_or_else(|| CyaneaError::ParameterNotFound(name.to_string()))?
            .set_value(value)
    }

    /// Append a parameter; names must be unique within the list.
    pub fn add(&mut self, param: Parameter) -> Result<()> {
        if self.has_parameter(&param.name) {
            return Err(CyaneaError::InvalidInput(format!(
                "duplicate parameter name '{}'",
                param.name
            )));
        }
        self.params.push(param);
        Ok(())
    }

    /// Append every parameter of `other`.
    pub fn add_all(&mut self, other: &ParameterList) -> Result<()> {
        for p in other.iter() {
            self.add(p.clone())?;
        }
        Ok(())
    }

    /// Remove the parameter called `name`, returning it.
    pub fn remove(&mut self, name: &str) -> Option<Parameter> {
        let pos = self.params.iter().position(|p| p.name == name)?;
        Some(self.params.remove(pos))
    }

    /// Parameters of `self` whose names also appear in `other`.
    pub fn common_with(&self, other: &ParameterList) -> ParameterList {
        ParameterList {
            params: self
                .params
                .iter()
                .filter(|p| other.has_parameter(&p.name))
                .cloned()
                .collect(),
        }
    }

    /// Copy values from `other` for every shared name.
    ///
    /// Returns the subset of parameters whose value actually changed. All
    /// values are checked before any is written, so a constraint failure
    /// leaves the list untouched.
    pub fn match_values(&mut self, other: &ParameterList) -> Result<ParameterList> {
        let mut updates = Vec::new();
        for p in other.iter() {
            if let Some(own) = self.get(&p.name) {
                if own.value != p.value {
                    if let Some(c) = &own.constraint {
                        if !c.is_correct(p.value) {
                            return Err(CyaneaError::Constraint {
                                name: p.name.clone(),
                                value: p.value,
                                constraint: c.to_string(),
                            });
                        }
                    }
                    updates.push((p.name.clone(), p.value));
                }
            }
        }
        let mut changed = ParameterList::new();
        for (name, value) in updates {
            if let Some(own) = self.get_mut(&name) {
                own.value = value;
                changed.params.push(own.clone());
            }
        }
        Ok(changed)
    }
}

impl core::ops::Index<usize> for ParameterList {
    type Output = Parameter;

    fn index(&self, index: usize) -> &Parameter {
        &self.params[index]
    }
}

impl<'a> IntoIterator for &'a ParameterList {
    type Item = &'a Parameter;
    type IntoIter = core::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

impl FromIterator<Parameter> for ParameterList {
    /// Later parameters with an already-seen name are dropped.
    fn from_iter<I: IntoIterator<Item = Parameter>>(iter: I) -> Self {
        let mut list = ParameterList::new();
        for p in iter {
            if !list.has_parameter(&p.name) {
                list.params.push(p);
            }
        }
        list
    }
}
