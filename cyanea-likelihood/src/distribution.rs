//! Discrete distributions: finite sets of weighted values used for rate
//! heterogeneity and for mixing model parameters.

use core::f64::consts::PI;
use core::fmt;

use cyanea_core::{Constraint, CyaneaError, Parameter, ParameterList, Result};

/// A finite set of `(value, probability)` categories with named parameters.
pub trait DiscreteDistribution: fmt::Debug + Send + Sync {
    /// Namespace prefix of the parameters, e.g. `"Gamma"`.
    fn name(&self) -> &str;

    /// Category values.
    fn categories(&self) -> &[f64];

    /// Category probabilities, summing to one.
    fn probabilities(&self) -> &[f64];

    /// Shape parameters of the distribution.
    fn parameters(&self) -> &ParameterList;

    /// Copy shared parameter values in and recompute the categories.
    ///
    /// Returns whether any value changed.
    fn set_parameter_values(&mut self, params: &ParameterList) -> Result<bool>;

    fn box_clone(&self) -> Box<dyn DiscreteDistribution>;

    /// A one-point distribution.
    fn is_constant(&self) -> bool {
        false
    }

    fn n_categories(&self) -> usize {
        self.categories().len()
    }

    /// Smallest category value.
    fn lower_bound(&self) -> f64 {
        self.categories().iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Largest category value.
    fn upper_bound(&self) -> f64 {
        self.categories()
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }

    fn mean(&self) -> f64 {
        self.categories()
            .iter()
            .zip(self.probabilities())
            .map(|(c, p)| c * p)
            .sum()
    }
}

impl Clone for Box<dyn DiscreteDistribution> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// A degenerate distribution with one category of probability one.
#[derive(Debug, Clone)]
pub struct ConstantDistribution {
    params: ParameterList,
    value: [f64; 1],
}

impl ConstantDistribution {
    pub fn new(value: f64) -> Self {
        let mut params = ParameterList::new();
        // A fresh list cannot hold a duplicate.
        let _ = params.add(Parameter::new("value", value));
        Self {
            params,
            value: [value],
        }
    }

    /// A constant whose `value` parameter carries `constraint`.
    pub fn constrained(value: f64, constraint: Constraint) -> Result<Self> {
        let mut params = ParameterList::new();
        params.add(Parameter::constrained("value", value, constraint)?)?;
        Ok(Self {
            params,
            value: [value],
        })
    }
}

const ONE: [f64; 1] = [1.0];

impl DiscreteDistribution for ConstantDistribution {
    fn name(&self) -> &str {
        "Constant"
    }

    fn categories(&self) -> &[f64] {
        &self.value
    }

    fn probabilities(&self) -> &[f64] {
        &ONE
    }

    fn parameters(&self) -> &ParameterList {
        &self.params
    }

    fn set_parameter_values(&mut self, params: &ParameterList) -> Result<bool> {
        let changed = self.params.match_values(params)?;
        self.value[0] = self.params.value("value")?;
        Ok(!changed.is_empty())
    }

    fn box_clone(&self) -> Box<dyn DiscreteDistribution> {
        Box::new(self.clone())
    }

    fn is_constant(&self) -> bool {
        true
    }
}

/// Mean-one gamma distribution discretised into equiprobable categories,
/// each represented by its conditional mean.
#[derive(Debug, Clone)]
pub struct GammaDiscreteDistribution {
    params: ParameterList,
    categories: Vec<f64>,
    probabilities: Vec<f64>,
}

impl GammaDiscreteDistribution {
    pub fn new(n_categories: usize, alpha: f64) -> Result<Self> {
        if n_categories == 0 {
            return Err(CyaneaError::InvalidInput(
                "gamma distribution needs at least one category".into(),
            ));
        }
        let mut params = ParameterList::new();
        params.add(Parameter::constrained("alpha", alpha, Constraint::positive())?)?;
        let categories = gamma_category_means(alpha, n_categories)?;
        Ok(Self {
            params,
            categories,
            probabilities: vec![1.0 / n_categories as f64; n_categories],
        })
    }

    pub fn alpha(&self) -> f64 {
        // The list always holds `alpha`.
        self.params.value("alpha").unwrap_or(f64::NAN)
    }
}

impl DiscreteDistribution for GammaDiscreteDistribution {
    fn name(&self) -> &str {
        "Gamma"
    }

    fn categories(&self) -> &[f64] {
        &self.categories
    }

    fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    fn parameters(&self) -> &ParameterList {
        &self.params
    }

    fn set_parameter_values(&mut self, params: &ParameterList) -> Result<bool> {
        let changed = self.params.match_values(params)?;
        if changed.is_empty() {
            return Ok(false);
        }
        self.categories = gamma_category_means(self.params.value("alpha")?, self.categories.len())?;
        Ok(true)
    }

    fn box_clone(&self) -> Box<dyn DiscreteDistribution> {
        Box::new(self.clone())
    }
}

/// User-supplied values with fixed probabilities; values are exposed as
/// parameters `V1..Vn`.
#[derive(Debug, Clone)]
pub struct SimpleDiscreteDistribution {
    params: ParameterList,
    values: Vec<f64>,
    probabilities: Vec<f64>,
}

impl SimpleDiscreteDistribution {
    pub fn new(values: Vec<f64>, probabilities: Vec<f64>) -> Result<Self> {
        if values.is_empty() || values.len() != probabilities.len() {
            return Err(CyaneaError::InvalidInput(format!(
                "{} values for {} probabilities",
                values.len(),
                probabilities.len()
            )));
        }
        if probabilities.iter().any(|&p| !(0.0..=1.0).contains(&p)) {
            return Err(CyaneaError::InvalidInput("probabilities must lie in [0, 1]".into()));
        }
        let total: f64 = probabilities.iter().sum();
        if (total - 1.0).abs() > 1e-9 {
            return Err(CyaneaError::InvalidInput(format!(
                "probabilities sum to {}, expected 1",
                total
            )));
        }
        let mut params = ParameterList::new();
        for (i, &v) in values.iter().enumerate() {
            params.add(Parameter::new(format!("V{}", i + 1), v))?;
        }
        Ok(Self {
            params,
            values,
            probabilities,
        })
    }
}

impl DiscreteDistribution for SimpleDiscreteDistribution {
    fn name(&self) -> &str {
        "Simple"
    }

    fn categories(&self) -> &[f64] {
        &self.values
    }

    fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    fn parameters(&self) -> &ParameterList {
        &self.params
    }

    fn set_parameter_values(&mut self, params: &ParameterList) -> Result<bool> {
        let changed = self.params.match_values(params)?;
        for (i, v) in self.values.iter_mut().enumerate() {
            *v = self.params.value(&format!("V{}", i + 1))?;
        }
        Ok(!changed.is_empty())
    }

    fn box_clone(&self) -> Box<dyn DiscreteDistribution> {
        Box::new(self.clone())
    }
}

// ── Gamma discretisation ──────────────────────────────────────────────────

/// Conditional means of `n` equiprobable categories of Gamma(alpha, rate alpha).
fn gamma_category_means(alpha: f64, n: usize) -> Result<Vec<f64>> {
    if !(alpha > 0.0) {
        return Err(CyaneaError::InvalidInput(format!(
            "gamma shape must be positive, got {}",
            alpha
        )));
    }
    if n == 1 {
        return Ok(vec![1.0]);
    }
    // Boundaries in the scaled variable y = alpha * x.
    let mut cut = Vec::with_capacity(n - 1);
    for i in 1..n {
        cut.push(gamma_quantile(alpha, i as f64 / n as f64)?);
    }
    let mut lower_tail = Vec::with_capacity(n + 1);
    lower_tail.push(0.0);
    for &y in &cut {
        lower_tail.push(gammainc(alpha + 1.0, y)?);
    }
    lower_tail.push(1.0);
    Ok(lower_tail
        .windows(2)
        .map(|w| n as f64 * (w[1] - w[0]))
        .collect())
}

/// `y` such that P(alpha, y) = p, by bisection.
fn gamma_quantile(alpha: f64, p: f64) -> Result<f64> {
    let mut lo = 0.0;
    let mut hi = alpha.max(1.0);
    while gammainc(alpha, hi)? < p {
        hi *= 2.0;
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if gammainc(alpha, mid)? < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-14 * hi {
            break;
        }
    }
    Ok(0.5 * (lo + hi))
}

/// Natural log of the gamma function via the Lanczos approximation (g=7).
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        // Γ(x) = π / (sin(πx) · Γ(1-x))
        (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut ag = 0.99999999999980993_f64;
        for (i, &c) in COEFFS.iter().enumerate() {
            ag += c / (x + i as f64 + 1.0);
        }
        let t = x + 7.5;
        0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + ag.ln()
    }
}

/// Regularized lower incomplete gamma function P(a, x).
pub fn gammainc(a: f64, x: f64) -> Result<f64> {
    if a <= 0.0 {
        return Err(CyaneaError::InvalidInput("gammainc: a must be positive".into()));
    }
    if x < 0.0 {
        return Err(CyaneaError::InvalidInput("gammainc: x must be non-negative".into()));
    }
    if x == 0.0 {
        return Ok(0.0);
    }
    let ln_prefix = a * x.ln() - x - ln_gamma(a);

    if x < a + 1.0 {
        let mut sum = 1.0 / a;
        let mut term = 1.0 / a;
        for n in 1..=500 {
            term *= x / (a + n as f64);
            sum += term;
            if term.abs() < sum.abs() * 1e-15 {
                break;
            }
        }
        Ok((sum * ln_prefix.exp()).min(1.0))
    } else {
        // Continued fraction for Q = 1 - P, modified Lentz.
        let tiny = 1e-300_f64;
        let mut b = x + 1.0 - a;
        let mut c = 1.0 / tiny;
        let mut d = 1.0 / b;
        let mut h = d;
        for i in 1..=500 {
            let an = -(i as f64) * (i as f64 - a);
            b += 2.0;
            d = an * d + b;
            if d.abs() < tiny {
                d = tiny;
            }
            c = b + an / c;
            if c.abs() < tiny {
                c = tiny;
            }
            d = 1.0 / d;
            let delta = d * c;
            h *= delta;
            if (delta - 1.0).abs() < 1e-15 {
                break;
            }
        }
        Ok((1.0 - h * ln_prefix.exp()).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ln_gamma_integers() {
        assert!((ln_gamma(1.0)).abs() < 1e-12);
        assert!((ln_gamma(5.0) - 24.0f64.ln()).abs() < 1e-10);
    }

    #[test]
    fn gammainc_exponential() {
        // a = 1 is the exponential CDF.
        for &x in &[0.1, 1.0, 3.0, 10.0] {
            assert!((gammainc(1.0, x).unwrap() - (1.0 - (-x as f64).exp())).abs() < 1e-10);
        }
    }

    #[test]
    fn gamma_categories_have_mean_one() {
        for &alpha in &[0.2, 0.5, 1.0, 2.0, 10.0] {
            let g = GammaDiscreteDistribution::new(4, alpha).unwrap();
            assert!(
                (g.mean() - 1.0).abs() < 1e-8,
                "alpha {} mean {}",
                alpha,
                g.mean()
            );
            let cats = g.categories();
            assert!(cats.windows(2).all(|w| w[0] < w[1]));
            assert!((g.probabilities().iter().sum::<f64>() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn gamma_alpha_one_known_values() {
        // Exponential(1) with two categories: cut at ln 2.
        let g = GammaDiscreteDistribution::new(2, 1.0).unwrap();
        let l2 = 2.0f64.ln();
        let lower = 2.0 * (1.0 - (-l2).exp() * (1.0 + l2));
        assert!((g.categories()[0] - lower).abs() < 1e-8);
    }

    #[test]
    fn gamma_update_recomputes() {
        let mut g = GammaDiscreteDistribution::new(4, 0.5).unwrap();
        let before = g.categories().to_vec();
        let mut p = ParameterList::new();
        p.add(Parameter::new("alpha", 2.0)).unwrap();
        assert!(g.set_parameter_values(&p).unwrap());
        assert_ne!(before, g.categories());
        assert!(!g.set_parameter_values(&p).unwrap());
        p.set_value("alpha", -1.0).unwrap();
        assert!(g.set_parameter_values(&p).is_err());
    }

    #[test]
    fn constant_is_degenerate() {
        let c = ConstantDistribution::new(2.5);
        assert!(c.is_constant());
        assert_eq!(c.categories(), &[2.5]);
        assert_eq!(c.lower_bound(), 2.5);
        assert_eq!(c.parameters().names(), vec!["value"]);
        assert!(ConstantDistribution::constrained(-1.0, Constraint::positive()).is_err());
    }

    #[test]
    fn simple_validates_probabilities() {
        assert!(SimpleDiscreteDistribution::new(vec![1.0, 2.0], vec![0.5, 0.6]).is_err());
        assert!(SimpleDiscreteDistribution::new(vec![1.0], vec![0.5, 0.5]).is_err());
        let d = SimpleDiscreteDistribution::new(vec![1.0, 3.0], vec![0.25, 0.75]).unwrap();
        assert_eq!(d.parameters().names(), vec!["V1", "V2"]);
        assert_eq!(d.upper_bound(), 3.0);
        assert!((d.mean() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn boxed_clone_is_deep() {
        let g: Box<dyn DiscreteDistribution> =
            Box::new(GammaDiscreteDistribution::new(3, 0.7).unwrap());
        let mut copy = g.clone();
        let mut p = ParameterList::new();
        p.add(Parameter::new("alpha", 3.0)).unwrap();
        copy.set_parameter_values(&p).unwrap();
        assert_ne!(g.categories(), copy.categories());
    }
}
