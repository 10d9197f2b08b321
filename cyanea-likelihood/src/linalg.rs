//! Dense linear algebra helpers on `ndarray`.
//!
//! Reversible generators are symmetrised with the stationary frequencies,
//! diagonalised with a cyclic Jacobi solver, and mapped back so that
//! `Q = V · diag(λ) · Vinv` with real `λ`.

use cyanea_core::{CyaneaError, Result};
use ndarray::{Array1, Array2, Axis};

const MAX_SWEEPS: usize = 100;

/// Eigenvalues and eigenvectors of a real symmetric matrix.
///
/// Returns `(λ, U)` with the k-th eigenvector in column k of `U`, so that
/// `a = U · diag(λ) · Uᵀ`.
pub fn symmetric_eigen(a: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    let n = a.nrows();
    if n != a.ncols() {
        return Err(CyaneaError::InvalidInput(format!(
            "matrix must be square, got {}x{}",
            n,
            a.ncols()
        )));
    }
    if a.iter().any(|x| !x.is_finite()) {
        return Err(CyaneaError::InvalidInput("matrix has non-finite entries".into()));
    }

    let mut a = a.clone();
    let mut v = Array2::<f64>::eye(n);
    let scale = a.iter().map(|x| x * x).sum::<f64>().sqrt().max(f64::MIN_POSITIVE);

    for _ in 0..MAX_SWEEPS {
        let mut off = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off += a[[p, q]] * a[[p, q]];
            }
        }
        if off.sqrt() <= 1e-15 * scale {
            let eigenvalues = a.diag().to_owned();
            return Ok((eigenvalues, v));
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq.abs() <= f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                a[[p, q]] = 0.0;
                a[[q, p]] = 0.0;

                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    Err(CyaneaError::Other(format!(
        "Jacobi eigen-solver did not converge in {} sweeps",
        MAX_SWEEPS
    )))
}

/// Spectral decomposition `Q = V · diag(λ) · Vinv` of a generator.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenDecomposition {
    eigenvalues: Array1<f64>,
    right: Array2<f64>,
    left: Array2<f64>,
}

impl EigenDecomposition {
    /// Decompose a generator that is reversible with respect to `freqs`.
    ///
    /// Every frequency must be strictly positive.
    pub fn from_reversible(q: &Array2<f64>, freqs: &Array1<f64>) -> Result<Self> {
        let n = freqs.len();
        if q.nrows() != n || q.ncols() != n {
            return Err(CyaneaError::Incompatible(format!(
                "generator is {}x{} but there are {} frequencies",
                q.nrows(),
                q.ncols(),
                n
            )));
        }
        if freqs.iter().any(|&f| !(f > 0.0)) {
            return Err(CyaneaError::Unsupported(
                "spectral decomposition requires strictly positive frequencies".into(),
            ));
        }
        let sqrt_pi = freqs.mapv(f64::sqrt);

        // B = diag(sqrt(pi)) * Q * diag(1/sqrt(pi)), symmetric for reversible Q.
        let mut b = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                b[[i, j]] = sqrt_pi[i] * q[[i, j]] / sqrt_pi[j];
            }
        }
        let sym = (&b + &b.t()) * 0.5;
        let (eigenvalues, u) = symmetric_eigen(&sym)?;

        let mut right = u.clone();
        for (i, mut row) in right.axis_iter_mut(Axis(0)).enumerate() {
            row /= sqrt_pi[i];
        }
        let mut left = u.t().to_owned();
        for (j, mut col) in left.axis_iter_mut(Axis(1)).enumerate() {
            col *= sqrt_pi[j];
        }

        Ok(Self {
            eigenvalues,
            right,
            left,
        })
    }

    pub fn n_states(&self) -> usize {
        self.eigenvalues.len()
    }

    /// λ
    pub fn eigenvalues(&self) -> &Array1<f64> {
        &self.eigenvalues
    }

    /// V, eigenvectors in columns.
    pub fn right_eigenvectors(&self) -> &Array2<f64> {
        &self.right
    }

    /// Vinv
    pub fn left_eigenvectors(&self) -> &Array2<f64> {
        &self.left
    }

    /// `V · diag(f(λ)) · Vinv`
    pub fn reconstruct<F: Fn(f64) -> f64>(&self, f: F) -> Array2<f64> {
        let mut scaled = self.right.clone();
        for (k, mut col) in scaled.axis_iter_mut(Axis(1)).enumerate() {
            col *= f(self.eigenvalues[k]);
        }
        scaled.dot(&self.left)
    }

    /// P(t) = exp(Qt). Negative round-off entries are clamped to zero.
    pub fn transition(&self, t: f64) -> Array2<f64> {
        let mut p = self.reconstruct(|l| (l * t).exp());
        p.mapv_inplace(|x| x.max(0.0));
        p
    }

    /// dP/dt
    pub fn d_transition(&self, t: f64) -> Array2<f64> {
        self.reconstruct(|l| l * (l * t).exp())
    }

    /// d²P/dt²
    pub fn d2_transition(&self, t: f64) -> Array2<f64> {
        self.reconstruct(|l| l * l * (l * t).exp())
    }
}

/// Build a generator from symmetric exchangeabilities and frequencies.
///
/// `Q[i][j] = s[i][j] · π[j]` off the diagonal, rows sum to zero, and the
/// matrix is scaled so that `-Σ π_i Q_ii = 1`.
pub fn build_rate_matrix(exchangeabilities: &Array2<f64>, freqs: &Array1<f64>) -> Array2<f64> {
    let n = freqs.len();
    let mut q = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        let mut off_diag = 0.0;
        for j in 0..n {
            if i != j {
                q[[i, j]] = exchangeabilities[[i, j]] * freqs[j];
                off_diag += q[[i, j]];
            }
        }
        q[[i, i]] = -off_diag;
    }
    normalize_rate_matrix(&mut q, freqs);
    q
}

/// Scale `q` in place to a mean rate of one under `freqs`.
pub fn normalize_rate_matrix(q: &mut Array2<f64>, freqs: &Array1<f64>) {
    let mu: f64 = (0..freqs.len()).map(|i| -freqs[i] * q[[i, i]]).sum();
    if mu > 0.0 {
        q.mapv_inplace(|x| x / mu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>, tol: f64) {
        for ((i, j), x) in a.indexed_iter() {
            assert!(
                (x - b[[i, j]]).abs() < tol,
                "mismatch at ({}, {}): {} vs {}",
                i,
                j,
                x,
                b[[i, j]]
            );
        }
    }

    #[test]
    fn eigen_of_diagonal() {
        let m = array![[1.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 3.0]];
        let (vals, _) = symmetric_eigen(&m).unwrap();
        let mut sorted = vals.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((sorted[0] - 1.0).abs() < 1e-12);
        assert!((sorted[2] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn eigen_reconstructs_symmetric_matrix() {
        let m = array![
            [4.0, 1.0, 0.5, 0.2],
            [1.0, 3.0, 0.3, 0.1],
            [0.5, 0.3, 2.0, 0.7],
            [0.2, 0.1, 0.7, 1.0]
        ];
        let (vals, u) = symmetric_eigen(&m).unwrap();
        let back = u.dot(&Array2::from_diag(&vals)).dot(&u.t());
        assert_close(&back, &m, 1e-10);
        assert_close(&u.t().dot(&u), &Array2::eye(4), 1e-10);
    }

    #[test]
    fn non_square_rejected() {
        let m = Array2::<f64>::zeros((2, 3));
        assert!(symmetric_eigen(&m).is_err());
    }

    #[test]
    fn reversible_decomposition() {
        let freqs = array![0.1, 0.2, 0.3, 0.4];
        let s = Array2::from_elem((4, 4), 1.0);
        let q = build_rate_matrix(&s, &freqs);
        let eig = EigenDecomposition::from_reversible(&q, &freqs).unwrap();
        assert_close(&eig.reconstruct(|l| l), &q, 1e-10);
        assert_close(&eig.transition(0.0), &Array2::eye(4), 1e-10);
        assert_close(
            &eig.right_eigenvectors().dot(eig.left_eigenvectors()),
            &Array2::eye(4),
            1e-10,
        );
        let p = eig.transition(0.7);
        for row in p.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn zero_frequency_unsupported() {
        let freqs = array![0.0, 0.5, 0.5];
        let q = Array2::<f64>::zeros((3, 3));
        assert!(matches!(
            EigenDecomposition::from_reversible(&q, &freqs),
            Err(CyaneaError::Unsupported(_))
        ));
    }

    #[test]
    fn rate_matrix_normalized() {
        let freqs = array![0.3, 0.2, 0.2, 0.3];
        let s = array![
            [0.0, 1.0, 2.0, 1.0],
            [1.0, 0.0, 1.0, 2.0],
            [2.0, 1.0, 0.0, 1.0],
            [1.0, 2.0, 1.0, 0.0]
        ];
        let q = build_rate_matrix(&s, &freqs);
        for row in q.rows() {
            assert!(row.sum().abs() < 1e-12);
        }
        let mu: f64 = (0..4).map(|i| -freqs[i] * q[[i, i]]).sum();
        assert!((mu - 1.0).abs() < 1e-12);
    }
}
