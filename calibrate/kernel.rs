//! Squared-exponential covariance with per-dimension length scales plus white noise.
//!
//! Hyperparameters are carried on the log scale in a fixed layout:
//! `[ln amplitude, ln length_1, ..., ln length_D, ln noise]`, where
//! `amplitude` and `noise` are variances.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelParams {
    /// Signal variance of the squared-exponential term.
    pub amplitude: f64,
    pub length_scales: Vec<f64>,
    /// White-noise variance added to the diagonal of the training covariance.
    pub noise: f64,
}

impl KernelParams {
    pub fn dim(&self) -> usize {
        self.length_scales.len()
    }

    /// Number of hyperparameters for inputs of dimension `dim`.
    pub fn n_params(dim: usize) -> usize {
        dim + 2
    }

    pub fn from_log(theta: ArrayView1<f64>) -> Self {
        let d = theta.len() - 2;
        Self {
            amplitude: theta[0].exp(),
            length_scales: theta.iter().skip(1).take(d).map(|v| v.exp()).collect(),
            noise: theta[d + 1].exp(),
        }
    }

    pub fn to_log(&self) -> Array1<f64> {
        std::iter::once(self.amplitude.ln())
            .chain(self.length_scales.iter().map(|l| l.ln()))
            .chain(std::iter::once(self.noise.ln()))
            .collect()
    }

    fn scaled_sq_dist(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        a.iter()
            .zip(b.iter())
            .zip(&self.length_scales)
            .map(|((x, y), l)| {
                let r = (x - y) / l;
                r * r
            })
            .sum()
    }

    /// Noise-free covariance between two single points.
    pub fn correlation(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        self.amplitude * (-0.5 * self.scaled_sq_dist(a, b)).exp()
    }

    /// Training covariance `K(X, X) + noise * I`.
    pub fn train_covariance(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let n = x.nrows();
        let mut k = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            k[[i, i]] = self.amplitude + self.noise;
            for j in 0..i {
                let v = self.correlation(x.row(i), x.row(j));
                k[[i, j]] = v;
                k[[j, i]] = v;
            }
        }
        k
    }

    /// Cross covariance `K(A, B)` without noise, shape (|A|, |B|).
    pub fn cross_covariance(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
        Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
            self.correlation(a.row(i), b.row(j))
        })
    }

    /// Prior variance at any input, including the noise term.
    pub fn prior_variance(&self) -> f64 {
        self.amplitude + self.noise
    }

    /// Derivatives of the training covariance with respect to each log-hyperparameter,
    /// in the same order as [`KernelParams::to_log`].
    pub fn log_param_gradients(&self, x: ArrayView2<f64>) -> Vec<Array2<f64>> {
        let n = x.nrows();
        let d = self.dim();
        let mut se = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            se[[i, i]] = self.amplitude;
            for j in 0..i {
                let v = self.correlation(x.row(i), x.row(j));
                se[[i, j]] = v;
                se[[j, i]] = v;
            }
        }

        let mut grads = Vec::with_capacity(d + 2);
        for dim in 0..d {
            let l2 = self.length_scales[dim] * self.length_scales[dim];
            let g = Array2::from_shape_fn((n, n), |(i, j)| {
                let diff = x[[i, dim]] - x[[j, dim]];
                se[[i, j]] * diff * diff / l2
            });
            grads.push(g);
        }
        grads.insert(0, se);
        grads.push(Array2::from_diag_elem(n, self.noise));
        grads
    }
}
