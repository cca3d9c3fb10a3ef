//! # Principal Component Transform
//!
//! Reduces the (scaled) training matrix to orthogonal components ranked by
//! explained variance. The full eigenbasis of the F x F sample covariance is
//! kept, so projecting onto all F components and reconstructing round-trips the
//! input exactly; truncating to the first `k` components is lossy.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Eigenvalues below this (relative to the largest) are treated as exact zeros.
pub const EIGENVALUE_EPSILON: f64 = 1.0e-12;

#[derive(Error, Debug)]
pub enum PcaError {
    #[error("PCA needs at least 2 samples to estimate a covariance, got {0}.")]
    InsufficientSamples(usize),

    #[error("PCA needs at least one feature column.")]
    NoFeatures,

    #[error("Requested {requested} principal components, but only {available} are available.")]
    RankExceedsComponents { requested: usize, available: usize },

    #[error("Input has {found} features, but the PCA basis was fitted on {expected}.")]
    FeatureMismatch { expected: usize, found: usize },

    #[error("Reduced input has {found} columns, but {expected} components were requested.")]
    ComponentMismatch { expected: usize, found: usize },

    #[error("The training matrix has zero total variance; every column is constant.")]
    ZeroVariance,

    #[error("The training matrix contains a non-finite value at row {row}, column {col}.")]
    NonFinite { row: usize, col: usize },

    #[error("Eigendecomposition of the covariance matrix failed: {0}")]
    EigendecompositionFailed(ndarray_linalg::error::LinalgError),
}

/// A fitted principal component basis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaBasis {
    /// Column means of the training matrix, shape (F).
    mean: Array1<f64>,
    /// Orthonormal components as columns, shape (F, F), ordered by variance.
    components: Array2<f64>,
    /// Eigenvalues of the sample covariance, descending, non-negative.
    explained_variance: Array1<f64>,
}

impl PcaBasis {
    /// Fits the basis: column mean, sample covariance, symmetric eigendecomposition.
    pub fn fit(matrix: ArrayView2<f64>) -> Result<Self, PcaError> {
        let (n, f) = matrix.dim();
        if n < 2 {
            return Err(PcaError::InsufficientSamples(n));
        }
        if f == 0 {
            return Err(PcaError::NoFeatures);
        }
        if let Some(((row, col), _)) = matrix.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(PcaError::NonFinite { row, col });
        }

        let mean = matrix
            .mean_axis(Axis(0))
            .ok_or(PcaError::InsufficientSamples(n))?;
        let centered = &matrix - &mean.view().insert_axis(Axis(0));
        let covariance = centered.t().dot(&centered) / (n as f64 - 1.0);

        let (eigenvalues, eigenvectors) = covariance
            .eigh(UPLO::Lower)
            .map_err(PcaError::EigendecompositionFailed)?;

        // eigh returns ascending order; flip to descending.
        let explained_variance: Array1<f64> = eigenvalues.slice(s![..;-1]).to_owned();
        let mut components: Array2<f64> = eigenvectors.slice(s![.., ..;-1]).to_owned();

        let largest = explained_variance.first().copied().unwrap_or(0.0);
        if largest <= 0.0 {
            return Err(PcaError::ZeroVariance);
        }
        let explained_variance =
            explained_variance.mapv(|v| if v <= EIGENVALUE_EPSILON * largest { 0.0 } else { v });

        // Deterministic sign: the largest-magnitude entry of each component is positive.
        for mut column in components.columns_mut() {
            let pivot = column
                .iter()
                .copied()
                .fold(0.0_f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
            if pivot < 0.0 {
                column.mapv_inplace(|v| -v);
            }
        }

        Ok(Self {
            mean,
            components,
            explained_variance,
        })
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    /// Number of components computed (always equal to the feature count).
    pub fn n_components(&self) -> usize {
        self.components.ncols()
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn components(&self) -> &Array2<f64> {
        &self.components
    }

    /// The first `k` components as columns, shape (F, k).
    pub fn leading_components(&self, k: usize) -> Result<ArrayView2<'_, f64>, PcaError> {
        self.check_rank(k)?;
        Ok(self.components.slice(s![.., ..k]))
    }

    /// Variance captured by each component, descending.
    pub fn explained_variance(&self) -> &Array1<f64> {
        &self.explained_variance
    }

    /// Fraction of total variance per component; non-increasing and summing to one.
    pub fn weights(&self) -> Array1<f64> {
        let total = self.explained_variance.sum();
        &self.explained_variance / total
    }

    /// Covariance of the discarded components `k..F`, mapped back to feature space.
    pub fn truncation_covariance(&self, k: usize) -> Result<Array2<f64>, PcaError> {
        self.check_rank(k)?;
        let rest = self.components.slice(s![.., k..]);
        let var = self.explained_variance.slice(s![k..]);
        let scaled = &rest * &var.insert_axis(Axis(0));
        Ok(scaled.dot(&rest.t()))
    }

    /// Centers rows of `x` by the fitted mean and projects onto the first `k` components.
    pub fn project(&self, x: ArrayView2<f64>, k: usize) -> Result<Array2<f64>, PcaError> {
        let basis = self.leading_components(k)?;
        self.check_features(x.ncols())?;
        let centered = &x - &self.mean.view().insert_axis(Axis(0));
        Ok(centered.dot(&basis))
    }

    pub fn project_vector(&self, x: ArrayView1<f64>, k: usize) -> Result<Array1<f64>, PcaError> {
        let basis = self.leading_components(k)?;
        self.check_features(x.len())?;
        Ok((&x - &self.mean).dot(&basis))
    }

    /// Maps reduced rows (n x k) back to feature space and re-adds the mean.
    pub fn inverse(&self, z: ArrayView2<f64>, k: usize) -> Result<Array2<f64>, PcaError> {
        let basis = self.leading_components(k)?;
        if z.ncols() != k {
            return Err(PcaError::ComponentMismatch {
                expected: k,
                found: z.ncols(),
            });
        }
        Ok(z.dot(&basis.t()) + &self.mean.view().insert_axis(Axis(0)))
    }

    pub fn inverse_vector(&self, z: ArrayView1<f64>, k: usize) -> Result<Array1<f64>, PcaError> {
        let basis = self.leading_components(k)?;
        if z.len() != k {
            return Err(PcaError::ComponentMismatch {
                expected: k,
                found: z.len(),
            });
        }
        Ok(basis.dot(&z) + &self.mean)
    }

    fn check_rank(&self, k: usize) -> Result<(), PcaError> {
        if k > self.n_components() {
            return Err(PcaError::RankExceedsComponents {
                requested: k,
                available: self.n_components(),
            });
        }
        Ok(())
    }

    fn check_features(&self, found: usize) -> Result<(), PcaError> {
        if found != self.n_features() {
            return Err(PcaError::FeatureMismatch {
                expected: self.n_features(),
                found,
            });
        }
        Ok(())
    }
}
