//! # Single-Output Gaussian Process Regressor
//!
//! Models one scalar target as a noisy function of a D-dimensional input with a
//! squared-exponential kernel plus white noise. Training maximises the log
//! marginal likelihood over the log-hyperparameters from several starting
//! points, each run through BFGS on a logistic reparametrisation that keeps the
//! hyperparameters inside their bounds. Targets are standardised internally.
//!
//! The lifecycle is explicit in the types: a [`GaussianProcess`] holds data
//! only; [`GaussianProcess::train`] consumes it and returns an immutable
//! [`FittedGaussianProcess`] that can be shared across threads for prediction.

use crate::kernel::KernelParams;
use crate::seeding::{self, HyperBounds, HyperPrior, SeedError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, OwnedRepr};
use ndarray_linalg::cholesky::{CholeskyFactorized, DeterminantC, FactorizeC, InverseC, SolveC};
use ndarray_linalg::UPLO;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Cost returned to the optimizer when the covariance cannot be factorised.
const FAILED_COST: f64 = 1e10;

/// Diagonal jitter (relative to the amplitude) tried in turn when factorisation fails.
const JITTER_LADDER: [f64; 3] = [1e-10, 1e-8, 1e-6];

#[derive(Error, Debug)]
pub enum GpError {
    #[error("Training inputs have {x_rows} rows but targets have {y_len} entries.")]
    LengthMismatch { x_rows: usize, y_len: usize },

    #[error("A Gaussian process needs at least 2 training points, got {0}.")]
    TooFewPoints(usize),

    #[error("Training data contains a non-finite value.")]
    NonFiniteData,

    #[error("Hyperparameter vector has {found} entries, expected {expected}.")]
    ParameterCountMismatch { expected: usize, found: usize },

    #[error("Query point has dimension {found}, but the model was trained on {expected}.")]
    QueryDimension { expected: usize, found: usize },

    #[error("Hyperparameter optimisation failed in all {restarts} restarts. Last failure: {reason}")]
    OptimizationFailed { restarts: usize, reason: String },

    #[error("The training covariance is not positive definite even with diagonal jitter: {0}")]
    NotPositiveDefinite(ndarray_linalg::error::LinalgError),

    #[error("Invalid optimizer starting configuration: {0}")]
    Seed(#[from] SeedError),
}

/// Options controlling hyperparameter estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingOptions {
    pub prior: HyperPrior,
    pub bounds: HyperBounds,
    pub nstarts: usize,
    pub seed: u64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            prior: HyperPrior::default(),
            bounds: HyperBounds::default(),
            nstarts: 8,
            seed: 0,
            max_iterations: 200,
            tolerance: 1e-6,
        }
    }
}

/// GP posterior at one query point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub mean: f64,
    pub variance: f64,
}

/// Training data awaiting hyperparameter estimation.
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    x: Array2<f64>,
    y: Array1<f64>,
    y_mean: f64,
    y_std: f64,
}

/// Standardised-target GP objective over log-hyperparameters.
struct Objective<'a> {
    x: ArrayView2<'a, f64>,
    y: ArrayView1<'a, f64>,
    /// Jitter (relative to the amplitude) always on the diagonal; zero in training.
    base_jitter: f64,
}

struct Conditioned {
    factor: CholeskyFactorized<OwnedRepr<f64>>,
    alpha: Array1<f64>,
    /// Total relative jitter that made the covariance factorisable.
    jitter: f64,
}

fn condition(
    params: &KernelParams,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    base_jitter: f64,
) -> Result<Conditioned, GpError> {
    let mut k = params.train_covariance(x);
    if base_jitter > 0.0 {
        k.diag_mut()
            .mapv_inplace(|v| v + base_jitter * params.amplitude);
    }
    let mut attempt = k.factorizec(UPLO::Lower);
    let mut jitter = base_jitter;
    for step in JITTER_LADDER {
        if attempt.is_ok() {
            break;
        }
        let mut kj = k.clone();
        kj.diag_mut().mapv_inplace(|v| v + step * params.amplitude);
        jitter = base_jitter + step;
        attempt = kj.factorizec(UPLO::Lower);
    }
    let factor = attempt.map_err(GpError::NotPositiveDefinite)?;
    let alpha = factor.solvec(&y).map_err(GpError::NotPositiveDefinite)?;
    Ok(Conditioned {
        factor,
        alpha,
        jitter,
    })
}

impl Objective<'_> {
    /// Negative log marginal likelihood and its gradient in log-hyperparameters.
    ///
    /// Jitter scales with the amplitude, so it contributes to the amplitude
    /// derivative of the covariance the factor was built from.
    fn nll_and_gradient(&self, theta: ArrayView1<f64>) -> Result<(f64, Array1<f64>), GpError> {
        let params = KernelParams::from_log(theta);
        let Conditioned {
            factor,
            alpha,
            jitter,
        } = condition(&params, self.x, self.y, self.base_jitter)?;
        let n = self.y.len() as f64;
        let nll = 0.5 * self.y.dot(&alpha) + 0.5 * factor.ln_detc() + 0.5 * n * (2.0 * PI).ln();

        let k_inv = factor.invc().map_err(GpError::NotPositiveDefinite)?;
        let a = alpha.view().insert_axis(Axis(1));
        let w = a.dot(&a.t()) - &k_inv;
        let mut dks = params.log_param_gradients(self.x);
        if jitter > 0.0 {
            if let Some(d_amp) = dks.first_mut() {
                d_amp
                    .diag_mut()
                    .mapv_inplace(|v| v + jitter * params.amplitude);
            }
        }
        let grad: Array1<f64> = dks.iter().map(|dk| -0.5 * (&w * dk).sum()).collect();
        Ok((nll, grad))
    }
}

fn logistic(u: f64) -> f64 {
    1.0 / (1.0 + (-u).exp())
}

/// Maps an unconstrained vector onto the bound box.
fn to_bounded(u: &Array1<f64>, bounds: &[(f64, f64)]) -> Array1<f64> {
    u.iter()
        .zip(bounds)
        .map(|(&ui, &(lo, hi))| lo + (hi - lo) * logistic(ui))
        .collect()
}

fn to_unbounded(theta: &Array1<f64>, bounds: &[(f64, f64)]) -> Array1<f64> {
    theta
        .iter()
        .zip(bounds)
        .map(|(&t, &(lo, hi))| {
            let p = ((t - lo) / (hi - lo)).clamp(1e-6, 1.0 - 1e-6);
            (p / (1.0 - p)).ln()
        })
        .collect()
}

struct RestartOutcome {
    theta: Array1<f64>,
    nll: f64,
    iterations: usize,
}

impl GaussianProcess {
    /// `x` should already be scaled (the emulator passes unit-cube inputs).
    pub fn new(x: Array2<f64>, y: Array1<f64>) -> Result<Self, GpError> {
        if x.nrows() != y.len() {
            return Err(GpError::LengthMismatch {
                x_rows: x.nrows(),
                y_len: y.len(),
            });
        }
        if y.len() < 2 {
            return Err(GpError::TooFewPoints(y.len()));
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(GpError::NonFiniteData);
        }
        let y_mean = y.mean().unwrap_or(0.0);
        let y_std = y.std(1.0);
        let y_std = if y_std > 0.0 && y_std.is_finite() { y_std } else { 1.0 };
        let y = y.mapv(|v| (v - y_mean) / y_std);
        Ok(Self {
            x,
            y,
            y_mean,
            y_std,
        })
    }

    pub fn dim(&self) -> usize {
        self.x.ncols()
    }

    fn objective(&self) -> Objective<'_> {
        Objective {
            x: self.x.view(),
            y: self.y.view(),
            base_jitter: 0.0,
        }
    }

    /// Log marginal likelihood (of the standardised targets) at `params`.
    pub fn log_marginal_likelihood(&self, params: &KernelParams) -> Result<f64, GpError> {
        self.check_params(params)?;
        let theta = params.to_log();
        Ok(-self.objective().nll_and_gradient(theta.view())?.0)
    }

    fn check_params(&self, params: &KernelParams) -> Result<(), GpError> {
        if params.dim() != self.dim() {
            return Err(GpError::ParameterCountMismatch {
                expected: KernelParams::n_params(self.dim()),
                found: KernelParams::n_params(params.dim()),
            });
        }
        Ok(())
    }

    fn optimize_from(
        &self,
        start: &Array1<f64>,
        log_bounds: &[(f64, f64)],
        options: &TrainingOptions,
    ) -> Result<RestartOutcome, String> {
        let objective = self.objective();
        let cost_and_grad = |u: &Array1<f64>| -> (f64, Array1<f64>) {
            let theta = to_bounded(u, log_bounds);
            match objective.nll_and_gradient(theta.view()) {
                Ok((nll, grad)) if nll.is_finite() && grad.iter().all(|g| g.is_finite()) => {
                    // Chain rule through the logistic map.
                    let chain: Array1<f64> = u
                        .iter()
                        .zip(log_bounds)
                        .zip(grad.iter())
                        .map(|((&ui, &(lo, hi)), &g)| {
                            let s = logistic(ui);
                            g * (hi - lo) * s * (1.0 - s)
                        })
                        .collect();
                    (nll, chain)
                }
                Ok((nll, _)) => {
                    log::warn!("Non-finite marginal likelihood {nll} during GP training.");
                    (FAILED_COST, Array1::zeros(u.len()))
                }
                Err(e) => {
                    log::warn!("GP objective evaluation failed: {e}");
                    (FAILED_COST, Array1::zeros(u.len()))
                }
            }
        };

        let BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        } = Bfgs::new(to_unbounded(start, log_bounds), cost_and_grad)
            .with_tolerance(options.tolerance)
            .with_max_iterations(options.max_iterations)
            .run()
            .map_err(|e| format!("BFGS failed: {e:?}"))?;

        if !(final_value.is_finite() && final_value < FAILED_COST) {
            return Err(format!("BFGS ended at an invalid objective value {final_value}"));
        }
        Ok(RestartOutcome {
            theta: to_bounded(&final_point, log_bounds),
            nll: final_value,
            iterations,
        })
    }

    /// Maximum-likelihood training from `options.nstarts` starting points.
    ///
    /// Starts are drawn sequentially from a generator seeded with
    /// `options.seed`, then optimised in parallel; the best restart wins, with
    /// ties going to the earliest start.
    pub fn train(self, options: &TrainingOptions) -> Result<FittedGaussianProcess, GpError> {
        let dim = self.dim();
        let mut rng = StdRng::seed_from_u64(options.seed);
        let starts = seeding::generate_starts(
            dim,
            &options.prior,
            &options.bounds,
            options.nstarts,
            &mut rng,
        )?;
        let log_bounds = options.bounds.log_bounds(dim);

        let outcomes: Vec<Result<RestartOutcome, String>> = starts
            .par_iter()
            .map(|start| self.optimize_from(start, &log_bounds, options))
            .collect();

        let mut best: Option<RestartOutcome> = None;
        let mut last_failure = String::new();
        for (i, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(o) => {
                    log::debug!(
                        "GP restart {i}: -log L = {:.6} after {} iterations",
                        o.nll,
                        o.iterations
                    );
                    if best.as_ref().is_none_or(|b| o.nll < b.nll) {
                        best = Some(o);
                    }
                }
                Err(reason) => {
                    log::warn!("GP restart {i} failed: {reason}");
                    last_failure = reason;
                }
            }
        }

        let best = best.ok_or_else(|| GpError::OptimizationFailed {
            restarts: starts.len(),
            reason: last_failure,
        })?;
        let params = KernelParams::from_log(best.theta.view());
        self.into_fitted(params)
    }

    /// Conditions on the data with fixed hyperparameters, skipping optimisation.
    pub fn with_params(self, params: KernelParams) -> Result<FittedGaussianProcess, GpError> {
        self.check_params(&params)?;
        self.into_fitted(params)
    }

    fn into_fitted(self, params: KernelParams) -> Result<FittedGaussianProcess, GpError> {
        let Conditioned { factor, alpha, .. } =
            condition(&params, self.x.view(), self.y.view(), 0.0)?;
        let log_marginal_likelihood = -(0.5 * self.y.dot(&alpha)
            + 0.5 * factor.ln_detc()
            + 0.5 * self.y.len() as f64 * (2.0 * PI).ln());
        Ok(FittedGaussianProcess {
            x: self.x,
            y: self.y,
            y_mean: self.y_mean,
            y_std: self.y_std,
            params,
            factor,
            alpha,
            log_marginal_likelihood,
        })
    }
}

/// A trained GP. Immutable; prediction never mutates state.
pub struct FittedGaussianProcess {
    x: Array2<f64>,
    y: Array1<f64>,
    y_mean: f64,
    y_std: f64,
    params: KernelParams,
    factor: CholeskyFactorized<OwnedRepr<f64>>,
    alpha: Array1<f64>,
    log_marginal_likelihood: f64,
}

impl std::fmt::Debug for FittedGaussianProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FittedGaussianProcess")
            .field("n_train", &self.x.nrows())
            .field("params", &self.params)
            .field("log_marginal_likelihood", &self.log_marginal_likelihood)
            .finish()
    }
}

/// Serializable state of a trained GP: hyperparameters plus conditioning data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpState {
    pub params: KernelParams,
    pub x: Array2<f64>,
    /// Targets in their original (unstandardised) units.
    pub y: Array1<f64>,
}

impl FittedGaussianProcess {
    pub fn params(&self) -> &KernelParams {
        &self.params
    }

    pub fn log_marginal_likelihood(&self) -> f64 {
        self.log_marginal_likelihood
    }

    pub fn dim(&self) -> usize {
        self.x.ncols()
    }

    fn check_query(&self, found: usize) -> Result<(), GpError> {
        if found != self.dim() {
            return Err(GpError::QueryDimension {
                expected: self.dim(),
                found,
            });
        }
        Ok(())
    }

    /// Posterior mean and variance at `x`. The variance includes the noise term,
    /// matching the diagonal of the training covariance.
    pub fn predict(&self, x: ArrayView1<f64>) -> Result<Prediction, GpError> {
        self.check_query(x.len())?;
        let k_star: Array1<f64> = self
            .x
            .rows()
            .into_iter()
            .map(|row| self.params.correlation(row, x))
            .collect();
        let v = self
            .factor
            .solvec(&k_star)
            .map_err(GpError::NotPositiveDefinite)?;
        let mean_std = k_star.dot(&self.alpha);
        let var_std = (self.params.prior_variance() - k_star.dot(&v)).max(0.0);
        Ok(Prediction {
            mean: self.y_mean + self.y_std * mean_std,
            variance: self.y_std * self.y_std * var_std,
        })
    }

    /// Joint posterior over several query rows: means and full covariance.
    pub fn predict_joint(&self, x: ArrayView2<f64>) -> Result<(Array1<f64>, Array2<f64>), GpError> {
        self.check_query(x.ncols())?;
        let k_star = self.params.cross_covariance(self.x.view(), x);
        let mean = k_star.t().dot(&self.alpha).mapv(|m| self.y_mean + self.y_std * m);

        let mut solved = Array2::<f64>::zeros(k_star.raw_dim());
        for (j, col) in k_star.columns().into_iter().enumerate() {
            let s = self
                .factor
                .solvec(&col)
                .map_err(GpError::NotPositiveDefinite)?;
            solved.column_mut(j).assign(&s);
        }
        let mut cov = self.params.cross_covariance(x, x) - k_star.t().dot(&solved);
        cov.diag_mut()
            .mapv_inplace(|v| (v + self.params.noise).max(0.0));
        cov.mapv_inplace(|v| v * self.y_std * self.y_std);
        Ok((mean, cov))
    }

    pub fn to_state(&self) -> GpState {
        GpState {
            params: self.params.clone(),
            x: self.x.clone(),
            y: self.y.mapv(|v| self.y_mean + self.y_std * v),
        }
    }

    pub fn from_state(state: GpState) -> Result<Self, GpError> {
        GaussianProcess::new(state.x, state.y)?.with_params(state.params)
    }
}
