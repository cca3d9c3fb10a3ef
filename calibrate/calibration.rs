//! # Calibration Engine
//!
//! Posterior over the physical parameters given an experimental target. The
//! likelihood is Gaussian in the emulator's scaled feature space, with
//! covariance equal to the emulator's predictive covariance plus a diagonal
//! observational variance. The prior is flat inside the parameter ranges
//! unless a truncated Gaussian is configured; outside the ranges the log
//! posterior is `-inf`, which the sampler treats as a rejection.

use crate::design::ParameterSpace;
use crate::emulator::{EmulatorError, MultiGpEmulator};
use crate::observables::{ExperimentalTarget, ObservableError, ObservableSpec, ObservableTree};
use crate::sampler::{Chain, EnsembleSampler, LogDensity, SamplerConfig, SamplerError};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::UPLO;
use ndarray_linalg::cholesky::{DeterminantC, FactorizeC, SolveC};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Experimental target has {found} features, but the emulator predicts {expected}.")]
    TargetLengthMismatch { expected: usize, found: usize },

    #[error("Fractional observational error must be positive and finite, got {0}.")]
    InvalidFractionalError(f64),

    #[error("Observational variance at feature {index} is {value}; it must be finite and non-negative.")]
    InvalidObservationalVariance { index: usize, value: f64 },

    #[error("Gaussian prior has {found} entries, but there are {expected} parameters.")]
    PriorDimension { expected: usize, found: usize },

    #[error("Gaussian prior width for parameter {index} is {value}; widths must be positive.")]
    InvalidPriorWidth { index: usize, value: f64 },

    #[error("Posterior predictive reconstruction failed: {0}")]
    Emulator(#[from] EmulatorError),

    #[error("{0}")]
    Observable(#[from] ObservableError),

    #[error("MCMC failed: {0}")]
    Sampler(#[from] SamplerError),
}

/// How the per-element observational variance is derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ErrorModel {
    /// Variance `(yerr * target_i)^2`, in the same units as the target.
    Fractional { yerr: f64 },
    /// Variance from the measured uncertainties of each bin.
    Experimental,
}

impl Default for ErrorModel {
    fn default() -> Self {
        ErrorModel::Fractional { yerr: 0.1 }
    }
}

/// Prior over the physical parameters, always truncated to their ranges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ParameterPrior {
    #[default]
    Flat,
    Gaussian { mean: Vec<f64>, sd: Vec<f64> },
}

impl ParameterPrior {
    fn validate(&self, dim: usize) -> Result<(), CalibrationError> {
        if let ParameterPrior::Gaussian { mean, sd } = self {
            for found in [mean.len(), sd.len()] {
                if found != dim {
                    return Err(CalibrationError::PriorDimension {
                        expected: dim,
                        found,
                    });
                }
            }
            if let Some((index, &value)) = sd
                .iter()
                .enumerate()
                .find(|(_, s)| !(s.is_finite() && **s > 0.0))
            {
                return Err(CalibrationError::InvalidPriorWidth { index, value });
            }
        }
        Ok(())
    }

    fn log_density(&self, x: ArrayView1<f64>) -> f64 {
        match self {
            ParameterPrior::Flat => 0.0,
            ParameterPrior::Gaussian { mean, sd } => x
                .iter()
                .zip(mean.iter().zip(sd))
                .map(|(v, (m, s))| -0.5 * ((v - m) / s).powi(2))
                .sum(),
        }
    }
}

/// Log posterior density over the physical parameter space.
pub struct LogPosterior<'a> {
    emulator: &'a MultiGpEmulator,
    target: Array1<f64>,
    obs_variance: Array1<f64>,
    prior: ParameterPrior,
}

impl<'a> LogPosterior<'a> {
    /// `target` and `errors` are in physical units; both are mapped into the
    /// emulator's scaled feature space here.
    pub fn new(
        emulator: &'a MultiGpEmulator,
        target: &ExperimentalTarget,
        error_model: ErrorModel,
        prior: ParameterPrior,
    ) -> Result<Self, CalibrationError> {
        let expected = emulator.n_features();
        for found in [target.values.len(), target.errors.len()] {
            if found != expected {
                return Err(CalibrationError::TargetLengthMismatch { expected, found });
            }
        }
        prior.validate(emulator.space().dim())?;

        let scale = emulator.scale();
        let scaled_target = scale.scale(target.values.view())?;
        let obs_variance = match error_model {
            ErrorModel::Fractional { yerr } => {
                if !(yerr.is_finite() && yerr > 0.0) {
                    return Err(CalibrationError::InvalidFractionalError(yerr));
                }
                scaled_target.mapv(|t| (yerr * t).powi(2))
            }
            ErrorModel::Experimental => {
                scale.scale_variance(target.errors.mapv(|e| e * e).view())?
            }
        };
        if let Some((index, &value)) = obs_variance
            .iter()
            .enumerate()
            .find(|(_, v)| !(v.is_finite() && **v >= 0.0))
        {
            return Err(CalibrationError::InvalidObservationalVariance { index, value });
        }

        Ok(Self {
            emulator,
            target: scaled_target,
            obs_variance,
            prior,
        })
    }

    pub fn space(&self) -> &ParameterSpace {
        self.emulator.space()
    }

    /// Gaussian log likelihood of the target at `x`, up to a constant.
    pub fn log_likelihood(&self, x: ArrayView1<f64>) -> f64 {
        let prediction = match self.emulator.predict(x) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("Emulator prediction failed at {x}: {e}");
                return f64::NEG_INFINITY;
            }
        };
        let mut cov = prediction.cov;
        cov.diag_mut()
            .iter_mut()
            .zip(&self.obs_variance)
            .for_each(|(c, v)| *c += v);
        let residual = &self.target - &prediction.mean;

        let factor = match cov.factorizec(UPLO::Lower) {
            Ok(f) => f,
            Err(e) => {
                log::debug!("Likelihood covariance is not positive definite at {x}: {e}");
                return f64::NEG_INFINITY;
            }
        };
        match factor.solvec(&residual) {
            Ok(solved) => -0.5 * residual.dot(&solved) - 0.5 * factor.ln_detc(),
            Err(_) => f64::NEG_INFINITY,
        }
    }
}

impl LogDensity for LogPosterior<'_> {
    fn log_density(&self, x: ArrayView1<f64>) -> f64 {
        if !self.space().contains(x) {
            return f64::NEG_INFINITY;
        }
        let lp = self.prior.log_density(x) + self.log_likelihood(x);
        if lp.is_nan() { f64::NEG_INFINITY } else { lp }
    }
}

/// Options for one calibration run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalibrationConfig {
    pub error_model: ErrorModel,
    pub prior: ParameterPrior,
    pub sampler: SamplerConfig,
}

/// Posterior samples over named physical parameters.
#[derive(Debug, Clone)]
pub struct PosteriorChain {
    names: Vec<String>,
    chain: Chain,
}

impl PosteriorChain {
    pub fn parameter_names(&self) -> &[String] {
        &self.names
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Flattened samples across walkers and post-burn-in steps.
    pub fn samples(&self) -> Array2<f64> {
        self.chain.flat()
    }

    pub fn log_probs(&self) -> Array1<f64> {
        self.chain.flat_log_probs()
    }

    pub fn len(&self) -> usize {
        self.chain.n_steps() * self.chain.n_walkers()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Posterior mean per parameter; `None` for an empty chain.
    pub fn mean(&self) -> Option<Array1<f64>> {
        self.samples().mean_axis(Axis(0))
    }

    pub fn std(&self) -> Option<Array1<f64>> {
        let samples = self.samples();
        (samples.nrows() > 1).then(|| samples.std_axis(Axis(0), 1.0))
    }

    /// Emulator-predicted observables at up to `max_samples` evenly spaced
    /// chain samples, restored to physical units and split per key path.
    pub fn predictive(
        &self,
        emulator: &MultiGpEmulator,
        spec: &ObservableSpec,
        max_samples: Option<usize>,
    ) -> Result<ObservableTree<Array2<f64>>, CalibrationError> {
        let samples = self.samples();
        let n = samples.nrows();
        let take = max_samples.map_or(n, |m| m.min(n));
        let selected = if take == n {
            samples
        } else {
            let rows: Vec<usize> = (0..take).map(|i| i * n / take).collect();
            samples.select(Axis(0), &rows)
        };
        let physical = emulator.predict_physical_rows(selected.view())?;
        Ok(spec.split(physical.view())?)
    }
}

/// Runs the ensemble sampler on the posterior defined by `emulator` and `target`.
///
/// Walkers start in a ball around the centre of the parameter box.
pub fn calibrate(
    emulator: &MultiGpEmulator,
    target: &ExperimentalTarget,
    config: &CalibrationConfig,
) -> Result<PosteriorChain, CalibrationError> {
    let posterior = LogPosterior::new(emulator, target, config.error_model, config.prior.clone())?;
    let space = emulator.space();
    log::info!(
        "Calibrating {} parameters against {} features with {} walkers",
        space.dim(),
        emulator.n_features(),
        config.sampler.nwalkers
    );
    let chain = EnsembleSampler::new(&posterior, config.sampler.clone()).run(
        space.midpoint().view(),
        space.lower().view(),
        space.upper().view(),
    )?;

    if let Some(r_hat) = chain.r_hat() {
        for (name, r) in space.names().iter().zip(r_hat.iter()) {
            if *r > 1.1 {
                log::warn!("Parameter '{name}' has R-hat {r:.3}; the chain may not have converged");
            }
        }
    }
    Ok(PosteriorChain {
        names: space.names(),
        chain,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::{DesignTable, Parameter};
    use crate::emulator::EmulatorConfig;
    use crate::gp::TrainingOptions;
    use crate::observables::{FeatureScale, ObservableEntry, TrainingMatrix};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn linear(p: ArrayView1<f64>) -> Array1<f64> {
        array![2.0 + p[0], 3.0 + p[1], 4.0 + 0.5 * p[0] - 0.5 * p[1]]
    }

    fn emulator(normalize_by: Option<Array1<f64>>) -> MultiGpEmulator {
        let space = ParameterSpace::new(vec![
            Parameter::new("x", 0.0, 1.0),
            Parameter::new("y", 0.0, 1.0),
        ])
        .unwrap();
        let mut rng = StdRng::seed_from_u64(8);
        let points = Array2::from_shape_fn((20, 2), |_| rng.gen_range(0.0..1.0));
        let mut raw = Array2::zeros((20, 3));
        for (i, row) in points.rows().into_iter().enumerate() {
            raw.row_mut(i).assign(&linear(row));
        }
        let scale = match normalize_by {
            Some(d) => FeatureScale::from_divisor(d).unwrap(),
            None => FeatureScale::identity(),
        };
        let training = TrainingMatrix::new(raw.view(), scale).unwrap();
        let design = DesignTable::new(space, points).unwrap();
        let config = EmulatorConfig {
            npc: 2,
            training: TrainingOptions {
                nstarts: 3,
                ..TrainingOptions::default()
            },
            ..EmulatorConfig::default()
        };
        MultiGpEmulator::train(&training, &design, &config).unwrap()
    }

    fn target_at(p: ArrayView1<f64>) -> ExperimentalTarget {
        let values = linear(p);
        let errors = values.mapv(|v| 0.01 * v);
        ExperimentalTarget { values, errors }
    }

    #[test]
    fn log_posterior_is_neg_infinity_outside_bounds() {
        let emu = emulator(None);
        let target = target_at(array![0.5, 0.5].view());
        let post =
            LogPosterior::new(&emu, &target, ErrorModel::default(), ParameterPrior::Flat).unwrap();
        for bad in [array![-0.01, 0.5], array![0.5, 1.01], array![2.0, -3.0]] {
            assert_eq!(post.log_density(bad.view()), f64::NEG_INFINITY);
        }
        assert!(post.log_density(array![0.5, 0.5].view()).is_finite());
    }

    #[test]
    fn likelihood_peaks_near_the_true_point() {
        let emu = emulator(None);
        let truth = array![0.3, 0.7];
        let target = target_at(truth.view());
        let post = LogPosterior::new(
            &emu,
            &target,
            ErrorModel::Fractional { yerr: 0.02 },
            ParameterPrior::Flat,
        )
        .unwrap();
        let at_truth = post.log_density(truth.view());
        assert!(at_truth > post.log_density(array![0.8, 0.2].view()));
        assert!(at_truth > post.log_density(array![0.1, 0.1].view()));
    }

    #[test]
    fn target_length_mismatch_is_rejected() {
        let emu = emulator(None);
        let target = ExperimentalTarget {
            values: array![1.0, 2.0],
            errors: array![0.1, 0.1],
        };
        assert!(matches!(
            LogPosterior::new(&emu, &target, ErrorModel::default(), ParameterPrior::Flat),
            Err(CalibrationError::TargetLengthMismatch { expected: 3, found: 2 })
        ));
    }

    #[test]
    fn gaussian_prior_is_validated() {
        let emu = emulator(None);
        let target = target_at(array![0.5, 0.5].view());
        let prior = ParameterPrior::Gaussian {
            mean: vec![0.5, 0.5],
            sd: vec![0.1, 0.0],
        };
        assert!(matches!(
            LogPosterior::new(&emu, &target, ErrorModel::default(), prior),
            Err(CalibrationError::InvalidPriorWidth { index: 1, .. })
        ));
    }

    #[test]
    fn normalised_calibration_recovers_the_truth() {
        let truth = array![0.4, 0.6];
        let target = target_at(truth.view());
        let emu = emulator(Some(target.values.clone()));
        let config = CalibrationConfig {
            error_model: ErrorModel::Fractional { yerr: 0.01 },
            prior: ParameterPrior::Flat,
            sampler: SamplerConfig {
                nwalkers: 12,
                nsteps: 300,
                nburnsteps: 150,
                seed: 3,
                show_progress: false,
                ..SamplerConfig::default()
            },
        };
        let posterior = calibrate(&emu, &target, &config).unwrap();
        assert_eq!(posterior.len(), 12 * 150);
        assert_eq!(posterior.parameter_names(), &["x".to_string(), "y".to_string()]);
        let mean = posterior.mean().unwrap();
        assert_abs_diff_eq!(mean[0], 0.4, epsilon = 0.05);
        assert_abs_diff_eq!(mean[1], 0.6, epsilon = 0.05);

        let spec = ObservableSpec::new(vec![
            ObservableEntry::new(["yields"], 2),
            ObservableEntry::new(["flow", "v2"], 1),
        ])
        .unwrap();
        let predictive = posterior.predictive(&emu, &spec, Some(50)).unwrap();
        let yields = predictive.get(&["yields".to_string()]).unwrap();
        assert_eq!(yields.dim(), (50, 2));
        let mean_yield = yields.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(mean_yield[0], 2.4, epsilon = 0.05);
    }
}
