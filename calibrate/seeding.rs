use ndarray::Array1;
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Bounds for the {which} hyperparameter are invalid: [{lo}, {hi}]. Both must be positive and finite with lo < hi.")]
    InvalidBounds { which: &'static str, lo: f64, hi: f64 },

    #[error("Prior for the {which} hyperparameter has non-positive or non-finite spread {sd}.")]
    InvalidPriorSpread { which: &'static str, sd: f64 },

    #[error("At least one optimizer start is required.")]
    NoStarts,
}

/// Closed bounds on the natural (not log) scale of each hyperparameter kind.
///
/// Length scales apply to inputs already mapped onto the unit cube and the
/// amplitude to standardised targets, so the defaults are dimensionless.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HyperBounds {
    pub amplitude: (f64, f64),
    pub length_scale: (f64, f64),
    pub noise: (f64, f64),
}

impl Default for HyperBounds {
    fn default() -> Self {
        Self {
            amplitude: (1e-2, 1e2),
            length_scale: (1e-2, 1e2),
            noise: (1e-8, 1.0),
        }
    }
}

fn check_positive_interval(which: &'static str, (lo, hi): (f64, f64)) -> Result<(), SeedError> {
    if lo > 0.0 && hi.is_finite() && lo < hi {
        Ok(())
    } else {
        Err(SeedError::InvalidBounds { which, lo, hi })
    }
}

impl HyperBounds {
    pub fn validate(&self) -> Result<(), SeedError> {
        check_positive_interval("amplitude", self.amplitude)?;
        check_positive_interval("length scale", self.length_scale)?;
        check_positive_interval("noise", self.noise)
    }

    /// Log-scale bounds in the [`crate::kernel::KernelParams::to_log`] layout.
    pub fn log_bounds(&self, dim: usize) -> Vec<(f64, f64)> {
        let ln = |(lo, hi): (f64, f64)| (lo.ln(), hi.ln());
        std::iter::once(ln(self.amplitude))
            .chain(std::iter::repeat_n(ln(self.length_scale), dim))
            .chain(std::iter::once(ln(self.noise)))
            .collect()
    }
}

/// Distribution that optimizer starting points are drawn from. It only
/// chooses where restarts begin; the objective itself is the plain
/// marginal likelihood.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum HyperPrior {
    /// Uniform in log space across the bounds.
    #[default]
    LogUniform,
    /// Independent normals on the log hyperparameters, clamped to the bounds.
    LogNormal {
        amplitude: (f64, f64),
        length_scale: (f64, f64),
        noise: (f64, f64),
    },
}

impl HyperPrior {
    pub fn validate(&self) -> Result<(), SeedError> {
        if let HyperPrior::LogNormal {
            amplitude,
            length_scale,
            noise,
        } = self
        {
            for (which, (_, sd)) in [
                ("amplitude", amplitude),
                ("length scale", length_scale),
                ("noise", noise),
            ] {
                if !(sd.is_finite() && *sd > 0.0) {
                    return Err(SeedError::InvalidPriorSpread { which, sd: *sd });
                }
            }
        }
        Ok(())
    }
}

fn clamp_to_bounds(value: f64, bounds: (f64, f64)) -> f64 {
    let (lo, hi) = if bounds.0 <= bounds.1 {
        bounds
    } else {
        (bounds.1, bounds.0)
    };
    value.clamp(lo, hi)
}

fn draw(
    prior: &HyperPrior,
    dim: usize,
    log_bounds: &[(f64, f64)],
    rng: &mut impl Rng,
) -> Result<Array1<f64>, SeedError> {
    let mut seed = Array1::zeros(log_bounds.len());
    match prior {
        HyperPrior::LogUniform => {
            for (v, &(lo, hi)) in seed.iter_mut().zip(log_bounds) {
                *v = Uniform::new_inclusive(lo, hi).sample(rng);
            }
        }
        HyperPrior::LogNormal {
            amplitude,
            length_scale,
            noise,
        } => {
            let make = |which: &'static str, (mu, sd): (f64, f64)| {
                Normal::new(mu, sd).map_err(|_| SeedError::InvalidPriorSpread { which, sd })
            };
            let amp = make("amplitude", *amplitude)?;
            let len = make("length scale", *length_scale)?;
            let noi = make("noise", *noise)?;
            for (i, (v, &b)) in seed.iter_mut().zip(log_bounds).enumerate() {
                let raw = if i == 0 {
                    amp.sample(rng)
                } else if i <= dim {
                    len.sample(rng)
                } else {
                    noi.sample(rng)
                };
                *v = clamp_to_bounds(raw, b);
            }
        }
    }
    Ok(seed)
}

/// Produces `nstarts` distinct log-hyperparameter vectors inside the bounds.
///
/// Every start is a draw from `prior`. All draws come from `rng` in order, so a
/// seeded generator reproduces the same starts.
pub fn generate_starts(
    dim: usize,
    prior: &HyperPrior,
    bounds: &HyperBounds,
    nstarts: usize,
    rng: &mut impl Rng,
) -> Result<Vec<Array1<f64>>, SeedError> {
    if nstarts == 0 {
        return Err(SeedError::NoStarts);
    }
    bounds.validate()?;
    prior.validate()?;
    let log_bounds = bounds.log_bounds(dim);

    let mut seen: HashSet<Vec<u64>> = HashSet::new();
    let mut starts: Vec<Array1<f64>> = Vec::with_capacity(nstarts);

    // A clamped normal can repeat a corner; bounded retries keep this finite.
    let mut attempts = 0;
    while starts.len() < nstarts && attempts < 100 * nstarts {
        attempts += 1;
        let s = draw(prior, dim, &log_bounds, rng)?;
        let key: Vec<u64> = s.iter().map(|v| v.to_bits()).collect();
        if seen.insert(key) {
            starts.push(s);
        }
    }
    Ok(starts)
}
