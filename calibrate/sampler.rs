//! Affine-invariant ensemble sampler (Goodman & Weare stretch move).
//!
//! Walkers are split into two halves that are updated in turn; each half's
//! proposals use the other half's current positions, so one half forms a
//! barrier for the other. Within a half, proposals are independent and their
//! log densities are evaluated in parallel. Every random number is drawn
//! sequentially from one seeded generator before the parallel evaluation, so a
//! fixed seed reproduces the chain exactly for any thread count.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::ops::Range;
use thiserror::Error;

/// An unnormalised log probability density. Returning `f64::NEG_INFINITY`
/// marks a point as impossible (e.g. outside the prior support).
pub trait LogDensity: Sync {
    fn log_density(&self, x: ArrayView1<f64>) -> f64;
}

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("{nwalkers} walkers were requested, but at least {min} (twice the {dim} dimensions) are required.")]
    TooFewWalkers {
        nwalkers: usize,
        min: usize,
        dim: usize,
    },

    #[error("Burn-in of {nburnsteps} steps exceeds the total of {nsteps} steps.")]
    BurnInExceedsSteps { nburnsteps: usize, nsteps: usize },

    #[error("Stretch scale must be greater than 1, got {0}.")]
    InvalidStretchScale(f64),

    #[error("Initial spread must be positive and finite, got {0}.")]
    InvalidSpread(f64),

    #[error("Initial center has {found} coordinates, but bounds have {expected}.")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Walker {walker} could not be placed at a point of finite log density after {attempts} attempts.")]
    InitializationFailed { walker: usize, attempts: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplerConfig {
    pub nwalkers: usize,
    pub nsteps: usize,
    pub nburnsteps: usize,
    pub seed: u64,
    /// Stretch move scale `a`; proposals stretch by z in [1/a, a].
    pub stretch_scale: f64,
    /// Initial ball radius as a fraction of each parameter's range.
    pub init_spread: f64,
    pub max_init_attempts: usize,
    pub show_progress: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            nwalkers: 64,
            nsteps: 2000,
            nburnsteps: 1000,
            seed: 1,
            stretch_scale: 2.0,
            init_spread: 0.1,
            max_init_attempts: 1000,
            show_progress: true,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self, dim: usize) -> Result<(), SamplerError> {
        let min = (2 * dim).max(2);
        if self.nwalkers < min {
            return Err(SamplerError::TooFewWalkers {
                nwalkers: self.nwalkers,
                min,
                dim,
            });
        }
        if self.nburnsteps > self.nsteps {
            return Err(SamplerError::BurnInExceedsSteps {
                nburnsteps: self.nburnsteps,
                nsteps: self.nsteps,
            });
        }
        if !(self.stretch_scale.is_finite() && self.stretch_scale > 1.0) {
            return Err(SamplerError::InvalidStretchScale(self.stretch_scale));
        }
        if !(self.init_spread.is_finite() && self.init_spread > 0.0) {
            return Err(SamplerError::InvalidSpread(self.init_spread));
        }
        Ok(())
    }
}

/// Draws z from g(z) ∝ 1/sqrt(z) on [1/a, a].
fn sample_stretch<R: Rng + ?Sized>(a: f64, rng: &mut R) -> f64 {
    let u: f64 = rng.r#gen();
    ((a - 1.0) * u + 1.0).powi(2) / a
}

/// Log acceptance ratio of a stretch move in `dim` dimensions.
fn log_acceptance(z: f64, dim: usize, log_prob_old: f64, log_prob_new: f64) -> f64 {
    if log_prob_new.is_nan() || log_prob_new == f64::INFINITY {
        return f64::NEG_INFINITY;
    }
    (dim as f64 - 1.0) * z.ln() + log_prob_new - log_prob_old
}

fn create_progress_bar(len: u64, message: &str, visible: bool) -> ProgressBar {
    let draw_target = if visible && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .map(|s| s.progress_chars("█▉▊▋▌▍▎▏  "))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// Ensemble state: walker positions and their current log densities.
#[derive(Debug, Clone)]
pub struct EnsembleState {
    pub positions: Array2<f64>,
    pub log_probs: Array1<f64>,
}

/// Post-burn-in samples, stored as (step, walker, parameter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    samples: Array3<f64>,
    log_probs: Array2<f64>,
    acceptance_fraction: Array1<f64>,
}

impl Chain {
    pub fn n_steps(&self) -> usize {
        self.samples.len_of(Axis(0))
    }

    pub fn n_walkers(&self) -> usize {
        self.samples.len_of(Axis(1))
    }

    pub fn dim(&self) -> usize {
        self.samples.len_of(Axis(2))
    }

    pub fn samples(&self) -> &Array3<f64> {
        &self.samples
    }

    /// Fraction of accepted proposals per walker over the whole run, burn-in included.
    pub fn acceptance_fraction(&self) -> &Array1<f64> {
        &self.acceptance_fraction
    }

    pub fn mean_acceptance(&self) -> f64 {
        self.acceptance_fraction.mean().unwrap_or(0.0)
    }

    /// All samples flattened step-major, shape (steps * walkers, dim).
    pub fn flat(&self) -> Array2<f64> {
        let rows = self.n_steps() * self.n_walkers();
        self.samples
            .to_shape((rows, self.dim()))
            .map(|v| v.to_owned())
            .unwrap_or_else(|_| {
                let mut out = Array2::zeros((rows, self.dim()));
                for (i, mut row) in out.rows_mut().into_iter().enumerate() {
                    let (step, walker) = (i / self.n_walkers(), i % self.n_walkers());
                    row.assign(&self.samples.slice(s![step, walker, ..]));
                }
                out
            })
    }

    /// Log densities in the same order as [`Chain::flat`].
    pub fn flat_log_probs(&self) -> Array1<f64> {
        self.log_probs.iter().copied().collect()
    }

    /// Split-chain Gelman-Rubin statistic per parameter. `None` with fewer
    /// than 4 kept steps.
    pub fn r_hat(&self) -> Option<Array1<f64>> {
        let n_keep = self.n_steps();
        if n_keep < 4 {
            return None;
        }
        let n_split = n_keep / 2;
        let n_chains = 2 * self.n_walkers();

        let r_hat = (0..self.dim())
            .map(|p| {
                let mut means = Vec::with_capacity(n_chains);
                let mut vars = Vec::with_capacity(n_chains);
                for walker in 0..self.n_walkers() {
                    for half in [0..n_split, n_split..2 * n_split] {
                        let chain = self.samples.slice(s![half, walker, p]);
                        let mean = chain.mean().unwrap_or(0.0);
                        let var = chain.iter().map(|&x| (x - mean).powi(2)).sum::<f64>()
                            / (n_split - 1) as f64;
                        means.push(mean);
                        vars.push(var);
                    }
                }
                let w = vars.iter().sum::<f64>() / n_chains as f64;
                let overall = means.iter().sum::<f64>() / n_chains as f64;
                let b = n_split as f64 * means.iter().map(|&m| (m - overall).powi(2)).sum::<f64>()
                    / (n_chains - 1) as f64;
                let var_plus = ((n_split - 1) as f64 * w + b) / n_split as f64;
                (var_plus / w).sqrt()
            })
            .collect();
        Some(r_hat)
    }
}

pub struct EnsembleSampler<'a, P: LogDensity> {
    target: &'a P,
    config: SamplerConfig,
}

impl<'a, P: LogDensity> EnsembleSampler<'a, P> {
    pub fn new(target: &'a P, config: SamplerConfig) -> Self {
        Self { target, config }
    }

    /// Places every walker in a Gaussian ball around `center` (radius
    /// `init_spread` times each range), redrawing any walker whose log density
    /// is not finite.
    pub fn initialize(
        &self,
        center: ArrayView1<f64>,
        lower: ArrayView1<f64>,
        upper: ArrayView1<f64>,
        rng: &mut StdRng,
    ) -> Result<EnsembleState, SamplerError> {
        let dim = lower.len();
        for found in [center.len(), upper.len()] {
            if found != dim {
                return Err(SamplerError::DimensionMismatch {
                    expected: dim,
                    found,
                });
            }
        }
        let width = &upper - &lower;
        let n = self.config.nwalkers;
        let mut positions = Array2::<f64>::zeros((n, dim));
        let mut log_probs = Array1::<f64>::zeros(n);
        let mut resampled = 0usize;

        for walker in 0..n {
            let mut placed = false;
            for attempt in 0..self.config.max_init_attempts {
                let x: Array1<f64> = (0..dim)
                    .map(|i| {
                        let g: f64 = StandardNormal.sample(rng);
                        center[i] + self.config.init_spread * width[i] * g
                    })
                    .collect();
                let lp = self.target.log_density(x.view());
                if lp.is_finite() {
                    positions.row_mut(walker).assign(&x);
                    log_probs[walker] = lp;
                    resampled += attempt;
                    placed = true;
                    break;
                }
            }
            if !placed {
                return Err(SamplerError::InitializationFailed {
                    walker,
                    attempts: self.config.max_init_attempts,
                });
            }
        }
        if resampled > 0 {
            log::debug!("Redrew {resampled} initial walker positions with non-finite log density");
        }
        Ok(EnsembleState {
            positions,
            log_probs,
        })
    }

    /// One stretch-move update of the walkers in `active`, using `complement`
    /// as the reference ensemble. Returns which active walkers moved.
    fn update_half(
        &self,
        state: &mut EnsembleState,
        active: Range<usize>,
        complement: Range<usize>,
        rng: &mut StdRng,
    ) -> Vec<bool> {
        let dim = state.positions.ncols();
        let a = self.config.stretch_scale;
        let others: ArrayView2<f64> = state.positions.slice(s![complement.clone(), ..]);

        let draws: Vec<(usize, f64, f64)> = active
            .clone()
            .map(|_| {
                let partner = rng.gen_range(0..others.nrows());
                let z = sample_stretch(a, rng);
                let u: f64 = rng.r#gen();
                (partner, z, u.ln())
            })
            .collect();

        let proposals: Vec<Array1<f64>> = active
            .clone()
            .zip(&draws)
            .map(|(k, &(partner, z, _))| {
                let xj = others.row(partner);
                let xk = state.positions.row(k);
                &xj + &((&xk - &xj) * z)
            })
            .collect();

        let proposal_log_probs: Vec<f64> = proposals
            .par_iter()
            .map(|p| self.target.log_density(p.view()))
            .collect();

        let mut accepted = Vec::with_capacity(proposals.len());
        for (((k, proposal), &(_, z, ln_u)), lp_new) in active
            .zip(proposals.iter())
            .zip(&draws)
            .zip(proposal_log_probs)
        {
            let ok = ln_u < log_acceptance(z, dim, state.log_probs[k], lp_new);
            if ok {
                state.positions.row_mut(k).assign(proposal);
                state.log_probs[k] = lp_new;
            }
            accepted.push(ok);
        }
        accepted
    }

    /// Initialises the ensemble around `center` and advances it `nsteps`
    /// steps, keeping every step after the first `nburnsteps`.
    pub fn run(
        &self,
        center: ArrayView1<f64>,
        lower: ArrayView1<f64>,
        upper: ArrayView1<f64>,
    ) -> Result<Chain, SamplerError> {
        let dim = lower.len();
        self.config.validate(dim)?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut state = self.initialize(center, lower, upper, &mut rng)?;

        let n = self.config.nwalkers;
        let keep = self.config.nsteps - self.config.nburnsteps;
        let mut samples = Array3::<f64>::zeros((keep, n, dim));
        let mut log_probs = Array2::<f64>::zeros((keep, n));
        let mut n_accepted = Array1::<f64>::zeros(n);

        let half = n / 2;
        let pb = create_progress_bar(self.config.nsteps as u64, "MCMC", self.config.show_progress);
        for step in 0..self.config.nsteps {
            for (active, complement) in [(0..half, half..n), (half..n, 0..half)] {
                let offset = active.start;
                for (i, ok) in self
                    .update_half(&mut state, active, complement, &mut rng)
                    .into_iter()
                    .enumerate()
                {
                    if ok {
                        n_accepted[offset + i] += 1.0;
                    }
                }
            }
            if step >= self.config.nburnsteps {
                let row = step - self.config.nburnsteps;
                samples.slice_mut(s![row, .., ..]).assign(&state.positions);
                log_probs.row_mut(row).assign(&state.log_probs);
            }
            if step == self.config.nburnsteps.saturating_sub(1) {
                log::info!("Burn-in complete after {} steps", self.config.nburnsteps);
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        let acceptance_fraction = if self.config.nsteps > 0 {
            n_accepted / self.config.nsteps as f64
        } else {
            n_accepted
        };
        log::info!(
            "MCMC finished: {} walkers x {} kept steps, mean acceptance {:.3}",
            n,
            keep,
            acceptance_fraction.mean().unwrap_or(0.0)
        );
        Ok(Chain {
            samples,
            log_probs,
            acceptance_fraction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Independent normals, truncated to a box.
    struct BoxedGaussian {
        mean: Array1<f64>,
        sd: Array1<f64>,
        lower: Array1<f64>,
        upper: Array1<f64>,
    }

    impl LogDensity for BoxedGaussian {
        fn log_density(&self, x: ArrayView1<f64>) -> f64 {
            let inside = x
                .iter()
                .zip(self.lower.iter().zip(&self.upper))
                .all(|(v, (lo, hi))| v >= lo && v <= hi);
            if !inside {
                return f64::NEG_INFINITY;
            }
            x.iter()
                .zip(&self.mean)
                .zip(&self.sd)
                .map(|((v, m), s)| -0.5 * ((v - m) / s).powi(2))
                .sum()
        }
    }

    fn target() -> BoxedGaussian {
        BoxedGaussian {
            mean: array![1.0, -2.0],
            sd: array![0.5, 0.2],
            lower: array![-5.0, -5.0],
            upper: array![5.0, 5.0],
        }
    }

    fn config() -> SamplerConfig {
        SamplerConfig {
            nwalkers: 16,
            nsteps: 600,
            nburnsteps: 200,
            seed: 5,
            show_progress: false,
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn recovers_gaussian_moments() {
        let t = target();
        let chain = EnsembleSampler::new(&t, config())
            .run(array![0.0, 0.0].view(), t.lower.view(), t.upper.view())
            .unwrap();
        let flat = chain.flat();
        assert_eq!(flat.nrows(), 16 * 400);
        let mean = flat.mean_axis(Axis(0)).unwrap();
        let sd = flat.std_axis(Axis(0), 1.0);
        assert_abs_diff_eq!(mean[0], 1.0, epsilon = 0.1);
        assert_abs_diff_eq!(mean[1], -2.0, epsilon = 0.05);
        assert_abs_diff_eq!(sd[0], 0.5, epsilon = 0.1);
        assert_abs_diff_eq!(sd[1], 0.2, epsilon = 0.05);
        let acc = chain.mean_acceptance();
        assert!(acc > 0.2 && acc < 0.9, "acceptance {acc}");
        for r in chain.r_hat().unwrap() {
            assert!(r < 1.2, "r_hat {r}");
        }
    }

    #[test]
    fn chain_length_is_walkers_times_kept_steps() {
        let t = target();
        for (nsteps, nburn) in [(10, 0), (10, 7), (5, 5)] {
            let cfg = SamplerConfig {
                nsteps,
                nburnsteps: nburn,
                ..config()
            };
            let chain = EnsembleSampler::new(&t, cfg)
                .run(array![0.0, 0.0].view(), t.lower.view(), t.upper.view())
                .unwrap();
            assert_eq!(chain.flat().nrows(), 16 * (nsteps - nburn));
            assert_eq!(chain.flat_log_probs().len(), 16 * (nsteps - nburn));
        }
    }

    #[test]
    fn same_seed_reproduces_chain() {
        let t = target();
        let cfg = SamplerConfig {
            nsteps: 50,
            nburnsteps: 10,
            ..config()
        };
        let run = || {
            EnsembleSampler::new(&t, cfg.clone())
                .run(array![0.5, 0.5].view(), t.lower.view(), t.upper.view())
                .unwrap()
        };
        assert_eq!(run().flat(), run().flat());
    }

    #[test]
    fn samples_stay_inside_support() {
        let t = BoxedGaussian {
            mean: array![0.0, 0.0],
            sd: array![10.0, 10.0],
            lower: array![-1.0, 0.0],
            upper: array![1.0, 0.5],
        };
        let chain = EnsembleSampler::new(&t, config())
            .run(array![0.9, 0.45].view(), t.lower.view(), t.upper.view())
            .unwrap();
        for row in chain.flat().rows() {
            assert!(row[0] >= -1.0 && row[0] <= 1.0);
            assert!(row[1] >= 0.0 && row[1] <= 0.5);
        }
        assert!(chain.flat_log_probs().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn initial_walkers_outside_support_are_redrawn() {
        // A center on the boundary puts about half of the first draws outside.
        let t = target();
        let sampler = EnsembleSampler::new(&t, config());
        let mut rng = StdRng::seed_from_u64(0);
        let state = sampler
            .initialize(
                array![5.0, 5.0].view(),
                t.lower.view(),
                t.upper.view(),
                &mut rng,
            )
            .unwrap();
        assert!(state.log_probs.iter().all(|v| v.is_finite()));
        for i in 1..state.positions.nrows() {
            assert_ne!(state.positions.row(i), state.positions.row(0));
        }
    }

    #[test]
    fn rejects_invalid_configurations() {
        let t = target();
        let lo = t.lower.view();
        let hi = t.upper.view();
        let c = array![0.0, 0.0];
        let run = |cfg: SamplerConfig| EnsembleSampler::new(&t, cfg).run(c.view(), lo, hi);
        assert!(matches!(
            run(SamplerConfig { nwalkers: 3, ..config() }),
            Err(SamplerError::TooFewWalkers { min: 4, .. })
        ));
        assert!(matches!(
            run(SamplerConfig { nsteps: 5, nburnsteps: 6, ..config() }),
            Err(SamplerError::BurnInExceedsSteps { .. })
        ));
        assert!(matches!(
            run(SamplerConfig { stretch_scale: 1.0, ..config() }),
            Err(SamplerError::InvalidStretchScale(_))
        ));
    }

    /// Zero density everywhere.
    struct Nowhere;

    impl LogDensity for Nowhere {
        fn log_density(&self, _: ArrayView1<f64>) -> f64 {
            f64::NEG_INFINITY
        }
    }

    #[test]
    fn unplaceable_walkers_fail_initialisation() {
        let lo = array![0.0, 0.0];
        let hi = array![1.0, 1.0];
        let cfg = SamplerConfig {
            max_init_attempts: 7,
            ..config()
        };
        let result =
            EnsembleSampler::new(&Nowhere, cfg).run(array![0.5, 0.5].view(), lo.view(), hi.view());
        assert!(matches!(
            result,
            Err(SamplerError::InitializationFailed { walker: 0, attempts: 7 })
        ));
    }

    #[test]
    fn stretch_factor_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            let z = sample_stretch(2.0, &mut rng);
            assert!((0.5..=2.0).contains(&z));
        }
        assert_eq!(log_acceptance(1.0, 3, -1.0, f64::NAN), f64::NEG_INFINITY);
    }
}
