//! Run configuration, read from a TOML file.
//!
//! Relative input paths are resolved against the directory holding the
//! configuration file. Every section except `inputs`, `parameters` and
//! `observables` is optional and falls back to its defaults.

use crate::calibration::{CalibrationConfig, ErrorModel, ParameterPrior};
use crate::design::{DesignError, Parameter, ParameterSpace};
use crate::emulator::EmulatorConfig;
use crate::gp::TrainingOptions;
use crate::observables::{ObservableEntry, ObservableError, ObservableSpec};
use crate::sampler::SamplerConfig;
use crate::seeding::{HyperBounds, HyperPrior};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid parameter declaration: {0}")]
    Design(#[from] DesignError),

    #[error("Invalid observable list: {0}")]
    Observable(#[from] ObservableError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputPaths {
    pub design: PathBuf,
    pub model: PathBuf,
    pub experiment: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmulatorSection {
    pub npc: usize,
    pub nstarts: usize,
    pub seed: u64,
    /// Divide every feature by the experimental target before PCA.
    pub normalize: bool,
    pub truncation_variance: bool,
    pub max_iterations: usize,
    pub bounds: HyperBounds,
    pub prior: HyperPrior,
}

impl Default for EmulatorSection {
    fn default() -> Self {
        let training = TrainingOptions::default();
        let emulator = EmulatorConfig::default();
        Self {
            npc: emulator.npc,
            nstarts: training.nstarts,
            seed: training.seed,
            normalize: true,
            truncation_variance: emulator.truncation_variance,
            max_iterations: training.max_iterations,
            bounds: training.bounds,
            prior: training.prior,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct McmcSection {
    pub nwalkers: usize,
    pub nsteps: usize,
    pub nburnsteps: usize,
    pub seed: u64,
    pub stretch_scale: f64,
    pub init_spread: f64,
    /// Fractional observational error; ignored when `experimental_errors` is set.
    pub yerr: f64,
    pub experimental_errors: bool,
    /// Chain samples used for the posterior-predictive observables; 0 keeps all.
    pub predictive_samples: usize,
    pub prior: ParameterPrior,
}

impl Default for McmcSection {
    fn default() -> Self {
        let sampler = SamplerConfig::default();
        Self {
            nwalkers: sampler.nwalkers,
            nsteps: sampler.nsteps,
            nburnsteps: sampler.nburnsteps,
            seed: sampler.seed,
            stretch_scale: sampler.stretch_scale,
            init_spread: sampler.init_spread,
            yerr: 0.1,
            experimental_errors: false,
            predictive_samples: 1000,
            prior: ParameterPrior::Flat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub inputs: InputPaths,
    pub parameters: Vec<Parameter>,
    pub observables: Vec<ObservableEntry>,
    #[serde(default)]
    pub emulator: EmulatorSection,
    #[serde(default)]
    pub mcmc: McmcSection,
}

impl RunConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(dir) = path.parent() {
            config.inputs.resolve_against(dir);
        }
        Ok(config)
    }

    pub fn parameter_space(&self) -> Result<ParameterSpace, ConfigError> {
        Ok(ParameterSpace::new(self.parameters.clone())?)
    }

    pub fn observable_spec(&self) -> Result<ObservableSpec, ConfigError> {
        Ok(ObservableSpec::new(self.observables.clone())?)
    }

    pub fn emulator_config(&self) -> EmulatorConfig {
        let e = &self.emulator;
        EmulatorConfig {
            npc: e.npc,
            truncation_variance: e.truncation_variance,
            training: TrainingOptions {
                prior: e.prior,
                bounds: e.bounds,
                nstarts: e.nstarts,
                seed: e.seed,
                max_iterations: e.max_iterations,
                ..TrainingOptions::default()
            },
        }
    }

    pub fn calibration_config(&self) -> CalibrationConfig {
        let m = &self.mcmc;
        CalibrationConfig {
            error_model: if m.experimental_errors {
                ErrorModel::Experimental
            } else {
                ErrorModel::Fractional { yerr: m.yerr }
            },
            prior: m.prior.clone(),
            sampler: SamplerConfig {
                nwalkers: m.nwalkers,
                nsteps: m.nsteps,
                nburnsteps: m.nburnsteps,
                seed: m.seed,
                stretch_scale: m.stretch_scale,
                init_spread: m.init_spread,
                ..SamplerConfig::default()
            },
        }
    }

    /// `None` means every chain sample is reconstructed.
    pub fn predictive_samples(&self) -> Option<usize> {
        (self.mcmc.predictive_samples > 0).then_some(self.mcmc.predictive_samples)
    }
}

impl InputPaths {
    fn resolve_against(&mut self, dir: &Path) {
        for p in [&mut self.design, &mut self.model, &mut self.experiment] {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        }
    }
}
