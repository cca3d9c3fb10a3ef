//! Per-run ownership of loaded inputs.
//!
//! A [`CalibrationContext`] is built once from a [`RunConfig`], holds every
//! loaded and assembled input for the lifetime of one run, and is passed
//! explicitly to training and calibration. All shape checks between the
//! design, the simulated observables and the experimental data happen here,
//! before any expensive work starts.

use crate::calibration::{self, CalibrationError, PosteriorChain};
use crate::config::{ConfigError, RunConfig};
use crate::data::{self, DataError};
use crate::design::{DesignTable, ParameterSpace};
use crate::emulator::{EmulatorError, MultiGpEmulator};
use crate::observables::{
    ExperimentalData, ExperimentalTarget, FeatureScale, ObservableError, ObservableSpec,
    ObservableTree, TrainingMatrix,
};
use crate::output::PosteriorArchive;
use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Data(#[from] DataError),

    #[error("{0}")]
    Observable(#[from] ObservableError),

    #[error("{0}")]
    Emulator(#[from] EmulatorError),

    #[error("{0}")]
    Calibration(#[from] CalibrationError),

    #[error("The loaded emulator does not match this run: {0}")]
    EmulatorMismatch(String),
}

pub struct CalibrationContext {
    config: RunConfig,
    space: ParameterSpace,
    spec: ObservableSpec,
    design: DesignTable,
    model: Array2<f64>,
    target: ExperimentalTarget,
}

impl CalibrationContext {
    /// Loads all inputs named by `config` and assembles them with its
    /// observable spec.
    pub fn load(config: RunConfig) -> Result<Self, ContextError> {
        let space = config.parameter_space()?;
        let design = data::load_design(&config.inputs.design, &space)?;
        let model_tree = data::load_model_observables(&config.inputs.model)?;
        let experiment = data::load_experiment(&config.inputs.experiment)?;
        Self::from_parts(config, design, &model_tree, &experiment)
    }

    /// Assembles already-loaded inputs.
    pub fn from_parts(
        config: RunConfig,
        design: DesignTable,
        model_tree: &ObservableTree<Array2<f64>>,
        experiment: &ObservableTree<ExperimentalData>,
    ) -> Result<Self, ContextError> {
        let space = config.parameter_space()?;
        let spec = config.observable_spec()?;
        let model = spec.assemble(model_tree)?;
        if model.nrows() != design.n_points() {
            return Err(EmulatorError::DesignMismatch {
                design_rows: design.n_points(),
                training_rows: model.nrows(),
            }
            .into());
        }
        let target = spec.assemble_target(experiment)?;
        log::info!(
            "Assembled {} observables into {} features for {} design points",
            spec.entries().len(),
            spec.total_len(),
            design.n_points()
        );
        Ok(Self {
            config,
            space,
            spec,
            design,
            model,
            target,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn spec(&self) -> &ObservableSpec {
        &self.spec
    }

    pub fn design(&self) -> &DesignTable {
        &self.design
    }

    pub fn target(&self) -> &ExperimentalTarget {
        &self.target
    }

    /// The model matrix, divided by the experimental target when the
    /// configuration asks for normalisation.
    pub fn training_matrix(&self) -> Result<TrainingMatrix, ContextError> {
        let scale = if self.config.emulator.normalize {
            FeatureScale::from_divisor(self.target.values.clone())?
        } else {
            FeatureScale::identity()
        };
        Ok(TrainingMatrix::new(self.model.view(), scale)?)
    }

    pub fn train_emulator(&self) -> Result<MultiGpEmulator, ContextError> {
        let training = self.training_matrix()?;
        Ok(MultiGpEmulator::train(
            &training,
            &self.design,
            &self.config.emulator_config(),
        )?)
    }

    /// Rejects an emulator trained for a different parameter space or feature layout.
    pub fn check_emulator(&self, emulator: &MultiGpEmulator) -> Result<(), ContextError> {
        if emulator.space() != &self.space {
            return Err(ContextError::EmulatorMismatch(format!(
                "parameters {:?} vs configured {:?}",
                emulator.space().names(),
                self.space.names()
            )));
        }
        if emulator.n_features() != self.spec.total_len() {
            return Err(ContextError::EmulatorMismatch(format!(
                "{} features vs {} from the observable list",
                emulator.n_features(),
                self.spec.total_len()
            )));
        }
        Ok(())
    }

    pub fn calibrate(&self, emulator: &MultiGpEmulator) -> Result<PosteriorChain, ContextError> {
        self.check_emulator(emulator)?;
        Ok(calibration::calibrate(
            emulator,
            &self.target,
            &self.config.calibration_config(),
        )?)
    }

    /// Packs the chain and its posterior-predictive observables for storage.
    pub fn archive(
        &self,
        emulator: &MultiGpEmulator,
        posterior: &PosteriorChain,
    ) -> Result<PosteriorArchive, ContextError> {
        let observables =
            posterior.predictive(emulator, &self.spec, self.config.predictive_samples())?;
        Ok(PosteriorArchive::new(posterior, observables))
    }
}
