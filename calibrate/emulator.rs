//! # Multi-Output Emulator
//!
//! One independent Gaussian process per retained principal component. Inputs
//! are mapped to the unit cube using the parameter ranges; outputs live in the
//! scaled feature space of the [`TrainingMatrix`] (divided by the normalisation
//! divisor, when one was used). Feature-space covariance is `V_k diag(var) V_kᵀ`,
//! so correlations between features come from the PCA rotation only.

use crate::design::{DesignTable, ParameterSpace};
use crate::gp::{FittedGaussianProcess, GaussianProcess, GpError, GpState, TrainingOptions};
use crate::observables::{FeatureScale, ObservableError, TrainingMatrix};
use crate::pca::{PcaBasis, PcaError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("The design has {design_rows} points but the training matrix has {training_rows} rows.")]
    DesignMismatch {
        design_rows: usize,
        training_rows: usize,
    },

    #[error("At least one principal component must be retained.")]
    ZeroComponents,

    #[error("PCA failed: {0}")]
    Pca(#[from] PcaError),

    #[error("Training the GP for principal component {component} failed: {source}")]
    ComponentTrainingFailed {
        component: usize,
        #[source]
        source: GpError,
    },

    #[error("GP prediction failed: {0}")]
    Gp(#[from] GpError),

    #[error("Query point has {found} parameters, but the emulator expects {expected}.")]
    QueryDimension { expected: usize, found: usize },

    #[error("Feature scaling failed: {0}")]
    Observable(#[from] ObservableError),

    #[error("Failed to read or write emulator file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML emulator file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize emulator to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("Saved emulator is inconsistent: {0}")]
    CorruptState(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmulatorConfig {
    /// Number of principal components (and GPs) to retain.
    pub npc: usize,
    /// Add the variance of the discarded components to every prediction.
    pub truncation_variance: bool,
    pub training: TrainingOptions,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            npc: 5,
            truncation_variance: false,
            training: TrainingOptions::default(),
        }
    }
}

/// Emulator output at one parameter point, in scaled feature units.
#[derive(Debug, Clone)]
pub struct EmulatorPrediction {
    pub mean: Array1<f64>,
    pub cov: Array2<f64>,
}

pub struct MultiGpEmulator {
    space: ParameterSpace,
    scale: FeatureScale,
    pca: PcaBasis,
    npc: usize,
    gps: Vec<FittedGaussianProcess>,
    truncation_cov: Option<Array2<f64>>,
}

#[derive(Serialize, Deserialize)]
struct EmulatorState {
    npc: usize,
    truncation_variance: bool,
    space: ParameterSpace,
    scale: FeatureScale,
    pca: PcaBasis,
    gps: Vec<GpState>,
}

impl MultiGpEmulator {
    /// Fits PCA on the training matrix, keeps `config.npc` components, and
    /// trains one GP per component on the unit-scaled design.
    pub fn train(
        training: &TrainingMatrix,
        design: &DesignTable,
        config: &EmulatorConfig,
    ) -> Result<Self, EmulatorError> {
        if design.n_points() != training.n_rows() {
            return Err(EmulatorError::DesignMismatch {
                design_rows: design.n_points(),
                training_rows: training.n_rows(),
            });
        }
        if config.npc == 0 {
            return Err(EmulatorError::ZeroComponents);
        }

        let pca = PcaBasis::fit(training.values())?;
        let z = pca.project(training.values(), config.npc)?;
        let weights = pca.weights();
        log::info!(
            "PCA: {} features, {} components retained, explaining {:.4} of the variance",
            pca.n_features(),
            config.npc,
            weights.iter().take(config.npc).sum::<f64>()
        );

        let x_unit = design.space().to_unit_rows(design.points());
        let gps = (0..config.npc)
            .into_par_iter()
            .map(|component| {
                let options = TrainingOptions {
                    seed: config.training.seed.wrapping_add(component as u64),
                    ..config.training.clone()
                };
                GaussianProcess::new(x_unit.clone(), z.column(component).to_owned())
                    .and_then(|gp| gp.train(&options))
                    .map_err(|source| EmulatorError::ComponentTrainingFailed { component, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (component, gp) in gps.iter().enumerate() {
            log::info!(
                "GP {component}: log L = {:.4}, {:?}",
                gp.log_marginal_likelihood(),
                gp.params()
            );
        }

        let truncation_cov = if config.truncation_variance {
            Some(pca.truncation_covariance(config.npc)?)
        } else {
            None
        };

        Ok(Self {
            space: design.space().clone(),
            scale: training.scale().clone(),
            pca,
            npc: config.npc,
            gps,
            truncation_cov,
        })
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn scale(&self) -> &FeatureScale {
        &self.scale
    }

    pub fn pca(&self) -> &PcaBasis {
        &self.pca
    }

    pub fn npc(&self) -> usize {
        self.npc
    }

    pub fn n_features(&self) -> usize {
        self.pca.n_features()
    }

    pub fn components(&self) -> &[FittedGaussianProcess] {
        &self.gps
    }

    fn unit_query(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, EmulatorError> {
        if x.len() != self.space.dim() {
            return Err(EmulatorError::QueryDimension {
                expected: self.space.dim(),
                found: x.len(),
            });
        }
        Ok(self.space.to_unit(x))
    }

    /// Mean and covariance in scaled feature space at a physical parameter point.
    pub fn predict(&self, x: ArrayView1<f64>) -> Result<EmulatorPrediction, EmulatorError> {
        let u = self.unit_query(x)?;
        let mut z_mean = Array1::<f64>::zeros(self.npc);
        let mut z_var = Array1::<f64>::zeros(self.npc);
        for (c, gp) in self.gps.iter().enumerate() {
            let p = gp.predict(u.view())?;
            z_mean[c] = p.mean;
            z_var[c] = p.variance;
        }

        let mean = self.pca.inverse_vector(z_mean.view(), self.npc)?;
        let basis = self.pca.leading_components(self.npc)?;
        let scaled = &basis * &z_var.view().insert_axis(Axis(0));
        let mut cov = scaled.dot(&basis.t());
        if let Some(extra) = &self.truncation_cov {
            cov += extra;
        }
        Ok(EmulatorPrediction { mean, cov })
    }

    /// Predicted means for many physical points, rows in scaled feature units.
    pub fn predict_mean_rows(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, EmulatorError> {
        let rows: Vec<Array1<f64>> = x
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| -> Result<Array1<f64>, EmulatorError> {
                let u = self.unit_query(row)?;
                let mut z = Array1::<f64>::zeros(self.npc);
                for (c, gp) in self.gps.iter().enumerate() {
                    z[c] = gp.predict(u.view())?.mean;
                }
                Ok(self.pca.inverse_vector(z.view(), self.npc)?)
            })
            .collect::<Result<_, _>>()?;

        let mut out = Array2::<f64>::zeros((rows.len(), self.n_features()));
        for (i, r) in rows.iter().enumerate() {
            out.row_mut(i).assign(r);
        }
        Ok(out)
    }

    /// Predicted means for many physical points, restored to physical units.
    pub fn predict_physical_rows(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, EmulatorError> {
        let scaled = self.predict_mean_rows(x)?;
        Ok(self.scale.restore_rows(scaled.view())?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), EmulatorError> {
        let state = EmulatorState {
            npc: self.npc,
            truncation_variance: self.truncation_cov.is_some(),
            space: self.space.clone(),
            scale: self.scale.clone(),
            pca: self.pca.clone(),
            gps: self.gps.iter().map(FittedGaussianProcess::to_state).collect(),
        };
        let toml_string = toml::to_string_pretty(&state)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a saved emulator and re-conditions every GP on its stored data.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EmulatorError> {
        let toml_string = fs::read_to_string(path)?;
        let state: EmulatorState = toml::from_str(&toml_string)?;
        if state.gps.len() != state.npc {
            return Err(EmulatorError::CorruptState(format!(
                "{} GPs stored for {} components",
                state.gps.len(),
                state.npc
            )));
        }
        if let Some(bad) = state.gps.iter().position(|g| g.x.ncols() != state.space.dim()) {
            return Err(EmulatorError::CorruptState(format!(
                "GP {bad} was trained on a different number of parameters"
            )));
        }
        let truncation_cov = if state.truncation_variance {
            Some(state.pca.truncation_covariance(state.npc)?)
        } else {
            None
        };
        let gps = state
            .gps
            .into_iter()
            .map(FittedGaussianProcess::from_state)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            space: state.space,
            scale: state.scale,
            pca: state.pca,
            npc: state.npc,
            gps,
            truncation_cov,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::Parameter;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::NamedTempFile;

    /// Three smooth features of two parameters on [0, 2] x [-1, 1].
    fn model(p: ArrayView1<f64>) -> Array1<f64> {
        array![1.0 + p[0] + 0.5 * p[1], 2.0 - p[1], 0.5 * p[0] * p[0] + 1.0]
    }

    fn setup(n: usize) -> (DesignTable, TrainingMatrix) {
        let space = ParameterSpace::new(vec![
            Parameter::new("a", 0.0, 2.0),
            Parameter::new("b", -1.0, 1.0),
        ])
        .unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let points = Array2::from_shape_fn((n, 2), |(_, j)| {
            if j == 0 {
                rng.gen_range(0.0..2.0)
            } else {
                rng.gen_range(-1.0..1.0)
            }
        });
        let mut y = Array2::zeros((n, 3));
        for (i, row) in points.rows().into_iter().enumerate() {
            y.row_mut(i).assign(&model(row));
        }
        let design = DesignTable::new(space, points).unwrap();
        let training = TrainingMatrix::new(y.view(), FeatureScale::identity()).unwrap();
        (design, training)
    }

    fn config(npc: usize) -> EmulatorConfig {
        EmulatorConfig {
            npc,
            training: TrainingOptions {
                nstarts: 3,
                ..TrainingOptions::default()
            },
            ..EmulatorConfig::default()
        }
    }

    #[test]
    fn reproduces_the_model_between_design_points() {
        let (design, training) = setup(30);
        let emu = MultiGpEmulator::train(&training, &design, &config(3)).unwrap();
        let q = array![1.1, 0.2];
        let pred = emu.predict(q.view()).unwrap();
        let truth = model(q.view());
        for (a, b) in pred.mean.iter().zip(truth.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 5e-2);
        }
        assert_eq!(pred.cov.dim(), (3, 3));
        for i in 0..3 {
            assert!(pred.cov[[i, i]] >= 0.0);
            for j in 0..3 {
                assert_abs_diff_eq!(pred.cov[[i, j]], pred.cov[[j, i]], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn rejects_too_many_components() {
        let (design, training) = setup(10);
        let err = MultiGpEmulator::train(&training, &design, &config(4)).err().unwrap();
        assert!(matches!(
            err,
            EmulatorError::Pca(PcaError::RankExceedsComponents { requested: 4, available: 3 })
        ));
    }

    #[test]
    fn rejects_design_training_mismatch() {
        let (design, _) = setup(10);
        let (_, training) = setup(12);
        assert!(matches!(
            MultiGpEmulator::train(&training, &design, &config(2)),
            Err(EmulatorError::DesignMismatch { design_rows: 10, training_rows: 12 })
        ));
    }

    #[test]
    fn truncation_variance_inflates_the_diagonal() {
        let (design, training) = setup(20);
        let plain = MultiGpEmulator::train(&training, &design, &config(1)).unwrap();
        let with_trunc = MultiGpEmulator::train(
            &training,
            &design,
            &EmulatorConfig {
                truncation_variance: true,
                ..config(1)
            },
        )
        .unwrap();
        let q = array![0.5, -0.5];
        let a = plain.predict(q.view()).unwrap().cov;
        let b = with_trunc.predict(q.view()).unwrap().cov;
        assert!(b.diag().sum() > a.diag().sum());
    }

    #[test]
    fn save_and_load_preserve_predictions() {
        let (design, training) = setup(15);
        let emu = MultiGpEmulator::train(&training, &design, &config(2)).unwrap();
        let file = NamedTempFile::new().unwrap();
        emu.save(file.path()).unwrap();
        let loaded = MultiGpEmulator::load(file.path()).unwrap();
        let q = array![1.5, 0.0];
        let a = emu.predict(q.view()).unwrap();
        let b = loaded.predict(q.view()).unwrap();
        for (x, y) in a.mean.iter().zip(b.mean.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-8);
        }
        for (x, y) in a.cov.iter().zip(b.cov.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-8);
        }
        assert_eq!(loaded.space().names(), vec!["a", "b"]);
    }

    #[test]
    fn batch_means_match_single_predictions() {
        let (design, training) = setup(15);
        let emu = MultiGpEmulator::train(&training, &design, &config(2)).unwrap();
        let q = array![[0.2, 0.1], [1.8, -0.9]];
        let batch = emu.predict_mean_rows(q.view()).unwrap();
        for i in 0..2 {
            let single = emu.predict(q.row(i)).unwrap();
            for (a, b) in batch.row(i).iter().zip(single.mean.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-12);
            }
        }
        assert!(matches!(
            emu.predict(array![1.0].view()),
            Err(EmulatorError::QueryDimension { expected: 2, found: 1 })
        ));
    }

    #[test]
    fn failed_component_training_names_the_component() {
        let (design, training) = setup(12);
        let mut cfg = config(1);
        cfg.training.max_iterations = 1;
        cfg.training.tolerance = 1e-12;
        let err = MultiGpEmulator::train(&training, &design, &cfg).err().unwrap();
        match err {
            EmulatorError::ComponentTrainingFailed {
                component,
                source: GpError::OptimizationFailed { restarts, .. },
            } => {
                assert_eq!(component, 0);
                assert_eq!(restarts, 3);
            }
            other => panic!("expected ComponentTrainingFailed, got {other:?}"),
        }
    }

    #[test]
    fn load_rejects_a_degenerate_parameter_range() {
        let (design, training) = setup(15);
        let emu = MultiGpEmulator::train(&training, &design, &config(1)).unwrap();
        let file = NamedTempFile::new().unwrap();
        emu.save(file.path()).unwrap();

        let saved = fs::read_to_string(file.path()).unwrap();
        assert!(saved.contains("max = 2.0"));
        fs::write(file.path(), saved.replacen("max = 2.0", "max = 0.0", 1)).unwrap();
        let err = MultiGpEmulator::load(file.path()).err().unwrap();
        assert!(matches!(err, EmulatorError::TomlParseError(_)));
        assert!(err.to_string().contains("invalid range"), "{err}");
    }
}
