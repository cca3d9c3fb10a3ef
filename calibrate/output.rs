//! Compressed posterior archive.
//!
//! A gzip-compressed JSON document with named datasets: `parameters`,
//! `chain` (flattened samples), `log_prob`, `acceptance_fraction`, and an
//! `observables` group tree mirroring the observable key paths, each leaf
//! holding posterior-predictive samples in physical units.

use crate::calibration::PosteriorChain;
use crate::observables::ObservableTree;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to read or write posterior archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode or decode posterior archive: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorArchive {
    pub parameters: Vec<String>,
    pub chain: Array2<f64>,
    pub log_prob: Array1<f64>,
    pub acceptance_fraction: Array1<f64>,
    pub observables: ObservableTree<Array2<f64>>,
}

impl PosteriorArchive {
    pub fn new(posterior: &PosteriorChain, observables: ObservableTree<Array2<f64>>) -> Self {
        Self {
            parameters: posterior.parameter_names().to_vec(),
            chain: posterior.samples(),
            log_prob: posterior.log_probs(),
            acceptance_fraction: posterior.chain().acceptance_fraction().clone(),
            observables,
        }
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), OutputError> {
        let file = BufWriter::new(File::create(path)?);
        let mut encoder = GzEncoder::new(file, Compression::default());
        serde_json::to_writer(&mut encoder, self)?;
        encoder.finish()?.flush()?;
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, OutputError> {
        let decoder = GzDecoder::new(BufReader::new(File::open(path)?));
        Ok(serde_json::from_reader(decoder)?)
    }
}
