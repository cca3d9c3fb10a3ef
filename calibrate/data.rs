//! # Input Loading
//!
//! Reads the three run inputs and hands them over as validated in-memory
//! structures: the design table (TSV, one named column per parameter), the
//! simulated observables (JSON tree of N x bins row arrays) and the
//! experimental data (JSON tree of `{x, y, yerr}` leaves). Failures here are
//! assumed to be user-input errors and carry enough context to fix the file.

use crate::design::{DesignError, DesignTable, ParameterSpace};
use crate::observables::{ExperimentalData, ObservableError, ObservableTree, display_path};
use ndarray::Array2;
use polars::prelude::*;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON input: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Column '{column_name}' contains missing values. Every design cell must be filled.")]
    MissingValuesFound { column_name: String },

    #[error("Column '{column_name}' must be numeric, but has type {found_type}.")]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },

    #[error("Column '{0}' contains NaN or infinite values.")]
    NonFiniteValuesFound(String),

    #[error("Observable '{path}': row {row} has {found} values, but row 0 has {expected}.")]
    RaggedRows {
        path: String,
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("Observable '{0}' has no rows.")]
    EmptyObservable(String),

    #[error("Invalid design: {0}")]
    Design(#[from] DesignError),

    #[error("{0}")]
    Observable(#[from] ObservableError),
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound {
            column_name: column_name.to_string(),
        });
    }

    let wrong_type = || DataError::ColumnWrongType {
        column_name: column_name.to_string(),
        found_type: format!("{:?}", series.dtype()),
    };
    let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    if casted.null_count() > 0 {
        return Err(wrong_type());
    }

    let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

/// Reads a tab-separated design whose header lists the parameters of `space`
/// in order. Every value must be numeric, finite and inside its range.
pub fn load_design(path: impl AsRef<Path>, space: &ParameterSpace) -> Result<DesignTable, DataError> {
    let path = path.as_ref();
    log::info!("Loading design from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;

    let labels: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    let mut points = Array2::<f64>::zeros((df.height(), labels.len()));
    for (j, name) in labels.iter().enumerate() {
        let values = extract_numeric_column(&df, name)?;
        for (i, v) in values.into_iter().enumerate() {
            points[[i, j]] = v;
        }
    }

    let design = DesignTable::with_labels(space.clone(), &labels, points)?;
    log::info!(
        "Loaded {} design points over {} parameters",
        design.n_points(),
        design.dim()
    );
    Ok(design)
}

fn rows_to_matrix(path: &[String], rows: Vec<Vec<f64>>) -> Result<Array2<f64>, DataError> {
    let name = display_path(path);
    let width = rows
        .first()
        .map(Vec::len)
        .ok_or_else(|| DataError::EmptyObservable(name.clone()))?;
    let mut out = Array2::<f64>::zeros((rows.len(), width));
    for (i, row) in rows.into_iter().enumerate() {
        if row.len() != width {
            return Err(DataError::RaggedRows {
                path: name,
                row: i,
                expected: width,
                found: row.len(),
            });
        }
        out.row_mut(i).assign(&ndarray::Array1::from_vec(row));
    }
    Ok(out)
}

/// Parses simulated observables: nested JSON objects whose leaves are arrays of
/// rows, one row per design point.
pub fn parse_model_observables(json: &str) -> Result<ObservableTree<Array2<f64>>, DataError> {
    let raw: ObservableTree<Vec<Vec<f64>>> = serde_json::from_str(json)?;
    raw.try_map(&mut |path, rows| rows_to_matrix(path, rows))
}

pub fn load_model_observables(
    path: impl AsRef<Path>,
) -> Result<ObservableTree<Array2<f64>>, DataError> {
    let path = path.as_ref();
    log::info!("Loading model observables from '{}'", path.display());
    let json = std::fs::read_to_string(path)?;
    parse_model_observables(&json)
}

pub fn load_experiment(path: impl AsRef<Path>) -> Result<ObservableTree<ExperimentalData>, DataError> {
    let path = path.as_ref();
    log::info!("Loading experimental data from '{}'", path.display());
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::Parameter;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn space() -> ParameterSpace {
        ParameterSpace::new(vec![
            Parameter::new("norm", 8.0, 20.0),
            Parameter::new("p", -0.5, 0.5),
        ])
        .unwrap()
    }

    fn write_tsv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file
    }

    #[test]
    fn loads_a_valid_design() {
        let file = write_tsv("norm\tp\n10.0\t0.1\n12.5\t-0.2\n19\t0\n");
        let design = load_design(file.path(), &space()).unwrap();
        assert_eq!(design.n_points(), 3);
        assert_eq!(design.points()[[1, 0]], 12.5);
        assert_eq!(design.points()[[2, 1]], 0.0);
    }

    #[test]
    fn design_header_must_match_parameters() {
        let file = write_tsv("p\tnorm\n0.1\t10.0\n");
        assert!(matches!(
            load_design(file.path(), &space()),
            Err(DataError::Design(DesignError::LabelMismatch { .. }))
        ));
    }

    #[test]
    fn design_values_must_be_numeric_and_in_range() {
        let file = write_tsv("norm\tp\n10.0\tabc\n");
        assert!(matches!(
            load_design(file.path(), &space()),
            Err(DataError::ColumnWrongType { .. })
        ));
        let file = write_tsv("norm\tp\n30.0\t0.0\n");
        assert!(matches!(
            load_design(file.path(), &space()),
            Err(DataError::Design(DesignError::OutOfRange { .. }))
        ));
    }

    #[test]
    fn model_observables_become_matrices() {
        let tree = parse_model_observables(
            r#"{"dNch_deta": [[1, 2, 3], [4, 5, 6]], "vn": {"v2": [[0.1], [0.2]]}}"#,
        )
        .unwrap();
        let m = tree.get(&["dNch_deta".to_string()]).unwrap();
        assert_eq!(m.dim(), (2, 3));
        assert_eq!(m[[1, 2]], 6.0);
        let v2 = tree.get(&["vn".to_string(), "v2".to_string()]).unwrap();
        assert_eq!(v2.dim(), (2, 1));
    }

    #[test]
    fn ragged_model_rows_are_rejected() {
        let err = parse_model_observables(r#"{"a": {"b": [[1, 2], [3]]}}"#).unwrap_err();
        match err {
            DataError::RaggedRows { path, row, .. } => {
                assert_eq!(path, "a/b");
                assert_eq!(row, 1);
            }
            other => panic!("Expected RaggedRows, got {other:?}"),
        }
    }

    #[test]
    fn experiment_file_round_trip() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"dNch_deta": {{"x": [2.5, 7.5], "y": [1600.0, 1300.0], "yerr": {{"stat": [5.0, 4.0], "sys": [60.0, 50.0]}}}}}}"#
        )
        .unwrap();
        let tree = load_experiment(file.path()).unwrap();
        let leaf = tree.get(&["dNch_deta".to_string()]).unwrap();
        assert_eq!(leaf.y, vec![1600.0, 1300.0]);
    }
}
