//! # Design Table
//!
//! The physical parameter space and the sampled design points that the model
//! was evaluated at. The design itself is generated elsewhere (Latin hypercube
//! sampling); this module only validates and carries it.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("Parameter '{name}' has an invalid range [{min}, {max}]. The minimum must be finite and strictly below the maximum.")]
    InvalidRange { name: String, min: f64, max: f64 },

    #[error("The parameter space is empty. At least one parameter must be declared.")]
    EmptySpace,

    #[error("Duplicate parameter name '{0}'. Parameter names must be unique.")]
    DuplicateName(String),

    #[error("Design has {found} columns, but the parameter space declares {expected} parameters.")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Design column {index} is labelled '{found}', expected '{expected}'.")]
    LabelMismatch {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("Design row {row}: parameter '{name}' = {value} lies outside its range [{min}, {max}].")]
    OutOfRange {
        row: usize,
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("The design contains no points.")]
    EmptyDesign,
}

/// One named physical parameter with its closed range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Parameter {
    pub name: String,
    pub min: f64,
    pub max: f64,
}

impl Parameter {
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
        }
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn midpoint(&self) -> f64 {
        0.5 * (self.min + self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Ordered, validated list of parameters shared by every design row.
///
/// Deserialisation runs the same checks as [`ParameterSpace::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawParameterSpace")]
pub struct ParameterSpace {
    parameters: Vec<Parameter>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParameterSpace {
    parameters: Vec<Parameter>,
}

impl TryFrom<RawParameterSpace> for ParameterSpace {
    type Error = DesignError;

    fn try_from(raw: RawParameterSpace) -> Result<Self, Self::Error> {
        Self::new(raw.parameters)
    }
}

impl ParameterSpace {
    pub fn new(parameters: Vec<Parameter>) -> Result<Self, DesignError> {
        if parameters.is_empty() {
            return Err(DesignError::EmptySpace);
        }
        for (i, p) in parameters.iter().enumerate() {
            if !(p.min.is_finite() && p.max.is_finite() && p.min < p.max) {
                return Err(DesignError::InvalidRange {
                    name: p.name.clone(),
                    min: p.min,
                    max: p.max,
                });
            }
            if parameters[..i].iter().any(|q| q.name == p.name) {
                return Err(DesignError::DuplicateName(p.name.clone()));
            }
        }
        Ok(Self { parameters })
    }

    pub fn dim(&self) -> usize {
        self.parameters.len()
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    pub fn lower(&self) -> Array1<f64> {
        self.parameters.iter().map(|p| p.min).collect()
    }

    pub fn upper(&self) -> Array1<f64> {
        self.parameters.iter().map(|p| p.max).collect()
    }

    pub fn midpoint(&self) -> Array1<f64> {
        self.parameters.iter().map(Parameter::midpoint).collect()
    }

    /// True when `x` has the right length and every coordinate is inside its range.
    pub fn contains(&self, x: ArrayView1<f64>) -> bool {
        x.len() == self.dim()
            && self
                .parameters
                .iter()
                .zip(x.iter())
                .all(|(p, &v)| p.contains(v))
    }

    /// Affine map of a physical point onto the unit cube.
    pub fn to_unit(&self, x: ArrayView1<f64>) -> Array1<f64> {
        self.parameters
            .iter()
            .zip(x.iter())
            .map(|(p, &v)| (v - p.min) / p.width())
            .collect()
    }

    /// Row-wise [`ParameterSpace::to_unit`].
    pub fn to_unit_rows(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut out = x.to_owned();
        for mut row in out.rows_mut() {
            for (v, p) in row.iter_mut().zip(&self.parameters) {
                *v = (*v - p.min) / p.width();
            }
        }
        out
    }
}

/// N sampled parameter vectors sharing one [`ParameterSpace`].
#[derive(Debug, Clone)]
pub struct DesignTable {
    space: ParameterSpace,
    points: Array2<f64>,
}

impl DesignTable {
    /// Validates the shape and that every point lies inside the declared ranges.
    pub fn new(space: ParameterSpace, points: Array2<f64>) -> Result<Self, DesignError> {
        if points.ncols() != space.dim() {
            return Err(DesignError::DimensionMismatch {
                expected: space.dim(),
                found: points.ncols(),
            });
        }
        if points.nrows() == 0 {
            return Err(DesignError::EmptyDesign);
        }
        for (row, point) in points.rows().into_iter().enumerate() {
            for (p, &value) in space.parameters().iter().zip(point.iter()) {
                if !p.contains(value) {
                    return Err(DesignError::OutOfRange {
                        row,
                        name: p.name.clone(),
                        value,
                        min: p.min,
                        max: p.max,
                    });
                }
            }
        }
        Ok(Self { space, points })
    }

    /// Builds a design whose column labels must match the space, in order.
    pub fn with_labels(
        space: ParameterSpace,
        labels: &[String],
        points: Array2<f64>,
    ) -> Result<Self, DesignError> {
        if labels.len() != space.dim() {
            return Err(DesignError::DimensionMismatch {
                expected: space.dim(),
                found: labels.len(),
            });
        }
        for (index, (label, p)) in labels.iter().zip(space.parameters()).enumerate() {
            if *label != p.name {
                return Err(DesignError::LabelMismatch {
                    index,
                    expected: p.name.clone(),
                    found: label.clone(),
                });
            }
        }
        Self::new(space, points)
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn points(&self) -> ArrayView2<'_, f64> {
        self.points.view()
    }

    pub fn n_points(&self) -> usize {
        self.points.nrows()
    }

    pub fn dim(&self) -> usize {
        self.points.ncols()
    }
}
