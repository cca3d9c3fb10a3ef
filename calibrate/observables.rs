//! # Observable Vector Builder
//!
//! Simulated and measured observables arrive as nested mappings keyed by a
//! path such as `["vn", "v2"]`, one leaf per observable, each leaf holding one
//! value per centrality bin. The [`ObservableSpec`] fixes which leaves are used,
//! in which order, and how many leading bins of each. Applying the same spec to
//! model output and to experimental data is what guarantees column alignment
//! everywhere downstream, so every shape disagreement is reported instead of
//! silently truncated or padded.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate, s};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use thiserror::Error;

/// Ordered sequence of keys addressing one observable in a nested mapping.
pub type KeyPath = Vec<String>;

pub fn display_path(path: &[String]) -> String {
    path.join("/")
}

#[derive(Error, Debug)]
pub enum ObservableError {
    #[error("Observable '{0}' was not found in the input data.")]
    MissingKeyPath(String),

    #[error("Expected a group at '{0}' but found an observable leaf.")]
    NotAGroup(String),

    #[error("Expected an observable leaf at '{0}' but found a group.")]
    NotALeaf(String),

    #[error("Observable '{path}' provides {available} bins, but the observable spec requests {requested}.")]
    InsufficientBins {
        path: String,
        requested: usize,
        available: usize,
    },

    #[error("Observable '{path}' has {found} rows, but {expected} design points were expected.")]
    RowCountMismatch {
        path: String,
        expected: usize,
        found: usize,
    },

    #[error("Observable '{path}': {field} has {found} entries but y has {expected}.")]
    ErrorLengthMismatch {
        path: String,
        field: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Assembled feature vector has length {found}, but the observable spec totals {expected}.")]
    LengthMismatch { expected: usize, found: usize },

    #[error("The observable spec is empty.")]
    EmptySpec,

    #[error("Observable '{0}' requests zero bins.")]
    ZeroBins(String),

    #[error("Observable '{0}' appears more than once in the observable spec.")]
    DuplicatePath(String),

    #[error("Normalisation divisor at feature {index} is {value}; divisors must be finite and positive.")]
    InvalidDivisor { index: usize, value: f64 },

    #[error("Observable '{path}' contains a non-finite value at row {row}, bin {bin}.")]
    NonFinite { path: String, row: usize, bin: usize },
}

/// A nested mapping from key paths to leaves of type `L`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObservableTree<L> {
    Leaf(L),
    Group(BTreeMap<String, ObservableTree<L>>),
}

impl<L> Default for ObservableTree<L> {
    fn default() -> Self {
        ObservableTree::Group(BTreeMap::new())
    }
}

impl<L> ObservableTree<L> {
    pub fn get(&self, path: &[String]) -> Result<&L, ObservableError> {
        let mut node = self;
        for (depth, key) in path.iter().enumerate() {
            match node {
                ObservableTree::Group(children) => {
                    node = children
                        .get(key)
                        .ok_or_else(|| ObservableError::MissingKeyPath(display_path(path)))?;
                }
                ObservableTree::Leaf(_) => {
                    return Err(ObservableError::NotAGroup(display_path(&path[..depth])));
                }
            }
        }
        match node {
            ObservableTree::Leaf(leaf) => Ok(leaf),
            ObservableTree::Group(_) => Err(ObservableError::NotALeaf(display_path(path))),
        }
    }

    /// Inserts `leaf` at `path`, creating intermediate groups as needed.
    pub fn insert(&mut self, path: &[String], leaf: L) -> Result<(), ObservableError> {
        let Some((last, parents)) = path.split_last() else {
            *self = ObservableTree::Leaf(leaf);
            return Ok(());
        };
        let mut node = self;
        for (depth, key) in parents.iter().enumerate() {
            node = match node {
                ObservableTree::Group(children) => children.entry(key.clone()).or_default(),
                ObservableTree::Leaf(_) => {
                    return Err(ObservableError::NotAGroup(display_path(&path[..depth])));
                }
            };
        }
        match node {
            ObservableTree::Group(children) => {
                children.insert(last.clone(), ObservableTree::Leaf(leaf));
                Ok(())
            }
            ObservableTree::Leaf(_) => Err(ObservableError::NotAGroup(display_path(parents))),
        }
    }

    /// Converts every leaf, passing its full key path to `f`.
    pub fn try_map<M, E>(
        self,
        f: &mut impl FnMut(&[String], L) -> Result<M, E>,
    ) -> Result<ObservableTree<M>, E> {
        fn walk<L, M, E>(
            node: ObservableTree<L>,
            path: &mut Vec<String>,
            f: &mut impl FnMut(&[String], L) -> Result<M, E>,
        ) -> Result<ObservableTree<M>, E> {
            match node {
                ObservableTree::Leaf(leaf) => Ok(ObservableTree::Leaf(f(path.as_slice(), leaf)?)),
                ObservableTree::Group(children) => {
                    let mut mapped = BTreeMap::new();
                    for (key, child) in children {
                        path.push(key.clone());
                        let converted = walk(child, path, &mut *f);
                        path.pop();
                        mapped.insert(key, converted?);
                    }
                    Ok(ObservableTree::Group(mapped))
                }
            }
        }
        walk(self, &mut Vec::new(), f)
    }
}

/// One entry of the observable spec: which leaf, and how many leading bins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservableEntry {
    pub path: KeyPath,
    pub bins: usize,
}

impl ObservableEntry {
    pub fn new<S: Into<String>>(path: impl IntoIterator<Item = S>, bins: usize) -> Self {
        Self {
            path: path.into_iter().map(Into::into).collect(),
            bins,
        }
    }
}

/// Measured values of one observable: bin centres, values and uncertainties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentalData {
    #[serde(default)]
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub yerr: ExperimentalError,
}

/// Either a total uncertainty per bin or a statistical/systematic breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExperimentalError {
    Total(Vec<f64>),
    Breakdown { stat: Vec<f64>, sys: Vec<f64> },
}

impl ExperimentalError {
    /// Combined per-bin uncertainty; stat and sys add in quadrature.
    fn combined(&self, path: &str, expected: usize) -> Result<Vec<f64>, ObservableError> {
        let check = |field: &'static str, v: &[f64]| {
            if v.len() == expected {
                Ok(())
            } else {
                Err(ObservableError::ErrorLengthMismatch {
                    path: path.to_string(),
                    field,
                    expected,
                    found: v.len(),
                })
            }
        };
        match self {
            ExperimentalError::Total(total) => {
                check("yerr", total)?;
                Ok(total.clone())
            }
            ExperimentalError::Breakdown { stat, sys } => {
                check("yerr.stat", stat)?;
                check("yerr.sys", sys)?;
                Ok(stat
                    .iter()
                    .zip(sys)
                    .map(|(a, b)| (a * a + b * b).sqrt())
                    .collect())
            }
        }
    }
}

/// Flat experimental target aligned with the assembled feature columns.
#[derive(Debug, Clone)]
pub struct ExperimentalTarget {
    pub values: Array1<f64>,
    pub errors: Array1<f64>,
}

/// The fixed, ordered list of observables making up one feature vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservableSpec {
    entries: Vec<ObservableEntry>,
}

impl ObservableSpec {
    pub fn new(entries: Vec<ObservableEntry>) -> Result<Self, ObservableError> {
        if entries.is_empty() {
            return Err(ObservableError::EmptySpec);
        }
        for (i, entry) in entries.iter().enumerate() {
            if entry.bins == 0 {
                return Err(ObservableError::ZeroBins(display_path(&entry.path)));
            }
            if entries[..i].iter().any(|e| e.path == entry.path) {
                return Err(ObservableError::DuplicatePath(display_path(&entry.path)));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ObservableEntry] {
        &self.entries
    }

    /// Length of the flat feature vector: the sum of all bin counts.
    pub fn total_len(&self) -> usize {
        self.entries.iter().map(|e| e.bins).sum()
    }

    /// Column range occupied by each entry, in spec order.
    pub fn column_ranges(&self) -> Vec<Range<usize>> {
        let mut start = 0;
        self.entries
            .iter()
            .map(|e| {
                let range = start..start + e.bins;
                start = range.end;
                range
            })
            .collect()
    }

    /// Concatenates the first `bins` columns of every spec'd leaf, in spec order.
    pub fn assemble(&self, tree: &ObservableTree<Array2<f64>>) -> Result<Array2<f64>, ObservableError> {
        let mut blocks: Vec<ArrayView2<f64>> = Vec::with_capacity(self.entries.len());
        let mut n_rows: Option<usize> = None;

        for entry in &self.entries {
            let name = display_path(&entry.path);
            let leaf = tree.get(&entry.path)?;
            if leaf.ncols() < entry.bins {
                return Err(ObservableError::InsufficientBins {
                    path: name,
                    requested: entry.bins,
                    available: leaf.ncols(),
                });
            }
            let expected = *n_rows.get_or_insert(leaf.nrows());
            if leaf.nrows() != expected {
                return Err(ObservableError::RowCountMismatch {
                    path: name,
                    expected,
                    found: leaf.nrows(),
                });
            }
            let block = leaf.slice(s![.., ..entry.bins]);
            if let Some(((row, bin), _)) = block.indexed_iter().find(|(_, v)| !v.is_finite()) {
                return Err(ObservableError::NonFinite { path: name, row, bin });
            }
            blocks.push(block);
        }

        let assembled = concatenate(Axis(1), &blocks).map_err(|_| ObservableError::LengthMismatch {
            expected: self.total_len(),
            found: blocks.iter().map(|b| b.ncols()).sum(),
        })?;
        self.check_len(assembled.ncols())?;
        Ok(assembled)
    }

    /// Builds the experimental target vector and its per-element uncertainty.
    pub fn assemble_target(
        &self,
        tree: &ObservableTree<ExperimentalData>,
    ) -> Result<ExperimentalTarget, ObservableError> {
        let mut values = Vec::with_capacity(self.total_len());
        let mut errors = Vec::with_capacity(self.total_len());

        for entry in &self.entries {
            let name = display_path(&entry.path);
            let leaf = tree.get(&entry.path)?;
            if leaf.y.len() < entry.bins {
                return Err(ObservableError::InsufficientBins {
                    path: name,
                    requested: entry.bins,
                    available: leaf.y.len(),
                });
            }
            let err = leaf.yerr.combined(&name, leaf.y.len())?;
            if let Some(bin) = leaf.y[..entry.bins].iter().position(|v| !v.is_finite()) {
                return Err(ObservableError::NonFinite { path: name, row: 0, bin });
            }
            values.extend_from_slice(&leaf.y[..entry.bins]);
            errors.extend_from_slice(&err[..entry.bins]);
        }

        self.check_len(values.len())?;
        Ok(ExperimentalTarget {
            values: Array1::from_vec(values),
            errors: Array1::from_vec(errors),
        })
    }

    /// Inverse of [`ObservableSpec::assemble`]: splits columns back into a tree
    /// of per-observable matrices.
    pub fn split(&self, matrix: ArrayView2<f64>) -> Result<ObservableTree<Array2<f64>>, ObservableError> {
        self.check_len(matrix.ncols())?;
        let mut tree = ObservableTree::default();
        for (entry, range) in self.entries.iter().zip(self.column_ranges()) {
            tree.insert(&entry.path, matrix.slice(s![.., range]).to_owned())?;
        }
        Ok(tree)
    }

    fn check_len(&self, found: usize) -> Result<(), ObservableError> {
        let expected = self.total_len();
        if found != expected {
            return Err(ObservableError::LengthMismatch { expected, found });
        }
        Ok(())
    }
}

/// Element-wise feature rescaling applied before PCA.
///
/// With a divisor (normally the experimental target) the emulator works on
/// dimensionless ratios near one. Deserialisation applies the same checks as
/// [`FeatureScale::from_divisor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFeatureScale")]
pub struct FeatureScale {
    divisor: Option<Array1<f64>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFeatureScale {
    divisor: Option<Array1<f64>>,
}

impl TryFrom<RawFeatureScale> for FeatureScale {
    type Error = ObservableError;

    fn try_from(raw: RawFeatureScale) -> Result<Self, Self::Error> {
        match raw.divisor {
            Some(d) => Self::from_divisor(d),
            None => Ok(Self::identity()),
        }
    }
}

impl FeatureScale {
    pub fn identity() -> Self {
        Self { divisor: None }
    }

    pub fn from_divisor(divisor: Array1<f64>) -> Result<Self, ObservableError> {
        if let Some((index, &value)) = divisor
            .iter()
            .enumerate()
            .find(|(_, v)| !(v.is_finite() && **v > 0.0))
        {
            return Err(ObservableError::InvalidDivisor { index, value });
        }
        Ok(Self {
            divisor: Some(divisor),
        })
    }

    fn check(&self, found: usize) -> Result<(), ObservableError> {
        match &self.divisor {
            Some(d) if d.len() != found => Err(ObservableError::LengthMismatch {
                expected: d.len(),
                found,
            }),
            _ => Ok(()),
        }
    }

    /// Physical units to scaled units.
    pub fn scale(&self, v: ArrayView1<f64>) -> Result<Array1<f64>, ObservableError> {
        self.check(v.len())?;
        Ok(match &self.divisor {
            Some(d) => &v / d,
            None => v.to_owned(),
        })
    }

    pub fn scale_rows(&self, m: ArrayView2<f64>) -> Result<Array2<f64>, ObservableError> {
        self.check(m.ncols())?;
        Ok(match &self.divisor {
            Some(d) => &m / &d.view().insert_axis(Axis(0)),
            None => m.to_owned(),
        })
    }

    /// Physical variances to scaled variances.
    pub fn scale_variance(&self, var: ArrayView1<f64>) -> Result<Array1<f64>, ObservableError> {
        self.check(var.len())?;
        Ok(match &self.divisor {
            Some(d) => &var / &d.mapv(|x| x * x),
            None => var.to_owned(),
        })
    }

    /// Scaled units back to physical units.
    pub fn restore_rows(&self, m: ArrayView2<f64>) -> Result<Array2<f64>, ObservableError> {
        self.check(m.ncols())?;
        Ok(match &self.divisor {
            Some(d) => &m * &d.view().insert_axis(Axis(0)),
            None => m.to_owned(),
        })
    }
}

/// The N x F training matrix together with the scale applied to it.
#[derive(Debug, Clone)]
pub struct TrainingMatrix {
    values: Array2<f64>,
    scale: FeatureScale,
}

impl TrainingMatrix {
    /// `raw` is in physical units; it is stored divided by `scale`.
    pub fn new(raw: ArrayView2<f64>, scale: FeatureScale) -> Result<Self, ObservableError> {
        let values = scale.scale_rows(raw)?;
        Ok(Self { values, scale })
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn scale(&self) -> &FeatureScale {
        &self.scale
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn path(keys: &[&str]) -> KeyPath {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn model_tree(n: usize) -> ObservableTree<Array2<f64>> {
        let a = Array2::from_shape_fn((n, 5), |(i, j)| (10 * i + j) as f64);
        let bx = Array2::from_shape_fn((n, 5), |(i, j)| -((10 * i + j) as f64));
        let mut tree = ObservableTree::default();
        tree.insert(&path(&["a"]), a).unwrap();
        tree.insert(&path(&["b", "x"]), bx).unwrap();
        tree
    }

    fn spec() -> ObservableSpec {
        ObservableSpec::new(vec![
            ObservableEntry::new(["a"], 2),
            ObservableEntry::new(["b", "x"], 3),
        ])
        .unwrap()
    }

    #[test]
    fn assembles_leading_columns_in_spec_order() {
        let n = 4;
        let m = spec().assemble(&model_tree(n)).unwrap();
        assert_eq!(m.dim(), (n, 5));
        for i in 0..n {
            let base = (10 * i) as f64;
            assert_eq!(m.row(i).to_vec(), vec![base, base + 1.0, -base, -base - 1.0, -base - 2.0]);
        }
    }

    #[test]
    fn too_few_bins_is_a_configuration_error() {
        let spec = ObservableSpec::new(vec![ObservableEntry::new(["a"], 6)]).unwrap();
        match spec.assemble(&model_tree(3)).unwrap_err() {
            ObservableError::InsufficientBins {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, 6);
                assert_eq!(available, 5);
            }
            other => panic!("Expected InsufficientBins, got {other:?}"),
        }
    }

    #[test]
    fn row_mismatch_is_reported() {
        let mut tree = model_tree(3);
        tree.insert(&path(&["b", "x"]), Array2::zeros((2, 5))).unwrap();
        assert!(matches!(
            spec().assemble(&tree).unwrap_err(),
            ObservableError::RowCountMismatch { expected: 3, found: 2, .. }
        ));
    }

    #[test]
    fn missing_and_misplaced_paths() {
        let tree = model_tree(2);
        assert!(matches!(
            tree.get(&path(&["c"])).unwrap_err(),
            ObservableError::MissingKeyPath(_)
        ));
        assert!(matches!(
            tree.get(&path(&["b"])).unwrap_err(),
            ObservableError::NotALeaf(_)
        ));
        assert!(matches!(
            tree.get(&path(&["a", "z"])).unwrap_err(),
            ObservableError::NotAGroup(_)
        ));
    }

    #[test]
    fn split_inverts_assemble() {
        let tree = model_tree(3);
        let m = spec().assemble(&tree).unwrap();
        let back = spec().split(m.view()).unwrap();
        assert_eq!(back.get(&path(&["a"])).unwrap().ncols(), 2);
        assert_eq!(
            back.get(&path(&["b", "x"])).unwrap(),
            &tree.get(&path(&["b", "x"])).unwrap().slice(s![.., ..3]).to_owned()
        );
        assert!(spec().split(Array2::<f64>::zeros((1, 4)).view()).is_err());
    }

    #[test]
    fn experimental_errors_combine_in_quadrature() {
        let mut tree = ObservableTree::default();
        tree.insert(
            &path(&["a"]),
            ExperimentalData {
                x: vec![],
                y: vec![1.0, 2.0, 3.0],
                yerr: ExperimentalError::Breakdown {
                    stat: vec![3.0, 0.0, 1.0],
                    sys: vec![4.0, 1.0, 1.0],
                },
            },
        )
        .unwrap();
        tree.insert(
            &path(&["b", "x"]),
            ExperimentalData {
                x: vec![0.0, 1.0, 2.0],
                y: vec![5.0, 6.0, 7.0],
                yerr: ExperimentalError::Total(vec![0.1, 0.2, 0.3]),
            },
        )
        .unwrap();
        let target = spec().assemble_target(&tree).unwrap();
        assert_eq!(target.values.to_vec(), vec![1.0, 2.0, 5.0, 6.0, 7.0]);
        assert_abs_diff_eq!(target.errors[0], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(target.errors[1], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(target.errors[4], 0.3, epsilon = 1e-12);
    }

    #[test]
    fn experimental_json_leaves_and_groups_are_distinguished() {
        let json = r#"{
            "a": {"y": [1.0, 2.0], "yerr": [0.1, 0.1]},
            "b": {"x": {"x": [0.5], "y": [3.0], "yerr": {"stat": [0.1], "sys": [0.2]}}}
        }"#;
        let tree: ObservableTree<ExperimentalData> = serde_json::from_str(json).unwrap();
        assert_eq!(tree.get(&path(&["a"])).unwrap().y, vec![1.0, 2.0]);
        assert_eq!(tree.get(&path(&["b", "x"])).unwrap().x, vec![0.5]);
    }

    #[test]
    fn feature_scale_round_trip() {
        let scale = FeatureScale::from_divisor(array![2.0, 4.0]).unwrap();
        let raw = array![[2.0, 8.0], [1.0, 1.0]];
        let scaled = scale.scale_rows(raw.view()).unwrap();
        assert_eq!(scaled, array![[1.0, 2.0], [0.5, 0.25]]);
        assert_eq!(scale.restore_rows(scaled.view()).unwrap(), raw);
        assert_eq!(
            scale.scale_variance(array![4.0, 16.0].view()).unwrap(),
            array![1.0, 1.0]
        );
        assert!(matches!(
            FeatureScale::from_divisor(array![1.0, 0.0]).unwrap_err(),
            ObservableError::InvalidDivisor { index: 1, .. }
        ));
        assert!(matches!(
            FeatureScale::from_divisor(array![-2.0, 1.0]).unwrap_err(),
            ObservableError::InvalidDivisor { index: 0, .. }
        ));
        assert!(scale.scale(array![1.0].view()).is_err());
    }

    #[test]
    fn deserialised_feature_scale_is_validated() {
        let ok: FeatureScale = serde_json::from_str(r#"{"divisor": null}"#).unwrap();
        assert_eq!(ok, FeatureScale::identity());
        let scale = FeatureScale::from_divisor(array![2.0, 4.0]).unwrap();
        let json = serde_json::to_string(&scale).unwrap();
        assert_eq!(serde_json::from_str::<FeatureScale>(&json).unwrap(), scale);

        let zero = json.replace("4.0", "0.0");
        assert!(serde_json::from_str::<FeatureScale>(&zero).is_err());
    }
}
