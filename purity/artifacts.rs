// ========================================================================================
//
//                         Pretrained artifacts: imputer, scaler, model
//
// ========================================================================================
//
// Every component downstream of gene alignment is a frozen, pretrained object. They
// are stored as human-readable TOML documents and consumed through two narrow traits:
// `FittedTransform` (matrix in, matrix out) and `FittedRegressor` (matrix in, one value
// per row out). Nothing here is ever refit during inference, so a loaded artifact can be
// shared read-only between concurrent predictions.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Custom error type for artifact loading, saving and application.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to read {kind} artifact '{path}': {source}")]
    Read {
        kind: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to write {kind} artifact '{path}': {source}")]
    Write {
        kind: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse {kind} artifact '{path}' (is the file corrupt?): {source}")]
    Parse {
        kind: &'static str,
        path: String,
        source: toml::de::Error,
    },
    #[error("Failed to serialize artifact to TOML format: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("The {kind} artifact is inconsistent: {reason}")]
    Invalid { kind: &'static str, reason: String },
    #[error("The {kind} was fitted on {expected} features, but the data has {found}.")]
    FeatureCount {
        kind: &'static str,
        expected: usize,
        found: usize,
    },
    #[error(
        "The {kind} was fitted with feature '{expected}' at position {position}, but the pipeline supplies '{found}'."
    )]
    FeatureMismatch {
        kind: &'static str,
        position: usize,
        expected: String,
        found: String,
    },
}

/// A frozen matrix-to-matrix transform.
pub trait FittedTransform: Send + Sync {
    fn kind(&self) -> &'static str;
    /// Ordered feature names the transform was fitted on.
    fn feature_names(&self) -> &[String];
    /// Returns a matrix with the same shape, row order and column order as `x`.
    fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ArtifactError>;
    /// Per-feature divisor applied by the transform, if it is a pure rescaling.
    fn feature_scale(&self) -> Option<&[f64]> {
        None
    }
}

/// A frozen regression model producing one value per row.
pub trait FittedRegressor: Send + Sync {
    fn kind(&self) -> &'static str;
    fn feature_names(&self) -> &[String];
    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ArtifactError>;
}

/// Checks that `supplied` is exactly the ordered feature list an artifact was fitted on.
pub fn check_feature_names(
    kind: &'static str,
    fitted: &[String],
    supplied: &[String],
) -> Result<(), ArtifactError> {
    if fitted.len() != supplied.len() {
        return Err(ArtifactError::FeatureCount {
            kind,
            expected: fitted.len(),
            found: supplied.len(),
        });
    }
    if let Some((position, (expected, found))) = fitted
        .iter()
        .zip(supplied)
        .enumerate()
        .find(|(_, (a, b))| a != b)
    {
        return Err(ArtifactError::FeatureMismatch {
            kind,
            position,
            expected: expected.clone(),
            found: found.clone(),
        });
    }
    Ok(())
}

fn check_width(kind: &'static str, expected: usize, x: &ArrayView2<f64>) -> Result<(), ArtifactError> {
    if x.ncols() != expected {
        return Err(ArtifactError::FeatureCount {
            kind,
            expected,
            found: x.ncols(),
        });
    }
    Ok(())
}

/// Shared TOML persistence for all artifact types.
pub trait Artifact: Serialize + DeserializeOwned {
    const KIND: &'static str;

    /// Structural checks run after every load.
    fn validate(&self) -> Result<(), String>;

    /// Saves the artifact to a file in a human-readable TOML format.
    fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        let toml_string = toml::to_string_pretty(self)?;
        let write_err = |source| ArtifactError::Write {
            kind: Self::KIND,
            path: path.display().to_string(),
            source,
        };
        let mut file = BufWriter::new(fs::File::create(path).map_err(write_err)?);
        file.write_all(toml_string.as_bytes()).map_err(write_err)?;
        file.flush().map_err(write_err)?;
        Ok(())
    }

    /// Loads and validates an artifact from a TOML file.
    fn load(path: &Path) -> Result<Self, ArtifactError> {
        let toml_string = fs::read_to_string(path).map_err(|source| ArtifactError::Read {
            kind: Self::KIND,
            path: path.display().to_string(),
            source,
        })?;
        let artifact: Self = toml::from_str(&toml_string).map_err(|source| ArtifactError::Parse {
            kind: Self::KIND,
            path: path.display().to_string(),
            source,
        })?;
        artifact.validate().map_err(|reason| ArtifactError::Invalid {
            kind: Self::KIND,
            reason,
        })?;
        log::info!("Loaded {} from '{}'", Self::KIND, path.display());
        Ok(artifact)
    }
}

fn check_len(field: &str, len: usize, expected: usize) -> Result<(), String> {
    if len != expected {
        return Err(format!(
            "'{field}' has {len} entries but {expected} features are declared"
        ));
    }
    Ok(())
}

// ========================================================================================
//                                   Standard scaler
// ========================================================================================

/// Per-feature affine transform `(x - mean) / scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub feature_names: Vec<String>,
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl Artifact for StandardScaler {
    const KIND: &'static str = "scaler";

    fn validate(&self) -> Result<(), String> {
        let n = self.feature_names.len();
        check_len("mean", self.mean.len(), n)?;
        check_len("scale", self.scale.len(), n)?;
        if let Some(idx) = self.mean.iter().position(|m| !m.is_finite()) {
            return Err(format!("mean of feature {idx} is not finite"));
        }
        if let Some(idx) = self
            .scale
            .iter()
            .position(|s| !s.is_finite() || *s == 0.0)
        {
            return Err(format!("scale of feature {idx} is zero or not finite"));
        }
        Ok(())
    }
}

impl FittedTransform for StandardScaler {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Missing values stay missing.
    fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ArtifactError> {
        check_width(Self::KIND, self.feature_names.len(), &x)?;
        let mut out = x.to_owned();
        for (j, mut column) in out.columns_mut().into_iter().enumerate() {
            let (mean, scale) = (self.mean[j], self.scale[j]);
            column.mapv_inplace(|v| (v - mean) / scale);
        }
        Ok(out)
    }

    fn feature_scale(&self) -> Option<&[f64]> {
        Some(&self.scale)
    }
}

// ========================================================================================
//                                  Iterative imputer
// ========================================================================================

/// One round-robin regression step: re-predict `feature` from `neighbors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputationStep {
    pub feature: usize,
    pub intercept: f64,
    pub neighbors: Vec<usize>,
    pub coefficients: Vec<f64>,
}

/// A fitted multivariate imputer.
///
/// Missing cells are first filled with `initial_fill`; then, for every step of the
/// recorded sequence whose feature had missing cells, those cells are re-predicted from
/// the current values of the step's neighbours and clipped to the feature's bounds.
/// Observed cells are never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterativeImputer {
    pub feature_names: Vec<String>,
    pub initial_fill: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<Vec<f64>>,
    #[serde(default)]
    pub imputation_sequence: Vec<ImputationStep>,
}

impl IterativeImputer {
    fn clip(&self, feature: usize, value: f64) -> f64 {
        let lower = self
            .min_value
            .as_ref()
            .map_or(f64::NEG_INFINITY, |bounds| bounds[feature]);
        let upper = self
            .max_value
            .as_ref()
            .map_or(f64::INFINITY, |bounds| bounds[feature]);
        value.clamp(lower, upper)
    }

    fn predict_step(step: &ImputationStep, row: ArrayView1<f64>) -> f64 {
        step.neighbors
            .iter()
            .zip(&step.coefficients)
            .fold(step.intercept, |acc, (&nb, &coef)| acc + coef * row[nb])
    }
}

impl Artifact for IterativeImputer {
    const KIND: &'static str = "imputer";

    fn validate(&self) -> Result<(), String> {
        let n = self.feature_names.len();
        check_len("initial_fill", self.initial_fill.len(), n)?;
        if let Some(idx) = self.initial_fill.iter().position(|v| !v.is_finite()) {
            return Err(format!("initial fill of feature {idx} is not finite"));
        }
        if let Some(bounds) = &self.min_value {
            check_len("min_value", bounds.len(), n)?;
        }
        if let Some(bounds) = &self.max_value {
            check_len("max_value", bounds.len(), n)?;
        }
        if let (Some(lower), Some(upper)) = (&self.min_value, &self.max_value) {
            if let Some(idx) = lower.iter().zip(upper).position(|(lo, hi)| lo > hi) {
                return Err(format!("min_value exceeds max_value for feature {idx}"));
            }
        }
        for (i, step) in self.imputation_sequence.iter().enumerate() {
            if step.feature >= n {
                return Err(format!(
                    "step {i} imputes feature {} of {n}",
                    step.feature
                ));
            }
            if let Some(nb) = step.neighbors.iter().find(|&&nb| nb >= n) {
                return Err(format!("step {i} reads feature {nb} of {n}"));
            }
            if step.neighbors.len() != step.coefficients.len() {
                return Err(format!(
                    "step {i} has {} neighbours but {} coefficients",
                    step.neighbors.len(),
                    step.coefficients.len()
                ));
            }
        }
        Ok(())
    }
}

impl FittedTransform for IterativeImputer {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ArtifactError> {
        check_width(Self::KIND, self.feature_names.len(), &x)?;
        let missing = x.mapv(f64::is_nan);
        let mut filled = x.to_owned();
        for ((_, j), value) in filled.indexed_iter_mut().filter(|(_, v)| v.is_nan()) {
            *value = self.initial_fill[j];
        }
        if !missing.iter().any(|&m| m) {
            return Ok(filled);
        }

        for step in &self.imputation_sequence {
            let rows: Vec<usize> = missing
                .column(step.feature)
                .iter()
                .enumerate()
                .filter(|(_, m)| **m)
                .map(|(i, _)| i)
                .collect();
            if rows.is_empty() {
                continue;
            }
            // All predictions of a step read the state from before the step.
            let predictions: Vec<f64> = rows
                .iter()
                .map(|&i| self.clip(step.feature, Self::predict_step(step, filled.row(i))))
                .collect();
            for (&i, value) in rows.iter().zip(predictions) {
                filled[[i, step.feature]] = value;
            }
        }
        Ok(filled)
    }
}

// ========================================================================================
//                                 Linear purity model
// ========================================================================================

/// A fitted linear regression (`x . coefficients + intercept`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRegressor {
    pub feature_names: Vec<String>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl Artifact for LinearRegressor {
    const KIND: &'static str = "purity model";

    fn validate(&self) -> Result<(), String> {
        check_len(
            "coefficients",
            self.coefficients.len(),
            self.feature_names.len(),
        )?;
        if !self.intercept.is_finite() || self.coefficients.iter().any(|c| !c.is_finite()) {
            return Err("intercept and coefficients must be finite".to_string());
        }
        Ok(())
    }
}

impl FittedRegressor for LinearRegressor {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ArtifactError> {
        check_width(Self::KIND, self.feature_names.len(), &x)?;
        let coefficients = ArrayView1::from(&self.coefficients[..]);
        Ok(x.dot(&coefficients) + self.intercept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::NamedTempFile;

    fn names(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("ENSG{i:02}")).collect()
    }

    fn imputer() -> IterativeImputer {
        IterativeImputer {
            feature_names: names(3),
            initial_fill: vec![1.0, 2.0, 3.0],
            min_value: Some(vec![-10.0, -10.0, -10.0]),
            max_value: Some(vec![10.0, 10.0, 5.0]),
            imputation_sequence: vec![
                ImputationStep {
                    feature: 0,
                    intercept: 0.5,
                    neighbors: vec![1, 2],
                    coefficients: vec![1.0, 0.0],
                },
                ImputationStep {
                    feature: 2,
                    intercept: 0.0,
                    neighbors: vec![0, 1],
                    coefficients: vec![2.0, 2.0],
                },
            ],
        }
    }

    #[test]
    fn scaler_applies_affine_transform_and_keeps_missing() {
        let scaler = StandardScaler {
            feature_names: names(2),
            mean: vec![1.0, -2.0],
            scale: vec![2.0, 0.5],
        };
        let out = scaler
            .transform(array![[3.0, -1.0], [f64::NAN, -2.0]].view())
            .unwrap();
        assert_abs_diff_eq!(out[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[[0, 1]], 2.0, epsilon = 1e-12);
        assert!(out[[1, 0]].is_nan());
        assert_abs_diff_eq!(out[[1, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn only_the_scaler_reports_a_feature_scale() {
        let scaler = StandardScaler {
            feature_names: names(2),
            mean: vec![0.0, 0.0],
            scale: vec![2.5, 1.0],
        };
        assert_eq!(scaler.feature_scale(), Some(&[2.5, 1.0][..]));
        assert_eq!(imputer().feature_scale(), None);
    }

    #[test]
    fn scaler_rejects_wrong_width() {
        let scaler = StandardScaler {
            feature_names: names(2),
            mean: vec![0.0, 0.0],
            scale: vec![1.0, 1.0],
        };
        let err = scaler.transform(array![[1.0]].view()).unwrap_err();
        assert!(matches!(
            err,
            ArtifactError::FeatureCount {
                expected: 2,
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn imputer_fills_only_missing_cells() {
        let x = array![[f64::NAN, 4.0, 1.0], [2.0, 3.0, f64::NAN], [7.0, 8.0, 9.0]];
        let out = imputer().transform(x.view()).unwrap();

        // Row 0: feature 0 = 0.5 + 1.0 * 4.0.
        assert_abs_diff_eq!(out[[0, 0]], 4.5, epsilon = 1e-12);
        assert_eq!(out[[0, 1]], 4.0);
        assert_eq!(out[[0, 2]], 1.0);
        // Row 1: feature 2 = 2 * 2.0 + 2 * 3.0 = 10, clipped to 5.
        assert_eq!(out[[1, 0]], 2.0);
        assert_abs_diff_eq!(out[[1, 2]], 5.0, epsilon = 1e-12);
        // Complete rows pass through.
        assert_eq!(out.row(2), x.row(2));
    }

    #[test]
    fn imputer_without_missing_values_is_identity() {
        let x = array![[1.0, 2.0, 3.0]];
        assert_eq!(imputer().transform(x.view()).unwrap(), x);
    }

    #[test]
    fn imputer_fills_entirely_missing_features() {
        let x = array![[f64::NAN, 1.0, 1.0], [f64::NAN, 3.0, 1.0]];
        let out = imputer().transform(x.view()).unwrap();
        assert_eq!(out.column(0).to_vec(), vec![1.5, 3.5]);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn imputer_validation_catches_bad_indices() {
        let mut broken = imputer();
        broken.imputation_sequence[1].neighbors = vec![0, 7];
        assert!(broken.validate().unwrap_err().contains("feature 7"));

        let mut broken = imputer();
        broken.initial_fill.pop();
        assert!(broken.validate().is_err());
    }

    #[test]
    fn linear_model_predicts_dot_product_plus_intercept() {
        let model = LinearRegressor {
            feature_names: names(2),
            intercept: 0.25,
            coefficients: vec![0.5, -1.0],
        };
        let pred = model.predict(array![[1.0, 0.0], [0.0, 1.0]].view()).unwrap();
        assert_abs_diff_eq!(pred[0], 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(pred[1], -0.75, epsilon = 1e-12);
    }

    #[test]
    fn feature_names_must_match_in_order() {
        let fitted = names(2);
        assert!(check_feature_names("scaler", &fitted, &names(2)).is_ok());
        let swapped = vec![fitted[1].clone(), fitted[0].clone()];
        match check_feature_names("scaler", &fitted, &swapped).unwrap_err() {
            ArtifactError::FeatureMismatch { position, .. } => assert_eq!(position, 0),
            other => panic!("Expected FeatureMismatch, got {other:?}"),
        }
        assert!(matches!(
            check_feature_names("scaler", &fitted, &names(3)),
            Err(ArtifactError::FeatureCount { .. })
        ));
    }

    #[test]
    fn artifacts_survive_a_toml_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let original = imputer();
        original.save(file.path()).unwrap();
        let loaded = IterativeImputer::load(file.path()).unwrap();
        assert_eq!(loaded, original);

        let model = LinearRegressor {
            feature_names: names(3),
            intercept: 0.1,
            coefficients: vec![0.2, 0.3, -0.4],
        };
        model.save(file.path()).unwrap();
        assert_eq!(LinearRegressor::load(file.path()).unwrap(), model);
    }

    #[test]
    fn missing_and_corrupt_files_are_reported() {
        let err = StandardScaler::load(Path::new("/nonexistent/scaler.toml")).unwrap_err();
        assert!(matches!(err, ArtifactError::Read { kind: "scaler", .. }));

        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "feature_names = [\"A\"\nmean = ").unwrap();
        let err = StandardScaler::load(file.path()).unwrap_err();
        assert!(matches!(err, ArtifactError::Parse { .. }));
    }

    #[test]
    fn zero_scale_is_rejected_on_load() {
        let file = NamedTempFile::new().unwrap();
        StandardScaler {
            feature_names: names(1),
            mean: vec![0.0],
            scale: vec![0.0],
        }
        .save(file.path())
        .unwrap();
        assert!(matches!(
            StandardScaler::load(file.path()),
            Err(ArtifactError::Invalid { kind: "scaler", .. })
        ));
    }
}
