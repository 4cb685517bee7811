// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use clap::ValueEnum;
use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Naming scheme of the gene labels in an input matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum GeneIdScheme {
    /// Common gene symbols, converted to canonical identifiers before alignment.
    #[serde(rename = "HGNC")]
    #[value(name = "HGNC")]
    Hgnc,
    /// Canonical stable identifiers, used as-is.
    #[serde(rename = "ENSEMBL")]
    #[value(name = "ENSEMBL")]
    Ensembl,
}

impl fmt::Display for GeneIdScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneIdScheme::Hgnc => write!(f, "HGNC"),
            GeneIdScheme::Ensembl => write!(f, "ENSEMBL"),
        }
    }
}

/// Selects which gene panel and artifact set drive the prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum RunMode {
    /// The reduced panel the published model was trained on.
    #[serde(rename = "PUREE_genes")]
    #[value(name = "PUREE_genes")]
    PureeGenes,
    /// The full panel of significantly expressed genes.
    #[serde(rename = "10000_significant_genes")]
    #[value(name = "10000_significant_genes")]
    SignificantGenes,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::PureeGenes => write!(f, "PUREE_genes"),
            RunMode::SignificantGenes => write!(f, "10000_significant_genes"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MatrixError {
    #[error(
        "Matrix values have shape {rows}x{cols}, but {samples} sample labels and {genes} gene labels were supplied."
    )]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        samples: usize,
        genes: usize,
    },
    #[error("Sample identifier '{0}' occurs more than once in the expression matrix.")]
    DuplicateSample(String),
}

/// A samples x genes expression table. Missing values are stored as `NaN`.
///
/// Labels are not checked for uniqueness on construction because a raw file may still
/// be gene-major. Once oriented, row labels must be unique (`check_unique_samples`);
/// column labels may repeat until alignment onto a gene list removes duplicates.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionMatrix {
    samples: Vec<String>,
    genes: Vec<String>,
    values: Array2<f64>,
}

impl ExpressionMatrix {
    pub fn new(
        samples: Vec<String>,
        genes: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, MatrixError> {
        let (rows, cols) = values.dim();
        if rows != samples.len() || cols != genes.len() {
            return Err(MatrixError::ShapeMismatch {
                rows,
                cols,
                samples: samples.len(),
                genes: genes.len(),
            });
        }
        Ok(Self {
            samples,
            genes,
            values,
        })
    }

    pub fn check_unique_samples(&self) -> Result<(), MatrixError> {
        let mut seen = ahash::AHashSet::with_capacity(self.samples.len());
        for sample in &self.samples {
            if !seen.insert(sample.as_str()) {
                return Err(MatrixError::DuplicateSample(sample.clone()));
            }
        }
        Ok(())
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn values_mut(&mut self) -> ArrayViewMut2<'_, f64> {
        self.values.view_mut()
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }

    /// Swaps the roles of rows and columns. The row labels become gene labels.
    pub fn transposed(self) -> Self {
        let values = self.values.reversed_axes().as_standard_layout().into_owned();
        Self {
            samples: self.genes,
            genes: self.samples,
            values,
        }
    }

    /// Builds a new matrix whose column `j` is a copy of source column `picks[j]`,
    /// or entirely missing when `picks[j]` is `None`.
    pub(crate) fn with_columns(&self, picks: &[Option<usize>], genes: Vec<String>) -> Self {
        debug_assert_eq!(picks.len(), genes.len());
        let mut values = Array2::from_elem((self.n_samples(), picks.len()), f64::NAN);
        for (target, pick) in picks.iter().enumerate() {
            if let Some(source) = pick {
                values
                    .column_mut(target)
                    .assign(&self.values.column(*source));
            }
        }
        Self {
            samples: self.samples.clone(),
            genes,
            values,
        }
    }

    /// Replaces the values, keeping labels. The new array must have the same shape.
    pub(crate) fn replace_values(&mut self, values: Array2<f64>) -> Result<(), MatrixError> {
        if values.dim() != self.values.dim() {
            let (rows, cols) = values.dim();
            return Err(MatrixError::ShapeMismatch {
                rows,
                cols,
                samples: self.samples.len(),
                genes: self.genes.len(),
            });
        }
        self.values = values;
        Ok(())
    }

    /// Indices of columns that hold no observed value.
    pub fn fully_missing_columns(&self) -> Vec<usize> {
        self.values
            .axis_iter(Axis(1))
            .enumerate()
            .filter(|(_, column)| column.iter().all(|v| v.is_nan()))
            .map(|(idx, _)| idx)
            .collect()
    }
}

/// Clipped purity estimates, one per sample, in input sample order.
#[derive(Debug, Clone, PartialEq)]
pub struct PurityEstimates {
    pub samples: Vec<String>,
    pub purity: Array1<f64>,
}

impl PurityEstimates {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, sample: &str) -> Option<f64> {
        self.samples
            .iter()
            .position(|s| s == sample)
            .map(|idx| self.purity[idx])
    }
}

/// Clamps every value into the closed unit interval. Linear models can leave it.
pub fn clip_unit_interval(values: &mut Array1<f64>) {
    values.mapv_inplace(|v| v.clamp(0.0, 1.0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn labels(prefix: &str, n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn new_rejects_mismatched_labels() {
        let err = ExpressionMatrix::new(labels("S", 2), labels("G", 2), Array2::zeros((2, 3)))
            .unwrap_err();
        assert_eq!(
            err,
            MatrixError::ShapeMismatch {
                rows: 2,
                cols: 3,
                samples: 2,
                genes: 2
            }
        );
    }

    #[test]
    fn duplicate_samples_are_reported() {
        let samples = vec!["S1".to_string(), "S1".to_string()];
        let matrix = ExpressionMatrix::new(samples, labels("G", 1), Array2::zeros((2, 1))).unwrap();
        let err = matrix.check_unique_samples().unwrap_err();
        assert_eq!(err, MatrixError::DuplicateSample("S1".to_string()));
    }

    #[test]
    fn transposed_swaps_labels_and_values() {
        let matrix = ExpressionMatrix::new(
            labels("G", 3),
            labels("S", 2),
            array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]],
        )
        .unwrap()
        .transposed();

        assert_eq!(matrix.samples(), &labels("S", 2)[..]);
        assert_eq!(matrix.genes(), &labels("G", 3)[..]);
        assert_eq!(matrix.values(), array![[1.0, 3.0, 5.0], [2.0, 4.0, 6.0]]);
    }

    #[test]
    fn clipping_bounds_predictions() {
        let mut values = array![-0.1, 1.2, 0.73, 0.5, 0.0, 1.0];
        clip_unit_interval(&mut values);
        assert_eq!(values, array![0.0, 1.0, 0.73, 0.5, 0.0, 1.0]);
    }

    #[test]
    fn fully_missing_columns_reports_empty_genes() {
        let matrix = ExpressionMatrix::new(
            labels("S", 2),
            labels("G", 3),
            array![[1.0, f64::NAN, f64::NAN], [2.0, f64::NAN, 3.0]],
        )
        .unwrap();
        assert_eq!(matrix.fully_missing_columns(), vec![1]);
    }

    #[test]
    fn run_mode_and_scheme_display_external_names() {
        assert_eq!(RunMode::PureeGenes.to_string(), "PUREE_genes");
        assert_eq!(
            RunMode::SignificantGenes.to_string(),
            "10000_significant_genes"
        );
        assert_eq!(GeneIdScheme::Hgnc.to_string(), "HGNC");
        assert_eq!(GeneIdScheme::Ensembl.to_string(), "ENSEMBL");
    }
}
