//! Column masks applied before imputation.
//!
//! A gene that carries no information (never expressed, or constant across the cohort)
//! or whose standardized spread is far outside anything seen in training is blanked
//! out, so the imputer replaces it instead of feeding it to the model.

use crate::types::ExpressionMatrix;
use itertools::Itertools;
use ndarray::{ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Variance ceiling derived from the training split of the reference cohort.
pub const DEFAULT_VARIANCE_THRESHOLD: f64 = 1.00015;
/// Columns whose variance exceeds `multiplier * threshold` are treated as outliers.
pub const DEFAULT_VARIANCE_MULTIPLIER: f64 = 3.0;

/// Sample variance (one degree of freedom) of the observed values, or `None` when fewer
/// than two values are observed.
pub fn column_variance(column: ArrayView1<f64>) -> Option<f64> {
    let observed: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
    if observed.len() < 2 {
        return None;
    }
    let n = observed.len() as f64;
    let mean = observed.iter().sum::<f64>() / n;
    let sum_sq: f64 = observed.iter().map(|v| (v - mean) * (v - mean)).sum();
    Some(sum_sq / (n - 1.0))
}

fn is_constant(column: ArrayView1<f64>) -> bool {
    let mut observed = column.iter().filter(|v| !v.is_nan());
    let Some(first) = observed.next() else {
        return false;
    };
    let mut count = 1usize;
    for v in observed {
        if v != first {
            return false;
        }
        count += 1;
    }
    count >= 2
}

fn mask_column(matrix: &mut ExpressionMatrix, idx: usize) {
    matrix.values_mut().column_mut(idx).fill(f64::NAN);
}

/// Blanks genes whose observed expression sums to zero across all samples.
/// Returns the number of genes masked.
pub fn mask_unexpressed_genes(matrix: &mut ExpressionMatrix) -> usize {
    let unexpressed: Vec<usize> = matrix
        .values()
        .axis_iter(Axis(1))
        .enumerate()
        .filter(|(_, column)| {
            column.iter().any(|v| !v.is_nan())
                && column.iter().filter(|v| !v.is_nan()).sum::<f64>() == 0.0
        })
        .map(|(idx, _)| idx)
        .collect();
    for &idx in &unexpressed {
        mask_column(matrix, idx);
    }
    if !unexpressed.is_empty() {
        log::info!("Masked {} genes with zero total expression", unexpressed.len());
    }
    unexpressed.len()
}

/// Counts of columns blanked by a `VarianceFilter` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VarianceReport {
    pub constant: usize,
    pub outlier: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarianceFilter {
    pub threshold: f64,
    pub multiplier: f64,
}

impl Default for VarianceFilter {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_VARIANCE_THRESHOLD,
            multiplier: DEFAULT_VARIANCE_MULTIPLIER,
        }
    }
}

impl VarianceFilter {
    pub fn ceiling(&self) -> f64 {
        self.threshold * self.multiplier
    }

    /// Blanks constant columns and columns whose variance exceeds the ceiling.
    /// Columns with fewer than two observed values are left untouched.
    ///
    /// The threshold is a variance of standardized values. When `scale` holds the
    /// per-column divisors of the standardizer, each variance is divided by
    /// `scale[j]^2` before the comparison, so the filter can run ahead of it.
    pub fn apply(
        &self,
        matrix: &mut ExpressionMatrix,
        scale: Option<&[f64]>,
    ) -> VarianceReport {
        let ceiling = self.ceiling();
        let values = matrix.values();
        let verdicts: Vec<Option<bool>> = (0..values.ncols())
            .into_par_iter()
            .map(|idx| {
                let column = values.column(idx);
                let divisor = scale
                    .and_then(|scale| scale.get(idx))
                    .map_or(1.0, |s| s * s);
                if is_constant(column) {
                    Some(true)
                } else if column_variance(column).is_some_and(|var| var / divisor > ceiling) {
                    Some(false)
                } else {
                    None
                }
            })
            .collect();
        let constant: Vec<usize> = verdicts
            .iter()
            .positions(|verdict| *verdict == Some(true))
            .collect();
        let outlier: Vec<usize> = verdicts
            .iter()
            .positions(|verdict| *verdict == Some(false))
            .collect();
        for &idx in constant.iter().chain(outlier.iter()) {
            mask_column(matrix, idx);
        }

        let report = VarianceReport {
            constant: constant.len(),
            outlier: outlier.len(),
        };
        log::info!(
            "Variance filter masked {} constant and {} high-variance genes (ceiling {:.5})",
            report.constant,
            report.outlier,
            ceiling
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn matrix(values: Array2<f64>) -> ExpressionMatrix {
        let samples = (1..=values.nrows()).map(|i| format!("S{i}")).collect();
        let genes = (1..=values.ncols()).map(|j| format!("G{j}")).collect();
        ExpressionMatrix::new(samples, genes, values).unwrap()
    }

    #[test]
    fn variance_uses_one_degree_of_freedom_and_skips_missing() {
        let column = array![1.0, f64::NAN, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(column_variance(column.view()).unwrap(), 5.0 / 3.0, epsilon = 1e-12);
        assert_eq!(column_variance(array![1.0, f64::NAN].view()), None);
    }

    #[test]
    fn constant_columns_become_missing() {
        let mut m = matrix(array![[0.1, 1.0], [0.1, 2.0], [0.1, 1.5]]);
        let report = VarianceFilter::default().apply(&mut m, None);
        assert_eq!(report.constant, 1);
        assert_eq!(report.outlier, 0);
        assert!(m.values().column(0).iter().all(|v| v.is_nan()));
        assert_eq!(m.values().column(1).to_vec(), vec![1.0, 2.0, 1.5]);
    }

    #[test]
    fn high_variance_columns_become_missing() {
        let filter = VarianceFilter {
            threshold: 1.0,
            multiplier: 3.0,
        };
        // Column 0 variance is 8.0, column 1 is 2.0.
        let mut m = matrix(array![[0.0, 0.0], [4.0, 2.0]]);
        let report = filter.apply(&mut m, None);
        assert_eq!(report.outlier, 1);
        assert!(m.values().column(0).iter().all(|v| v.is_nan()));
        assert_eq!(m.values().column(1).to_vec(), vec![0.0, 2.0]);
    }

    #[test]
    fn variance_is_compared_on_the_standardized_scale() {
        // Raw variance 8.0 is above the ceiling, 8.0 / 2.5^2 = 1.28 is not.
        let mut m = matrix(array![[-5.0, 0.0], [-1.0, 10.0]]);
        let report = VarianceFilter::default().apply(&mut m, Some(&[2.5, 1.0][..]));
        assert_eq!(report.outlier, 1);
        assert_eq!(m.values().column(0).to_vec(), vec![-5.0, -1.0]);
        assert!(m.values().column(1).iter().all(|v| v.is_nan()));

        let mut unscaled = matrix(array![[-5.0], [-1.0]]);
        assert_eq!(VarianceFilter::default().apply(&mut unscaled, None).outlier, 1);
    }

    #[test]
    fn single_observation_columns_are_untouched() {
        let mut m = matrix(array![[5.0, f64::NAN], [f64::NAN, 1.0]]);
        let report = VarianceFilter::default().apply(&mut m, None);
        assert_eq!(report, VarianceReport::default());
        assert_eq!(m.values()[[0, 0]], 5.0);
        assert_eq!(m.values()[[1, 1]], 1.0);
    }

    #[test]
    fn unexpressed_genes_are_masked() {
        let mut m = matrix(array![[0.0, 1.0, f64::NAN], [0.0, 0.0, f64::NAN]]);
        assert_eq!(mask_unexpressed_genes(&mut m), 1);
        assert!(m.values().column(0).iter().all(|v| v.is_nan()));
        assert_eq!(m.values().column(1).to_vec(), vec![1.0, 0.0]);
    }
}
