//! Within-sample rank normalization.
//!
//! Raw expression values depend on sequencing depth and quantification pipeline; their
//! order within a sample does not. Each sample's values are replaced by their percentile
//! rank among that sample's observed values, optionally on a log2 scale.

use crate::types::ExpressionMatrix;
use ndarray::parallel::prelude::*;
use ndarray::{ArrayViewMut1, Axis};
use serde::{Deserialize, Serialize};

/// How tied values share ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankMethod {
    /// Mean of the positions the tie group occupies.
    Average,
    /// Lowest position of the tie group.
    Min,
    /// Highest position of the tie group.
    Max,
}

/// Scale of the emitted percentile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankMode {
    /// Rank fraction in (0, 1].
    Linear,
    /// log2 of the rank fraction, in (-inf, 0].
    Log,
}

/// Rank-normalizes every sample in place. Missing values stay missing and do not count
/// towards the denominator of the percentile.
pub fn rank_normalize(matrix: &mut ExpressionMatrix, mode: RankMode, method: RankMethod) {
    matrix
        .values_mut()
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|row| rank_row(row, mode, method));
}

fn rank_row(mut row: ArrayViewMut1<f64>, mode: RankMode, method: RankMethod) {
    let mut observed: Vec<(f64, usize)> = row
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .map(|(idx, &v)| (v, idx))
        .collect();
    let n = observed.len();
    if n == 0 {
        return;
    }
    observed.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total = n as f64;
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && observed[end].0 == observed[start].0 {
            end += 1;
        }
        // Positions start+1..=end (1-based) share one rank.
        let rank = match method {
            RankMethod::Average => (start + 1 + end) as f64 / 2.0,
            RankMethod::Min => (start + 1) as f64,
            RankMethod::Max => end as f64,
        };
        let fraction = rank / total;
        let value = match mode {
            RankMode::Linear => fraction,
            RankMode::Log => fraction.log2(),
        };
        for &(_, idx) in &observed[start..end] {
            row[idx] = value;
        }
        start = end;
    }
}
