//! Best-effort detection of gene-major input.
//!
//! Expression matrices arrive either as samples x genes or genes x samples, and the
//! file itself does not say which. The check below only looks at the shape: bulk
//! cohorts have far fewer samples than measured genes, so a matrix that is much taller
//! than it is wide is assumed to carry genes on its rows. Unusual shapes (very large
//! cohorts over small panels, tiny gene panels) can fool it.

use crate::types::ExpressionMatrix;

/// A matrix with more than this many rows per column is treated as gene-major.
pub const GENE_MAJOR_ROW_RATIO: usize = 100;
/// Row count from which a narrow matrix is treated as gene-major...
pub const GENE_MAJOR_MIN_ROWS: usize = 10_000;
/// ...provided it has at most this many columns.
pub const GENE_MAJOR_MAX_COLUMNS: usize = 5_000;

pub fn looks_gene_major(rows: usize, cols: usize) -> bool {
    rows > cols.saturating_mul(GENE_MAJOR_ROW_RATIO)
        || (rows >= GENE_MAJOR_MIN_ROWS && cols <= GENE_MAJOR_MAX_COLUMNS)
}

/// Returns the matrix with samples on its rows, and whether it had to be transposed.
pub fn orient_samples_by_genes(matrix: ExpressionMatrix) -> (ExpressionMatrix, bool) {
    if looks_gene_major(matrix.n_samples(), matrix.n_genes()) {
        log::info!(
            "Looks like genes are supplied as rows instead of columns ({} rows x {} columns), transposing",
            matrix.n_samples(),
            matrix.n_genes()
        );
        (matrix.transposed(), true)
    } else {
        (matrix, false)
    }
}
