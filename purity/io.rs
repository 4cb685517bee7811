//! # Table Loading and Result Writing
//!
//! Entry point for every user- or bundle-provided table: the expression matrix, the
//! gene identifier conversion table and the gene lists. Reading goes through the
//! `polars` CSV and Parquet readers; results are written with the `csv` crate.
//!
//! - Matrix files: `.csv`, `.tsv` or `.parquet`. One column holds the row labels (see
//!   `index_column`), every other column is numeric. Orientation is not decided here.
//! - Gene tables: CSV files with fixed column names (`HGNC`, `ENSEMBL_ID`).

use crate::genes::{GeneConversionTable, GeneError, GeneList};
use crate::types::{ExpressionMatrix, MatrixError, PurityEstimates};
use ndarray::Array2;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Column holding canonical identifiers in the conversion table and gene lists.
pub const CANONICAL_ID_COLUMN: &str = "ENSEMBL_ID";
/// Column holding gene symbols in the conversion table.
pub const SYMBOL_COLUMN: &str = "HGNC";
/// Column name pandas gives an unnamed index when writing Parquet.
const PANDAS_INDEX_COLUMN: &str = "__index_level_0__";
/// Cell contents read as missing values.
const MISSING_MARKERS: [&str; 6] = ["NA", "NaN", "nan", "N/A", "null", ""];

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Error writing tab-separated output: {0}")]
    CsvError(#[from] ::csv::Error),
    #[error(
        "Unsupported data format for '{0}'. The input matrix has to be .csv, .tsv or .parquet."
    )]
    UnsupportedFormat(String),
    #[error(
        "The required column '{column}' was not found in '{path}'. Please check spelling and case."
    )]
    ColumnNotFound { path: String, column: String },
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("'{0}' has no value columns besides the row labels.")]
    NoValueColumns(String),
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error(transparent)]
    Genes(#[from] GeneError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixFormat {
    Csv,
    Tsv,
    Parquet,
}

impl MatrixFormat {
    /// Picks the reader from the file extension.
    pub fn from_path(path: &Path) -> Result<Self, DataError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("csv") => Ok(MatrixFormat::Csv),
            Some("tsv") => Ok(MatrixFormat::Tsv),
            Some("parquet") => Ok(MatrixFormat::Parquet),
            _ => Err(DataError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

fn csv_options(separator: u8, null_values: Option<NullValues>) -> CsvReadOptions {
    CsvReadOptions::default()
        .with_has_header(true)
        .with_parse_options(
            CsvParseOptions::default()
                .with_separator(separator)
                .with_null_values(null_values),
        )
}

/// Reads a gene table, treating the missing markers as nulls.
fn read_delimited(path: &Path, separator: u8) -> Result<DataFrame, DataError> {
    let null_values = NullValues::AllColumns(MISSING_MARKERS.iter().map(|m| (*m).into()).collect());
    let df = CsvReader::new(File::open(path)?)
        .with_options(csv_options(separator, Some(null_values)).with_infer_schema_length(None))
        .finish()?;
    Ok(df)
}

/// Reads every column as text, so row labels come through verbatim and missing markers
/// are only interpreted in value columns.
fn read_delimited_as_text(path: &Path, separator: u8) -> Result<DataFrame, DataError> {
    let df = CsvReader::new(File::open(path)?)
        .with_options(csv_options(separator, None).with_infer_schema_length(Some(0)))
        .finish()?;
    Ok(df)
}

fn read_frame(path: &Path, format: MatrixFormat) -> Result<DataFrame, DataError> {
    match format {
        MatrixFormat::Csv => read_delimited_as_text(path, b','),
        MatrixFormat::Tsv => read_delimited_as_text(path, b'\t'),
        MatrixFormat::Parquet => Ok(ParquetReader::new(File::open(path)?).finish()?),
    }
}

/// Picks the row label column.
///
/// Delimited files keep labels in the first column. Parquet files written from a data
/// frame store an unnamed index as `__index_level_0__` and a named index as an extra
/// text column after the values, so the only text column is taken when there is one.
fn index_column(df: &DataFrame, format: MatrixFormat) -> Option<String> {
    let columns = df.get_columns();
    if format == MatrixFormat::Parquet {
        if let Some(column) = columns
            .iter()
            .find(|c| c.name().as_str() == PANDAS_INDEX_COLUMN)
        {
            return Some(column.name().to_string());
        }
        let text: Vec<&Column> = columns
            .iter()
            .filter(|c| c.dtype() == &DataType::String)
            .collect();
        if let [only] = text.as_slice() {
            return Some(only.name().to_string());
        }
    }
    columns.first().map(|c| c.name().to_string())
}

/// Reads a column as strings, numbering missing labels from 1.
fn label_column(df: &DataFrame, name: &str) -> Result<Vec<String>, DataError> {
    let labels = df.column(name)?.cast(&DataType::String)?;
    let labels = labels.str()?;
    Ok(labels
        .into_iter()
        .enumerate()
        .map(|(i, label)| match label {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => (i + 1).to_string(),
        })
        .collect())
}

fn wrong_type(column: &Column, found: String) -> DataError {
    DataError::ColumnWrongType {
        column_name: column.name().to_string(),
        expected_type: "f64 (numeric)",
        found_type: found,
    }
}

/// Converts one value column to `f64`, with `NaN` for missing cells.
fn numeric_values(column: &Column) -> Result<Vec<f64>, DataError> {
    if column.dtype() == &DataType::String {
        return column
            .str()?
            .into_iter()
            .map(|cell| match cell.map(str::trim) {
                None => Ok(f64::NAN),
                Some(text) if MISSING_MARKERS.contains(&text) => Ok(f64::NAN),
                Some(text) => text
                    .parse::<f64>()
                    .map_err(|_| wrong_type(column, format!("String (e.g. '{text}')"))),
            })
            .collect();
    }
    let casted = column.cast(&DataType::Float64)?;
    // Values that do not convert turn into extra nulls.
    if casted.null_count() > column.null_count() {
        return Err(wrong_type(column, format!("{:?}", column.dtype())));
    }
    Ok(casted
        .f64()?
        .into_iter()
        .map(|value| value.unwrap_or(f64::NAN))
        .collect())
}

/// Loads an expression matrix exactly as laid out in the file: row labels from the
/// label column, column labels from the header.
pub fn load_expression_matrix(path: &Path) -> Result<ExpressionMatrix, DataError> {
    let format = MatrixFormat::from_path(path)?;
    log::info!("Reading data from '{}'", path.display());
    let df = read_frame(path, format)?;
    if df.width() < 2 {
        return Err(DataError::NoValueColumns(path.display().to_string()));
    }
    let index_name = index_column(&df, format)
        .ok_or_else(|| DataError::NoValueColumns(path.display().to_string()))?;

    let row_labels = label_column(&df, &index_name)?;
    let value_frame = df.drop(&index_name)?;
    let column_labels: Vec<String> = value_frame
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();

    let mut values = Array2::from_elem((row_labels.len(), column_labels.len()), f64::NAN);
    for (j, column) in value_frame.get_columns().iter().enumerate() {
        for (i, value) in numeric_values(column)?.into_iter().enumerate() {
            values[[i, j]] = value;
        }
    }

    log::info!(
        "Loaded a {} x {} matrix from '{}'",
        row_labels.len(),
        column_labels.len(),
        path.display()
    );
    Ok(ExpressionMatrix::new(row_labels, column_labels, values)?)
}

fn load_csv_table(path: &Path, required: &[&str]) -> Result<DataFrame, DataError> {
    let df = read_delimited(path, b',')?;
    for column in required {
        if !df.get_column_names().iter().any(|name| name.as_str() == *column) {
            return Err(DataError::ColumnNotFound {
                path: path.display().to_string(),
                column: column.to_string(),
            });
        }
    }
    Ok(df)
}

fn string_values(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, DataError> {
    let column = df.column(name)?.cast(&DataType::String)?;
    Ok(column
        .str()?
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect())
}

/// Loads the symbol -> canonical identifier table. Rows with either side missing are
/// skipped.
pub fn load_conversion_table(path: &Path) -> Result<GeneConversionTable, DataError> {
    let df = load_csv_table(path, &[SYMBOL_COLUMN, CANONICAL_ID_COLUMN])?;
    let symbols = string_values(&df, SYMBOL_COLUMN)?;
    let canonical = string_values(&df, CANONICAL_ID_COLUMN)?;
    let table = GeneConversionTable::from_pairs(
        symbols
            .into_iter()
            .zip(canonical)
            .filter_map(|(symbol, id)| Some((symbol?, id?))),
    );
    log::info!(
        "Loaded {} gene symbols from '{}'",
        table.len(),
        path.display()
    );
    Ok(table)
}

/// Loads an ordered gene list from the `ENSEMBL_ID` column.
pub fn load_gene_list(path: &Path) -> Result<GeneList, DataError> {
    let df = load_csv_table(path, &[CANONICAL_ID_COLUMN])?;
    let genes: Vec<String> = string_values(&df, CANONICAL_ID_COLUMN)?
        .into_iter()
        .flatten()
        .collect();
    Ok(GeneList::new(path.display().to_string(), genes)?)
}

/// Writes `sample_id<TAB>purity` rows in sample order.
pub fn write_purities(path: &Path, estimates: &PurityEstimates) -> Result<(), DataError> {
    let mut writer = ::csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    writer.write_record(["sample_id", "purity"])?;
    for (sample, purity) in estimates.samples.iter().zip(estimates.purity.iter()) {
        writer.write_record([sample.as_str(), &purity.to_string()])?;
    }
    writer.flush()?;
    log::info!(
        "Saved {} purity estimates to '{}'",
        estimates.len(),
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn format_is_taken_from_the_extension() {
        assert_eq!(
            MatrixFormat::from_path(Path::new("a/b.csv")).unwrap(),
            MatrixFormat::Csv
        );
        assert_eq!(
            MatrixFormat::from_path(Path::new("b.TSV")).unwrap(),
            MatrixFormat::Tsv
        );
        assert_eq!(
            MatrixFormat::from_path(Path::new("b.parquet")).unwrap(),
            MatrixFormat::Parquet
        );
        assert!(matches!(
            MatrixFormat::from_path(Path::new("b.xlsx")),
            Err(DataError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            MatrixFormat::from_path(Path::new("no_extension")),
            Err(DataError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn unsupported_matrix_is_rejected_before_reading() {
        let err = load_expression_matrix(Path::new("/nonexistent/matrix.txt")).unwrap_err();
        assert!(matches!(err, DataError::UnsupportedFormat(_)));
    }

    #[test]
    fn tsv_matrix_loads_with_missing_markers() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "expr.tsv",
            "sample\tENSG1\tENSG2\tENSG3\nS1\t1.5\tNA\t3\nS2\t0\t2.25\t\n",
        );
        let matrix = load_expression_matrix(&path).unwrap();
        assert_eq!(matrix.samples(), &["S1".to_string(), "S2".to_string()]);
        assert_eq!(
            matrix.genes(),
            &["ENSG1".to_string(), "ENSG2".to_string(), "ENSG3".to_string()]
        );
        let values = matrix.values();
        assert_abs_diff_eq!(values[[0, 0]], 1.5, epsilon = 1e-12);
        assert!(values[[0, 1]].is_nan());
        assert_abs_diff_eq!(values[[0, 2]], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(values[[1, 1]], 2.25, epsilon = 1e-12);
        assert!(values[[1, 2]].is_nan());
    }

    #[test]
    fn csv_matrix_with_numeric_labels_loads() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "expr.csv", "id,G1,G2\n1,1,2\n2,3,4\n");
        let matrix = load_expression_matrix(&path).unwrap();
        assert_eq!(matrix.samples(), &["1".to_string(), "2".to_string()]);
        assert_eq!(matrix.values(), array![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn non_numeric_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "expr.csv", "id,G1,G2\nS1,1,high\nS2,3,4\n");
        match load_expression_matrix(&path).unwrap_err() {
            DataError::ColumnWrongType { column_name, .. } => assert_eq!(column_name, "G2"),
            other => panic!("Expected ColumnWrongType, got {other:?}"),
        }
    }

    #[test]
    fn labels_that_look_missing_are_kept_verbatim() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "expr.csv", "id,G1,G2\nNA,1,null\nnull,NA,4\n,5,6\n");
        let matrix = load_expression_matrix(&path).unwrap();
        assert_eq!(
            matrix.samples(),
            &["NA".to_string(), "null".to_string(), "3".to_string()]
        );
        let values = matrix.values();
        assert!(values[[0, 1]].is_nan());
        assert!(values[[1, 0]].is_nan());
        assert_abs_diff_eq!(values[[2, 1]], 6.0, epsilon = 1e-12);
    }

    #[test]
    fn parquet_named_index_supplies_row_labels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("expr.parquet");
        let mut df = df![
            "ENSG01" => [1.0, 2.0],
            "ENSG02" => [Some(3.0), None],
            "sample" => ["S1", "S2"],
        ]
        .unwrap();
        ParquetWriter::new(File::create(&path).unwrap())
            .finish(&mut df)
            .unwrap();

        let matrix = load_expression_matrix(&path).unwrap();
        assert_eq!(matrix.samples(), &["S1".to_string(), "S2".to_string()]);
        assert_eq!(matrix.genes(), &["ENSG01".to_string(), "ENSG02".to_string()]);
        assert_abs_diff_eq!(matrix.values()[[1, 0]], 2.0, epsilon = 1e-12);
        assert!(matrix.values()[[1, 1]].is_nan());
    }

    #[test]
    fn parquet_unnamed_index_column_supplies_row_labels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("expr.parquet");
        let mut df = df![
            "ENSG01" => [1.0, 2.0],
            "__index_level_0__" => [10i64, 11],
        ]
        .unwrap();
        ParquetWriter::new(File::create(&path).unwrap())
            .finish(&mut df)
            .unwrap();

        let matrix = load_expression_matrix(&path).unwrap();
        assert_eq!(matrix.samples(), &["10".to_string(), "11".to_string()]);
        assert_eq!(matrix.genes(), &["ENSG01".to_string()]);
    }

    #[test]
    fn label_only_files_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "expr.csv", "id\nS1\nS2\n");
        assert!(matches!(
            load_expression_matrix(&path),
            Err(DataError::NoValueColumns(_))
        ));
    }

    #[test]
    fn conversion_table_and_gene_list_load() {
        let dir = TempDir::new().unwrap();
        let table_path = write_file(
            &dir,
            "conversion.csv",
            ",ENSEMBL_ID,ENST,HGNC\n0,ENSG01,ENST1,TP53\n1,ENSG09,ENST2,TP53\n2,ENSG02,ENST3,KRAS\n3,ENSG03,ENST4,\n",
        );
        let table = load_conversion_table(&table_path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.canonical("TP53"), Some("ENSG01"));
        assert_eq!(table.canonical("KRAS"), Some("ENSG02"));

        let list_path = write_file(&dir, "genes.csv", "ENSEMBL_ID\nENSG02\nENSG01\n");
        let list = load_gene_list(&list_path).unwrap();
        assert_eq!(list.genes(), &["ENSG02".to_string(), "ENSG01".to_string()]);
    }

    #[test]
    fn gene_list_without_required_column_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "genes.csv", "gene\nENSG02\n");
        match load_gene_list(&path).unwrap_err() {
            DataError::ColumnNotFound { column, .. } => assert_eq!(column, "ENSEMBL_ID"),
            other => panic!("Expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn purities_are_written_as_tsv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("purity.tsv");
        let estimates = PurityEstimates {
            samples: vec!["S1".to_string(), "S2".to_string()],
            purity: array![0.5, 0.0],
        };
        write_purities(&path, &estimates).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "sample_id\tpurity\nS1\t0.5\nS2\t0\n");
    }
}
