// ========================================================================================
//
//               Gene identifier harmonization and alignment
//
// ========================================================================================
//
// Pretrained components consume a feature vector whose columns are a fixed, ordered
// list of canonical gene identifiers. Everything in this module exists to turn an
// arbitrary input column set into exactly that list: symbol conversion, reindexing
// onto the list with missing placeholders, and the plain keep-list filter.

use crate::types::ExpressionMatrix;
use ahash::{AHashMap, AHashSet};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GeneError {
    #[error("The gene list '{0}' is empty.")]
    EmptyGeneList(String),
    #[error("The gene list '{list}' contains '{gene}' more than once.")]
    DuplicateGene { list: String, gene: String },
    #[error(
        "All {total} genes of '{list}' are missing from the data. Did you set the correct gene identifier type (HGNC or ENSEMBL)?"
    )]
    TotalGeneLoss { list: String, total: usize },
}

/// An ordered, duplicate-free list of canonical gene identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneList {
    name: String,
    genes: Vec<String>,
}

impl GeneList {
    /// `name` labels the list in error messages (usually the file it came from).
    pub fn new(name: impl Into<String>, genes: Vec<String>) -> Result<Self, GeneError> {
        let name = name.into();
        if genes.is_empty() {
            return Err(GeneError::EmptyGeneList(name));
        }
        let mut seen = AHashSet::with_capacity(genes.len());
        for gene in &genes {
            if !seen.insert(gene.as_str()) {
                return Err(GeneError::DuplicateGene {
                    list: name,
                    gene: gene.clone(),
                });
            }
        }
        Ok(Self { name, genes })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }
}

/// Symbol -> canonical identifier lookup.
///
/// A symbol listed several times keeps the canonical identifier of its first entry in
/// table order. The choice is arbitrary; it is kept so predictions stay comparable with
/// artifacts trained against the same table.
#[derive(Debug, Clone, Default)]
pub struct GeneConversionTable {
    symbol_to_canonical: AHashMap<String, String>,
}

impl GeneConversionTable {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut symbol_to_canonical = AHashMap::new();
        for (symbol, canonical) in pairs {
            symbol_to_canonical.entry(symbol).or_insert(canonical);
        }
        Self {
            symbol_to_canonical,
        }
    }

    pub fn canonical(&self, symbol: &str) -> Option<&str> {
        self.symbol_to_canonical.get(symbol).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.symbol_to_canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbol_to_canonical.is_empty()
    }
}

/// Renames symbol columns to canonical identifiers.
///
/// Columns whose symbol is not in the table are dropped. When two columns resolve to the
/// same canonical identifier the first one in matrix order wins.
pub fn convert_to_canonical(
    matrix: &ExpressionMatrix,
    table: &GeneConversionTable,
) -> ExpressionMatrix {
    let mut picks = Vec::with_capacity(matrix.n_genes());
    let mut renamed = Vec::with_capacity(matrix.n_genes());
    let mut taken = AHashSet::with_capacity(matrix.n_genes());
    let mut unknown = 0usize;
    let mut collisions = 0usize;

    for (idx, symbol) in matrix.genes().iter().enumerate() {
        let Some(canonical) = table.canonical(symbol) else {
            unknown += 1;
            continue;
        };
        if !taken.insert(canonical) {
            collisions += 1;
            continue;
        }
        picks.push(Some(idx));
        renamed.push(canonical.to_string());
    }

    log::info!(
        "Converted {} of {} gene symbols to canonical identifiers ({} not in the conversion table, {} duplicates dropped)",
        renamed.len(),
        matrix.n_genes(),
        unknown,
        collisions
    );

    matrix.with_columns(&picks, renamed)
}

/// The result of reindexing a matrix onto a gene list.
#[derive(Debug, Clone)]
pub struct Alignment {
    pub matrix: ExpressionMatrix,
    /// Genes of the list with no observed value in the aligned matrix, in list order.
    pub missing: Vec<String>,
}

/// Reindexes the columns onto `list`: same genes, same order, no duplicates.
///
/// Genes absent from the input become entirely missing columns; input genes outside the
/// list are dropped. A gene repeated in the input contributes its first column.
pub fn reindex_to_gene_list(matrix: &ExpressionMatrix, list: &GeneList) -> ExpressionMatrix {
    let mut first_position: AHashMap<&str, usize> = AHashMap::with_capacity(matrix.n_genes());
    for (idx, gene) in matrix.genes().iter().enumerate() {
        first_position.entry(gene.as_str()).or_insert(idx);
    }

    let picks: Vec<Option<usize>> = list
        .genes()
        .iter()
        .map(|gene| first_position.get(gene.as_str()).copied())
        .collect();
    matrix.with_columns(&picks, list.genes().to_vec())
}

/// `reindex_to_gene_list`, reporting which genes ended up without data.
///
/// Fails with `TotalGeneLoss` when no gene of the list carries a single observed value,
/// since imputing a fully empty matrix would only return training means.
pub fn align_to_gene_list(
    matrix: &ExpressionMatrix,
    list: &GeneList,
) -> Result<Alignment, GeneError> {
    let aligned = reindex_to_gene_list(matrix, list);

    let missing: Vec<String> = aligned
        .fully_missing_columns()
        .into_iter()
        .map(|idx| list.genes()[idx].clone())
        .collect();

    if missing.len() == list.len() {
        return Err(GeneError::TotalGeneLoss {
            list: list.name().to_string(),
            total: list.len(),
        });
    }

    log::info!(
        "Aligned data onto {} genes of '{}' ({} missing)",
        list.len(),
        list.name(),
        missing.len()
    );
    log::debug!("Missing genes: {:?}", missing);

    Ok(Alignment {
        matrix: aligned,
        missing,
    })
}

/// Keeps only columns named in `keep`, in their current matrix order.
pub fn keep_columns(matrix: &ExpressionMatrix, keep: &GeneList) -> ExpressionMatrix {
    let wanted: AHashSet<&str> = keep.genes().iter().map(String::as_str).collect();
    let (picks, genes): (Vec<Option<usize>>, Vec<String>) = matrix
        .genes()
        .iter()
        .enumerate()
        .filter(|(_, gene)| wanted.contains(gene.as_str()))
        .map(|(idx, gene)| (Some(idx), gene.clone()))
        .unzip();
    matrix.with_columns(&picks, genes)
}
