//! Local side of the hosted prediction service.
//!
//! The service accepts a tab-separated expression table, runs the same pipeline remotely
//! and returns a `sample<TAB>purity` table. Transport is not implemented here: callers
//! provide a `PurityService`. This module prepares uploads (sample names replaced by
//! `Sample_1..n` aliases, written as TSV into a caller-owned working directory) and turns
//! service output back into `PurityEstimates` under the original sample names.

use crate::types::{GeneIdScheme, PurityEstimates, RunMode};
use ahash::AHashMap;
use ndarray::Array1;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefixes that mark a sample name as already anonymized.
const ALIAS_PREFIXES: [&str; 2] = ["sample", "Sample"];

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error reading or writing a delimited table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Not a compatible file: '{0}'. Please upload a .txt, .tsv or .csv file.")]
    UnsupportedFormat(String),
    #[error("The table '{0}' has no data rows.")]
    EmptyTable(String),
    #[error("The service reported an error: {0}")]
    Service(String),
    #[error("Could not parse the service output: {0}")]
    MalformedOutput(String),
    #[error("The service returned sample '{0}', which was not part of the upload.")]
    UnknownAlias(String),
    #[error("Invalid sample alias table: {0}")]
    AliasFile(String),
}

/// Identifier the service hands out for an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubmissionId(pub String);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionStatus {
    /// Still being processed.
    Pending,
    Ready,
}

/// Operations of the hosted service. Retries and timeouts belong to implementors.
pub trait PurityService {
    fn submit(
        &self,
        upload: &Path,
        scheme: GeneIdScheme,
        mode: RunMode,
    ) -> Result<SubmissionId, RemoteError>;
    fn poll(&self, id: &SubmissionId) -> Result<SubmissionStatus, RemoteError>;
    /// Raw `sample<TAB>purity` output of a finished submission.
    fn fetch(&self, id: &SubmissionId) -> Result<String, RemoteError>;
    fn logs(&self, id: &SubmissionId) -> Result<String, RemoteError>;
}

/// Alias -> original sample name, in upload order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleAliases {
    pairs: Vec<(String, String)>,
    index: AHashMap<String, usize>,
}

impl SampleAliases {
    fn from_pairs(pairs: Vec<(String, String)>) -> Result<Self, RemoteError> {
        let mut index = AHashMap::with_capacity(pairs.len());
        for (position, (alias, _)) in pairs.iter().enumerate() {
            if index.insert(alias.clone(), position).is_some() {
                return Err(RemoteError::AliasFile(format!(
                    "alias '{alias}' is listed more than once"
                )));
            }
        }
        Ok(Self { pairs, index })
    }

    /// Assigns `Sample_1..n` to `names` in order.
    fn assign(names: &[String]) -> (Self, Vec<String>) {
        let aliases: Vec<String> = (1..=names.len()).map(|i| format!("Sample_{i}")).collect();
        let pairs = aliases.iter().cloned().zip(names.iter().cloned()).collect();
        let index = aliases
            .iter()
            .enumerate()
            .map(|(position, alias)| (alias.clone(), position))
            .collect();
        (Self { pairs, index }, aliases)
    }

    pub fn original(&self, alias: &str) -> Option<&str> {
        self.index
            .get(alias)
            .map(|&position| self.pairs[position].1.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True when the upload kept its sample names.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Writes `alias<TAB>sample_id` rows in upload order.
    pub fn save(&self, path: &Path) -> Result<(), RemoteError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;
        writer.write_record(["alias", "sample_id"])?;
        for (alias, original) in &self.pairs {
            writer.write_record([alias, original])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads a table written by `save`.
    pub fn load(path: &Path) -> Result<Self, RemoteError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path)?;
        let mut pairs = Vec::new();
        for record in reader.records() {
            let record = record?;
            match (record.get(0), record.get(1)) {
                (Some(alias), Some(original)) => {
                    pairs.push((alias.to_string(), original.to_string()))
                }
                _ => {
                    return Err(RemoteError::AliasFile(format!(
                        "'{}' needs two columns per row",
                        path.display()
                    )));
                }
            }
        }
        Self::from_pairs(pairs)
    }
}

#[derive(Debug, Clone)]
pub struct PreparedSubmission {
    /// TSV file to upload.
    pub path: PathBuf,
    pub aliases: SampleAliases,
    /// Saved alias table, written only when names were replaced.
    pub alias_file: Option<PathBuf>,
}

/// Directory that receives prepared uploads.
#[derive(Debug, Clone)]
pub struct SubmissionWorkspace {
    work_dir: PathBuf,
}

impl SubmissionWorkspace {
    /// Creates `work_dir` if it does not exist yet.
    pub fn new(work_dir: impl Into<PathBuf>) -> Result<Self, RemoteError> {
        let work_dir = work_dir.into();
        fs::create_dir_all(&work_dir)?;
        Ok(Self { work_dir })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Writes `input` as TSV into the workspace, replacing sample names by aliases unless
    /// they already look anonymized.
    ///
    /// A table with fewer columns than rows is taken to be gene-major, so its column
    /// headers (after the first) are the sample names. Otherwise the first column is.
    pub fn prepare(&self, input: &Path) -> Result<PreparedSubmission, RemoteError> {
        let display = input.display().to_string();
        let extension = input
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let delimiter = match extension.as_deref() {
            Some("csv") => b',',
            Some("tsv") | Some("txt") => b'\t',
            _ => return Err(RemoteError::UnsupportedFormat(display)),
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_path(input)?;
        let mut header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows: Vec<Vec<String>> = reader
            .records()
            .map(|record| record.map(|r| r.iter().map(str::to_string).collect()))
            .collect::<Result<_, _>>()?;
        if rows.is_empty() {
            return Err(RemoteError::EmptyTable(display));
        }

        let samples_in_header = header.len() < rows.len();
        let names: Vec<String> = if samples_in_header {
            header.iter().skip(1).cloned().collect()
        } else {
            rows.iter()
                .map(|row| row.first().cloned().unwrap_or_default())
                .collect()
        };

        let aliases = if names.iter().all(|name| is_alias(name)) {
            SampleAliases::default()
        } else {
            let (aliases, renamed) = SampleAliases::assign(&names);
            if samples_in_header {
                header.truncate(1);
                header.extend(renamed);
            } else {
                for (row, alias) in rows.iter_mut().zip(renamed) {
                    match row.first_mut() {
                        Some(first) => *first = alias,
                        None => row.push(alias),
                    }
                }
            }
            log::info!(
                "Replaced {} sample names with anonymous aliases",
                aliases.len()
            );
            aliases
        };

        let stem = input
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("upload");
        let path = self.work_dir.join(format!("{stem}.tsv"));
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(&path)?;
        writer.write_record(&header)?;
        for row in &rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        log::info!("Prepared upload '{}'", path.display());

        let alias_file = if aliases.is_empty() {
            None
        } else {
            let alias_path = self.work_dir.join(format!("{stem}.aliases.tsv"));
            aliases.save(&alias_path)?;
            log::info!("Saved sample aliases to '{}'", alias_path.display());
            Some(alias_path)
        };

        Ok(PreparedSubmission {
            path,
            aliases,
            alias_file,
        })
    }
}

fn is_alias(name: &str) -> bool {
    ALIAS_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Parses the service's `sample<TAB>purity` table. The sample column header may be empty.
pub fn parse_service_output(text: &str) -> Result<PurityEstimates, RemoteError> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| RemoteError::MalformedOutput("the output is empty".to_string()))?;
    let purity_column = header
        .split('\t')
        .position(|column| column.trim() == "purity")
        .ok_or_else(|| {
            RemoteError::MalformedOutput(format!("no 'purity' column in header '{header}'"))
        })?;
    if purity_column == 0 {
        return Err(RemoteError::MalformedOutput(
            "the first column must hold sample names".to_string(),
        ));
    }

    let mut samples = Vec::new();
    let mut purity = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        let value = fields.get(purity_column).ok_or_else(|| {
            RemoteError::MalformedOutput(format!("line '{line}' has no purity value"))
        })?;
        let value: f64 = value.trim().parse().map_err(|_| {
            RemoteError::MalformedOutput(format!("'{value}' is not a number"))
        })?;
        samples.push(fields[0].trim().to_string());
        purity.push(value);
    }

    Ok(PurityEstimates {
        samples,
        purity: Array1::from(purity),
    })
}

/// Maps aliased sample names back to the names of the uploaded file.
pub fn restore_sample_names(
    mut estimates: PurityEstimates,
    aliases: &SampleAliases,
) -> Result<PurityEstimates, RemoteError> {
    if aliases.is_empty() {
        return Ok(estimates);
    }
    for sample in estimates.samples.iter_mut() {
        let original = aliases
            .original(sample)
            .ok_or_else(|| RemoteError::UnknownAlias(sample.clone()))?;
        *sample = original.to_string();
    }
    Ok(estimates)
}

/// Output of a finished submission.
#[derive(Debug, Clone)]
pub struct RemoteReport {
    pub estimates: PurityEstimates,
    pub logs: String,
}

/// Checks a submission once. Returns `None` while the service is still working.
pub fn collect<S: PurityService + ?Sized>(
    service: &S,
    id: &SubmissionId,
    aliases: &SampleAliases,
) -> Result<Option<RemoteReport>, RemoteError> {
    match service.poll(id)? {
        SubmissionStatus::Pending => {
            log::debug!("Submission {id} is still pending");
            Ok(None)
        }
        SubmissionStatus::Ready => {
            let estimates = parse_service_output(&service.fetch(id)?)?;
            let estimates = restore_sample_names(estimates, aliases)?;
            let logs = service.logs(id)?;
            Ok(Some(RemoteReport { estimates, logs }))
        }
    }
}
