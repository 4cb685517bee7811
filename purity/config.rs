//! Resource layout and tunables.
//!
//! Defaults reproduce the layout of the published resource bundle (`data/` for gene
//! tables, `models/pancancer/` for artifacts). Any field can be overridden from a TOML
//! file; relative paths are resolved against the resources directory given on the
//! command line.

use crate::rank::{RankMethod, RankMode};
use crate::types::RunMode;
use crate::variance::VarianceFilter;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse configuration file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Gene list and artifact files for one run mode.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PanelFiles {
    /// Ordered gene list the artifacts were fitted on.
    pub gene_list: PathBuf,
    pub imputer: PathBuf,
    pub scaler: PathBuf,
    pub model: PathBuf,
}

impl PanelFiles {
    fn resolve_against(&mut self, base: &Path) {
        for path in [
            &mut self.gene_list,
            &mut self.imputer,
            &mut self.scaler,
            &mut self.model,
        ] {
            *path = base.join(&*path);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RankSettings {
    pub mode: RankMode,
    pub method: RankMethod,
}

impl Default for RankSettings {
    fn default() -> Self {
        Self {
            mode: RankMode::Log,
            method: RankMethod::Max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceConfig {
    /// Symbol -> canonical identifier table, needed only for HGNC input.
    pub conversion_table: PathBuf,
    /// Panel the input is aligned to before ranking.
    pub reference_genes: PathBuf,
    pub rank: RankSettings,
    pub variance: VarianceFilter,
    pub puree_genes: PanelFiles,
    pub significant_genes: PanelFiles,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            conversion_table: PathBuf::from("data/ENSG_ENST_HGNC_conversion_table.csv"),
            reference_genes: PathBuf::from("data/significantly_expressed_genes.csv"),
            rank: RankSettings::default(),
            variance: VarianceFilter::default(),
            puree_genes: PanelFiles {
                gene_list: PathBuf::from("data/selected_genes.csv"),
                imputer: PathBuf::from("models/pancancer/imputer_170.toml"),
                scaler: PathBuf::from("models/pancancer/standard_scaler_pancancer_log-rt_170.toml"),
                model: PathBuf::from("models/pancancer/Lasso_log-rt_170.toml"),
            },
            significant_genes: PanelFiles {
                gene_list: PathBuf::from("data/significantly_expressed_genes.csv"),
                imputer: PathBuf::from("models/pancancer/imputer_10000.toml"),
                scaler: PathBuf::from(
                    "models/pancancer/standard_scaler_pancancer_log-rt_10000.toml",
                ),
                model: PathBuf::from("models/pancancer/Lasso_log-rt_10000.toml"),
            },
        }
    }
}

impl ResourceConfig {
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text, &path.display().to_string())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let variance = &self.variance;
        if !(variance.threshold.is_finite() && variance.threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "variance.threshold must be a positive number, got {}",
                variance.threshold
            )));
        }
        if !(variance.multiplier.is_finite() && variance.multiplier > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "variance.multiplier must be a positive number, got {}",
                variance.multiplier
            )));
        }
        Ok(())
    }

    /// Makes every relative path relative to `base`. Absolute paths are kept.
    pub fn resolve_against(mut self, base: &Path) -> Self {
        self.conversion_table = base.join(&self.conversion_table);
        self.reference_genes = base.join(&self.reference_genes);
        self.puree_genes.resolve_against(base);
        self.significant_genes.resolve_against(base);
        self
    }

    pub fn panel(&self, mode: RunMode) -> &PanelFiles {
        match mode {
            RunMode::PureeGenes => &self.puree_genes,
            RunMode::SignificantGenes => &self.significant_genes,
        }
    }
}
