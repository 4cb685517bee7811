// ========================================================================================
//
//                              The purity prediction pipeline
//
// ========================================================================================
//
// A run walks one expression matrix through a fixed sequence of stages:
//
//   Loaded -> Cleaned -> RankNormalized -> GeneFiltered -> VarianceFiltered
//          -> Imputed -> Standardized -> Predicted
//
// Every stage method takes the run by value and hands back the next state, so a matrix
// cannot be processed twice by the same stage. Calling a stage on a run in any other
// state is a `StageOrder` error. The pipeline itself only holds read-only resources and
// can be shared between threads, each owning its own run.

use crate::artifacts::{
    Artifact, ArtifactError, FittedRegressor, FittedTransform, IterativeImputer,
    LinearRegressor, StandardScaler, check_feature_names,
};
use crate::config::{RankSettings, ResourceConfig};
use crate::genes::{
    GeneConversionTable, GeneError, GeneList, align_to_gene_list, convert_to_canonical,
    keep_columns, reindex_to_gene_list,
};
use crate::io::{DataError, load_conversion_table, load_gene_list};
use crate::orient::orient_samples_by_genes;
use crate::rank::rank_normalize;
use crate::types::{
    ExpressionMatrix, GeneIdScheme, MatrixError, PurityEstimates, RunMode, clip_unit_interval,
};
use crate::variance::{VarianceFilter, mask_unexpressed_genes};
use itertools::Itertools;
use std::fmt;
use thiserror::Error;

/// How many missing gene names are spelled out in the debug log.
const MISSING_GENES_PREVIEW: usize = 20;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Genes(#[from] GeneError),
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error(
        "The data uses HGNC gene symbols, but no gene conversion table was loaded. Load the resources with the HGNC identifier type."
    )]
    MissingConversionTable,
    #[error("The '{stage}' stage needs a run in state {expected}, but the run is {found}.")]
    StageOrder {
        stage: &'static str,
        expected: PipelineStage,
        found: PipelineStage,
    },
    #[error("The {kind} returned {found} predictions for {expected} samples.")]
    PredictionCount {
        kind: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Position of a run in the stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Loaded,
    Cleaned,
    RankNormalized,
    GeneFiltered,
    VarianceFiltered,
    Imputed,
    Standardized,
    Predicted,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Loaded => "Loaded",
            PipelineStage::Cleaned => "Cleaned",
            PipelineStage::RankNormalized => "RankNormalized",
            PipelineStage::GeneFiltered => "GeneFiltered",
            PipelineStage::VarianceFiltered => "VarianceFiltered",
            PipelineStage::Imputed => "Imputed",
            PipelineStage::Standardized => "Standardized",
            PipelineStage::Predicted => "Predicted",
        };
        f.write_str(name)
    }
}

/// One matrix on its way through the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    stage: PipelineStage,
    matrix: ExpressionMatrix,
}

impl PipelineRun {
    /// Starts a run from a matrix exactly as read from disk.
    pub fn load(matrix: ExpressionMatrix) -> Self {
        Self {
            stage: PipelineStage::Loaded,
            matrix,
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn matrix(&self) -> &ExpressionMatrix {
        &self.matrix
    }

    fn require(&self, stage: &'static str, expected: PipelineStage) -> Result<(), PipelineError> {
        if self.stage != expected {
            return Err(PipelineError::StageOrder {
                stage,
                expected,
                found: self.stage,
            });
        }
        Ok(())
    }

    fn advance(stage: PipelineStage, matrix: ExpressionMatrix) -> Self {
        log::debug!(
            "Run is now {stage} ({} samples x {} genes)",
            matrix.n_samples(),
            matrix.n_genes()
        );
        Self { stage, matrix }
    }
}

/// Read-only inputs shared by every run.
pub struct PipelineResources {
    /// Only needed for HGNC input.
    pub conversion_table: Option<GeneConversionTable>,
    /// Panel the input is aligned to before ranking.
    pub reference_genes: GeneList,
    /// Genes the artifacts were fitted on, in feature order.
    pub model_genes: GeneList,
    pub imputer: Box<dyn FittedTransform>,
    pub scaler: Box<dyn FittedTransform>,
    pub model: Box<dyn FittedRegressor>,
}

impl PipelineResources {
    /// Loads gene tables and artifacts for `mode` from the layout in `config`.
    pub fn load(
        config: &ResourceConfig,
        mode: RunMode,
        scheme: GeneIdScheme,
    ) -> Result<Self, PipelineError> {
        let panel = config.panel(mode);
        log::info!("Loading resources for run mode {mode}");

        let conversion_table = match scheme {
            GeneIdScheme::Hgnc => Some(load_conversion_table(&config.conversion_table)?),
            GeneIdScheme::Ensembl => None,
        };
        let reference_genes = load_gene_list(&config.reference_genes)?;
        let model_genes = load_gene_list(&panel.gene_list)?;
        let imputer = IterativeImputer::load(&panel.imputer)?;
        let scaler = StandardScaler::load(&panel.scaler)?;
        let model = LinearRegressor::load(&panel.model)?;

        Ok(Self {
            conversion_table,
            reference_genes,
            model_genes,
            imputer: Box::new(imputer),
            scaler: Box::new(scaler),
            model: Box::new(model),
        })
    }
}

/// Tunables that do not come from pretrained artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PipelineSettings {
    pub rank: RankSettings,
    pub variance: VarianceFilter,
}

impl From<&ResourceConfig> for PipelineSettings {
    fn from(config: &ResourceConfig) -> Self {
        Self {
            rank: config.rank,
            variance: config.variance,
        }
    }
}

pub struct PurityPipeline {
    resources: PipelineResources,
    settings: PipelineSettings,
}

impl PurityPipeline {
    /// Assembles a pipeline, checking that every artifact was fitted on the model genes
    /// in the same order.
    pub fn new(
        resources: PipelineResources,
        settings: PipelineSettings,
    ) -> Result<Self, PipelineError> {
        let genes = resources.model_genes.genes();
        check_feature_names(
            resources.imputer.kind(),
            resources.imputer.feature_names(),
            genes,
        )?;
        check_feature_names(
            resources.scaler.kind(),
            resources.scaler.feature_names(),
            genes,
        )?;
        check_feature_names(
            resources.model.kind(),
            resources.model.feature_names(),
            genes,
        )?;
        Ok(Self {
            resources,
            settings,
        })
    }

    pub fn resources(&self) -> &PipelineResources {
        &self.resources
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runs every stage and returns clipped purities in input sample order.
    pub fn predict(
        &self,
        matrix: ExpressionMatrix,
        scheme: GeneIdScheme,
    ) -> Result<PurityEstimates, PipelineError> {
        let run = PipelineRun::load(matrix);
        let run = self.clean(run, scheme)?;
        let run = self.rank(run)?;
        let run = self.filter_genes(run)?;
        let run = self.filter_variance(run)?;
        let run = self.impute(run)?;
        let run = self.standardize(run)?;
        self.estimate_purity(run)
    }

    /// Orients the matrix, converts symbols if needed, aligns onto the reference panel
    /// and masks genes never expressed in any sample.
    pub fn clean(
        &self,
        run: PipelineRun,
        scheme: GeneIdScheme,
    ) -> Result<PipelineRun, PipelineError> {
        run.require("clean", PipelineStage::Loaded)?;
        let (matrix, _) = orient_samples_by_genes(run.matrix);
        matrix.check_unique_samples()?;

        let matrix = match scheme {
            GeneIdScheme::Ensembl => matrix,
            GeneIdScheme::Hgnc => {
                let table = self
                    .resources
                    .conversion_table
                    .as_ref()
                    .ok_or(PipelineError::MissingConversionTable)?;
                convert_to_canonical(&matrix, table)
            }
        };

        let mut matrix = reindex_to_gene_list(&matrix, &self.resources.reference_genes);
        mask_unexpressed_genes(&mut matrix);
        Ok(PipelineRun::advance(PipelineStage::Cleaned, matrix))
    }

    pub fn rank(&self, run: PipelineRun) -> Result<PipelineRun, PipelineError> {
        run.require("rank", PipelineStage::Cleaned)?;
        let RankSettings { mode, method } = self.settings.rank;
        let mut matrix = run.matrix;
        rank_normalize(&mut matrix, mode, method);
        Ok(PipelineRun::advance(PipelineStage::RankNormalized, matrix))
    }

    /// Restricts the matrix to the model genes, in model feature order. Fails when none
    /// of them has data.
    pub fn filter_genes(&self, run: PipelineRun) -> Result<PipelineRun, PipelineError> {
        run.require("filter_genes", PipelineStage::RankNormalized)?;
        let genes = &self.resources.model_genes;
        let kept = keep_columns(&run.matrix, genes);
        let alignment = align_to_gene_list(&kept, genes)?;
        if !alignment.missing.is_empty() {
            log::warn!(
                "{} of {} model genes have no data and will be imputed",
                alignment.missing.len(),
                genes.len()
            );
            log::debug!(
                "First missing model genes: {}",
                alignment
                    .missing
                    .iter()
                    .take(MISSING_GENES_PREVIEW)
                    .join(", ")
            );
        }
        Ok(PipelineRun::advance(PipelineStage::GeneFiltered, alignment.matrix))
    }

    pub fn filter_variance(&self, run: PipelineRun) -> Result<PipelineRun, PipelineError> {
        run.require("filter_variance", PipelineStage::GeneFiltered)?;
        let mut matrix = run.matrix;
        let scale = self.resources.scaler.feature_scale();
        self.settings.variance.apply(&mut matrix, scale);
        Ok(PipelineRun::advance(PipelineStage::VarianceFiltered, matrix))
    }

    pub fn impute(&self, run: PipelineRun) -> Result<PipelineRun, PipelineError> {
        run.require("impute", PipelineStage::VarianceFiltered)?;
        let matrix = apply_transform(run.matrix, self.resources.imputer.as_ref())?;
        Ok(PipelineRun::advance(PipelineStage::Imputed, matrix))
    }

    pub fn standardize(&self, run: PipelineRun) -> Result<PipelineRun, PipelineError> {
        run.require("standardize", PipelineStage::Imputed)?;
        let matrix = apply_transform(run.matrix, self.resources.scaler.as_ref())?;
        Ok(PipelineRun::advance(PipelineStage::Standardized, matrix))
    }

    /// Applies the regression model and clips each estimate into [0, 1].
    pub fn estimate_purity(&self, run: PipelineRun) -> Result<PurityEstimates, PipelineError> {
        run.require("estimate_purity", PipelineStage::Standardized)?;
        let model = self.resources.model.as_ref();
        let mut purity = model.predict(run.matrix.values())?;
        if purity.len() != run.matrix.n_samples() {
            return Err(PipelineError::PredictionCount {
                kind: model.kind(),
                expected: run.matrix.n_samples(),
                found: purity.len(),
            });
        }
        clip_unit_interval(&mut purity);
        log::info!(
            "Run is {}: estimated purity for {} samples",
            PipelineStage::Predicted,
            purity.len()
        );
        Ok(PurityEstimates {
            samples: run.matrix.samples().to_vec(),
            purity,
        })
    }
}

fn apply_transform(
    mut matrix: ExpressionMatrix,
    transform: &dyn FittedTransform,
) -> Result<ExpressionMatrix, PipelineError> {
    let values = transform.transform(matrix.values())?;
    matrix.replace_values(values)?;
    log::info!("Applied {} to {} samples", transform.kind(), matrix.n_samples());
    Ok(matrix)
}
