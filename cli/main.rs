#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use puree::config::ResourceConfig;
use puree::io::{load_expression_matrix, write_purities};
use puree::pipeline::{PipelineResources, PipelineSettings, PurityPipeline};
use puree::remote::{
    parse_service_output, restore_sample_names, SampleAliases, SubmissionWorkspace,
};
use puree::types::{GeneIdScheme, RunMode};

#[derive(Args)]
pub struct PredictArgs {
    /// Path to a gene expression matrix (.csv, .tsv or .parquet) of size [samples, genes]
    #[arg(long = "data_path", value_name = "PATH")]
    pub data_path: PathBuf,

    /// Output file path for the tab-separated purity table
    #[arg(long, value_name = "PATH")]
    pub output: PathBuf,

    /// Gene identifier type used in the column names of the matrix
    #[arg(long = "gene_identifier_type", value_enum, default_value_t = GeneIdScheme::Ensembl)]
    pub gene_identifier_type: GeneIdScheme,

    /// Gene set used for predicting purities
    #[arg(long = "run_mode", value_enum, default_value_t = RunMode::PureeGenes)]
    pub run_mode: RunMode,

    /// Directory holding the data/ and models/ resource bundle
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub resources: PathBuf,

    /// Optional TOML file overriding the resource layout and tunables
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "puree",
    about = "Tumor purity (cancer cell fraction) prediction from bulk gene expression",
    long_about = None,
    version
)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Predict tumor purity for every sample of an expression matrix
    #[command(about = "Predict tumor purity (outputs: sample_id/purity TSV)")]
    Predict(PredictArgs),

    /// Prepare an expression file for upload to the hosted service
    #[command(about = "Anonymize sample names and write an upload-ready TSV")]
    PrepareUpload {
        /// Expression table (.csv, .tsv or .txt)
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Directory receiving the prepared file
        #[arg(long = "work-dir", value_name = "DIR")]
        work_dir: PathBuf,
    },

    /// Convert hosted-service output back to the original sample names
    #[command(about = "Restore sample names in service output (outputs: sample_id/purity TSV)")]
    RestoreNames {
        /// Tab-separated sample/purity table returned by the service
        #[arg(value_name = "SERVICE_OUTPUT")]
        service_output: PathBuf,

        /// Alias table written by prepare-upload
        #[arg(long, value_name = "PATH")]
        aliases: Option<PathBuf>,

        /// Output file path for the tab-separated purity table
        #[arg(long, value_name = "PATH")]
        output: PathBuf,
    },

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::PrepareUpload { input, work_dir }) => prepare_upload(input, work_dir),
        Some(Commands::RestoreNames {
            service_output,
            aliases,
            output,
        }) => restore_names(service_output, aliases, output),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_version_info() {
    println!("puree {}", env!("CARGO_PKG_VERSION"));
    match option_env!("PUREE_RELEASE_TAG") {
        Some(tag) => println!("Release: {}", tag),
        None => println!("Release: development build"),
    }
}

fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => ResourceConfig::load(path)?,
        None => ResourceConfig::default(),
    }
    .resolve_against(&args.resources);

    log::info!(
        "Predicting purity with gene identifier type {} and run mode {}",
        args.gene_identifier_type,
        args.run_mode
    );

    let resources =
        PipelineResources::load(&config, args.run_mode, args.gene_identifier_type)?;
    let pipeline = PurityPipeline::new(resources, PipelineSettings::from(&config))?;

    let matrix = load_expression_matrix(&args.data_path)?;
    let estimates = pipeline.predict(matrix, args.gene_identifier_type)?;
    write_purities(&args.output, &estimates)?;

    println!(
        "Saved purity estimates for {} samples to '{}'",
        estimates.len(),
        args.output.display()
    );
    Ok(())
}

fn prepare_upload(input: PathBuf, work_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let workspace = SubmissionWorkspace::new(work_dir)?;
    let prepared = workspace.prepare(&input)?;
    println!("Upload file: {}", prepared.path.display());
    if !prepared.aliases.is_empty() {
        println!(
            "Sample names were replaced by {} aliases (Sample_1..Sample_{})",
            prepared.aliases.len(),
            prepared.aliases.len()
        );
    }
    if let Some(alias_file) = &prepared.alias_file {
        println!("Alias table: {}", alias_file.display());
    }
    Ok(())
}

fn restore_names(
    service_output: PathBuf,
    aliases: Option<PathBuf>,
    output: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(&service_output)?;
    let mut estimates = parse_service_output(&text)?;
    if let Some(path) = &aliases {
        let aliases = SampleAliases::load(path)?;
        estimates = restore_sample_names(estimates, &aliases)?;
    }
    write_purities(&output, &estimates)?;
    println!(
        "Saved purity estimates for {} samples to '{}'",
        estimates.len(),
        output.display()
    );
    Ok(())
}
