use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use relt_core::StorageEvent;
use relt_pipeline::{Pipeline, PipelineConfig};
use relt_web::ServeStage;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relt-cli")]
#[command(about = "Review ELT pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one or both stages as HTTP services.
    Serve {
        #[arg(long, value_enum, default_value_t = StageArg::All)]
        stage: StageArg,
    },
    /// Load one object into staging and trigger the merge stage.
    Ingest {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        name: String,
        /// Copy this file into the local object store before loading.
        #[arg(long)]
        from_file: Option<PathBuf>,
    },
    /// Run a single merge pass.
    Merge,
    /// Create staging and analytics tables (postgres backend).
    Migrate,
    /// Print the resolved configuration.
    CheckConfig,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StageArg {
    Ingest,
    Merge,
    All,
}

impl From<StageArg> for ServeStage {
    fn from(value: StageArg) -> Self {
        match value {
            StageArg::Ingest => ServeStage::Ingest,
            StageArg::Merge => ServeStage::Merge,
            StageArg::All => ServeStage::All,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("RELT_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    info!(command = ?cli.command, "relt-cli starting");

    match cli.command {
        Commands::Serve { stage } => {
            relt_web::serve_from_env(stage.into()).await?;
        }
        Commands::Ingest {
            bucket,
            name,
            from_file,
        } => {
            let config = PipelineConfig::load()?;
            let event = StorageEvent::new(bucket, name);
            if let Some(path) = from_file {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                let store = config
                    .local_object_store()
                    .context("--from-file needs the postgres or memory warehouse backend")?;
                let written = store.put_object(&event.locator(), &bytes).await?;
                println!("staged {} at {}", event.locator(), written.display());
            }
            let pipeline = Pipeline::from_config(config).await?;
            let outcome = pipeline.ingest_stage()?.handle(&event).await;
            println!("{} {}", outcome.status_code(), outcome.message());
            if !outcome.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Merge => {
            let summary = relt_pipeline::run_merge_once_from_env().await?;
            println!(
                "{} invocation_id={} job_id={}",
                summary.message(),
                summary.invocation_id,
                summary.job_id
            );
        }
        Commands::Migrate => {
            relt_pipeline::migrate(&PipelineConfig::load()?).await?;
            println!("migrations applied");
        }
        Commands::CheckConfig => {
            let config = PipelineConfig::load()?;
            config.validate()?;
            print!("{}", config.to_yaml()?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
