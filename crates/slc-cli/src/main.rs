use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use slc_annotate::{write_results, LinkCheckPipeline, RunConfig};
use slc_storage::ResultStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "slc-cli")]
#[command(about = "Check whether Shopee product links in a spreadsheet are still live")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Annotate an .xlsx workbook and write the results to disk.
    Check {
        input: PathBuf,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// e.g. http://localhost:3001/api/shopee
        #[arg(long)]
        api_base: Option<String>,
    },
    /// Upload UI plus relay.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Relay only.
    Relay {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Check {
            input,
            output_dir,
            api_base,
        } => {
            let mut config = RunConfig::from_env();
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            if api_base.is_some() {
                config.api_base = api_base;
            }
            run_check(&input, &config).await?;
        }
        Commands::Serve { port } => slc_web::serve_from_env(port).await?,
        Commands::Relay { port } => slc_web::serve_relay_from_env(port).await?,
    }

    Ok(())
}

async fn run_check(input: &Path, config: &RunConfig) -> Result<()> {
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let pipeline = LinkCheckPipeline::from_config(config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    info!(input = %input.display(), "starting link check");
    let output = pipeline
        .run_workbook(&bytes, cancel)
        .await
        .with_context(|| format!("checking links in {}", input.display()))?;

    let store = ResultStore::new(config.output_dir.clone());
    let (workbook, summary_file) = write_results(&store, &output).await?;

    let summary = &output.summary;
    println!(
        "check complete: run_id={} rows={} links={} live={} missing={} output={} summary={}",
        summary.run_id,
        summary.total_rows,
        summary.marketplace_links,
        summary.live_links,
        summary.missing_links,
        workbook.path.display(),
        summary_file.path.display()
    );
    Ok(())
}
