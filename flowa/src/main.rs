//! flowa - Main entry point
//!
//! Subcommands:
//! - `process`: events one after another in this process
//! - `multi`: one worker process per event
//! - `worker`: internal, processes one event and prints a JSON report
//! - `inspect`: misfit and window statistics from event archives

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowa::config::load_run_config;
use flowa::inspector::Inspection;
use flowa::services::Services;
use flowa::workflow::{WorkerPool, WorkerReport};
use flowa::{Orchestrator, RunConfig};

/// Command-line arguments for flowa
#[derive(Parser, Debug)]
#[command(name = "flowa")]
#[command(about = "Misfit quantification workflow for seismic inversions")]
#[command(version)]
struct Args {
    /// Run configuration file (falls back to $FLOWA_CONFIG, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process events sequentially in this process
    Process {
        /// Source (event) names
        #[arg(required = true)]
        sources: Vec<String>,

        /// Only these stations (NET.STA), instead of the stations file
        #[arg(long, value_delimiter = ',')]
        stations: Option<Vec<String>>,
    },

    /// Process events in parallel worker processes
    Multi {
        /// Source names; discovered from the sources directory when omitted
        sources: Vec<String>,

        /// Maximum concurrent workers (default: available parallelism)
        #[arg(long)]
        max_workers: Option<usize>,
    },

    /// Process one event and print a JSON report (used by `multi`)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        source: String,
    },

    /// Collect misfit statistics from event archives
    Inspect {
        /// Directory containing the event archives
        #[arg(long)]
        datasets: PathBuf,

        /// Write the statistics as JSON here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn orchestrator(config: RunConfig) -> Result<Orchestrator> {
    let services = Services::from_config(&config.services).context("Failed to configure services")?;
    Orchestrator::new(config, services).context("Failed to build path plan")
}

fn print_misfits(misfits: &BTreeMap<String, Option<f64>>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(misfits)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Console logging goes to stderr so worker stdout stays machine-readable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowa=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match args.command {
        Command::Process { sources, stations } => {
            let (path, config) = load_run_config(args.config.as_deref())?;
            info!("Configuration: {}", path.display());
            let orchestrator = orchestrator(config)?;

            let mut misfits = BTreeMap::new();
            for source in &sources {
                let outcome = orchestrator
                    .process_event(source, stations.as_deref())
                    .await
                    .with_context(|| format!("Processing {} failed", source))?;
                misfits.insert(source.clone(), outcome.misfit);
            }
            print_misfits(&misfits)?;
        }

        Command::Multi {
            sources,
            max_workers,
        } => {
            let (path, config) = load_run_config(args.config.as_deref())?;
            let max_workers = max_workers.or(config.workflow.max_workers);
            let orchestrator = orchestrator(config)?;

            let sources = if sources.is_empty() {
                let found = orchestrator
                    .discover_sources()
                    .context("Failed to discover sources")?;
                info!(
                    "Discovered {} sources in {}",
                    found.len(),
                    orchestrator.sources_dir().display()
                );
                found
            } else {
                sources
            };

            let pool = WorkerPool::for_current_exe(&path, max_workers)?;
            let misfits = pool.run_misfits(&sources).await;
            print_misfits(&misfits)?;
        }

        Command::Worker { source } => {
            let report = match load_run_config(args.config.as_deref()) {
                Ok((_, config)) => match orchestrator(config) {
                    Ok(orchestrator) => {
                        WorkerReport::from_outcome(&source, orchestrator.process_event(&source, None).await)
                    }
                    Err(e) => WorkerReport::failed(&source, format!("{:#}", e)),
                },
                Err(e) => WorkerReport::failed(&source, e.to_string()),
            };
            println!("{}", serde_json::to_string(&report)?);
        }

        Command::Inspect { datasets, output } => {
            let inspection = Inspection::collect(&datasets)
                .await
                .with_context(|| format!("Failed to inspect {}", datasets.display()))?;
            match output {
                Some(path) => {
                    inspection.save(&path)?;
                    info!("Wrote {}", path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&inspection)?),
            }
        }
    }

    Ok(())
}
