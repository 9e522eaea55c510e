mod artifacts;
mod config;
mod error;
mod gate;
mod notifier;
mod orchestrator;
mod promoter;
mod types;
mod validation;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use orchestrator::PromotionOrchestrator;
use types::ModelKind;

#[derive(Parser)]
#[command(name = "model-promoter")]
#[command(version = "0.1.0")]
#[command(about = "Gate, validate and promote freshly trained models into production", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "promote.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full promotion cycle
    Run {
        /// Model kinds to process (default: all)
        #[arg(short, long, value_enum)]
        kind: Vec<ModelKind>,
        /// Print outcomes as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Evaluate gates only; runs no jobs and writes nothing
    Gate {
        #[arg(short, long, value_enum)]
        kind: Vec<ModelKind>,
    },
    /// Show candidate and production artifacts for every kind
    Status,
    /// Print the effective configuration
    Config,
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // stdout carries outcome lines only
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = config::load(&cli.config)?;

    match cli.command {
        Commands::Run { kind, json } => {
            info!("Model promoter v0.1.0");
            let orchestrator = Arc::new(PromotionOrchestrator::from_config(&config));
            let outcomes = orchestrator.run_all(&kind).await;
            for outcome in &outcomes {
                if json {
                    println!("{}", serde_json::to_string(outcome)?);
                } else {
                    println!("{}", outcome);
                }
            }
            let promoted = outcomes.iter().filter(|o| o.is_promoted()).count();
            info!("Cycle complete: {}/{} promoted", promoted, outcomes.len());
        }
        Commands::Gate { kind } => {
            let orchestrator = PromotionOrchestrator::from_config(&config);
            for report in orchestrator.evaluate_gates(&kind) {
                println!("{}", report);
            }
        }
        Commands::Status => {
            let orchestrator = PromotionOrchestrator::from_config(&config);
            for status in orchestrator.status_report(&[]) {
                println!("{}", status);
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
