//! `bias-sweep` command-line entry point.
//!
//! ```bash
//! # Check a configuration without touching hardware
//! bias-sweep validate --config config/sweep.toml
//!
//! # Rehearse the whole run with simulated instruments
//! bias-sweep run --config config/sweep.toml --dry-run
//!
//! # Real run (build with --features instrument_visa)
//! bias-sweep run --config config/sweep.toml --test-name RFTtest_2
//! ```

use anyhow::{Context, Result};
use bias_sweep::{app, config::Settings, logging};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

/// Nested DC-bias sweeps with a triggered measurement per combination
#[derive(Parser, Debug)]
#[command(name = "bias-sweep")]
#[command(about = "Sweep bias sources and trigger a measurement at every combination")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the configured sweep
    Run {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Override the base test name
        #[arg(long)]
        test_name: Option<String>,

        /// Use simulated instruments instead of the configured resources
        #[arg(long)]
        dry_run: bool,
    },
    /// Load and validate a configuration, then print the planned artifacts
    Validate {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn load(path: &Path) -> Result<Settings> {
    Settings::load(path).with_context(|| format!("Failed to load configuration from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Validate { config } => {
            let settings = load(&config)?;
            println!("Configuration OK: {}", config.display());
            let sweep = app::build_orchestrator(&settings, true)
                .await
                .context("Failed to plan sweep")?;
            sweep.check_preconditions().context("Sweep preconditions not met")?;
            println!("{} combination(s):", sweep.combination_count());
            for name in sweep.planned_artifacts() {
                println!("  {}", name);
            }
            Ok(())
        }
        Command::Run {
            config,
            test_name,
            dry_run,
        } => {
            let mut settings = load(&config)?;
            if let Some(name) = test_name {
                settings.sweep.test_name = name;
                settings.validate().context("Invalid test name override")?;
            }
            logging::init(&settings.application).context("Failed to initialise logging")?;
            info!(
                app = %settings.application.name,
                config = %config.display(),
                dry_run,
                "Starting"
            );

            let mut sweep = app::build_orchestrator(&settings, dry_run)
                .await
                .context("Failed to connect instruments")?;
            let reports = app::run_configured(&mut sweep, &settings)
                .await
                .context("Sweep failed")?;

            for report in &reports {
                info!(
                    test = %report.test_name,
                    combinations = report.combinations.len(),
                    "Run finished"
                );
                for source in &report.records {
                    info!(
                        source = %source.label,
                        samples = source.record.len(),
                        path = %source.path.display(),
                        "Saved"
                    );
                }
            }
            Ok(())
        }
    }
}
