//! CLI entry point for pftl_daq
//!
//! Runs one voltage sweep described by a YAML configuration file:
//!
//! ```bash
//! pftl_daq --config config/experiment.yml
//! pftl_daq --config config/experiment.yml --daq DummyDaq --no-save
//! RUST_LOG=debug pftl_daq --config config/experiment.yml --port /dev/ttyACM1
//! ```
//!
//! Ctrl-C stops the scan at the next step; the partial result is still saved.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use pftl_daq::config::ExperimentConfig;
use pftl_daq::experiment::{Experiment, ScanState};
use std::path::PathBuf;
use std::time::Duration;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "pftl_daq")]
#[command(about = "Voltage sweeps with the PFTL DAQ board", long_about = None)]
struct Cli {
    /// Experiment configuration file
    #[arg(long, short)]
    config: PathBuf,

    /// Override DAQ.name (DummyDaq or AnalogDaq)
    #[arg(long)]
    daq: Option<String>,

    /// Override DAQ.port
    #[arg(long)]
    port: Option<String>,

    /// Do not write result files
    #[arg(long)]
    no_save: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = ExperimentConfig::extract_from(&cli.config)
        .with_context(|| format!("Failed to load '{}'", cli.config.display()))?;
    if let Some(name) = cli.daq {
        config.daq.name = name;
    }
    if let Some(port) = cli.port {
        config.daq.port = port;
    }
    config.validate().with_context(|| {
        format!("Invalid configuration in '{}'", cli.config.display())
    })?;
    let mut experiment = Experiment::new(config);

    experiment.load_daq().await.context("Failed to load DAQ")?;
    let run = experiment.start_scan()?;

    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping scan");
                experiment.stop_scan();
            }
            _ = ticker.tick() => {
                info!(
                    "Step {}/{}: out={} value={}",
                    run.cursor(),
                    run.plan().steps(),
                    run.voltage_out(),
                    run.last_value()
                );
            }
        }
        if run.state() == ScanState::Finished {
            break;
        }
    }

    if let Some(err) = run.error() {
        warn!("Scan ended with an error: {}", err);
    }

    if !cli.no_save {
        let files = experiment.save_data().context("Failed to save results")?;
        info!(
            "Results written to '{}' and '{}'",
            files.data.display(),
            files.metadata.display()
        );
    }

    experiment.finalize().await.context("Failed to finalize DAQ")?;
    Ok(())
}
