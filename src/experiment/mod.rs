//! Experiment orchestration.
//!
//! [`Experiment`] ties an [`ExperimentConfig`] to a DAQ and a [`ScanEngine`]:
//!
//! ```rust,ignore
//! use pftl_daq::experiment::Experiment;
//!
//! let mut experiment = Experiment::from_file("config/experiment.yml")?;
//! experiment.load_daq().await?;
//! let run = experiment.start_scan()?;
//!
//! // Progress can be read while the scan runs
//! println!("{} / {}", run.cursor(), run.plan().steps());
//!
//! experiment.save_data()?;
//! experiment.finalize().await?;
//! ```
//!
//! The plan is rebuilt from the configuration on every [`Experiment::start_scan`],
//! so edits to [`Experiment::config_mut`] apply to the next scan only.

pub mod plan;
pub mod scan;

pub use plan::ScanPlan;
pub use scan::{ScanEngine, ScanRun, ScanSnapshot, ScanState};

use crate::config::ExperimentConfig;
use crate::daq::{self, Daq};
use crate::data::storage::{self, SavedFiles};
use crate::error::{DaqError, DaqResult};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

/// Configuration, DAQ and scan engine of one measurement session.
#[derive(Debug)]
pub struct Experiment {
    config: ExperimentConfig,
    engine: Option<ScanEngine>,
}

impl Experiment {
    /// Experiment over an already validated configuration. No DAQ is loaded yet.
    pub fn new(config: ExperimentConfig) -> Self {
        Self {
            config,
            engine: None,
        }
    }

    /// Load the configuration file (with `PFTL_` environment overrides).
    pub fn from_file<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let config = ExperimentConfig::load_from(path.as_ref())?;
        info!("Loaded experiment configuration from '{}'", path.as_ref().display());
        Ok(Self::new(config))
    }

    /// Active configuration
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Configuration, editable between scans
    pub fn config_mut(&mut self) -> &mut ExperimentConfig {
        &mut self.config
    }

    /// Build the DAQ named in the configuration and initialize it.
    pub async fn load_daq(&mut self) -> DaqResult<()> {
        let daq = daq::from_config(&self.config)?;
        self.load_daq_with(daq).await
    }

    /// Initialize `daq` and use it for subsequent scans.
    ///
    /// Any previously loaded DAQ is finalized first. A failing identification
    /// query is only logged.
    pub async fn load_daq_with(&mut self, daq: Arc<dyn Daq>) -> DaqResult<()> {
        if let Some(previous) = self.engine.take() {
            previous.finalize().await?;
        }
        daq.initialize().await?;
        match daq.idn().await {
            Ok(idn) => info!("{} ready: {}", daq.name(), idn),
            Err(e) => warn!("{} ready, identification failed: {}", daq.name(), e),
        }
        self.engine = Some(ScanEngine::new(daq));
        Ok(())
    }

    /// Loaded DAQ, if any
    pub fn daq(&self) -> Option<&Arc<dyn Daq>> {
        self.engine.as_ref().map(ScanEngine::daq)
    }

    fn engine(&self) -> DaqResult<&ScanEngine> {
        self.engine.as_ref().ok_or(DaqError::DaqNotLoaded)
    }

    /// Start a scan with the plan described by the configuration.
    pub fn start_scan(&self) -> DaqResult<Arc<ScanRun>> {
        let engine = self.engine()?;
        let plan = ScanPlan::from_config(&self.config)?;
        engine.start(plan)
    }

    /// Request the running scan to stop. No-op without a DAQ or a scan.
    pub fn stop_scan(&self) {
        if let Some(engine) = &self.engine {
            engine.stop();
        }
    }

    /// Whether a scan is running or stopping
    pub fn is_running(&self) -> bool {
        self.engine
            .as_ref()
            .is_some_and(|engine| engine.state().is_active())
    }

    /// Most recent scan, if any
    pub fn current_run(&self) -> Option<Arc<ScanRun>> {
        self.engine.as_ref().and_then(ScanEngine::current_run)
    }

    /// Save the most recent scan to the configured folder, with the
    /// configuration embedded in the sidecar.
    ///
    /// Saves whatever has been recorded so far, so it can also be used on a
    /// scan that is still running.
    pub fn save_data(&self) -> DaqResult<SavedFiles> {
        let run = self.current_run().ok_or_else(|| {
            DaqError::Configuration("no scan has been run, nothing to save".to_string())
        })?;
        storage::save_with_config(&run.snapshot(), &self.config)
    }

    /// Stop any scan, wait for it to end, then finalize the DAQ.
    ///
    /// The last run stays readable through the returned handle; the DAQ must be
    /// loaded again before the next scan.
    pub async fn finalize(&mut self) -> DaqResult<Option<Arc<ScanRun>>> {
        let Some(engine) = self.engine.take() else {
            return Ok(None);
        };
        let run = engine.current_run();
        engine.finalize().await?;
        info!("Experiment finalized");
        Ok(run)
    }
}
