//! Experiment configuration using Figment
//!
//! Configuration is loaded from:
//! 1. A YAML file (base configuration)
//! 2. Environment variables (prefixed with `PFTL_`)
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! PFTL_DAQ__PORT=/dev/ttyACM1
//! PFTL_SCAN__NUM_STEPS=50
//! PFTL_SAVING__FOLDER=~/data
//! ```
//!
//! # Example file
//!
//! ```yaml
//! DAQ:
//!   name: AnalogDaq
//!   port: /dev/ttyACM0
//!   resistance: 220Ohm
//! Scan:
//!   start: 0V
//!   stop: 3.3V
//!   num_steps: 50
//!   delay: 10ms
//!   channel_in: 0
//!   channel_out: 0
//! Saving:
//!   folder: ~/Documents/data
//!   filename: iv_curve.dat
//! ```

use crate::daq::DaqKind;
use crate::error::{DaqError, DaqResult};
use crate::experiment::plan::MAX_STEPS;
use crate::units::{Quantity, Unit};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level experiment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Which DAQ to use and how to reach it
    #[serde(rename = "DAQ")]
    pub daq: DaqConfig,
    /// Sweep parameters
    #[serde(rename = "Scan")]
    pub scan: ScanConfig,
    /// Where results go
    #[serde(rename = "Saving")]
    pub saving: SavingConfig,
}

/// DAQ selection and serial settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqConfig {
    /// DAQ variant (`DummyDaq` or `AnalogDaq`)
    pub name: String,
    /// Serial port of the board
    #[serde(default)]
    pub port: String,
    /// Resistor the measured voltage drops over; turns readings into currents
    #[serde(default)]
    pub resistance: Option<Quantity>,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Response timeout
    #[serde(default = "default_timeout")]
    pub read_timeout: Quantity,
    /// Request timeout
    #[serde(default = "default_timeout")]
    pub write_timeout: Quantity,
    /// Wait after opening the port before the first request
    #[serde(default = "default_settle_time")]
    pub settle_time: Quantity,
}

/// Sweep parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// First output voltage
    pub start: Quantity,
    /// Last output voltage
    pub stop: Quantity,
    /// Number of points, both ends included
    pub num_steps: usize,
    /// Pause between points
    pub delay: Quantity,
    /// Input channel to measure
    pub channel_in: u32,
    /// Output channel to sweep
    pub channel_out: u32,
}

/// Result file location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavingConfig {
    /// Base folder; a dated subfolder is created inside it
    pub folder: PathBuf,
    /// Base file name, e.g. `data.dat`
    pub filename: String,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout() -> Quantity {
    Quantity::seconds(1.0)
}

fn default_settle_time() -> Quantity {
    Quantity::seconds(1.0)
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ExperimentConfig {
    /// Load configuration from a YAML file and `PFTL_` environment variables.
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let config = Self::extract_from(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Same sources as [`load_from`](Self::load_from) without validation, for
    /// callers that apply further overrides and call [`validate`](Self::validate)
    /// themselves.
    pub fn extract_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let config = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(env_overrides())
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from YAML text (no environment overrides).
    pub fn from_yaml_str(yaml: &str) -> DaqResult<Self> {
        let config: Self = Figment::new().merge(Yaml::string(yaml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - DAQ name is a known variant, and `AnalogDaq` has a port
    /// - Resistance, if present, is a positive resistance
    /// - Timeouts are durations
    /// - Start/stop are voltages, delay a non-negative duration, 1 to `MAX_STEPS` steps
    /// - Saving filename is not empty
    pub fn validate(&self) -> DaqResult<()> {
        let kind = self.daq_kind()?;
        if kind == DaqKind::AnalogDaq && self.daq.port.trim().is_empty() {
            return Err(DaqError::Configuration(
                "AnalogDaq requires 'DAQ.port'".to_string(),
            ));
        }

        if let Some(resistance) = &self.daq.resistance {
            check_unit("DAQ.resistance", resistance, Unit::Ohm)?;
            if resistance.magnitude() <= 0.0 {
                return Err(DaqError::Configuration(format!(
                    "'DAQ.resistance' must be positive, got {}",
                    resistance
                )));
            }
        }
        self.read_timeout()?;
        self.write_timeout()?;
        self.settle_time()?;

        check_unit("Scan.start", &self.scan.start, Unit::Volt)?;
        check_unit("Scan.stop", &self.scan.stop, Unit::Volt)?;
        check_unit("Scan.delay", &self.scan.delay, Unit::Second)?;
        if self.scan.num_steps == 0 {
            return Err(DaqError::Configuration(
                "'Scan.num_steps' must be at least 1".to_string(),
            ));
        }
        if self.scan.num_steps > MAX_STEPS {
            return Err(DaqError::Configuration(format!(
                "'Scan.num_steps' must be at most {}, got {}",
                MAX_STEPS, self.scan.num_steps
            )));
        }
        if self.scan.delay.magnitude() < 0.0 {
            return Err(DaqError::Configuration(format!(
                "'Scan.delay' must not be negative, got {}",
                self.scan.delay
            )));
        }

        if self.saving.filename.trim().is_empty() {
            return Err(DaqError::Configuration(
                "'Saving.filename' cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// DAQ variant named in the configuration
    pub fn daq_kind(&self) -> DaqResult<DaqKind> {
        self.daq.name.parse()
    }

    /// Response timeout as a duration
    pub fn read_timeout(&self) -> DaqResult<Duration> {
        duration_of("DAQ.read_timeout", &self.daq.read_timeout)
    }

    /// Request timeout as a duration
    pub fn write_timeout(&self) -> DaqResult<Duration> {
        duration_of("DAQ.write_timeout", &self.daq.write_timeout)
    }

    /// Post-open settle period as a duration
    pub fn settle_time(&self) -> DaqResult<Duration> {
        duration_of("DAQ.settle_time", &self.daq.settle_time)
    }

    /// Saving folder with a leading `~` replaced by the home directory.
    pub fn saving_folder(&self) -> PathBuf {
        expand_home(&self.saving.folder)
    }
}

/// `PFTL_` variables with `__` as the nesting separator. Section names are
/// matched case-insensitively and mapped to their file spelling (`DAQ`,
/// `Scan`, `Saving`); keys inside a section are lowercased.
fn env_overrides() -> Env {
    Env::prefixed("PFTL_")
        .split("__")
        .map(|key| env_key(key.as_str()).into())
        .lowercase(false)
}

fn env_key(key: &str) -> String {
    let (section, rest) = key.split_once('.').unwrap_or((key, ""));
    let section = match section.to_ascii_lowercase().as_str() {
        "daq" => "DAQ",
        "scan" => "Scan",
        "saving" => "Saving",
        _ => return key.to_ascii_lowercase(),
    };
    if rest.is_empty() {
        section.to_string()
    } else {
        format!("{}.{}", section, rest.to_ascii_lowercase())
    }
}

fn check_unit(key: &str, value: &Quantity, unit: Unit) -> DaqResult<()> {
    value.to(unit).map(|_| ()).map_err(|_| {
        DaqError::Configuration(format!(
            "'{}' must be in {}, got {}",
            key, unit, value
        ))
    })
}

fn duration_of(key: &str, value: &Quantity) -> DaqResult<Duration> {
    value.as_duration().map_err(|_| {
        DaqError::Configuration(format!(
            "'{}' must be a non-negative duration, got {}",
            key, value
        ))
    })
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
