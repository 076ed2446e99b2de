//! DAQ abstraction.
//!
//! [`Daq`] is the capability interface the scan engine drives. Two variants
//! exist: [`DummyDaq`], which synthesizes readings, and [`AnalogDaq`], which
//! talks to the PFTL board and converts between volts and codes.
//!
//! The variant is picked once at setup from the configuration name, see
//! [`from_config`].

pub mod analog;
pub mod dummy;

pub use analog::AnalogDaq;
pub use dummy::DummyDaq;

use crate::adapters::{SerialAdapter, SerialSettings};
use crate::config::ExperimentConfig;
use crate::error::{DaqError, DaqResult};
use crate::instrument::PftlDevice;
use crate::units::Quantity;
use async_trait::async_trait;
use log::info;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Analog DAQ operations used by the scan engine. Voltages are [`Quantity`]s in volts.
#[async_trait]
pub trait Daq: Send + Sync {
    /// Human-readable name of the variant
    fn name(&self) -> &str;

    /// Prepare the hardware for use.
    async fn initialize(&self) -> DaqResult<()>;

    /// Identification string of the hardware.
    async fn idn(&self) -> DaqResult<String>;

    /// Drive output `channel` to `volts`.
    async fn set_output_voltage(&self, channel: u32, volts: &Quantity) -> DaqResult<()>;

    /// Voltage currently set on output `channel`.
    async fn get_output_voltage(&self, channel: u32) -> DaqResult<Quantity>;

    /// Voltage measured on input `channel`.
    async fn get_input_voltage(&self, channel: u32) -> DaqResult<Quantity>;

    /// Leave the hardware in a safe state and release it.
    async fn finalize(&self) -> DaqResult<()>;
}

/// The DAQ variants selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqKind {
    /// Simulated DAQ producing synthetic readings
    DummyDaq,
    /// PFTL board on a serial port
    AnalogDaq,
}

impl FromStr for DaqKind {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DummyDaq" => Ok(DaqKind::DummyDaq),
            "AnalogDaq" => Ok(DaqKind::AnalogDaq),
            other => Err(DaqError::Configuration(format!(
                "Unsupported DAQ '{}'. Must be one of: DummyDaq, AnalogDaq",
                other
            ))),
        }
    }
}

impl fmt::Display for DaqKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaqKind::DummyDaq => f.write_str("DummyDaq"),
            DaqKind::AnalogDaq => f.write_str("AnalogDaq"),
        }
    }
}

/// Build the DAQ named in `config`. The DAQ is not initialized.
pub fn from_config(config: &ExperimentConfig) -> DaqResult<Arc<dyn Daq>> {
    let kind = config.daq_kind()?;
    info!("Loading {} on port '{}'", kind, config.daq.port);

    let daq: Arc<dyn Daq> = match kind {
        DaqKind::DummyDaq => Arc::new(DummyDaq::new()),
        DaqKind::AnalogDaq => {
            let settings = SerialSettings::new(config.daq.port.as_str())
                .with_baud_rate(config.daq.baud_rate)
                .with_read_timeout(config.read_timeout()?)
                .with_write_timeout(config.write_timeout()?);
            let device = PftlDevice::with_adapter(SerialAdapter::new(settings))
                .with_settle_time(config.settle_time()?);
            Arc::new(AnalogDaq::with_device(device))
        }
    };
    Ok(daq)
}
