//! DAQ backed by the PFTL board.
//!
//! Converts volts to codes with [`Converter::OUTPUT`] for the outputs and codes
//! to volts with [`Converter::INPUT`] for the inputs, then delegates to
//! [`PftlDevice`].

use super::Daq;
use crate::error::DaqResult;
use crate::instrument::PftlDevice;
use crate::units::{Converter, Quantity};
use async_trait::async_trait;
use log::{info, warn};

/// Output channels driven to 0 V on initialize and finalize.
const OUTPUT_CHANNELS: [u32; 2] = [0, 1];

/// Real DAQ.
#[derive(Debug, Clone)]
pub struct AnalogDaq {
    device: PftlDevice,
}

impl AnalogDaq {
    /// DAQ on `port` with the firmware's default serial settings.
    pub fn new(port: &str) -> Self {
        Self::with_device(PftlDevice::new(port))
    }

    /// DAQ over an already configured driver.
    pub fn with_device(device: PftlDevice) -> Self {
        Self { device }
    }

    /// Underlying driver
    pub fn device(&self) -> &PftlDevice {
        &self.device
    }

    async fn zero_outputs(&self) -> DaqResult<()> {
        let zero = Quantity::volts(0.0);
        for channel in OUTPUT_CHANNELS {
            self.set_output_voltage(channel, &zero).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Daq for AnalogDaq {
    fn name(&self) -> &str {
        "Analog Daq"
    }

    /// Open the board and drive both outputs to 0 V.
    async fn initialize(&self) -> DaqResult<()> {
        self.device.initialize().await?;
        self.zero_outputs().await
    }

    async fn idn(&self) -> DaqResult<String> {
        self.device.identify().await
    }

    async fn set_output_voltage(&self, channel: u32, volts: &Quantity) -> DaqResult<()> {
        let code = Converter::OUTPUT.volts_to_code(volts)?;
        self.device.write_output(channel, code).await?;
        Ok(())
    }

    async fn get_output_voltage(&self, channel: u32) -> DaqResult<Quantity> {
        let code = self.device.read_output(channel).await?;
        Ok(Converter::OUTPUT.code_to_volts(code))
    }

    async fn get_input_voltage(&self, channel: u32) -> DaqResult<Quantity> {
        let code = self.device.read_input(channel).await?;
        Ok(Converter::INPUT.code_to_volts(code))
    }

    /// Drive both outputs to 0 V, then close the port. The port is closed even
    /// when zeroing fails; the zeroing error is still returned.
    async fn finalize(&self) -> DaqResult<()> {
        let zeroed = self.zero_outputs().await;
        if let Err(e) = &zeroed {
            warn!("Failed to zero outputs on '{}': {}", self.device.port(), e);
        }
        self.device.finalize().await;
        info!("Analog DAQ on '{}' finalized", self.device.port());
        zeroed
    }
}
