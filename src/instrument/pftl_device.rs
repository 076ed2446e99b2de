//! PFTL DAQ device driver
//!
//! The Python for the Lab DAQ is an Arduino-based board with two analog
//! outputs (12-bit, 0-3.3 V) and several analog inputs (10-bit, 0-3.3 V). It
//! speaks a line protocol over USB serial:
//!
//! | Request            | Response                       |
//! |--------------------|--------------------------------|
//! | `*IDN?`            | free-text identifier           |
//! | `MEAS:CH{n}?`      | input code                     |
//! | `OUT:CH{n} {code}` | code or echo                   |
//! | `OUT:CH{n}?`       | output code                    |
//!
//! Any response starting with `ERROR` is a device error, whatever the request.
//!
//! The driver works in raw codes; volt scaling lives in
//! [`AnalogDaq`](crate::daq::AnalogDaq).

use crate::adapters::{SerialAdapter, SerialSettings};
use crate::error::{DaqError, DaqResult};
use log::{debug, info};
use std::time::Duration;

/// Time the board needs to reboot after the port opens.
pub const DEFAULT_SETTLE_TIME: Duration = Duration::from_secs(1);

/// Prefix the firmware puts in front of every error report.
const ERROR_PREFIX: &str = "ERROR";

/// Protocol client for one PFTL DAQ board.
#[derive(Debug, Clone)]
pub struct PftlDevice {
    adapter: SerialAdapter,
    settle_time: Duration,
}

impl PftlDevice {
    /// Driver for the board on `port` with the firmware's default serial settings.
    /// The port is not opened until [`initialize`](Self::initialize).
    pub fn new(port: &str) -> Self {
        Self::with_adapter(SerialAdapter::new(SerialSettings::new(port)))
    }

    /// Driver over an existing adapter.
    pub fn with_adapter(adapter: SerialAdapter) -> Self {
        Self {
            adapter,
            settle_time: DEFAULT_SETTLE_TIME,
        }
    }

    /// Override the post-open settle period
    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Port the driver talks to
    pub fn port(&self) -> &str {
        &self.adapter.settings().port
    }

    /// Open the port and wait for the board to boot.
    pub async fn initialize(&self) -> DaqResult<()> {
        self.adapter.open().await?;
        if !self.settle_time.is_zero() {
            debug!("Waiting {:?} for '{}' to settle", self.settle_time, self.port());
            tokio::time::sleep(self.settle_time).await;
        }
        info!("PFTL DAQ on '{}' initialized", self.port());
        Ok(())
    }

    /// Close the port. Safe to call repeatedly.
    pub async fn finalize(&self) {
        self.adapter.close().await;
    }

    /// Whether the port is currently open
    pub async fn is_open(&self) -> bool {
        self.adapter.is_open().await
    }

    /// Identification string of the board.
    pub async fn identify(&self) -> DaqResult<String> {
        self.query("*IDN?").await
    }

    /// Raw ADC code of input `channel`.
    pub async fn read_input(&self, channel: u32) -> DaqResult<i64> {
        self.query_code(&format!("MEAS:CH{}?", channel)).await
    }

    /// Set output `channel` to `code`. Returns the device reply unparsed.
    pub async fn write_output(&self, channel: u32, code: i64) -> DaqResult<String> {
        self.query(&format!("OUT:CH{} {}", channel, code)).await
    }

    /// Raw DAC code currently set on output `channel`.
    pub async fn read_output(&self, channel: u32) -> DaqResult<i64> {
        self.query_code(&format!("OUT:CH{}?", channel)).await
    }

    async fn query_code(&self, request: &str) -> DaqResult<i64> {
        let response = self.query(request).await?;
        parse_code(request, &response)
    }

    /// Shared request path: every operation gets the `ERROR` check.
    async fn query(&self, request: &str) -> DaqResult<String> {
        let response = self.adapter.request(request).await?;
        if response.starts_with(ERROR_PREFIX) {
            return Err(DaqError::Device(response));
        }
        Ok(response)
    }
}

fn parse_code(request: &str, response: &str) -> DaqResult<i64> {
    response.trim().parse::<i64>().map_err(|_| DaqError::Protocol {
        request: request.to_string(),
        response: response.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_code() {
        assert_eq!(parse_code("MEAS:CH0?", "512").unwrap(), 512);
        assert_eq!(parse_code("MEAS:CH0?", " 7 ").unwrap(), 7);
        for bad in ["", "1.5", "abc", "12 34"] {
            assert!(matches!(
                parse_code("MEAS:CH0?", bad),
                Err(DaqError::Protocol { .. })
            ));
        }
    }

    #[test]
    fn test_new_does_not_open() {
        let device = PftlDevice::new("/dev/ttyACM0");
        assert_eq!(device.port(), "/dev/ttyACM0");
        assert_eq!(device.settle_time, DEFAULT_SETTLE_TIME);
    }
}
