//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the errors that can occur between the serial port and the result files.
//!
//! ## Error Hierarchy
//!
//! - **Transport**: `PortUnavailable`, `Timeout`, `Encoding`, plus the plumbing
//!   variants `SerialPortNotConnected`, `SerialUnexpectedEof` and
//!   `SerialFeatureDisabled`.
//! - **Protocol**: `Protocol` for malformed or non-numeric responses and `Device`
//!   for responses the firmware flags with the `ERROR` prefix.
//! - **Units**: `IncompatibleUnit` and `Parse` for misuse of [`crate::units::Quantity`].
//! - **Scan engine**: `AlreadyRunning`, `DaqNotLoaded`, `Task`.
//! - **Persistence and configuration**: `Io`, `Csv`, `Metadata`, `Config`,
//!   `Configuration`.
//!
//! Nothing in the crate retries on its own. [`DaqError::is_retryable`] tells a
//! caller whether repeating the same call has a chance of succeeding.

use crate::units::Unit;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Every failure the DAQ client, scan engine and result writers can report.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Serial port '{port}' unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    #[error("Serial read timeout after {0:?}")]
    Timeout(Duration),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Malformed response to '{request}': '{response}'")]
    Protocol { request: String, response: String },

    #[error("Device reported an error: {0}")]
    Device(String),

    #[error("Incompatible units: {from} is not convertible to {to}")]
    IncompatibleUnit { from: Unit, to: Unit },

    #[error("Cannot parse '{0}' as a quantity")]
    Parse(String),

    #[error("A scan is already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write data file: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to serialize metadata: {0}")]
    Metadata(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("No DAQ loaded")]
    DaqNotLoaded,

    #[error("Background task failed: {0}")]
    Task(String),
}

impl DaqError {
    /// Whether repeating the failed call may succeed without any other action.
    ///
    /// Only timeouts qualify; everything else needs the caller to change
    /// something first (re-initialize, fix the request, free the port).
    pub fn is_retryable(&self) -> bool {
        matches!(self, DaqError::Timeout(_))
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Device("ERROR bad channel".to_string());
        assert_eq!(err.to_string(), "Device reported an error: ERROR bad channel");
    }

    #[test]
    fn test_only_timeouts_are_retryable() {
        assert!(DaqError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!DaqError::Device("ERROR".into()).is_retryable());
        assert!(!DaqError::AlreadyRunning.is_retryable());
    }

    #[test]
    fn test_incompatible_unit_display() {
        let err = DaqError::IncompatibleUnit {
            from: Unit::Volt,
            to: Unit::Second,
        };
        assert!(err.to_string().contains("V is not convertible to s"));
    }
}
