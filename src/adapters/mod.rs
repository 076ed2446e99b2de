//! Hardware adapter implementations
//!
//! Low-level I/O for talking to the DAQ: the serial transport and an
//! in-memory port for running without hardware.

pub mod mock;
pub mod serial_adapter;

pub use mock::{MockSerialPort, RequestLog, SimulatedFirmware};
pub use serial_adapter::{Encoding, PortOpener, SerialAdapter, SerialSettings, SerialStream};
