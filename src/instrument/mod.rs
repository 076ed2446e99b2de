//! Instrument drivers.
//!
//! Drivers map domain operations onto [`SerialAdapter`](crate::adapters::SerialAdapter)
//! requests and validate the replies.

pub mod pftl_device;

pub use pftl_device::PftlDevice;
