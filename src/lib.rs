//! Core library for the pftl_daq application.
//!
//! Drives the PFTL DAQ board over a serial line: typed physical quantities,
//! the line-oriented serial transport, the device command set, a DAQ
//! abstraction with a simulated and a real variant, a background voltage-sweep
//! engine and the result writers. The `pftl_daq` binary is a thin CLI on top.

pub mod adapters;
pub mod config;
pub mod daq;
pub mod data;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod units;
