//! Parameters of one voltage sweep.

use crate::config::ExperimentConfig;
use crate::error::{DaqError, DaqResult};
use crate::units::{Quantity, Unit};
use serde::Serialize;
use std::time::Duration;

/// Largest number of points a single sweep may have.
pub const MAX_STEPS: usize = 1_000_000;

/// Immutable parameters of one sweep, captured when the scan starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanPlan {
    start: Quantity,
    stop: Quantity,
    steps: usize,
    delay: Quantity,
    channel_out: u32,
    channel_in: u32,
    source_resistance: Option<Quantity>,
}

impl ScanPlan {
    /// Validate and build a plan.
    ///
    /// `start`/`stop` must be volts, `delay` non-negative seconds and `steps`
    /// between 1 and [`MAX_STEPS`].
    pub fn new(
        start: Quantity,
        stop: Quantity,
        steps: usize,
        delay: Quantity,
        channel_out: u32,
        channel_in: u32,
    ) -> DaqResult<Self> {
        start.to(Unit::Volt)?;
        stop.to(Unit::Volt)?;
        delay.as_duration()?;
        if steps == 0 {
            return Err(DaqError::Configuration(
                "a scan needs at least one step".to_string(),
            ));
        }
        if steps > MAX_STEPS {
            return Err(DaqError::Configuration(format!(
                "a scan can have at most {} steps, got {}",
                MAX_STEPS, steps
            )));
        }
        Ok(Self {
            start,
            stop,
            steps,
            delay,
            channel_out,
            channel_in,
            source_resistance: None,
        })
    }

    /// Divide every reading by `resistance`, recording currents instead of voltages.
    pub fn with_source_resistance(mut self, resistance: Quantity) -> DaqResult<Self> {
        resistance.to(Unit::Ohm)?;
        if resistance.magnitude() <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "source resistance must be positive, got {}",
                resistance
            )));
        }
        self.source_resistance = Some(resistance);
        Ok(self)
    }

    /// Plan described by the `Scan` and `DAQ` sections of a configuration.
    pub fn from_config(config: &ExperimentConfig) -> DaqResult<Self> {
        let scan = &config.scan;
        let plan = Self::new(
            scan.start,
            scan.stop,
            scan.num_steps,
            scan.delay,
            scan.channel_out,
            scan.channel_in,
        )?;
        match config.daq.resistance {
            Some(resistance) => plan.with_source_resistance(resistance),
            None => Ok(plan),
        }
    }

    /// First output voltage
    pub fn start(&self) -> Quantity {
        self.start
    }

    /// Last output voltage
    pub fn stop(&self) -> Quantity {
        self.stop
    }

    /// Number of points
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Pause between points
    pub fn delay(&self) -> Duration {
        // Validated in `new`.
        self.delay.as_duration().unwrap_or_default()
    }

    /// Output channel being swept
    pub fn channel_out(&self) -> u32 {
        self.channel_out
    }

    /// Input channel being measured
    pub fn channel_in(&self) -> u32 {
        self.channel_in
    }

    /// Resistance readings are divided by, if any
    pub fn source_resistance(&self) -> Option<Quantity> {
        self.source_resistance
    }

    /// Unit of the recorded values: amps with a source resistance, volts otherwise.
    pub fn value_unit(&self) -> Unit {
        if self.source_resistance.is_some() {
            Unit::Amp
        } else {
            Unit::Volt
        }
    }

    /// `steps` evenly spaced voltages from `start` to `stop`, both included.
    pub fn voltage_series(&self) -> Vec<Quantity> {
        let start = self.start.magnitude();
        let stop = self.stop.magnitude();
        if self.steps == 1 {
            return vec![self.start];
        }
        let step = (stop - start) / (self.steps - 1) as f64;
        (0..self.steps)
            .map(|i| {
                if i == self.steps - 1 {
                    self.stop
                } else {
                    Quantity::volts(start + step * i as f64)
                }
            })
            .collect()
    }
}
