//! Simulated DAQ that lets the program run without a board attached.
//!
//! By default every read returns an independent random voltage in [0, 1) V
//! and writes are ignored. A scripted variant returns a fixed sequence of
//! input readings and echoes back the last output voltage written, which makes
//! scans reproducible.

use super::Daq;
use crate::error::DaqResult;
use crate::units::Quantity;
use async_trait::async_trait;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
struct DummyState {
    rng: StdRng,
    script: Option<VecDeque<f64>>,
    outputs: HashMap<u32, Quantity>,
}

/// Simulated DAQ.
#[derive(Debug)]
pub struct DummyDaq {
    state: Mutex<DummyState>,
}

impl Default for DummyDaq {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyDaq {
    /// Random readings from an entropy-seeded generator.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy(), None)
    }

    /// Random readings from a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), None)
    }

    /// Input readings (in volts) returned in order. Output reads echo the last
    /// value written. Once the script runs out, inputs are random again.
    pub fn scripted(inputs: impl IntoIterator<Item = f64>) -> Self {
        Self::with_rng(StdRng::seed_from_u64(0), Some(inputs.into_iter().collect()))
    }

    fn with_rng(rng: StdRng, script: Option<VecDeque<f64>>) -> Self {
        Self {
            state: Mutex::new(DummyState {
                rng,
                script,
                outputs: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DummyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Daq for DummyDaq {
    fn name(&self) -> &str {
        "Dummy Daq"
    }

    async fn initialize(&self) -> DaqResult<()> {
        debug!("Dummy DAQ initialized");
        Ok(())
    }

    async fn idn(&self) -> DaqResult<String> {
        Ok("Dummy DAQ (simulated)".to_string())
    }

    async fn set_output_voltage(&self, channel: u32, volts: &Quantity) -> DaqResult<()> {
        let mut state = self.state();
        if state.script.is_some() {
            state.outputs.insert(channel, *volts);
        }
        Ok(())
    }

    async fn get_output_voltage(&self, channel: u32) -> DaqResult<Quantity> {
        let mut state = self.state();
        if state.script.is_some() {
            return Ok(state
                .outputs
                .get(&channel)
                .copied()
                .unwrap_or(Quantity::volts(0.0)));
        }
        Ok(Quantity::volts(state.rng.gen::<f64>()))
    }

    async fn get_input_voltage(&self, _channel: u32) -> DaqResult<Quantity> {
        let mut state = self.state();
        let DummyState { rng, script, .. } = &mut *state;
        let volts = script
            .as_mut()
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| rng.gen::<f64>());
        Ok(Quantity::volts(volts))
    }

    async fn finalize(&self) -> DaqResult<()> {
        debug!("Dummy DAQ finalized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_random_readings_in_unit_interval() {
        let daq = DummyDaq::seeded(7);
        daq.initialize().await.unwrap();
        for _ in 0..100 {
            let v = daq.get_input_voltage(0).await.unwrap().magnitude();
            assert!((0.0..1.0).contains(&v));
            let v = daq.get_output_voltage(0).await.unwrap().magnitude();
            assert!((0.0..1.0).contains(&v));
        }
        daq.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn test_scripted_readings_in_order() {
        let daq = DummyDaq::scripted([0.1, 0.5, 0.9]);
        for expected in [0.1, 0.5, 0.9] {
            assert_eq!(daq.get_input_voltage(0).await.unwrap(), Quantity::volts(expected));
        }
        let fallback = daq.get_input_voltage(0).await.unwrap().magnitude();
        assert!((0.0..1.0).contains(&fallback));
    }

    #[tokio::test]
    async fn test_scripted_output_echo() {
        let daq = DummyDaq::scripted([]);
        assert_eq!(daq.get_output_voltage(1).await.unwrap(), Quantity::volts(0.0));
        daq.set_output_voltage(1, &Quantity::volts(2.5)).await.unwrap();
        assert_eq!(daq.get_output_voltage(1).await.unwrap(), Quantity::volts(2.5));
    }
}
