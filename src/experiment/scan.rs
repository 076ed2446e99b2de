//! Scan engine: runs a [`ScanPlan`] against a [`Daq`] on a background task.
//!
//! # State machine
//!
//! ```text
//! Idle ──start──▶ Running ──last step──▶ Finished
//!                    │                      ▲
//!                   stop                    │
//!                    ▼                      │
//!                Cancelling ──next step boundary
//! ```
//!
//! A step error also ends the run in `Finished`, with the error kept on the run.
//!
//! # Sharing
//!
//! Each [`ScanRun`] is written only by its scan task. Readers see a cursor that
//! is published (release) after the slot it covers has been written, so every
//! index below an observed cursor (acquire) holds its final value. The series
//! itself is a fixed array of atomics; no lock is taken on the step path.

use super::plan::ScanPlan;
use crate::daq::Daq;
use crate::error::{DaqError, DaqResult};
use crate::units::{Quantity, Unit};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Interval at which [`ScanEngine::finalize`] checks for the run to end.
pub const FINALIZE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of a scan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ScanState {
    /// No scan has been started
    Idle = 0,
    /// Steps are being executed
    Running = 1,
    /// Stop requested, waiting for the next step boundary
    Cancelling = 2,
    /// Completed, stopped or failed
    Finished = 3,
}

impl ScanState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ScanState::Running,
            2 => ScanState::Cancelling,
            3 => ScanState::Finished,
            _ => ScanState::Idle,
        }
    }

    /// Whether a scan task is still attached to the run.
    pub fn is_active(self) -> bool {
        matches!(self, ScanState::Running | ScanState::Cancelling)
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Idle => "Idle",
            ScanState::Running => "Running",
            ScanState::Cancelling => "Cancelling",
            ScanState::Finished => "Finished",
        };
        f.write_str(name)
    }
}

/// An f64 that can be shared between the scan task and readers.
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self, order: Ordering) -> f64 {
        f64::from_bits(self.0.load(order))
    }

    fn store(&self, value: f64, order: Ordering) {
        self.0.store(value.to_bits(), order);
    }
}

/// Record of one executed plan.
///
/// Created by [`ScanEngine::start`], mutated only by its scan task.
#[derive(Debug)]
pub struct ScanRun {
    plan: ScanPlan,
    voltages: Vec<Quantity>,
    value_unit: Unit,
    values: Box<[AtomicF64]>,
    cursor: AtomicUsize,
    state: AtomicU8,
    cancel: AtomicBool,
    voltage_out: AtomicF64,
    last_value: AtomicF64,
    error: Mutex<Option<Arc<DaqError>>>,
}

impl ScanRun {
    fn new(plan: ScanPlan) -> Self {
        let voltages = plan.voltage_series();
        let values = (0..voltages.len()).map(|_| AtomicF64::new(0.0)).collect();
        Self {
            value_unit: plan.value_unit(),
            plan,
            voltages,
            values,
            cursor: AtomicUsize::new(0),
            state: AtomicU8::new(ScanState::Running as u8),
            cancel: AtomicBool::new(false),
            voltage_out: AtomicF64::new(0.0),
            last_value: AtomicF64::new(0.0),
            error: Mutex::new(None),
        }
    }

    /// Plan this run executes
    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    /// Current state
    pub fn state(&self) -> ScanState {
        ScanState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of completed steps. Every value below this index is final.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Planned output voltages, one per step
    pub fn voltages(&self) -> &[Quantity] {
        &self.voltages
    }

    /// Unit of the recorded values
    pub fn value_unit(&self) -> Unit {
        self.value_unit
    }

    /// Value recorded at `index`. Entries at or past the cursor read as zero
    /// until their step completes.
    pub fn value(&self, index: usize) -> Option<Quantity> {
        self.values
            .get(index)
            .map(|v| Quantity::new(v.load(Ordering::Relaxed), self.value_unit))
    }

    /// Full value series, zero past the cursor observed at the start of the call.
    pub fn values(&self) -> Vec<Quantity> {
        self.values_below(self.cursor())
    }

    /// Series with every slot at or past `cursor` read as zero.
    fn values_below(&self, cursor: usize) -> Vec<Quantity> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let magnitude = if i < cursor {
                    v.load(Ordering::Relaxed)
                } else {
                    0.0
                };
                Quantity::new(magnitude, self.value_unit)
            })
            .collect()
    }

    /// Output voltage read back at the most recent step
    pub fn voltage_out(&self) -> Quantity {
        Quantity::volts(self.voltage_out.load(Ordering::Relaxed))
    }

    /// Most recently recorded value
    pub fn last_value(&self) -> Quantity {
        Quantity::new(self.last_value.load(Ordering::Relaxed), self.value_unit)
    }

    /// Error that ended the run, if a step failed
    pub fn error(&self) -> Option<Arc<DaqError>> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a stop was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Owned copy of the run for plotting or saving.
    pub fn snapshot(&self) -> ScanSnapshot {
        let cursor = self.cursor();
        let values = self.values_below(cursor);
        ScanSnapshot {
            plan: self.plan.clone(),
            voltages: self.voltages.clone(),
            values,
            cursor,
            state: self.state(),
            error: self.error().map(|e| e.to_string()),
        }
    }

    fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        let _ = self.state.compare_exchange(
            ScanState::Running as u8,
            ScanState::Cancelling as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn publish_voltage_out(&self, volts: Quantity) {
        self.voltage_out.store(volts.magnitude(), Ordering::Relaxed);
    }

    /// Write slot `index`, then publish the cursor past it.
    fn record(&self, index: usize, value: f64) {
        self.values[index].store(value, Ordering::Relaxed);
        self.last_value.store(value, Ordering::Relaxed);
        self.cursor.store(index + 1, Ordering::Release);
    }

    fn fail(&self, err: DaqError) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(err));
    }

    fn finish(&self) {
        self.state.store(ScanState::Finished as u8, Ordering::Release);
    }
}

/// Owned copy of a [`ScanRun`] at one moment.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSnapshot {
    /// Plan executed
    pub plan: ScanPlan,
    /// Planned output voltages
    pub voltages: Vec<Quantity>,
    /// Recorded values; entries at or past `cursor` are zero
    pub values: Vec<Quantity>,
    /// Number of valid entries
    pub cursor: usize,
    /// State when the copy was taken
    pub state: ScanState,
    /// Error text if a step failed
    pub error: Option<String>,
}

impl ScanSnapshot {
    /// `(voltage, value)` pairs for the completed steps only.
    pub fn points(&self) -> impl Iterator<Item = (Quantity, Quantity)> + '_ {
        self.voltages
            .iter()
            .copied()
            .zip(self.values.iter().copied())
            .take(self.cursor)
    }
}

/// Runs one scan at a time against a DAQ.
pub struct ScanEngine {
    daq: Arc<dyn Daq>,
    current: RwLock<Option<Arc<ScanRun>>>,
    poll_interval: Duration,
}

impl fmt::Debug for ScanEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanEngine")
            .field("daq", &self.daq.name())
            .field("state", &self.state())
            .finish()
    }
}

impl ScanEngine {
    /// Engine driving `daq`. The DAQ is expected to be initialized already.
    pub fn new(daq: Arc<dyn Daq>) -> Self {
        Self {
            daq,
            current: RwLock::new(None),
            poll_interval: FINALIZE_POLL_INTERVAL,
        }
    }

    /// Override the interval used by [`finalize`](Self::finalize) to poll for completion
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// DAQ driven by this engine
    pub fn daq(&self) -> &Arc<dyn Daq> {
        &self.daq
    }

    /// Most recent run, if any scan was started.
    pub fn current_run(&self) -> Option<Arc<ScanRun>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// State of the most recent run, `Idle` if none.
    pub fn state(&self) -> ScanState {
        self.current_run()
            .map_or(ScanState::Idle, |run| run.state())
    }

    /// Start `plan` on a background task.
    ///
    /// Rejected with [`DaqError::AlreadyRunning`] while a run is `Running` or
    /// `Cancelling`; the active run is left untouched. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self, plan: ScanPlan) -> DaqResult<Arc<ScanRun>> {
        let run = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(active) = current.as_ref().filter(|run| run.state().is_active()) {
                warn!(
                    "Scan already running ({}/{} steps done)",
                    active.cursor(),
                    active.plan().steps()
                );
                return Err(DaqError::AlreadyRunning);
            }
            let run = Arc::new(ScanRun::new(plan));
            *current = Some(run.clone());
            run
        };

        info!(
            "Starting scan: {} to {} in {} steps on CH{} -> CH{}",
            run.plan().start(),
            run.plan().stop(),
            run.plan().steps(),
            run.plan().channel_out(),
            run.plan().channel_in()
        );
        tokio::spawn(execute(self.daq.clone(), run.clone()));
        Ok(run)
    }

    /// Ask the current run to stop at its next step boundary. Returns immediately.
    pub fn stop(&self) {
        if let Some(run) = self.current_run() {
            if run.state().is_active() {
                info!("Stop requested at step {}", run.cursor());
            }
            run.request_cancel();
        }
    }

    /// Stop the current run, wait for it to end, then finalize the DAQ.
    pub async fn finalize(&self) -> DaqResult<()> {
        info!("Finalizing scan engine");
        self.stop();
        while self.state().is_active() {
            tokio::time::sleep(self.poll_interval).await;
        }
        self.daq.finalize().await
    }
}

async fn execute(daq: Arc<dyn Daq>, run: Arc<ScanRun>) {
    if let Err(e) = run_steps(daq.as_ref(), &run).await {
        error!("Scan aborted at step {}: {}", run.cursor(), e);
        run.fail(e);
    }
    run.finish();
    info!(
        "Scan finished: {}/{} steps recorded",
        run.cursor(),
        run.plan().steps()
    );
}

async fn run_steps(daq: &dyn Daq, run: &ScanRun) -> DaqResult<()> {
    let plan = run.plan();
    let delay = plan.delay();
    let last = run.voltages().len().saturating_sub(1);

    for (index, target) in run.voltages().iter().enumerate() {
        if run.is_cancelled() {
            info!("Scan cancelled before step {}", index);
            return Ok(());
        }

        daq.set_output_voltage(plan.channel_out(), target).await?;
        let voltage_out = daq.get_output_voltage(plan.channel_out()).await?;
        run.publish_voltage_out(voltage_out);

        let measured = daq.get_input_voltage(plan.channel_in()).await?;
        let value = match plan.source_resistance() {
            Some(resistance) => measured.checked_div(&resistance)?,
            None => measured,
        };
        let value = value.to(run.value_unit())?;
        run.record(index, value.magnitude());
        debug!("Step {}: out={} measured={}", index, voltage_out, value);

        if index < last && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq::DummyDaq;

    fn plan(steps: usize, delay_s: f64) -> ScanPlan {
        ScanPlan::new(
            Quantity::volts(0.0),
            Quantity::volts(1.0),
            steps,
            Quantity::seconds(delay_s),
            0,
            0,
        )
        .unwrap()
    }

    async fn wait_finished(run: &ScanRun) {
        while run.state() != ScanState::Finished {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            ScanState::Idle,
            ScanState::Running,
            ScanState::Cancelling,
            ScanState::Finished,
        ] {
            assert_eq!(ScanState::from_u8(state as u8), state);
        }
        assert!(ScanState::Cancelling.is_active());
        assert!(!ScanState::Finished.is_active());
    }

    #[test]
    fn test_record_publishes_cursor_after_value() {
        let run = ScanRun::new(plan(3, 0.0));
        assert_eq!(run.cursor(), 0);
        assert_eq!(run.values(), vec![Quantity::volts(0.0); 3]);

        run.record(0, 0.25);
        assert_eq!(run.cursor(), 1);
        assert_eq!(run.value(0), Some(Quantity::volts(0.25)));
        assert_eq!(run.last_value(), Quantity::volts(0.25));
        assert_eq!(run.snapshot().points().count(), 1);
    }

    #[test]
    fn test_snapshot_and_values_mask_the_same_slots() {
        let run = ScanRun::new(plan(4, 0.0));
        run.record(0, 0.5);
        run.record(1, 0.75);
        // Written but not yet published
        run.values[2].store(9.0, Ordering::Relaxed);

        let snapshot = run.snapshot();
        assert_eq!(snapshot.cursor, 2);
        assert_eq!(snapshot.values, run.values());
        assert_eq!(snapshot.values[1], Quantity::volts(0.75));
        assert_eq!(snapshot.values[2], Quantity::volts(0.0));
        assert_eq!(run.value(2), Some(Quantity::volts(9.0)));
    }

    #[test]
    fn test_cancel_moves_running_to_cancelling_only() {
        let run = ScanRun::new(plan(3, 0.0));
        run.request_cancel();
        assert_eq!(run.state(), ScanState::Cancelling);
        run.finish();
        run.request_cancel();
        assert_eq!(run.state(), ScanState::Finished);
    }

    #[tokio::test]
    async fn test_engine_starts_idle() {
        let engine = ScanEngine::new(Arc::new(DummyDaq::new()));
        assert_eq!(engine.state(), ScanState::Idle);
        assert!(engine.current_run().is_none());
        engine.stop();
        assert_eq!(engine.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_resistance_turns_readings_into_currents() {
        let engine = ScanEngine::new(Arc::new(DummyDaq::scripted([0.2, 0.4])));
        let plan = plan(2, 0.0)
            .with_source_resistance(Quantity::ohms(100.0))
            .unwrap();
        let run = engine.start(plan).unwrap();
        wait_finished(&run).await;

        assert_eq!(run.value_unit(), Unit::Amp);
        let values = run.values();
        assert!((values[0].magnitude() - 0.002).abs() < 1e-12);
        assert!((values[1].magnitude() - 0.004).abs() < 1e-12);
        assert_eq!(run.voltage_out(), Quantity::volts(1.0));
    }

    #[tokio::test]
    async fn test_restart_after_finish() {
        let engine = ScanEngine::new(Arc::new(DummyDaq::seeded(1)));
        let first = engine.start(plan(2, 0.0)).unwrap();
        wait_finished(&first).await;
        let second = engine.start(plan(4, 0.0)).unwrap();
        wait_finished(&second).await;
        assert_eq!(second.cursor(), 4);
        assert!(!Arc::ptr_eq(&first, &engine.current_run().unwrap()));
    }
}
