use async_trait::async_trait;
use pftl_daq::daq::{Daq, DummyDaq};
use pftl_daq::error::{DaqError, DaqResult};
use pftl_daq::experiment::{ScanEngine, ScanPlan, ScanRun, ScanState};
use pftl_daq::units::Quantity;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn plan(steps: usize, delay: Duration) -> ScanPlan {
    ScanPlan::new(
        Quantity::volts(0.0),
        Quantity::volts(1.0),
        steps,
        Quantity::seconds(delay.as_secs_f64()),
        0,
        0,
    )
    .unwrap()
}

async fn wait_finished(run: &ScanRun) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while run.state() != ScanState::Finished {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("scan did not finish");
}

/// DAQ whose input read fails from the `fail_at`-th call on.
struct FailingDaq {
    inner: DummyDaq,
    reads: AtomicUsize,
    fail_at: usize,
}

#[async_trait]
impl Daq for FailingDaq {
    fn name(&self) -> &str {
        "Failing Daq"
    }

    async fn initialize(&self) -> DaqResult<()> {
        Ok(())
    }

    async fn idn(&self) -> DaqResult<String> {
        self.inner.idn().await
    }

    async fn set_output_voltage(&self, channel: u32, volts: &Quantity) -> DaqResult<()> {
        self.inner.set_output_voltage(channel, volts).await
    }

    async fn get_output_voltage(&self, channel: u32) -> DaqResult<Quantity> {
        self.inner.get_output_voltage(channel).await
    }

    async fn get_input_voltage(&self, channel: u32) -> DaqResult<Quantity> {
        if self.reads.fetch_add(1, Ordering::SeqCst) >= self.fail_at {
            return Err(DaqError::Device("ERROR bad channel".to_string()));
        }
        self.inner.get_input_voltage(channel).await
    }

    async fn finalize(&self) -> DaqResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_three_step_scan_records_script() {
    let engine = ScanEngine::new(Arc::new(DummyDaq::scripted([0.1, 0.5, 0.9])));
    let run = engine.start(plan(3, Duration::ZERO)).unwrap();
    wait_finished(&run).await;

    assert_eq!(run.cursor(), 3);
    assert_eq!(
        run.voltages(),
        &[Quantity::volts(0.0), Quantity::volts(0.5), Quantity::volts(1.0)]
    );
    assert_eq!(
        run.values(),
        vec![Quantity::volts(0.1), Quantity::volts(0.5), Quantity::volts(0.9)]
    );
    assert_eq!(run.voltage_out(), Quantity::volts(1.0));
    assert_eq!(run.last_value(), Quantity::volts(0.9));
    assert!(run.error().is_none());
    assert_eq!(engine.state(), ScanState::Finished);
}

#[tokio::test]
async fn test_stop_before_first_step() {
    let engine = ScanEngine::new(Arc::new(DummyDaq::scripted([0.1, 0.2, 0.3])));
    // Current-thread runtime: the scan task cannot run until we yield.
    let run = engine.start(plan(3, Duration::ZERO)).unwrap();
    engine.stop();
    assert_eq!(run.state(), ScanState::Cancelling);
    wait_finished(&run).await;

    assert_eq!(run.cursor(), 0);
    assert_eq!(run.values(), vec![Quantity::volts(0.0); 3]);
}

#[tokio::test]
async fn test_stop_mid_run_keeps_prefix() {
    let script: Vec<f64> = (0..100).map(|i| i as f64 / 100.0).collect();
    let engine = ScanEngine::new(Arc::new(DummyDaq::scripted(script.clone())));
    let run = engine.start(plan(100, Duration::from_millis(20))).unwrap();

    while run.cursor() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.stop();
    wait_finished(&run).await;

    let cursor = run.cursor();
    assert!(cursor >= 2 && cursor < 100, "cursor = {}", cursor);
    let values = run.values();
    for (i, value) in values.iter().enumerate() {
        let expected = if i < cursor { script[i] } else { 0.0 };
        assert_eq!(value.magnitude(), expected);
    }
}

#[tokio::test]
async fn test_second_start_rejected_while_running() {
    let engine = ScanEngine::new(Arc::new(DummyDaq::scripted([0.1, 0.2, 0.3, 0.4, 0.5])));
    let run = engine.start(plan(5, Duration::from_millis(20))).unwrap();

    let err = engine.start(plan(2, Duration::ZERO)).unwrap_err();
    assert!(matches!(err, DaqError::AlreadyRunning));
    assert!(Arc::ptr_eq(&run, &engine.current_run().unwrap()));

    wait_finished(&run).await;
    assert_eq!(run.cursor(), 5);
    assert_eq!(run.voltages().len(), 5);
    assert_eq!(run.values()[4], Quantity::volts(0.5));
}

#[tokio::test]
async fn test_step_error_aborts_run() {
    let daq = FailingDaq {
        inner: DummyDaq::scripted([0.1, 0.2, 0.3, 0.4]),
        reads: AtomicUsize::new(0),
        fail_at: 2,
    };
    let engine = ScanEngine::new(Arc::new(daq));
    let run = engine.start(plan(4, Duration::ZERO)).unwrap();
    wait_finished(&run).await;

    assert_eq!(run.cursor(), 2);
    assert_eq!(
        run.values(),
        vec![
            Quantity::volts(0.1),
            Quantity::volts(0.2),
            Quantity::volts(0.0),
            Quantity::volts(0.0)
        ]
    );
    let err = run.error().expect("error recorded");
    assert!(matches!(*err, DaqError::Device(ref m) if m == "ERROR bad channel"));

    let snapshot = run.snapshot();
    assert_eq!(snapshot.state, ScanState::Finished);
    assert_eq!(
        snapshot.error.as_deref(),
        Some("Device reported an error: ERROR bad channel")
    );

    // A failed run does not block the next one.
    assert!(engine.start(plan(1, Duration::ZERO)).is_ok());
}

#[tokio::test]
async fn test_reader_never_sees_unwritten_values() {
    let script: Vec<f64> = (1..=200).map(|i| i as f64).collect();
    let engine = ScanEngine::new(Arc::new(DummyDaq::scripted(script)));
    let run = engine.start(plan(200, Duration::ZERO)).unwrap();

    loop {
        let snapshot = run.snapshot();
        for (i, value) in snapshot.values.iter().enumerate() {
            if i < snapshot.cursor {
                assert_eq!(value.magnitude(), (i + 1) as f64);
            }
        }
        if snapshot.state == ScanState::Finished {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(run.cursor(), 200);
}

#[tokio::test]
async fn test_finalize_stops_running_scan() {
    let engine = ScanEngine::new(Arc::new(DummyDaq::seeded(3)))
        .with_poll_interval(Duration::from_millis(5));
    let run = engine.start(plan(1000, Duration::from_millis(10))).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    engine.finalize().await.unwrap();
    assert_eq!(run.state(), ScanState::Finished);
    assert!(run.cursor() < 1000);
}
