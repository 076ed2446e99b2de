use pftl_daq::config::ExperimentConfig;
use pftl_daq::daq::DummyDaq;
use pftl_daq::error::DaqError;
use pftl_daq::experiment::{Experiment, ScanState};
use pftl_daq::units::{Quantity, Unit};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn config_in(folder: &Path, resistance: Option<&str>) -> ExperimentConfig {
    let resistance = resistance
        .map(|r| format!("  resistance: {}\n", r))
        .unwrap_or_default();
    let yaml = format!(
        "DAQ:\n  name: DummyDaq\n{}Scan:\n  start: 0V\n  stop: 1V\n  num_steps: 3\n  delay: 1ms\n  channel_in: 0\n  channel_out: 0\nSaving:\n  folder: {}\n  filename: data.dat\n",
        resistance,
        folder.display()
    );
    ExperimentConfig::from_yaml_str(&yaml).unwrap()
}

async fn run_to_end(experiment: &Experiment) {
    let run = experiment.start_scan().unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while run.state() != ScanState::Finished {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[test]
fn test_shipped_config_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/experiment.yml");
    let experiment = Experiment::from_file(path).unwrap();
    let config = experiment.config();
    assert_eq!(config.scan.num_steps, 50);
    assert_eq!(config.daq.resistance, Some(Quantity::ohms(220.0)));
    assert!(config.saving_folder().is_absolute() || dirs::home_dir().is_none());
}

#[tokio::test]
async fn test_end_to_end_saves_numbered_files() {
    let dir = tempdir().unwrap();
    let mut experiment = Experiment::new(config_in(dir.path(), None));
    experiment
        .load_daq_with(Arc::new(DummyDaq::scripted([0.1, 0.5, 0.9, 0.2, 0.6, 1.0])))
        .await
        .unwrap();

    run_to_end(&experiment).await;
    let first = experiment.save_data().unwrap();
    let first_text = std::fs::read_to_string(&first.data).unwrap();

    run_to_end(&experiment).await;
    let second = experiment.save_data().unwrap();

    assert!(first.data.ends_with("data_0001.dat"));
    assert!(second.data.ends_with("data_0002.dat"));
    assert_eq!(first.data.parent(), second.data.parent());
    assert_eq!(std::fs::read_to_string(&first.data).unwrap(), first_text);

    let rows: Vec<&str> = first_text.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[1], "0,0.1");
    assert_eq!(rows[3], "1,0.9");

    experiment.finalize().await.unwrap();
}

#[tokio::test]
async fn test_resistance_records_currents() {
    let dir = tempdir().unwrap();
    let mut experiment = Experiment::new(config_in(dir.path(), Some("1kOhm")));
    experiment
        .load_daq_with(Arc::new(DummyDaq::scripted([0.5, 1.0, 2.0])))
        .await
        .unwrap();

    run_to_end(&experiment).await;
    let run = experiment.current_run().unwrap();
    assert_eq!(run.value_unit(), Unit::Amp);
    let last = run.last_value().value_in("mA").unwrap();
    assert!((last - 2.0).abs() < 1e-9);

    let files = experiment.save_data().unwrap();
    let metadata = std::fs::read_to_string(files.metadata).unwrap();
    assert!(metadata.contains("points_recorded: 3"));
    assert!(metadata.contains("source_resistance: 1000Ohm"));
    let sidecar: serde_yaml::Value = serde_yaml::from_str(&metadata).unwrap();
    assert_eq!(sidecar["config"]["DAQ"]["name"].as_str(), Some("DummyDaq"));
    assert_eq!(sidecar["config"]["Scan"]["num_steps"].as_u64(), Some(3));
}

#[tokio::test]
async fn test_start_twice_reports_already_running() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path(), None);
    config.scan.num_steps = 20;
    config.scan.delay = Quantity::seconds(0.01);
    let mut experiment = Experiment::new(config);
    experiment
        .load_daq_with(Arc::new(DummyDaq::seeded(5)))
        .await
        .unwrap();

    let run = experiment.start_scan().unwrap();
    assert!(matches!(
        experiment.start_scan(),
        Err(DaqError::AlreadyRunning)
    ));
    experiment.stop_scan();
    let last = experiment.finalize().await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&run, &last));
    assert!(run.cursor() < 20);
}
