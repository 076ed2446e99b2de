//! Environment overrides. Kept in its own test binary so the variables set
//! here cannot leak into other tests.

use pftl_daq::config::ExperimentConfig;
use pftl_daq::units::Quantity;
use std::fs;

const BASE: &str = r#"
DAQ:
  name: DummyDaq
Scan:
  start: 0V
  stop: 1V
  num_steps: 10
  delay: 10ms
  channel_in: 0
  channel_out: 0
Saving:
  folder: /tmp/pftl
  filename: data.dat
"#;

#[test]
fn test_env_overrides_file_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("experiment.yml");
    fs::write(&path, BASE).unwrap();

    std::env::set_var("PFTL_SCAN__NUM_STEPS", "7");
    std::env::set_var("PFTL_SCAN__STOP", "2.5V");
    std::env::set_var("PFTL_DAQ__PORT", "/dev/ttyUSB3");

    let config = ExperimentConfig::load_from(&path).unwrap();
    assert_eq!(config.scan.num_steps, 7);
    assert_eq!(config.scan.stop, Quantity::volts(2.5));
    assert_eq!(config.scan.start, Quantity::volts(0.0));
    assert_eq!(config.daq.port, "/dev/ttyUSB3");
    assert_eq!(config.saving.filename, "data.dat");

    // An invalid override is caught by validation, not silently ignored.
    std::env::set_var("PFTL_SCAN__NUM_STEPS", "0");
    assert!(ExperimentConfig::load_from(&path).is_err());
    assert_eq!(
        ExperimentConfig::extract_from(&path).unwrap().scan.num_steps,
        0
    );

    for key in ["PFTL_SCAN__NUM_STEPS", "PFTL_SCAN__STOP", "PFTL_DAQ__PORT"] {
        std::env::remove_var(key);
    }
}
