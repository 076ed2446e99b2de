//! Scan result files.
//!
//! A saved scan is two files in `<folder>/<YYYY-MM-DD>/`:
//!
//! - `<stem>_NNNN.<ext>`: `#`-prefixed header lines followed by a CSV table of
//!   the valid points.
//! - `<stem>_NNNN.yml`: the scan metadata as YAML.
//!
//! `NNNN` is the first free 1-based index. Files are opened with create-new
//! semantics so an existing result is never replaced.

use crate::config::ExperimentConfig;
use crate::error::{DaqError, DaqResult};
use crate::experiment::plan::ScanPlan;
use crate::experiment::scan::{ScanSnapshot, ScanState};
use crate::units::Unit;
use chrono::{DateTime, Local, NaiveDate};
use log::{debug, info};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Extension of the metadata file written next to each data file.
pub const SIDECAR_EXTENSION: &str = "yml";

/// Extension used when the base filename has none.
pub const DEFAULT_DATA_EXTENSION: &str = "dat";

const MAX_INDEX: u32 = 9999;

/// Paths written by [`save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFiles {
    /// CSV data file
    pub data: PathBuf,
    /// YAML metadata file
    pub metadata: PathBuf,
}

/// Contents of the sidecar file.
#[derive(Debug, Serialize)]
pub struct ScanMetadata<'a> {
    /// Sweep parameters
    pub plan: &'a ScanPlan,
    /// Rows in the data file
    pub points_recorded: usize,
    /// Rows the plan asked for
    pub points_planned: usize,
    /// State of the run when it was saved
    pub state: ScanState,
    /// Why the run ended early, if a step failed
    pub error: Option<&'a str>,
    /// Local time the files were written
    pub saved_at: DateTime<Local>,
    /// Experiment configuration the scan was started from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<&'a ExperimentConfig>,
}

/// Save `snapshot` under `folder/<today>` using `base_filename` as the name template.
pub fn save(snapshot: &ScanSnapshot, folder: &Path, base_filename: &str) -> DaqResult<SavedFiles> {
    save_on(snapshot, folder, base_filename, Local::now().date_naive())
}

/// Save `snapshot` to the configured saving folder and filename, embedding
/// `config` in the sidecar.
pub fn save_with_config(snapshot: &ScanSnapshot, config: &ExperimentConfig) -> DaqResult<SavedFiles> {
    write_files(
        snapshot,
        &config.saving_folder(),
        &config.saving.filename,
        Local::now().date_naive(),
        Some(config),
    )
}

/// Same as [`save`] with an explicit date for the subfolder.
pub fn save_on(
    snapshot: &ScanSnapshot,
    folder: &Path,
    base_filename: &str,
    date: NaiveDate,
) -> DaqResult<SavedFiles> {
    write_files(snapshot, folder, base_filename, date, None)
}

fn write_files(
    snapshot: &ScanSnapshot,
    folder: &Path,
    base_filename: &str,
    date: NaiveDate,
    config: Option<&ExperimentConfig>,
) -> DaqResult<SavedFiles> {
    let day_folder = folder.join(date.format("%Y-%m-%d").to_string());
    fs::create_dir_all(&day_folder)?;

    let (stem, extension) = split_filename(base_filename)?;
    let (files, data_file, metadata_file) = create_next(&day_folder, &stem, &extension)?;

    write_table(snapshot, data_file)?;
    write_metadata(snapshot, config, metadata_file)?;

    info!(
        "Saved {} points to '{}'",
        snapshot.cursor,
        files.data.display()
    );
    Ok(files)
}

fn split_filename(base_filename: &str) -> DaqResult<(String, String)> {
    let path = Path::new(base_filename);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            DaqError::Configuration(format!("invalid base filename '{}'", base_filename))
        })?;
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or(DEFAULT_DATA_EXTENSION);
    Ok((stem.to_string(), extension.to_string()))
}

fn create_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Claim the first index for which neither the data file nor the sidecar exists.
fn create_next(folder: &Path, stem: &str, extension: &str) -> DaqResult<(SavedFiles, File, File)> {
    for index in 1..=MAX_INDEX {
        let data = folder.join(format!("{}_{:04}.{}", stem, index, extension));
        let metadata = folder.join(format!("{}_{:04}.{}", stem, index, SIDECAR_EXTENSION));
        if metadata.exists() {
            continue;
        }
        let data_file = match create_new(&data) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        };
        let metadata_file = match create_new(&metadata) {
            Ok(file) => file,
            Err(e) => {
                // Release the claimed data name; it is still empty.
                let _ = fs::remove_file(&data);
                if e.kind() == io::ErrorKind::AlreadyExists {
                    continue;
                }
                return Err(e.into());
            }
        };
        debug!("Claimed '{}'", data.display());
        return Ok((SavedFiles { data, metadata }, data_file, metadata_file));
    }
    Err(DaqError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!(
            "no free index for '{}' in '{}'",
            stem,
            folder.display()
        ),
    )))
}

fn write_table(snapshot: &ScanSnapshot, mut file: File) -> DaqResult<()> {
    let plan = &snapshot.plan;
    let is_current = plan.value_unit() == Unit::Amp;

    writeln!(file, "# PFTL DAQ scan")?;
    writeln!(
        file,
        "# output CH{}: {} to {} in {} steps, delay {}s",
        plan.channel_out(),
        plan.start(),
        plan.stop(),
        plan.steps(),
        plan.delay().as_secs_f64()
    )?;
    match plan.source_resistance() {
        Some(resistance) => writeln!(
            file,
            "# input CH{} through {}, recorded as current",
            plan.channel_in(),
            resistance
        )?,
        None => writeln!(file, "# input CH{}", plan.channel_in())?,
    }
    writeln!(file, "# points: {} of {}", snapshot.cursor, plan.steps())?;

    let mut writer = csv::Writer::from_writer(file);
    let value_header = if is_current { "current (mA)" } else { "voltage in (V)" };
    writer.write_record(["voltage out (V)", value_header])?;
    for (voltage, value) in snapshot.points() {
        let value = if is_current {
            value.magnitude() * 1e3
        } else {
            value.magnitude()
        };
        writer.write_record([voltage.magnitude().to_string(), value.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_metadata(
    snapshot: &ScanSnapshot,
    config: Option<&ExperimentConfig>,
    mut file: File,
) -> DaqResult<()> {
    let metadata = ScanMetadata {
        plan: &snapshot.plan,
        points_recorded: snapshot.cursor,
        points_planned: snapshot.plan.steps(),
        state: snapshot.state,
        error: snapshot.error.as_deref(),
        saved_at: Local::now(),
        config,
    };
    let yaml = serde_yaml::to_string(&metadata)?;
    file.write_all(yaml.as_bytes())?;
    file.flush()?;
    Ok(())
}
