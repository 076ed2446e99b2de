//! Result persistence.

pub mod storage;

pub use storage::{save, save_with_config, SavedFiles, ScanMetadata};
