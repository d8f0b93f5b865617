// src/config/mod.rs

//! Configuration sources: the record model, the directory scanner and the
//! validation rules shared by first-load and reconciliation.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{bump_modification_marker, scan_config_dir, ConfigScan, WatchSource};
pub use model::{DaemonConfig, WatchConfig, MAIN_CONFIG_NAME, USER_CONFIG_NAME};
pub use validate::{clamp_free_text, validate_watch, ValidationError};
