// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::model::{
    DaemonConfig, DaemonOverrides, WatchConfig, MAIN_CONFIG_NAME, USER_CONFIG_NAME,
};

/// One watch candidate discovered during a scan, paired with the config file
/// it came from. The source path is the reconciliation identity: a watch
/// whose backing source disappears from later scans gets released.
#[derive(Debug, Clone)]
pub struct WatchSource {
    pub source: PathBuf,
    pub cfg: WatchConfig,
}

/// Result of scanning the configuration directory once.
#[derive(Debug, Clone)]
pub struct ConfigScan {
    pub daemon: DaemonConfig,
    /// True if the reserved main config file was found and parsed.
    pub main_found: bool,
    pub watches: Vec<WatchSource>,
}

/// Scan `dir` for configuration sources, in deterministic (lexicographic)
/// order of file name.
///
/// The reserved main name parses into [`DaemonConfig`]; the reserved user
/// override name, if present, is applied last and may override daemon fields
/// again. Every other `*.toml` file is a candidate watch record. A single
/// unreadable or unparseable file is discarded with a logged reason and
/// never fails the scan as a whole; only an unreadable directory does.
pub fn scan_config_dir(dir: &Path) -> Result<ConfigScan> {
    let mut names: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("reading config directory {dir:?}"))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    names.sort();

    let mut daemon = DaemonConfig::default();
    let mut main_found = false;
    let mut user_override: Option<DaemonOverrides> = None;
    let mut watches = Vec::new();

    for path in names {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(err) => {
                warn!(path = ?path, error = %err, "skipping unreadable config file");
                continue;
            }
        };

        if file_name == MAIN_CONFIG_NAME {
            match toml::from_str::<DaemonConfig>(&contents) {
                Ok(cfg) => {
                    debug!(path = ?path, "parsed main daemon config");
                    daemon = cfg;
                    main_found = true;
                }
                Err(err) => {
                    warn!(path = ?path, error = %err, "skipping unparseable main config");
                }
            }
        } else if file_name == USER_CONFIG_NAME {
            match toml::from_str::<DaemonOverrides>(&contents) {
                Ok(cfg) => user_override = Some(cfg),
                Err(err) => {
                    warn!(path = ?path, error = %err, "skipping unparseable user override");
                }
            }
        } else {
            match toml::from_str::<WatchConfig>(&contents) {
                Ok(cfg) => {
                    debug!(path = ?path, filename = ?cfg.filename, "parsed watch config");
                    watches.push(WatchSource { source: path, cfg });
                }
                Err(err) => {
                    warn!(path = ?path, error = %err, "skipping unparseable watch config");
                }
            }
        }
    }

    // The user override is applied last, whatever its lexicographic position.
    if let Some(overrides) = user_override {
        debug!("applying user override on top of main config");
        daemon.apply_overrides(&overrides);
    }

    Ok(ConfigScan {
        daemon,
        main_found,
        watches,
    })
}

/// Bump the modification marker so external observers can poll cheaply for
/// "did anything change" without parsing configuration themselves.
///
/// Recreating the file updates its mtime; contents are irrelevant.
pub fn bump_modification_marker(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::File::create(path).map(|_| ())
}
