// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod ipc;
pub mod logging;
pub mod oracle;
pub mod registry;
pub mod spawn;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cli::CliArgs;
use crate::config::{scan_config_dir, ConfigScan};
use crate::engine::Engine;
use crate::ipc::IpcRequest;
use crate::oracle::ProcessingOracle;
use crate::registry::WatchRegistry;
use crate::state::State;

/// Every filesystem location the daemon touches, resolved once at startup.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    /// The user-visible storage partition the watched files live on.
    pub mountpoint: PathBuf,
    /// Directory scanned for TOML configuration.
    pub config_dir: PathBuf,
    /// The host's content database.
    pub db_path: PathBuf,
    /// Root of the host's thumbnail-image cache.
    pub images_root: PathBuf,
    /// Marker file whose mtime is bumped on every effective config change.
    pub marker: PathBuf,
    /// Kill switch: while this file exists, no action is launched.
    pub kill_switch: PathBuf,
    /// Local control socket.
    pub socket: PathBuf,
}

impl DaemonPaths {
    pub fn from_args(args: &CliArgs) -> Self {
        let mountpoint = PathBuf::from(&args.mountpoint);
        let under = |sub: &str| mountpoint.join(sub);
        Self {
            config_dir: args
                .config_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| under(".adds/inkmon/config")),
            db_path: args
                .database
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| under(".kobo/KoboReader.sqlite")),
            images_root: args
                .images
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| under(".kobo-images")),
            marker: under(".adds/inkmon/last-change"),
            kill_switch: under(".adds/inkmon/disabled"),
            socket: PathBuf::from(&args.socket),
            mountpoint,
        }
    }
}

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - the initial configuration scan
/// - the shared registry + process-table state
/// - the processing oracle
/// - the control-socket service
/// - the watch engine
pub async fn run(args: CliArgs) -> Result<()> {
    let paths = DaemonPaths::from_args(&args);

    let scan = scan_config_dir(&paths.config_dir)?;
    if !scan.main_found {
        warn!(
            config_dir = ?paths.config_dir,
            "no main config file found, running with built-in defaults"
        );
    }

    if args.dry_run {
        print_dry_run(&paths, &scan);
        return Ok(());
    }

    let daemon_cfg = scan.daemon.clone();
    if daemon_cfg.use_syslog {
        // Log output goes wherever the process's stdio is pointed; a
        // supervisor forwards it to syslog on devices that want that.
        info!("use_syslog is set, leaving log routing to the supervisor");
    }

    let registry = WatchRegistry::load(scan.watches);
    if registry.active_count() == 0 {
        bail!(
            "no valid watch configured under {:?}, refusing to start",
            paths.config_dir
        );
    }
    info!(watches = registry.active_count(), "initial configuration loaded");

    let state = Arc::new(State::new(registry));
    let oracle = Arc::new(ProcessingOracle::new(
        paths.db_path.clone(),
        paths.images_root.clone(),
        &daemon_cfg,
    ));

    let (ipc_tx, ipc_rx) = mpsc::channel::<IpcRequest>(16);
    let _ipc_handle = ipc::spawn_service(paths.socket.clone(), ipc_tx)?;

    let engine = Engine::new(state, oracle, daemon_cfg, paths, ipc_rx);

    tokio::select! {
        result = engine.run() => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupt received, shutting down");
            Ok(())
        }
    }
}

/// Simple dry-run output: print the resolved paths and the watch table.
fn print_dry_run(paths: &DaemonPaths, scan: &ConfigScan) {
    println!("inkmon dry-run");
    println!("  mountpoint: {}", paths.mountpoint.display());
    println!("  config dir: {}", paths.config_dir.display());
    println!("  database:   {}", paths.db_path.display());
    println!("  images:     {}", paths.images_root.display());
    println!("  socket:     {}", paths.socket.display());
    println!("  db_timeout = {}ms", scan.daemon.db_timeout);
    println!("  debounce_window = {}s", scan.daemon.debounce_window);
    println!();

    let registry = WatchRegistry::load(scan.watches.clone());
    println!("watches ({}):", registry.active_count());
    for (idx, entry) in registry.iter_active() {
        println!("  [{idx}] {}", entry.cfg.basename());
        println!("      filename: {}", entry.cfg.filename.display());
        println!("      action:   {}", entry.cfg.action.display());
        if let Some(ref label) = entry.cfg.label {
            println!("      label:    {label}");
        }
        if entry.cfg.hidden {
            println!("      hidden: true");
        }
        if entry.cfg.block_spawns {
            println!("      block_spawns: true");
        }
        if entry.cfg.skip_db_checks {
            println!("      skip_db_checks: true");
        }
        if entry.cfg.do_db_update {
            println!("      do_db_update: true");
        }
    }
}
