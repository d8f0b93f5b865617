// src/cli.rs

//! CLI argument parsing using `clap`.
//!
//! NOTE: this expects `clap` to be built with the `derive` feature, e.g.:
//! `clap = { version = "4.5.53", features = ["derive"] }` in `Cargo.toml`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `inkmon`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "inkmon",
    version,
    about = "Launch actions when watched files are opened on an e-ink reader.",
    long_about = None
)]
pub struct CliArgs {
    /// Mountpoint of the user-visible storage partition.
    ///
    /// The database, image cache, marker and kill-switch paths all default
    /// to locations below it.
    #[arg(long, value_name = "PATH", default_value = "/mnt/onboard")]
    pub mountpoint: String,

    /// Configuration directory to scan for TOML files.
    ///
    /// Default: `<mountpoint>/.adds/inkmon/config`.
    #[arg(long, value_name = "PATH")]
    pub config_dir: Option<String>,

    /// Path of the host content database.
    ///
    /// Default: `<mountpoint>/.kobo/KoboReader.sqlite`.
    #[arg(long, value_name = "PATH")]
    pub database: Option<String>,

    /// Root of the host thumbnail-image cache.
    ///
    /// Default: `<mountpoint>/.kobo-images`.
    #[arg(long, value_name = "PATH")]
    pub images: Option<String>,

    /// Path of the local control socket.
    #[arg(long, value_name = "PATH", default_value = "/tmp/inkmon-ipc.ctl")]
    pub socket: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `INKMON_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Scan + validate the configuration, print the resulting watch table,
    /// but don't start watching or spawn anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
