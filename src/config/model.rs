// src/config/model.rs

use std::fmt;
use std::path::PathBuf;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

/// Fixed capacity for path fields (`filename`, `action`).
///
/// Exceeding this is a hard validation failure: silently truncating a path
/// would make the daemon watch or launch the wrong thing.
pub const MAX_PATH_LEN: usize = 4096;

/// Fixed capacity for free-text fields (`label`, `db_title`, ...).
///
/// Free text longer than this is clamped with a warning at validation time.
pub const MAX_TEXT_LEN: usize = 256;

/// Reserved file name for the main daemon configuration.
pub const MAIN_CONFIG_NAME: &str = "inkmon.toml";

/// Reserved file name for the user override, applied last over the main config.
pub const USER_CONFIG_NAME: &str = "inkmon.user.toml";

/// Process-wide daemon configuration, loaded once at startup from the
/// reserved main config file (and optionally refined by the user override).
///
/// Unlike watches, this is not hot-reloaded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Milliseconds to busy-wait on the external database for an OPEN-time
    /// check. Doubled for the more important CLOSE-time check.
    pub db_timeout: u64,

    /// Whether the daemon should log through syslog once daemonized.
    /// Collaborator policy flag; daemonization itself is out of scope.
    #[serde(deserialize_with = "flex_bool")]
    pub use_syslog: bool,

    /// Whether transient situations should also surface as on-screen notices.
    #[serde(deserialize_with = "flex_bool")]
    pub with_notifications: bool,

    /// Seconds during which a CLOSE following a just-completed processing
    /// pass is treated as spurious. Empirically tuned on real devices.
    pub debounce_window: u64,

    /// Maximum polls for the database journal sidecar to disappear during a
    /// strict processing check.
    pub journal_wait_attempts: u32,

    /// Milliseconds slept between journal sidecar polls.
    pub journal_wait_interval: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_timeout: 500,
            use_syslog: false,
            with_notifications: true,
            debounce_window: 10,
            journal_wait_attempts: 10,
            journal_wait_interval: 400,
        }
    }
}

/// Optional overlay parsed from the user override file.
///
/// Only the fields actually present override the main config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonOverrides {
    pub db_timeout: Option<u64>,
    #[serde(deserialize_with = "flex_bool_opt")]
    pub use_syslog: Option<bool>,
    #[serde(deserialize_with = "flex_bool_opt")]
    pub with_notifications: Option<bool>,
    pub debounce_window: Option<u64>,
    pub journal_wait_attempts: Option<u32>,
    pub journal_wait_interval: Option<u64>,
}

impl DaemonConfig {
    /// Apply a user override on top of this config, field by field.
    pub fn apply_overrides(&mut self, o: &DaemonOverrides) {
        if let Some(v) = o.db_timeout {
            self.db_timeout = v;
        }
        if let Some(v) = o.use_syslog {
            self.use_syslog = v;
        }
        if let Some(v) = o.with_notifications {
            self.with_notifications = v;
        }
        if let Some(v) = o.debounce_window {
            self.debounce_window = v;
        }
        if let Some(v) = o.journal_wait_attempts {
            self.journal_wait_attempts = v;
        }
        if let Some(v) = o.journal_wait_interval {
            self.journal_wait_interval = v;
        }
    }
}

/// One watch record, as parsed from a watch config file.
///
/// A record only becomes an active watch after validation
/// (see `config::validate`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WatchConfig {
    /// Absolute path of the file to watch.
    pub filename: PathBuf,

    /// Path of the program executed when the watch fires.
    pub action: PathBuf,

    /// Optional human-readable name, shown in IPC listings.
    #[serde(default)]
    pub label: Option<String>,

    /// Excluded from user-facing (`gui-list`) listings.
    #[serde(default, deserialize_with = "flex_bool")]
    pub hidden: bool,

    /// While this watch's action runs, suppress triggers for all watches.
    #[serde(default, deserialize_with = "flex_bool")]
    pub block_spawns: bool,

    /// Bypass the processing oracle entirely. Debug/testing only.
    #[serde(default, deserialize_with = "flex_bool")]
    pub skip_db_checks: bool,

    /// Once the file is confirmed processed, opportunistically rewrite its
    /// metadata fields in the external database.
    #[serde(default, deserialize_with = "flex_bool")]
    pub do_db_update: bool,

    /// Metadata written back when `do_db_update` is set.
    #[serde(default)]
    pub db_title: Option<String>,
    #[serde(default)]
    pub db_author: Option<String>,
    #[serde(default)]
    pub db_comment: Option<String>,
}

impl WatchConfig {
    /// Base name of the watched file. Watches are identified by base name
    /// over IPC, hence the uniqueness rule on it.
    pub fn basename(&self) -> String {
        self.filename
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Accept the boolean tokens `true/false/yes/no/on/off/1/0`
/// (case-insensitive), as well as native booleans and 0/1 integers.
pub fn parse_flex_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn flex_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    struct FlexBoolVisitor;

    impl Visitor<'_> for FlexBoolVisitor {
        type Value = bool;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a boolean, 0/1, or one of true/false/yes/no/on/off")
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<bool, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<bool, E> {
            match v {
                0 => Ok(false),
                1 => Ok(true),
                other => Err(E::custom(format!("invalid boolean integer: {other}"))),
            }
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<bool, E> {
            self.visit_i64(v as i64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<bool, E> {
            parse_flex_bool(v).ok_or_else(|| E::custom(format!("invalid boolean token: {v:?}")))
        }
    }

    deserializer.deserialize_any(FlexBoolVisitor)
}

fn flex_bool_opt<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    flex_bool(deserializer).map(Some)
}
