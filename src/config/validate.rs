// src/config/validate.rs

use std::path::Path;

use thiserror::Error;
use tracing::warn;

use crate::config::model::{WatchConfig, MAX_PATH_LEN, MAX_TEXT_LEN};

/// Why a candidate watch record was rejected.
///
/// Rejections are never fatal to the daemon as a whole; the candidate is
/// discarded with a logged reason and the other watches are unaffected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`filename` must not be empty")]
    EmptyFilename,
    #[error("`action` must not be empty")]
    EmptyAction,
    #[error("`{field}` exceeds the {max}-byte path capacity; refusing to truncate a path")]
    PathTooLong { field: &'static str, max: usize },
    #[error("another active watch already targets {0:?}")]
    DuplicateFilename(String),
    #[error("another active watch already uses the base name {0:?}")]
    DuplicateBasename(String),
    #[error("`do_db_update` requires non-empty `db_title`, `db_author` and `db_comment`")]
    IncompleteMetadata,
}

/// Validate a candidate against the set of already-active watches.
///
/// `active` must not include the candidate itself (pass the other entries
/// when re-validating a merge). Checked identically for first-load and
/// update, per the registry's merge protocol.
pub fn validate_watch<'a, I>(cfg: &WatchConfig, active: I) -> Result<(), ValidationError>
where
    I: IntoIterator<Item = &'a WatchConfig>,
{
    if cfg.filename.as_os_str().is_empty() {
        return Err(ValidationError::EmptyFilename);
    }
    if cfg.action.as_os_str().is_empty() {
        return Err(ValidationError::EmptyAction);
    }

    check_path_capacity(&cfg.filename, "filename")?;
    check_path_capacity(&cfg.action, "action")?;

    let basename = cfg.basename();
    for other in active {
        if other.filename == cfg.filename {
            return Err(ValidationError::DuplicateFilename(
                cfg.filename.to_string_lossy().into_owned(),
            ));
        }
        // Actions identify watches by base name over IPC, so base names must
        // be unique even across different directories.
        if other.basename() == basename {
            return Err(ValidationError::DuplicateBasename(basename));
        }
    }

    if cfg.do_db_update {
        let complete = [&cfg.db_title, &cfg.db_author, &cfg.db_comment]
            .iter()
            .all(|f| f.as_deref().is_some_and(|s| !s.is_empty()));
        if !complete {
            return Err(ValidationError::IncompleteMetadata);
        }
    }

    Ok(())
}

fn check_path_capacity(path: &Path, field: &'static str) -> Result<(), ValidationError> {
    if path.as_os_str().len() > MAX_PATH_LEN {
        return Err(ValidationError::PathTooLong {
            field,
            max: MAX_PATH_LEN,
        });
    }
    Ok(())
}

/// Clamp the free-text fields of a record to the fixed text capacity.
///
/// Unlike paths, truncating free text is tolerated; each clamp is logged.
pub fn clamp_free_text(cfg: &mut WatchConfig) {
    for (field, value) in [
        ("label", &mut cfg.label),
        ("db_title", &mut cfg.db_title),
        ("db_author", &mut cfg.db_author),
        ("db_comment", &mut cfg.db_comment),
    ] {
        if let Some(text) = value {
            if text.len() > MAX_TEXT_LEN {
                let mut cut = MAX_TEXT_LEN;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                warn!(
                    field,
                    original_len = text.len(),
                    clamped_len = cut,
                    "free-text field exceeds capacity, truncating"
                );
                text.truncate(cut);
            }
        }
    }
}
