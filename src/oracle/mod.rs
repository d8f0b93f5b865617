// src/oracle/mod.rs

//! The processing oracle: decides whether the host library application has
//! finished processing a watched file.
//!
//! "Processed" means two things, in order: a content record exists in the
//! host's SQLite database, and all three thumbnail variants derived from
//! that record's image identifier exist on disk. The record appears before
//! the thumbnails do, and firing an action in between is the principal
//! correctness risk this whole subsystem exists to avoid, so both halves
//! must pass. Any unexpected database error yields "not processed"
//! (fail-closed: better to delay a launch than launch against inconsistent
//! state).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use crate::config::{DaemonConfig, WatchConfig};

/// Content type discriminator the host uses for book/document records.
const BOOK_CONTENT_TYPE: i64 = 6;

/// Suffixes appended to the image identifier for each rendered thumbnail
/// variant: full-screen, library tile, library grid.
const THUMBNAIL_VARIANTS: [&str; 3] = [
    " - N3_FULL.parsed",
    " - N3_LIBRARY_FULL.parsed",
    " - N3_LIBRARY_GRID.parsed",
];

#[derive(Debug, Clone)]
pub struct ProcessingOracle {
    db_path: PathBuf,
    images_root: PathBuf,
    db_timeout: Duration,
    journal_wait_attempts: u32,
    journal_wait_interval: Duration,
}

impl ProcessingOracle {
    pub fn new(db_path: PathBuf, images_root: PathBuf, cfg: &DaemonConfig) -> Self {
        Self {
            db_path,
            images_root,
            db_timeout: Duration::from_millis(cfg.db_timeout),
            journal_wait_attempts: cfg.journal_wait_attempts,
            journal_wait_interval: Duration::from_millis(cfg.journal_wait_interval),
        }
    }

    /// Has the host finished processing this watch's target file?
    ///
    /// `strict` is used at file-close time, where correctness matters more
    /// than latency: the database busy-wait is doubled and, once processed,
    /// we additionally wait (bounded) for the journal sidecar to clear.
    pub fn is_processed(&self, watch: &WatchConfig, strict: bool) -> bool {
        match self.check(watch, strict) {
            Ok(processed) => processed,
            Err(err) => {
                warn!(
                    filename = ?watch.filename,
                    error = %format!("{err:#}"),
                    "database check failed, treating target as not processed"
                );
                false
            }
        }
    }

    fn check(&self, watch: &WatchConfig, strict: bool) -> Result<bool> {
        let conn = self.open_db(watch.do_db_update, strict)?;

        let content_id = format!("file://{}", watch.filename.display());
        let row: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT ImageId, Title FROM content WHERE ContentID = ?1 AND ContentType = ?2",
                rusqlite::params![content_id, BOOK_CONTENT_TYPE],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .context("querying content record")?;

        let Some((image_id, title)) = row else {
            debug!(content_id, "no content record yet");
            return Ok(false);
        };
        let Some(image_id) = image_id else {
            debug!(content_id, "content record has no image identifier yet");
            return Ok(false);
        };

        if !self.thumbnails_present(&image_id) {
            debug!(content_id, image_id, "thumbnails not fully generated yet");
            return Ok(false);
        }

        if watch.do_db_update {
            if let Err(err) = self.update_metadata(&conn, watch, &content_id, title.as_deref()) {
                // The companion action still fires on a positive check.
                warn!(content_id, error = %format!("{err:#}"), "metadata update failed");
            }
        }

        drop(conn);

        if strict {
            self.wait_for_journal();
        }

        Ok(true)
    }

    fn open_db(&self, writable: bool, strict: bool) -> Result<Connection> {
        let flags = if writable {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };
        let conn = Connection::open_with_flags(&self.db_path, flags)
            .with_context(|| format!("opening database {:?}", self.db_path))?;

        let timeout = if strict {
            self.db_timeout * 2
        } else {
            self.db_timeout
        };
        conn.busy_timeout(timeout).context("setting busy timeout")?;
        Ok(conn)
    }

    /// Rewrite title/attribution/description when the stored title differs
    /// from the configured one.
    fn update_metadata(
        &self,
        conn: &Connection,
        watch: &WatchConfig,
        content_id: &str,
        stored_title: Option<&str>,
    ) -> Result<()> {
        let title = watch.db_title.as_deref().unwrap_or_default();
        if stored_title == Some(title) {
            return Ok(());
        }

        let updated = conn
            .execute(
                "UPDATE content SET Title = ?1, Attribution = ?2, Description = ?3 \
                 WHERE ContentID = ?4",
                rusqlite::params![
                    title,
                    watch.db_author.as_deref().unwrap_or_default(),
                    watch.db_comment.as_deref().unwrap_or_default(),
                    content_id,
                ],
            )
            .context("updating content metadata")?;
        info!(content_id, rows = updated, "rewrote content metadata");
        Ok(())
    }

    fn thumbnails_present(&self, image_id: &str) -> bool {
        let dir = thumbnail_dir(&self.images_root, image_id);
        THUMBNAIL_VARIANTS
            .iter()
            .all(|suffix| dir.join(format!("{image_id}{suffix}")).exists())
    }

    /// Best-effort wait for the database's journal sidecar to disappear, to
    /// avoid racing a not-yet-committed transaction. Exceeding the cap logs
    /// a warning and proceeds anyway.
    fn wait_for_journal(&self) {
        let sidecars = [
            sibling_with_suffix(&self.db_path, "-journal"),
            sibling_with_suffix(&self.db_path, "-wal"),
        ];

        for attempt in 0..self.journal_wait_attempts {
            if !sidecars.iter().any(|p| p.exists()) {
                return;
            }
            debug!(attempt, "journal sidecar still present, waiting");
            std::thread::sleep(self.journal_wait_interval);
        }
        warn!(
            attempts = self.journal_wait_attempts,
            "journal sidecar still present after bounded wait, proceeding anyway"
        );
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// The host's 32-bit rolling checksum over an image identifier.
///
/// Keeps only the low 28 bits per step, folding the top nibble back in.
pub fn qhash(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in bytes {
        h = (h << 4).wrapping_add(u32::from(b));
        h ^= (h & 0xf000_0000) >> 23;
        h &= 0x0fff_ffff;
    }
    h
}

/// Two-level thumbnail cache directory for an image identifier, derived from
/// the low two bytes of its checksum.
pub fn thumbnail_dir(images_root: &Path, image_id: &str) -> PathBuf {
    let h = qhash(image_id.as_bytes());
    images_root
        .join((h & 0xff).to_string())
        .join(((h >> 8) & 0xff).to_string())
}

/// The three on-disk artifacts expected for an image identifier.
pub fn thumbnail_paths(images_root: &Path, image_id: &str) -> [PathBuf; 3] {
    let dir = thumbnail_dir(images_root, image_id);
    THUMBNAIL_VARIANTS.map(|suffix| dir.join(format!("{image_id}{suffix}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Fixed vectors; the directory scheme must stay stable across releases
    // because it addresses a cache the daemon does not own.
    #[test]
    fn qhash_regression_vectors() {
        assert_eq!(qhash(b""), 0);
        assert_eq!(qhash(b"abc"), 0x6783);
        assert_eq!(qhash(b"file_123"), 0x2b29f3);
    }

    #[test]
    fn thumbnail_dir_uses_low_two_checksum_bytes() {
        let root = Path::new("/mnt/onboard/.kobo-images");
        // qhash("abc") = 0x6783 -> dir1 = 0x83 = 131, dir2 = 0x67 = 103
        assert_eq!(thumbnail_dir(root, "abc"), root.join("131").join("103"));
        // qhash("file_123") = 0x2b29f3 -> dir1 = 0xf3 = 243, dir2 = 0x29 = 41
        assert_eq!(
            thumbnail_dir(root, "file_123"),
            root.join("243").join("41")
        );
    }

    #[test]
    fn thumbnail_paths_cover_all_three_variants() {
        let root = Path::new("/images");
        let paths = thumbnail_paths(root, "id");
        assert_eq!(paths.len(), 3);
        assert!(paths[0].to_string_lossy().ends_with("id - N3_FULL.parsed"));
        assert!(paths[1]
            .to_string_lossy()
            .ends_with("id - N3_LIBRARY_FULL.parsed"));
        assert!(paths[2]
            .to_string_lossy()
            .ends_with("id - N3_LIBRARY_GRID.parsed"));
    }
}
