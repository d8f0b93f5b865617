// src/engine/decision.rs

//! The per-watch open/close trigger state machine, kept free of I/O so the
//! tricky cases (pending processing, the post-processing event storm) can be
//! tested without a database or a filesystem.

use std::time::{Duration, Instant};

use crate::registry::WatchEntry;

/// Verdict for a CLOSE event that passed the running/blocker guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    Fire,
    Suppress(&'static str),
}

/// Record the outcome of the OPEN-time (non-strict) processing check.
///
/// When the file is not yet processed, the matching CLOSE must not fire:
/// this open/close bracket is the host's own processing pass, not a user
/// interaction. The flag is only ever set here; it resolves at CLOSE, so a
/// nested OPEN that observes "processed" cannot forget an open bracket.
pub fn note_open(entry: &mut WatchEntry, processed: bool) {
    if !processed {
        entry.pending_processing = true;
    }
}

/// Decide what a CLOSE event means, given the strict processing check.
///
/// Hosts have been observed to emit an extra open/close pair immediately
/// after first-time processing of a brand-new file; `window` is the recency
/// debounce that swallows it. Suppression never clears the debounce anchor,
/// so a second spurious CLOSE inside the window stays suppressed even when
/// the first one was, too.
pub fn note_close(
    entry: &mut WatchEntry,
    processed: bool,
    now: Instant,
    window: Duration,
) -> CloseAction {
    if entry.pending_processing {
        // Resolution of the OPEN-time "not processed" observation.
        entry.pending_processing = false;
        if processed {
            entry.processing_ts = Some(now);
            return CloseAction::Suppress("processing completed during this open/close bracket");
        }
        if entry.processing_ts.is_none() {
            entry.processing_ts = Some(now);
        }
        return CloseAction::Suppress("target not processed yet");
    }

    if !processed {
        if entry.processing_ts.is_none() {
            entry.processing_ts = Some(now);
        }
        return CloseAction::Suppress("target not processed yet");
    }

    if let Some(ts) = entry.processing_ts {
        if now.duration_since(ts) < window {
            return CloseAction::Suppress("spurious close right after processing");
        }
    }

    entry.processing_ts = None;
    CloseAction::Fire
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;
    use std::path::PathBuf;

    const WINDOW: Duration = Duration::from_secs(10);

    fn entry() -> WatchEntry {
        let cfg: WatchConfig = toml::from_str(
            "filename = \"/mnt/onboard/a.png\"\naction = \"/mnt/onboard/a.sh\"",
        )
        .unwrap();
        WatchEntry {
            source: PathBuf::from("/cfg/a.toml"),
            cfg,
            wd: None,
            wd_destroyed: false,
            pending_processing: false,
            processing_ts: None,
        }
    }

    #[test]
    fn fires_when_processed_and_no_recent_completion() {
        let mut e = entry();
        let now = Instant::now();
        assert_eq!(note_close(&mut e, true, now, WINDOW), CloseAction::Fire);
        assert!(e.processing_ts.is_none());
    }

    #[test]
    fn no_fire_before_ready() {
        let mut e = entry();
        let now = Instant::now();

        // OPEN saw an unprocessed file; the matching CLOSE must not fire even
        // though processing finished in between.
        note_open(&mut e, false);
        assert!(e.pending_processing);
        assert!(matches!(
            note_close(&mut e, true, now, WINDOW),
            CloseAction::Suppress(_)
        ));
        assert!(!e.pending_processing);

        // The storm pair right after completion stays suppressed...
        let storm = now + Duration::from_secs(2);
        note_open(&mut e, true);
        assert!(matches!(
            note_close(&mut e, true, storm, WINDOW),
            CloseAction::Suppress(_)
        ));

        // ...but a genuine interaction after the window fires.
        let later = now + WINDOW + Duration::from_secs(1);
        note_open(&mut e, true);
        assert_eq!(note_close(&mut e, true, later, WINDOW), CloseAction::Fire);
    }

    #[test]
    fn debounce_is_idempotent() {
        let mut e = entry();
        let now = Instant::now();

        // First CLOSE observes "not processed"; anchors the debounce.
        assert!(matches!(
            note_close(&mut e, false, now, WINDOW),
            CloseAction::Suppress(_)
        ));
        let anchor = e.processing_ts;
        assert!(anchor.is_some());

        // Two CLOSEs in quick succession after completion: both suppressed,
        // anchor untouched.
        for secs in [3, 4] {
            let t = now + Duration::from_secs(secs);
            assert!(matches!(
                note_close(&mut e, true, t, WINDOW),
                CloseAction::Suppress(_)
            ));
            assert_eq!(e.processing_ts, anchor);
        }
    }

    #[test]
    fn nested_open_does_not_clear_the_processing_bracket() {
        let mut e = entry();
        let now = Instant::now();

        note_open(&mut e, false);
        // The host finishes processing while the bracket is still open; a
        // second OPEN now observes "processed" but must not forget the first.
        note_open(&mut e, true);
        assert!(e.pending_processing);

        // The bracket's CLOSE is suppressed and anchors the debounce...
        assert!(matches!(
            note_close(&mut e, true, now, WINDOW),
            CloseAction::Suppress(_)
        ));
        assert!(!e.pending_processing);
        assert!(e.processing_ts.is_some());

        // ...so the storm pair right after completion stays quiet too.
        note_open(&mut e, true);
        assert!(matches!(
            note_close(&mut e, true, now + Duration::from_secs(2), WINDOW),
            CloseAction::Suppress(_)
        ));
    }

    #[test]
    fn unprocessed_close_anchors_timestamp_only_once() {
        let mut e = entry();
        let now = Instant::now();

        note_close(&mut e, false, now, WINDOW);
        let anchor = e.processing_ts;
        note_close(&mut e, false, now + Duration::from_secs(1), WINDOW);
        assert_eq!(e.processing_ts, anchor, "first observation wins");
    }
}
