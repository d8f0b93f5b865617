// src/registry/mod.rs

//! The table of configured watches.
//!
//! Entries live in a growable arena with an explicit free list: an entry's
//! index is a stable identity (it is what IPC clients use to address a
//! watch) for as long as the entry stays active, and freed slots are reused
//! for later additions.

use std::path::PathBuf;
use std::time::Instant;

use inotify::WatchDescriptor;
use tracing::{debug, info, warn};

use crate::config::{clamp_free_text, validate_watch, WatchConfig, WatchSource};

/// One active watch, configuration plus per-epoch runtime state.
#[derive(Debug, Clone)]
pub struct WatchEntry {
    /// Config file this entry was materialized from.
    pub source: PathBuf,
    pub cfg: WatchConfig,

    /// OS subscription handle. `None` means the target file was missing at
    /// subscription time and the watch is IPC-only for this epoch.
    pub wd: Option<WatchDescriptor>,
    /// Set when the kernel told us this subscription is gone (IN_IGNORED);
    /// teardown must not try to remove it again.
    pub wd_destroyed: bool,

    /// An OPEN arrived before the file was confirmed processed; the matching
    /// CLOSE must not fire.
    pub pending_processing: bool,
    /// Debounce anchor: when we last observed "not processed yet" or "just
    /// completed", used to swallow the post-processing event storm.
    pub processing_ts: Option<Instant>,
}

impl WatchEntry {
    fn new(source: PathBuf, cfg: WatchConfig) -> Self {
        Self {
            source,
            cfg,
            wd: None,
            wd_destroyed: false,
            pending_processing: false,
            processing_ts: None,
        }
    }

    /// Clear the per-epoch runtime state. Called when a new epoch
    /// re-subscribes everything from scratch.
    pub fn reset_epoch_state(&mut self) {
        self.wd = None;
        self.wd_destroyed = false;
        self.pending_processing = false;
        self.processing_ts = None;
    }
}

/// Arena of watch slots.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    slots: Vec<Option<WatchEntry>>,
    free: Vec<usize>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize the initial watch set. Invalid candidates are discarded
    /// with a logged reason; the caller decides whether an empty result is
    /// fatal.
    pub fn load(sources: Vec<WatchSource>) -> Self {
        let mut registry = Self::new();
        for source in sources {
            registry.add_candidate(source);
        }
        registry
    }

    pub fn get(&self, idx: usize) -> Option<&WatchEntry> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut WatchEntry> {
        self.slots.get_mut(idx).and_then(|s| s.as_mut())
    }

    pub fn iter_active(&self) -> impl Iterator<Item = (usize, &WatchEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|e| (i, e)))
    }

    pub fn iter_active_mut(&mut self) -> impl Iterator<Item = (usize, &mut WatchEntry)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|e| (i, e)))
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn find_by_filename(&self, filename: &std::path::Path) -> Option<usize> {
        self.iter_active()
            .find(|(_, e)| e.cfg.filename == filename)
            .map(|(i, _)| i)
    }

    pub fn find_by_basename(&self, basename: &str) -> Option<usize> {
        self.iter_active()
            .find(|(_, e)| e.cfg.basename() == basename)
            .map(|(i, _)| i)
    }

    /// Resolve an OS subscription handle back to a watch index.
    pub fn find_by_wd(&self, wd: &WatchDescriptor) -> Option<usize> {
        self.iter_active()
            .find(|(_, e)| e.wd.as_ref() == Some(wd))
            .map(|(i, _)| i)
    }

    /// Validate and activate a candidate in the first free slot.
    pub fn add_candidate(&mut self, source: WatchSource) -> Option<usize> {
        let WatchSource { source, mut cfg } = source;
        clamp_free_text(&mut cfg);

        let others: Vec<WatchConfig> = self.iter_active().map(|(_, e)| e.cfg.clone()).collect();
        if let Err(err) = validate_watch(&cfg, others.iter()) {
            warn!(source = ?source, error = %err, "discarding invalid watch config");
            return None;
        }

        let entry = WatchEntry::new(source, cfg);
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        info!(
            index = idx,
            filename = ?self.slots[idx].as_ref().map(|e| &e.cfg.filename),
            "activated watch"
        );
        Some(idx)
    }

    /// Zero a slot and return it to the free list.
    pub fn release(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            if let Some(entry) = slot.take() {
                info!(index = idx, filename = ?entry.cfg.filename, "released watch slot");
                self.free.push(idx);
            }
        }
    }

    /// Re-align the registry with a fresh directory scan.
    ///
    /// `is_running` reports whether a spawn is currently live for a slot;
    /// both updates and removals of such slots are deferred entirely to the
    /// next pass rather than mutating state a live spawn may read.
    ///
    /// Returns true if any watch was added, changed or removed, which is the
    /// caller's cue to bump the modification marker.
    pub fn reconcile(&mut self, scan: &[WatchSource], is_running: impl Fn(usize) -> bool) -> bool {
        let mut changed = false;
        let mut seen = vec![false; self.slots.len()];

        for candidate in scan {
            match self.find_by_filename(&candidate.cfg.filename) {
                None => {
                    if self.add_candidate(candidate.clone()).is_some() {
                        changed = true;
                        seen.resize(self.slots.len(), false);
                        // The new entry is by definition part of this scan.
                        if let Some(idx) = self.find_by_filename(&candidate.cfg.filename) {
                            seen[idx] = true;
                        }
                    }
                }
                Some(idx) => {
                    if seen[idx] {
                        warn!(
                            source = ?candidate.source,
                            filename = ?candidate.cfg.filename,
                            "duplicate watch target in scan, discarding"
                        );
                        continue;
                    }
                    let Some(entry) = self.get(idx) else { continue };
                    if entry.source != candidate.source && entry.source.exists() {
                        warn!(
                            source = ?candidate.source,
                            conflicts_with = ?entry.source,
                            "second source targets an already-watched file, discarding"
                        );
                        continue;
                    }
                    seen[idx] = true;
                    if self.apply_update(idx, candidate, &is_running) {
                        changed = true;
                    }
                }
            }
        }

        // Anything not observed in this scan lost its backing source.
        for idx in 0..seen.len() {
            if seen[idx] || self.slots[idx].is_none() {
                continue;
            }
            if is_running(idx) {
                info!(
                    index = idx,
                    "backing source gone but a spawn is live, deferring removal"
                );
                continue;
            }
            self.release(idx);
            changed = true;
        }

        changed
    }

    /// Merge a re-read source into an existing entry.
    ///
    /// Returns true if the entry was modified (or released on failed
    /// re-validation). A verbatim re-read touches nothing and reports false.
    fn apply_update(
        &mut self,
        idx: usize,
        candidate: &WatchSource,
        is_running: &impl Fn(usize) -> bool,
    ) -> bool {
        let mut incoming = candidate.cfg.clone();
        clamp_free_text(&mut incoming);

        let Some(entry) = self.get(idx) else {
            return false;
        };
        let diffs = diff_fields(&entry.cfg, &incoming);
        if diffs.is_empty() {
            // Source may have been renamed without changing its contents.
            if entry.source != candidate.source {
                if let Some(entry) = self.get_mut(idx) {
                    entry.source = candidate.source.clone();
                }
            }
            return false;
        }

        if is_running(idx) {
            info!(
                index = idx,
                source = ?candidate.source,
                "watch config changed while its spawn is live, deferring update"
            );
            return false;
        }

        for field in &diffs {
            info!(index = idx, field, "watch field changed on reconcile");
        }

        let others: Vec<WatchConfig> = self
            .iter_active()
            .filter(|(i, _)| *i != idx)
            .map(|(_, e)| e.cfg.clone())
            .collect();
        if let Err(err) = validate_watch(&incoming, others.iter()) {
            // A removed watch is safer than a malformed one; never leave the
            // slot half-updated.
            warn!(index = idx, error = %err, "merged watch config invalid, releasing slot");
            self.release(idx);
            return true;
        }

        if let Some(entry) = self.get_mut(idx) {
            entry.cfg = incoming;
            entry.source = candidate.source.clone();
            debug!(index = idx, "watch updated in place");
        }
        true
    }
}

/// Names of the fields that differ between two watch records.
fn diff_fields(old: &WatchConfig, new: &WatchConfig) -> Vec<&'static str> {
    let mut diffs = Vec::new();
    if old.filename != new.filename {
        diffs.push("filename");
    }
    if old.action != new.action {
        diffs.push("action");
    }
    if old.label != new.label {
        diffs.push("label");
    }
    if old.hidden != new.hidden {
        diffs.push("hidden");
    }
    if old.block_spawns != new.block_spawns {
        diffs.push("block_spawns");
    }
    if old.skip_db_checks != new.skip_db_checks {
        diffs.push("skip_db_checks");
    }
    if old.do_db_update != new.do_db_update {
        diffs.push("do_db_update");
    }
    if old.db_title != new.db_title {
        diffs.push("db_title");
    }
    if old.db_author != new.db_author {
        diffs.push("db_author");
    }
    if old.db_comment != new.db_comment {
        diffs.push("db_comment");
    }
    diffs
}
