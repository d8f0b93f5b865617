// src/spawn/mod.rs

//! The process table and the spawner.
//!
//! Each trigger forks the watch's action as a separate OS process, records
//! the pid/watch association in the table, and detaches a reaper task whose
//! sole job is to await the child's termination, log the outcome, and
//! release the table slot. The daemon never joins reapers and never kills a
//! launched action; its only influence is refusing to launch a new instance
//! while one is outstanding.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::state::State;

/// Exits faster than this with a nonzero status are *suspected* (never
/// proven) to have failed to launch at all.
const EARLY_EXIT_WINDOW: Duration = Duration::from_secs(1);

/// One tracked spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnSlot {
    pub pid: u32,
    pub watch_idx: usize,
}

/// Arena of concurrently-tracked spawns, with a free list.
///
/// At most one entry may reference a given watch index at a time; `claim`
/// enforces this at allocation.
#[derive(Debug, Default)]
pub struct ProcessTable {
    slots: Vec<Option<SpawnSlot>>,
    free: Vec<usize>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for a watch. Fails (None) when a spawn is already
    /// tracked for it. The pid is filled in via [`set_pid`] once known.
    ///
    /// [`set_pid`]: ProcessTable::set_pid
    pub fn claim(&mut self, watch_idx: usize) -> Option<usize> {
        if self.is_running(watch_idx) {
            return None;
        }
        let entry = SpawnSlot { pid: 0, watch_idx };
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                Some(slot)
            }
            None => {
                self.slots.push(Some(entry));
                Some(self.slots.len() - 1)
            }
        }
    }

    pub fn set_pid(&mut self, slot: usize, pid: u32) {
        if let Some(entry) = self.slots.get_mut(slot).and_then(|s| s.as_mut()) {
            entry.pid = pid;
        }
    }

    pub fn release(&mut self, slot: usize) -> Option<SpawnSlot> {
        let entry = self.slots.get_mut(slot)?.take();
        if entry.is_some() {
            self.free.push(slot);
        }
        entry
    }

    pub fn is_running(&self, watch_idx: usize) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|s| s.watch_idx == watch_idx)
    }

    pub fn pid_for(&self, watch_idx: usize) -> Option<u32> {
        self.slots
            .iter()
            .flatten()
            .find(|s| s.watch_idx == watch_idx)
            .map(|s| s.pid)
    }

    pub fn running_watches(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().flatten().map(|s| s.watch_idx)
    }

    pub fn running_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// What happened when we tried to launch a watch's action.
#[derive(Debug)]
pub enum LaunchOutcome {
    Launched { pid: u32 },
    /// A spawn for this watch is already tracked; nothing was launched.
    AlreadyRunning,
    /// The OS refused to spawn the process (missing binary, permissions...).
    LaunchFailed(std::io::Error),
}

/// Launch the action configured for a watch and detach a reaper for it.
///
/// The action is invoked with no arguments and inherited stdio, plus a small
/// launcher environment so scripts can tell they were started by the daemon.
/// The table slot is claimed before spawning, so a concurrent trigger for
/// the same watch observes `AlreadyRunning` instead of racing.
pub fn spawn_watch_action(state: &Arc<State>, watch_idx: usize) -> LaunchOutcome {
    let (action, basename, slot) = {
        let mut inner = state.lock();
        let Some(entry) = inner.registry.get(watch_idx) else {
            return LaunchOutcome::LaunchFailed(std::io::Error::other("watch slot inactive"));
        };
        let action = entry.cfg.action.clone();
        let basename = entry.cfg.basename();
        match inner.table.claim(watch_idx) {
            Some(slot) => (action, basename, slot),
            None => return LaunchOutcome::AlreadyRunning,
        }
    };

    let mut cmd = Command::new(&action);
    cmd.env("INKMON", "1")
        .env("INKMON_WATCH_BASENAME", &basename);

    match cmd.spawn() {
        Ok(child) => {
            let pid = child.id().unwrap_or(0);
            state.lock().table.set_pid(slot, pid);
            info!(watch = %basename, pid, action = ?action, "spawned action");

            let state = Arc::clone(state);
            tokio::spawn(reap(state, slot, basename, child, Instant::now()));
            LaunchOutcome::Launched { pid }
        }
        Err(err) => {
            state.lock().table.release(slot);
            error!(watch = %basename, action = ?action, error = %err, "failed to spawn action");
            LaunchOutcome::LaunchFailed(err)
        }
    }
}

/// Await one spawned action, log its outcome, release its table slot.
async fn reap(
    state: Arc<State>,
    slot: usize,
    basename: String,
    mut child: tokio::process::Child,
    started: Instant,
) {
    match child.wait().await {
        Ok(status) => log_exit(&basename, status, started.elapsed()),
        Err(err) => error!(watch = %basename, error = %err, "waiting on spawned action failed"),
    }
    state.lock().table.release(slot);
    debug!(watch = %basename, "released spawn slot");
}

fn log_exit(basename: &str, status: ExitStatus, ran_for: Duration) {
    if let Some(code) = status.code() {
        if code == 0 {
            info!(watch = %basename, "action exited cleanly");
        } else if ran_for < EARLY_EXIT_WINDOW {
            // Heuristic only: an action that dies within a second with a
            // nonzero status very likely never launched properly.
            warn!(
                watch = %basename,
                code,
                ran_for_ms = ran_for.as_millis() as u64,
                "action exited almost immediately with a nonzero status, \
                 it may have failed to launch"
            );
        } else {
            warn!(watch = %basename, code, "action exited with a nonzero status");
        }
    } else if let Some(signal) = status.signal() {
        warn!(watch = %basename, signal, "action was killed by a signal");
    } else {
        warn!(watch = %basename, ?status, "action ended in an unknown state");
    }
}
