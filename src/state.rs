// src/state.rs

//! Shared mutable state: the watch registry plus the process table, behind
//! one mutex.
//!
//! The main engine task, the IPC service and every reaper touch this; there
//! is exactly one lock, so no ordering hazards exist. Critical sections are
//! table lookups and mutations only; blocking waits (the child wait, the
//! database busy-wait) always happen outside the lock, and the lock is never
//! held across an await.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::registry::WatchRegistry;
use crate::spawn::ProcessTable;

#[derive(Debug)]
pub struct State {
    inner: Mutex<StateInner>,
}

#[derive(Debug)]
pub struct StateInner {
    pub registry: WatchRegistry,
    pub table: ProcessTable,
}

impl State {
    pub fn new(registry: WatchRegistry) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                registry,
                table: ProcessTable::new(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateInner {
    /// True if any currently-running spawn belongs to a watch flagged
    /// `block_spawns`.
    pub fn blocker_running(&self) -> bool {
        self.table.running_watches().any(|idx| {
            self.registry
                .get(idx)
                .is_some_and(|entry| entry.cfg.block_spawns)
        })
    }
}
