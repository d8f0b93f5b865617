// src/engine/mod.rs

//! The watch engine.
//!
//! This module ties together:
//! - classification of raw inotify events
//! - the per-watch open/close trigger state machine
//! - the epoch-based runtime loop that reacts to:
//!   - filesystem open/close events on watched files
//!   - control-socket requests
//!   - configuration changes picked up by the periodic rescan
//!   - subscription loss, queue overflow and unmounts

pub mod decision;
pub mod events;
pub mod runtime;

pub use decision::{note_close, note_open, CloseAction};
pub use events::{classify, FsEventKind};
pub use runtime::Engine;
