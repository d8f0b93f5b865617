// src/engine/events.rs

//! Interpretation of raw inotify event masks into the handful of semantics
//! the engine cares about.

use inotify::EventMask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    /// The watched file was opened.
    Opened,
    /// The watched file was closed (with or without a write).
    Closed,
    /// The kernel dropped this subscription (IN_IGNORED): the file was
    /// deleted, moved away, or its filesystem went down.
    SubscriptionGone,
    /// The kernel event queue overflowed; events were lost and the engine
    /// can no longer trust its view of the world.
    Overflow,
    /// The underlying filesystem was unmounted.
    Unmounted,
}

/// Classify a raw event mask. Order matters: queue overflow and unmount
/// outrank the per-file bits they may arrive combined with.
pub fn classify(mask: EventMask) -> Option<FsEventKind> {
    if mask.contains(EventMask::Q_OVERFLOW) {
        Some(FsEventKind::Overflow)
    } else if mask.contains(EventMask::UNMOUNT) {
        Some(FsEventKind::Unmounted)
    } else if mask.contains(EventMask::IGNORED) {
        Some(FsEventKind::SubscriptionGone)
    } else if mask.contains(EventMask::OPEN) {
        Some(FsEventKind::Opened)
    } else if mask.intersects(EventMask::CLOSE_WRITE | EventMask::CLOSE_NOWRITE) {
        Some(FsEventKind::Closed)
    } else {
        None
    }
}
