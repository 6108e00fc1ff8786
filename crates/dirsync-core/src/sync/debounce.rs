//! Echo suppression for change events
//!
//! Applying a received change makes the local watcher report that same
//! change back; without suppression it would be sent straight back to the
//! hub and loop forever. The filter remembers the single most recent
//! `(path, instant)` pair and suppresses any event for that path inside the
//! window.
//!
//! The state is one slot, not one per path: touching path B inside the
//! window replaces the entry for path A.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::types::RelativePath;

/// Default suppression window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Single-slot debounce filter shared by the watcher path and the apply path
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last: Mutex<Option<(RelativePath, Instant)>>,
}

impl Debouncer {
    /// Create a filter whose slot never matches until first recorded
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// True iff `path` is the stored path and less than one window has
    /// elapsed since it was stored
    pub fn should_suppress(&self, path: &RelativePath, now: Instant) -> bool {
        match &*self.last.lock() {
            Some((last_path, at)) => {
                last_path == path && now.saturating_duration_since(*at) < self.window
            }
            None => false,
        }
    }

    /// Overwrite the slot
    pub fn record(&self, path: &RelativePath, now: Instant) {
        *self.last.lock() = Some((path.clone(), now));
    }

    /// Check and record under one lock: returns `true` if the event is
    /// suppressed, otherwise stores `(path, now)` and returns `false`
    pub fn check_and_record(&self, path: &RelativePath, now: Instant) -> bool {
        let mut last = self.last.lock();
        if let Some((last_path, at)) = &*last {
            if last_path == path && now.saturating_duration_since(*at) < self.window {
                return true;
            }
        }
        *last = Some((path.clone(), now));
        false
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
