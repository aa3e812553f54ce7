//! Burst coalescing for structural mutation notifications.

use std::time::Duration;

use tokio::time::Instant;

/// Collapses a burst of mutation notifications into one evaluation.
///
/// The first notification opens a fixed window; notifications inside the
/// window are absorbed. The window does not slide, so a page that never
/// stops mutating is still evaluated once per window.
#[derive(Debug, Clone)]
pub struct MutationCoalescer {
    quiet: Duration,
    due: Option<Instant>,
    absorbed: u32,
}

impl MutationCoalescer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            due: None,
            absorbed: 0,
        }
    }

    /// Record a mutation. Returns `true` when this opened a new window.
    pub fn notify(&mut self, now: Instant) -> bool {
        if self.due.is_some() {
            self.absorbed += 1;
            return false;
        }
        self.due = Some(now + self.quiet);
        true
    }

    /// When the pending evaluation should run.
    pub fn deadline(&self) -> Option<Instant> {
        self.due
    }

    /// Close the window if it is due. Returns how many notifications it covered.
    pub fn fire(&mut self, now: Instant) -> Option<u32> {
        match self.due {
            Some(due) if now >= due => {
                self.due = None;
                Some(std::mem::take(&mut self.absorbed) + 1)
            }
            _ => None,
        }
    }

    pub fn cancel(&mut self) {
        self.due = None;
        self.absorbed = 0;
    }
}
