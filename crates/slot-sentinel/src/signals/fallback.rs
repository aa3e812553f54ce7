//! Jittered periodic re-check, independent of mutation events.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct FallbackTimer {
    min: Duration,
    max: Duration,
    next: Instant,
}

impl FallbackTimer {
    pub fn new(min: Duration, max: Duration, now: Instant) -> Self {
        let mut timer = Self { min, max, next: now };
        timer.reschedule(now);
        timer
    }

    /// Pick a fresh random delay in `[min, max]` from `now`.
    pub fn reschedule(&mut self, now: Instant) {
        let delay = if self.max > self.min {
            rand::thread_rng().gen_range(self.min..=self.max)
        } else {
            self.min
        };
        self.next = now + delay;
    }

    pub fn deadline(&self) -> Instant {
        self.next
    }

    /// Whether the check is due; reschedules when it is.
    pub fn fire(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        self.reschedule(now);
        true
    }
}
