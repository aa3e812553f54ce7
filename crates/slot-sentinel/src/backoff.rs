//! Adaptive poll cadence under rate limiting.
//!
//! `interval = min(base × 1.5^level, base × 5)`, with `level ∈ [0, 5]`
//! moving at most one step per evaluation. Limiting pushes the level up
//! after two consecutive hits; twenty consecutive successes, or a
//! time-based recovery, bring it back down.
//!
//! The controller is a plain value driven with explicit instants so that it
//! can be stepped deterministically; the poller task owns the only instance.

use std::time::Duration;

use tokio::time::Instant;

/// Highest backoff level.
pub const MAX_LEVEL: u8 = 5;

/// Tunables for [`BackoffController`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Consecutive rate-limited responses before escalating.
    pub escalate_after: u32,
    /// Consecutive successes before de-escalating.
    pub recover_after: u32,
    pub growth: f64,
    /// Interval ceiling as a multiple of the base interval.
    pub max_multiplier: f64,
    pub recovery_initial: Duration,
    pub recovery_max: Duration,
    pub recovery_growth: f64,
    /// Consecutive transport errors before a transport pause.
    pub transport_error_limit: u32,
    pub transport_pause: Duration,
    /// Level at or above which the poller counts as saturated.
    pub saturation_level: u8,
    pub saturation_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            escalate_after: 2,
            recover_after: 20,
            growth: 1.5,
            max_multiplier: 5.0,
            recovery_initial: Duration::from_secs(45),
            recovery_max: Duration::from_secs(180),
            recovery_growth: 1.5,
            transport_error_limit: 5,
            transport_pause: Duration::from_secs(30),
            saturation_level: 4,
            saturation_after: Duration::from_secs(300),
        }
    }
}

/// Live cadence state for one captured status endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSession {
    pub base_interval: Duration,
    pub current_interval: Duration,
    pub level: u8,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub paused_until: Option<Instant>,
}

/// A cadence change the poller should act on and report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffChange {
    pub level: u8,
    pub interval: Duration,
    pub reason: &'static str,
}

/// Why polling is currently paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// A claim sequence asked for quiet.
    Claim,
    /// Too many consecutive transport errors.
    Transport,
}

#[derive(Debug)]
pub struct BackoffController {
    policy: BackoffPolicy,
    session: PollSession,
    pause_reason: Option<PauseReason>,
    recovery_delay: Duration,
    recovery_due: Option<Instant>,
    /// Set by a time-based recovery, cleared by the next success.
    recovered_without_success: bool,
    transport_failures: u32,
    saturated_since: Option<Instant>,
    saturation_reported: bool,
}

impl BackoffController {
    pub fn new(base_interval: Duration, policy: BackoffPolicy) -> Self {
        let recovery_delay = policy.recovery_initial;
        Self {
            policy,
            session: PollSession {
                base_interval,
                current_interval: base_interval,
                level: 0,
                consecutive_failures: 0,
                consecutive_successes: 0,
                paused_until: None,
            },
            pause_reason: None,
            recovery_delay,
            recovery_due: None,
            recovered_without_success: false,
            transport_failures: 0,
            saturated_since: None,
            saturation_reported: false,
        }
    }

    pub fn session(&self) -> &PollSession {
        &self.session
    }

    pub fn level(&self) -> u8 {
        self.session.level
    }

    pub fn interval(&self) -> Duration {
        self.session.current_interval
    }

    pub fn recovery_delay(&self) -> Duration {
        self.recovery_delay
    }

    pub fn recovery_due(&self) -> Option<Instant> {
        self.recovery_due
    }

    /// Change the base interval, keeping the current level.
    pub fn set_base(&mut self, base_interval: Duration) {
        self.session.base_interval = base_interval;
        self.recompute();
    }

    fn recompute(&mut self) {
        let base_ms = self.session.base_interval.as_millis() as f64;
        let scaled = base_ms * self.policy.growth.powi(i32::from(self.session.level));
        let capped = scaled.min(base_ms * self.policy.max_multiplier);
        self.session.current_interval = Duration::from_millis(capped.round() as u64);
    }

    fn change(&self, reason: &'static str) -> BackoffChange {
        BackoffChange {
            level: self.session.level,
            interval: self.session.current_interval,
            reason,
        }
    }

    /// Record a rate-limited response.
    pub fn on_rate_limited(&mut self, now: Instant) -> Option<BackoffChange> {
        self.transport_failures = 0;
        self.session.consecutive_successes = 0;
        self.session.consecutive_failures += 1;
        if self.session.consecutive_failures < self.policy.escalate_after {
            return None;
        }
        self.session.consecutive_failures = 0;

        if self.recovered_without_success {
            let grown = self.recovery_delay.mul_f64(self.policy.recovery_growth);
            self.recovery_delay = grown.min(self.policy.recovery_max);
            self.recovered_without_success = false;
        }
        self.recovery_due = Some(now + self.recovery_delay);

        if self.session.level >= MAX_LEVEL {
            return None;
        }
        self.session.level += 1;
        self.recompute();
        self.track_saturation(now);
        Some(self.change("rate limited"))
    }

    /// Record a successful response.
    pub fn on_success(&mut self, now: Instant) -> Option<BackoffChange> {
        self.transport_failures = 0;
        self.recovered_without_success = false;
        self.session.consecutive_failures = 0;
        self.session.consecutive_successes += 1;
        if self.session.consecutive_successes < self.policy.recover_after || self.session.level == 0
        {
            return None;
        }
        self.session.consecutive_successes = 0;
        Some(self.step_down(now, "sustained success"))
    }

    /// Apply the time-based recovery if it is due.
    pub fn poll_recovery(&mut self, now: Instant) -> Option<BackoffChange> {
        let due = self.recovery_due?;
        if now < due || self.session.level == 0 {
            return None;
        }
        self.recovered_without_success = true;
        Some(self.step_down(now, "recovery timer"))
    }

    fn step_down(&mut self, now: Instant, reason: &'static str) -> BackoffChange {
        self.session.level -= 1;
        self.recompute();
        if self.session.level == 0 {
            self.recovery_delay = self.policy.recovery_initial;
            self.recovery_due = None;
        } else {
            self.recovery_due = Some(now + self.recovery_delay);
        }
        self.track_saturation(now);
        self.change(reason)
    }

    /// Record a transport failure; returns the pause to apply when the limit is hit.
    pub fn on_transport_error(&mut self, now: Instant) -> Option<Duration> {
        self.transport_failures += 1;
        if self.transport_failures < self.policy.transport_error_limit {
            return None;
        }
        self.transport_failures = 0;
        let pause = self.policy.transport_pause;
        self.pause(now, pause, PauseReason::Transport);
        Some(pause)
    }

    pub fn pause(&mut self, now: Instant, duration: Duration, reason: PauseReason) {
        self.session.paused_until = Some(now + duration);
        self.pause_reason = Some(reason);
    }

    pub fn is_paused(&self, now: Instant) -> bool {
        self.session.paused_until.is_some_and(|until| now < until)
    }

    /// Clear an expired pause, returning why it was set.
    pub fn take_expired_pause(&mut self, now: Instant) -> Option<PauseReason> {
        let until = self.session.paused_until?;
        if now < until {
            return None;
        }
        self.session.paused_until = None;
        self.pause_reason.take()
    }

    /// Drop any pause without reporting a resume.
    pub fn clear_pause(&mut self) {
        self.session.paused_until = None;
        self.pause_reason = None;
    }

    fn track_saturation(&mut self, now: Instant) {
        if self.session.level >= self.policy.saturation_level {
            self.saturated_since.get_or_insert(now);
        } else {
            self.saturated_since = None;
            self.saturation_reported = false;
        }
    }

    /// Report, once per saturation episode, that backoff has been pinned
    /// near the ceiling for longer than the policy allows.
    pub fn check_saturation(&mut self, now: Instant) -> Option<Duration> {
        let since = self.saturated_since?;
        let elapsed = now.saturating_duration_since(since);
        if self.saturation_reported || elapsed < self.policy.saturation_after {
            return None;
        }
        self.saturation_reported = true;
        Some(elapsed)
    }
}
