//! Engine configuration: operator toggles plus the timing table.
//!
//! The operator-facing part ([`SentinelConfig`]) is serializable and owned by
//! whatever persistence layer hosts the engine. [`Timings`] holds the fixed
//! cadence constants; tests shrink them, production keeps the defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SentinelError, SentinelResult};

/// Lowest poll interval the engine accepts.
pub const MIN_POLL_INTERVAL_MS: u64 = 500;

/// Highest poll interval the engine accepts (one hour).
pub const MAX_POLL_INTERVAL_MS: u64 = 3_600_000;

/// Bounds for the periodic page refresh period, in seconds.
const MIN_AUTO_REFRESH_SEC: u64 = 5;
const MAX_AUTO_REFRESH_SEC: u64 = 3_600;

/// Largest debounce window that still makes sense for flicker suppression.
const MAX_DEBOUNCE_MS: u64 = 5_000;

/// Operator toggles consumed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Master switch. Disarmed engines ignore signals and hold the poller.
    pub armed: bool,
    /// Run the claim sequence automatically on AVAILABLE.
    pub auto_click_enabled: bool,
    /// Continue into the CONFIRM step after sub-units are selected.
    pub chain_confirm_enabled: bool,
    /// Allow full page reloads: periodically while polling is inactive, and
    /// when polling is saturated.
    pub auto_refresh_enabled: bool,
    /// Base period of the idle page refresh, in seconds. Up to
    /// [`Timings::auto_refresh_jitter`] is added to every period.
    pub auto_refresh_sec: u64,
    /// Base poll interval in milliseconds, within 500..=3_600_000.
    pub poll_interval_ms: u64,
    /// Debounce window for low-trust confirmations, in milliseconds.
    pub debounce_ms: u64,
    /// Preferred days of month, e.g. "3,5,10-12". Empty means any day.
    pub preferred_days: String,
    /// Preferred sub-unit time, e.g. "9am-4pm". Empty means top-ranked.
    pub preferred_time: String,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            armed: false,
            auto_click_enabled: false,
            chain_confirm_enabled: false,
            auto_refresh_enabled: false,
            auto_refresh_sec: 30,
            poll_interval_ms: MIN_POLL_INTERVAL_MS,
            debounce_ms: 100,
            preferred_days: String::new(),
            preferred_time: String::new(),
        }
    }
}

impl SentinelConfig {
    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> SentinelResult<()> {
        if self.debounce_ms == 0 || self.debounce_ms > MAX_DEBOUNCE_MS {
            return Err(SentinelError::Config(format!(
                "debounce_ms must be within 1..={MAX_DEBOUNCE_MS}, got {}",
                self.debounce_ms
            )));
        }
        if self.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(SentinelError::Config(format!(
                "poll_interval_ms must not exceed {MAX_POLL_INTERVAL_MS}, got {}",
                self.poll_interval_ms
            )));
        }
        if !(MIN_AUTO_REFRESH_SEC..=MAX_AUTO_REFRESH_SEC).contains(&self.auto_refresh_sec) {
            return Err(SentinelError::Config(format!(
                "auto_refresh_sec must be within {MIN_AUTO_REFRESH_SEC}..={MAX_AUTO_REFRESH_SEC}, got {}",
                self.auto_refresh_sec
            )));
        }
        Ok(())
    }

    /// Copy of this config with out-of-range values pulled into range.
    pub fn normalized(mut self) -> Self {
        self.poll_interval_ms = self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS);
        self.preferred_days = self.preferred_days.trim().to_string();
        self.preferred_time = self.preferred_time.trim().to_string();
        self
    }

    /// Whether claims may run right now.
    pub fn automation_enabled(&self) -> bool {
        self.armed && self.auto_click_enabled
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
        )
    }

    pub fn auto_refresh(&self) -> Duration {
        Duration::from_secs(self.auto_refresh_sec)
    }
}

/// Fixed cadence table for every timer the engine runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Timings {
    /// Quiet window used to coalesce structural mutation bursts.
    pub structural_quiet: Duration,
    /// Bounds of the jittered fallback re-check.
    pub fallback_min: Duration,
    pub fallback_max: Duration,
    /// Signals are ignored for this long after entering AVAILABLE.
    pub cooldown: Duration,
    /// Poll pause requested when a claim starts.
    pub claim_pause: Duration,
    /// The grab lock is force-released when a step boundary is not reached in time.
    pub safety_timeout: Duration,
    pub handshake_probe_interval: Duration,
    pub handshake_max_probes: u32,
    pub pending_queue_capacity: usize,
    pub select_unit_attempts: u32,
    pub select_unit_interval: Duration,
    /// Wait after a unit click before looking for sub-units.
    pub select_unit_settle: Duration,
    pub subunit_attempts: u32,
    pub subunit_interval: Duration,
    /// Wait after sub-unit clicks before the first confirm probe.
    pub confirm_delay: Duration,
    pub confirm_disabled_retries: u32,
    pub confirm_interval: Duration,
    /// Total confirm retries (including forced clicks) before giving up.
    pub confirm_total_budget: u32,
    /// Wait after an enabled confirm click before checking for navigation.
    pub confirm_settle: Duration,
    /// Extra delay before structurally triggered grabs start clicking.
    pub structural_grab_delay: Duration,
    /// Cooldown applied when available units do not match the preference.
    pub filtered_cooldown: Duration,
    /// Freshness window for the urgent marker left by a forced reload.
    pub urgent_freshness: Duration,
    /// capacityLock is released if no poll session appears within this window.
    pub capacity_lock_timeout: Duration,
    /// Safety release for the forced-refresh in-flight flag.
    pub refresh_safety: Duration,
    /// Wait after a forced refresh before retrying SELECT_UNIT.
    pub refresh_settle: Duration,
    /// Random extra delay added to each idle page refresh period.
    pub auto_refresh_jitter: Duration,
    /// Longest the engine waits on a page inspection before skipping it.
    pub inspect_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            structural_quiet: Duration::from_millis(150),
            fallback_min: Duration::from_secs(25),
            fallback_max: Duration::from_secs(55),
            cooldown: Duration::from_secs(15),
            claim_pause: Duration::from_secs(16),
            safety_timeout: Duration::from_secs(90),
            handshake_probe_interval: Duration::from_millis(200),
            handshake_max_probes: 25,
            pending_queue_capacity: 100,
            select_unit_attempts: 10,
            select_unit_interval: Duration::from_millis(500),
            select_unit_settle: Duration::from_secs(1),
            subunit_attempts: 25,
            subunit_interval: Duration::from_millis(800),
            confirm_delay: Duration::from_millis(1_500),
            confirm_disabled_retries: 8,
            confirm_interval: Duration::from_millis(800),
            confirm_total_budget: 38,
            confirm_settle: Duration::from_millis(1_500),
            structural_grab_delay: Duration::from_millis(500),
            filtered_cooldown: Duration::from_secs(10),
            urgent_freshness: Duration::from_secs(30),
            capacity_lock_timeout: Duration::from_secs(120),
            refresh_safety: Duration::from_secs(15),
            refresh_settle: Duration::from_millis(500),
            auto_refresh_jitter: Duration::from_secs(5),
            inspect_timeout: Duration::from_secs(5),
        }
    }
}

impl Timings {
    pub fn validate(&self) -> SentinelResult<()> {
        if self.fallback_min > self.fallback_max {
            return Err(SentinelError::Config(
                "fallback_min must not exceed fallback_max".into(),
            ));
        }
        if self.handshake_max_probes == 0 || self.pending_queue_capacity == 0 {
            return Err(SentinelError::Config(
                "handshake probes and queue capacity must be positive".into(),
            ));
        }
        if self.inspect_timeout.is_zero() {
            return Err(SentinelError::Config(
                "inspect_timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}
