//! Telemetry bus: typed events from every component.
//!
//! The [`EventBus`] is a `tokio::sync::broadcast` channel carrying
//! [`SentinelEvent`] values. Consumers (the relay forwarder, a terminal
//! printer, tests) subscribe independently. When nobody is subscribed,
//! events are silently dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::availability::AvailabilityState;
use crate::grab::GrabStep;
use crate::signals::SignalSource;

/// Severity of a log event forwarded to telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Every event the engine emits. Serialized to JSON for the relay.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SentinelEvent {
    // ── State ─────────────────────────────
    /// The availability state machine moved.
    StateChanged {
        state: AvailabilityState,
        previous: AvailabilityState,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Free-form log line meant for operators.
    Log {
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },

    // ── Claim ─────────────────────────────
    /// A grab session acquired the lock.
    GrabStarted {
        trigger: SignalSource,
        skip_select_unit: bool,
        timestamp: DateTime<Utc>,
    },
    /// The grab sequence entered a new step.
    GrabStep { step: GrabStep, timestamp: DateTime<Utc> },
    /// A grab session ended, successfully or not.
    GrabFinished {
        outcome: String,
        success: bool,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// The engine asked the page to perform a full reload.
    ReloadRequested {
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // ── Polling ───────────────────────────
    /// A status request template was captured and polling started.
    PollReady { interval_ms: u64 },
    /// The backoff controller changed the poll cadence.
    PollBackoff {
        level: u8,
        interval_ms: u64,
        reason: String,
    },
    /// Polling resumed after an explicit pause.
    PollResumed,
    /// Backoff has been pinned near its ceiling for too long.
    PollSaturated { level: u8, since_secs: u64 },

    // ── Channel ───────────────────────────
    /// The secure channel completed its handshake.
    ChannelReady,
    /// The handshake timed out; only local signals remain usable.
    ChannelDegraded { attempts: u32 },
}

impl SentinelEvent {
    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            SentinelEvent::StateChanged { .. } => "state_changed",
            SentinelEvent::Log { .. } => "log",
            SentinelEvent::GrabStarted { .. } => "grab_started",
            SentinelEvent::GrabStep { .. } => "grab_step",
            SentinelEvent::GrabFinished { .. } => "grab_finished",
            SentinelEvent::ReloadRequested { .. } => "reload_requested",
            SentinelEvent::PollReady { .. } => "poll_ready",
            SentinelEvent::PollBackoff { .. } => "poll_backoff",
            SentinelEvent::PollResumed => "poll_resumed",
            SentinelEvent::PollSaturated { .. } => "poll_saturated",
            SentinelEvent::ChannelReady => "channel_ready",
            SentinelEvent::ChannelDegraded { .. } => "channel_degraded",
        }
    }
}

/// The central telemetry bus.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SentinelEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: SentinelEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SentinelEvent> {
        self.sender.subscribe()
    }

    /// Write a log line to `tracing` and mirror it onto the bus.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
        self.emit(SentinelEvent::Log {
            level,
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
