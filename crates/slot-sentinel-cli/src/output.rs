//! Terminal rendering of engine events.

use slot_sentinel::{LogLevel, SentinelEvent};

/// Formats events as JSON lines or short human-readable lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventPrinter {
    pub json: bool,
}

impl EventPrinter {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn render(&self, event: &SentinelEvent) -> String {
        if self.json {
            return serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"));
        }
        match event {
            SentinelEvent::StateChanged {
                state,
                previous,
                reason,
                timestamp,
            } => format!(
                "[{}] state    {previous} -> {state} ({reason})",
                timestamp.format("%H:%M:%S")
            ),
            SentinelEvent::Log {
                level,
                message,
                timestamp,
            } => {
                let tag = match level {
                    LogLevel::Debug => "debug",
                    LogLevel::Info => "info",
                    LogLevel::Warn => "warn",
                    LogLevel::Error => "error",
                };
                format!("[{}] {tag:<8} {message}", timestamp.format("%H:%M:%S"))
            }
            SentinelEvent::GrabStarted {
                trigger,
                skip_select_unit,
                timestamp,
            } => format!(
                "[{}] grab     started by {trigger}{}",
                timestamp.format("%H:%M:%S"),
                if *skip_select_unit { " (sub-units visible)" } else { "" }
            ),
            SentinelEvent::GrabStep { step, timestamp } => {
                format!("[{}] grab     step {step}", timestamp.format("%H:%M:%S"))
            }
            SentinelEvent::GrabFinished {
                outcome,
                success,
                elapsed_ms,
                timestamp,
            } => format!(
                "[{}] grab     {} {outcome} after {elapsed_ms} ms",
                timestamp.format("%H:%M:%S"),
                if *success { "succeeded:" } else { "failed:" }
            ),
            SentinelEvent::ReloadRequested { reason, timestamp } => {
                format!("[{}] reload   {reason}", timestamp.format("%H:%M:%S"))
            }
            SentinelEvent::PollReady { interval_ms } => {
                format!("           poll     ready every {interval_ms} ms")
            }
            SentinelEvent::PollBackoff {
                level,
                interval_ms,
                reason,
            } => format!("           poll     level {level}, every {interval_ms} ms ({reason})"),
            SentinelEvent::PollResumed => "           poll     resumed".to_string(),
            SentinelEvent::PollSaturated { level, since_secs } => {
                format!("           poll     saturated at level {level} for {since_secs} s")
            }
            SentinelEvent::ChannelReady => "           channel  ready".to_string(),
            SentinelEvent::ChannelDegraded { attempts } => {
                format!("           channel  degraded after {attempts} probes")
            }
        }
    }

    pub fn print(&self, event: &SentinelEvent) {
        println!("{}", self.render(event));
    }
}
