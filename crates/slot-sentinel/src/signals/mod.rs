//! Availability signal sources.
//!
//! Three independent sources observe the page: the structural notifier
//! (coalesced DOM mutations), the jittered fallback timer, and the status
//! poller. Each produces [`AvailabilitySignal`]s; none of them touch the
//! availability state directly.

pub mod fallback;
pub mod poller;
pub mod structural;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

pub use fallback::FallbackTimer;
pub use poller::{classify_payload, spawn_poller, RequestTemplate, StatusTransport};
pub use structural::MutationCoalescer;

/// Where a signal came from. Poll signals are authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalSource {
    Structural,
    Poll,
    Fallback,
}

impl std::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalSource::Structural => write!(f, "structural"),
            SignalSource::Poll => write!(f, "poll"),
            SignalSource::Fallback => write!(f, "fallback"),
        }
    }
}

/// What the page looks like right now, as judged by the page adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralReport {
    /// The "nothing available" marker is present.
    pub sold_out: bool,
    /// Selectable sub-units are already rendered.
    pub has_sub_units: bool,
    /// The target context (e.g. the facility) is selected.
    pub context_selected: bool,
}

/// A parsed status endpoint response.
#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
    pub sold_out: bool,
    pub unit_count: u32,
    pub raw_payload: Value,
    /// URL the request was issued against, used for date fallback.
    pub request_url: Option<String>,
}

impl PollReport {
    /// Build a report by classifying a raw payload.
    pub fn from_payload(payload: Value, request_url: Option<String>) -> Self {
        let (sold_out, unit_count) = classify_payload(&payload);
        Self {
            sold_out,
            unit_count,
            raw_payload: payload,
            request_url,
        }
    }

    /// The unit objects inside the payload, when it carries a list.
    pub fn units(&self) -> &[Value] {
        poller::unit_list(&self.raw_payload).unwrap_or(&[])
    }
}

/// One observation, consumed immediately by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct AvailabilitySignal {
    pub source: SignalSource,
    pub observed_at: Instant,
    pub sold_out: bool,
    pub unit_count: u32,
    pub raw_payload: Option<Value>,
    pub has_sub_units: bool,
    pub context_selected: bool,
    pub request_url: Option<String>,
}

impl AvailabilitySignal {
    /// Signal from a page inspection, either structural or fallback.
    pub fn observed(source: SignalSource, report: StructuralReport, at: Instant) -> Self {
        Self {
            source,
            observed_at: at,
            sold_out: report.sold_out,
            unit_count: u32::from(!report.sold_out),
            raw_payload: None,
            has_sub_units: report.has_sub_units,
            context_selected: report.context_selected,
            request_url: None,
        }
    }

    pub fn poll(report: PollReport, at: Instant) -> Self {
        Self {
            source: SignalSource::Poll,
            observed_at: at,
            sold_out: report.sold_out || report.unit_count == 0,
            unit_count: report.unit_count,
            raw_payload: Some(report.raw_payload),
            has_sub_units: false,
            context_selected: true,
            request_url: report.request_url,
        }
    }

    pub fn is_authoritative(&self) -> bool {
        self.source == SignalSource::Poll
    }

    /// Unit objects carried by an authoritative payload.
    pub fn units(&self) -> &[Value] {
        self.raw_payload
            .as_ref()
            .and_then(poller::unit_list)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_poll_signal_is_authoritative() {
        let report = PollReport::from_payload(json!([{"id": 1}, {"id": 2}]), None);
        let signal = AvailabilitySignal::poll(report, Instant::now());
        assert!(signal.is_authoritative());
        assert!(!signal.sold_out);
        assert_eq!(signal.unit_count, 2);
        assert_eq!(signal.units().len(), 2);
    }

    #[test]
    fn test_observed_signal_carries_structure() {
        let report = StructuralReport {
            sold_out: false,
            has_sub_units: true,
            context_selected: true,
        };
        let signal = AvailabilitySignal::observed(SignalSource::Fallback, report, Instant::now());
        assert!(!signal.is_authoritative());
        assert!(signal.has_sub_units);
        assert!(signal.units().is_empty());
    }

    #[test]
    fn test_source_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&SignalSource::Structural).unwrap(),
            "\"STRUCTURAL\""
        );
    }
}
