//! Availability state machine: fuses signals into one authoritative state.
//!
//! ```text
//!            context selected, marker present
//!   UNKNOWN ─────────────────────────────────▶ SOLD_OUT
//!                                               │   ▲
//!       poll: units > 0                         │   │ marker back / poll: 0 units /
//!       structural: marker gone ×2 in window    │   │ poller resumed / claim aborted
//!                                               ▼   │
//!                                             AVAILABLE
//! ```
//!
//! Poll signals are authoritative: one report with units is enough.
//! Structural and fallback signals need two confirmations inside the
//! debounce window, and are blocked by the capacity lock until a poll
//! clears it or sub-units are visibly rendered.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{SentinelConfig, Timings};
use crate::grab::GrabTrigger;
use crate::preference::{match_days, DayMatch};
use crate::signals::{AvailabilitySignal, SignalSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvailabilityState {
    Unknown,
    SoldOut,
    Available,
}

impl std::fmt::Display for AvailabilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AvailabilityState::Unknown => "UNKNOWN",
            AvailabilityState::SoldOut => "SOLD_OUT",
            AvailabilityState::Available => "AVAILABLE",
        };
        f.write_str(name)
    }
}

/// A state change, with the claim trigger when entering AVAILABLE.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: AvailabilityState,
    pub to: AvailabilityState,
    pub reason: String,
    pub trigger: Option<GrabTrigger>,
}

/// What the machine did with a signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Transition(Transition),
    /// First low-trust confirmation recorded; re-check before `deadline`.
    AwaitingConfirmation { deadline: Instant },
    /// Units were reported, but none on a preferred day.
    Filtered(Vec<u8>),
    Ignored(&'static str),
    Unchanged,
}

impl Evaluation {
    pub fn transition(&self) -> Option<&Transition> {
        match self {
            Evaluation::Transition(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingConfirmation {
    first_at: Instant,
}

/// The one owned availability value per engine.
#[derive(Debug)]
pub struct AvailabilityMachine {
    state: AvailabilityState,
    last_transition_at: Option<Instant>,
    cooldown_until: Option<Instant>,
    capacity_lock: bool,
    lock_armed_at: Instant,
    poll_session_seen: bool,
    pending: Option<PendingConfirmation>,
    debounce: Duration,
    cooldown: Duration,
    capacity_lock_timeout: Duration,
    preferred_days: String,
}

impl AvailabilityMachine {
    pub fn new(config: &SentinelConfig, timings: &Timings, now: Instant) -> Self {
        Self {
            state: AvailabilityState::Unknown,
            last_transition_at: None,
            cooldown_until: None,
            capacity_lock: true,
            lock_armed_at: now,
            poll_session_seen: false,
            pending: None,
            debounce: config.debounce(),
            cooldown: timings.cooldown,
            capacity_lock_timeout: timings.capacity_lock_timeout,
            preferred_days: config.preferred_days.clone(),
        }
    }

    pub fn state(&self) -> AvailabilityState {
        self.state
    }

    pub fn last_transition_at(&self) -> Option<Instant> {
        self.last_transition_at
    }

    pub fn cooldown_until(&self) -> Option<Instant> {
        self.cooldown_until
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    pub fn capacity_locked(&self) -> bool {
        self.capacity_lock
    }

    pub fn apply_config(&mut self, config: &SentinelConfig) {
        self.debounce = config.debounce();
        self.preferred_days = config.preferred_days.clone();
    }

    /// A poll session now exists; the capacity lock no longer times out.
    pub fn on_poll_session(&mut self) {
        self.poll_session_seen = true;
    }

    /// Clear the capacity lock explicitly (urgent marker after a forced reload).
    pub fn release_capacity_lock(&mut self, reason: &str) {
        if self.capacity_lock {
            tracing::info!(reason, "capacity lock released");
            self.capacity_lock = false;
        }
    }

    /// Lock state after applying the no-poll-session timeout.
    fn lock_engaged(&mut self, now: Instant) -> bool {
        if self.capacity_lock
            && !self.poll_session_seen
            && now.saturating_duration_since(self.lock_armed_at) >= self.capacity_lock_timeout
        {
            tracing::info!(
                timeout_s = self.capacity_lock_timeout.as_secs(),
                "no poll session established, capacity lock expired"
            );
            self.capacity_lock = false;
        }
        self.capacity_lock
    }

    fn arm_lock(&mut self, now: Instant) {
        self.capacity_lock = true;
        self.lock_armed_at = now;
    }

    fn move_to(
        &mut self,
        to: AvailabilityState,
        now: Instant,
        reason: impl Into<String>,
        trigger: Option<GrabTrigger>,
    ) -> Evaluation {
        let from = self.state;
        self.state = to;
        self.last_transition_at = Some(now);
        self.pending = None;
        if to == AvailabilityState::Available {
            self.cooldown_until = Some(now + self.cooldown);
        }
        Evaluation::Transition(Transition {
            from,
            to,
            reason: reason.into(),
            trigger,
        })
    }

    /// Feed one signal through the trust rules.
    pub fn apply(&mut self, signal: &AvailabilitySignal, now: Instant) -> Evaluation {
        if self.in_cooldown(now) {
            return Evaluation::Ignored("cooldown");
        }
        match signal.source {
            SignalSource::Poll => self.apply_poll(signal, now),
            SignalSource::Structural | SignalSource::Fallback => self.apply_observed(signal, now),
        }
    }

    fn apply_poll(&mut self, signal: &AvailabilitySignal, now: Instant) -> Evaluation {
        self.poll_session_seen = true;
        self.pending = None;

        if signal.sold_out || signal.unit_count == 0 {
            self.arm_lock(now);
            if self.state == AvailabilityState::SoldOut {
                return Evaluation::Unchanged;
            }
            return self.move_to(AvailabilityState::SoldOut, now, "poll reported no units", None);
        }

        let days = match_days(&self.preferred_days, signal.units(), signal.request_url.as_deref());
        if let DayMatch::Rejected(found) = days {
            return Evaluation::Filtered(found);
        }
        if days == DayMatch::Undetermined {
            tracing::debug!("unit days not found in payload, page filter decides");
        }

        self.capacity_lock = false;
        if self.state == AvailabilityState::Available {
            return Evaluation::Unchanged;
        }
        let reason = format!("poll reported {} unit(s)", signal.unit_count);
        let trigger = GrabTrigger {
            source: SignalSource::Poll,
            skip_select_unit: false,
        };
        self.move_to(AvailabilityState::Available, now, reason, Some(trigger))
    }

    fn apply_observed(&mut self, signal: &AvailabilitySignal, now: Instant) -> Evaluation {
        if !signal.context_selected {
            self.pending = None;
            if self.state == AvailabilityState::Unknown {
                return Evaluation::Unchanged;
            }
            return self.move_to(AvailabilityState::Unknown, now, "waiting for context selection", None);
        }

        if signal.sold_out {
            self.pending = None;
            if self.state == AvailabilityState::SoldOut {
                return Evaluation::Unchanged;
            }
            return self.move_to(AvailabilityState::SoldOut, now, "sold-out marker present", None);
        }

        match self.state {
            AvailabilityState::Available => Evaluation::Unchanged,
            AvailabilityState::Unknown if !signal.has_sub_units => {
                self.move_to(AvailabilityState::SoldOut, now, "context selected, monitoring", None)
            }
            AvailabilityState::Unknown | AvailabilityState::SoldOut => self.confirm(signal, now),
        }
    }

    /// Marker gone: require a second confirmation inside the debounce window.
    fn confirm(&mut self, signal: &AvailabilitySignal, now: Instant) -> Evaluation {
        let locked = self.lock_engaged(now);
        if locked && !signal.has_sub_units {
            self.pending = None;
            return Evaluation::Ignored("capacity lock");
        }

        let within_window = self
            .pending
            .is_some_and(|p| now.saturating_duration_since(p.first_at) <= self.debounce);
        if !within_window {
            self.pending = Some(PendingConfirmation { first_at: now });
            return Evaluation::AwaitingConfirmation {
                deadline: now + self.debounce,
            };
        }

        let skip_select_unit = locked && signal.has_sub_units;
        if skip_select_unit {
            self.release_capacity_lock("sub-units visible");
        }
        let trigger = GrabTrigger {
            source: signal.source,
            skip_select_unit,
        };
        self.move_to(
            AvailabilityState::Available,
            now,
            format!("{} signal confirmed marker gone", signal.source),
            Some(trigger),
        )
    }

    /// Navigation: back to UNKNOWN with a fresh lock and no poll session.
    pub fn on_navigation(&mut self, now: Instant) -> Option<Transition> {
        self.cooldown_until = None;
        self.poll_session_seen = false;
        self.arm_lock(now);
        if self.state == AvailabilityState::Unknown {
            self.pending = None;
            return None;
        }
        self.move_to(AvailabilityState::Unknown, now, "navigation", None)
            .transition()
            .cloned()
    }

    /// The poller came back from its claim pause.
    pub fn on_poll_resumed(&mut self, now: Instant) -> Option<Transition> {
        self.cooldown_until = None;
        self.arm_lock(now);
        if self.state != AvailabilityState::Available {
            return None;
        }
        self.move_to(AvailabilityState::SoldOut, now, "poller resumed", None)
            .transition()
            .cloned()
    }

    /// A claim ended without success: back to SOLD_OUT and hold off for `cooldown`.
    pub fn abort_claim(&mut self, now: Instant, cooldown: Duration, reason: &str) -> Option<Transition> {
        let transition = if self.state == AvailabilityState::SoldOut {
            None
        } else {
            self.move_to(AvailabilityState::SoldOut, now, reason, None)
                .transition()
                .cloned()
        };
        self.cooldown_until = Some(now + cooldown);
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{PollReport, StructuralReport};
    use proptest::prelude::*;
    use serde_json::json;

    fn machine(now: Instant) -> AvailabilityMachine {
        AvailabilityMachine::new(&SentinelConfig::default(), &Timings::default(), now)
    }

    fn observed(sold_out: bool, has_sub_units: bool, at: Instant) -> AvailabilitySignal {
        AvailabilitySignal::observed(
            SignalSource::Structural,
            StructuralReport {
                sold_out,
                has_sub_units,
                context_selected: true,
            },
            at,
        )
    }

    fn poll(payload: serde_json::Value, at: Instant) -> AvailabilitySignal {
        AvailabilitySignal::poll(PollReport::from_payload(payload, None), at)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_context_selected_moves_to_sold_out() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        let eval = m.apply(&observed(true, false, t0), t0);
        assert_eq!(eval.transition().unwrap().to, AvailabilityState::SoldOut);
        assert_eq!(m.state(), AvailabilityState::SoldOut);
    }

    #[test]
    fn test_single_poll_with_units_is_enough() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.apply(&observed(true, false, t0), t0);

        let eval = m.apply(&poll(json!([{"id": 1}]), t0 + ms(10)), t0 + ms(10));
        let t = eval.transition().unwrap();
        assert_eq!(t.to, AvailabilityState::Available);
        assert_eq!(t.trigger.as_ref().unwrap().source, SignalSource::Poll);
        assert!(!m.capacity_locked());
        assert!(m.in_cooldown(t0 + ms(15_000)));
        assert!(!m.in_cooldown(t0 + ms(15_010)));
    }

    #[test]
    fn test_capacity_lock_blocks_structural_without_poll() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.apply(&observed(true, false, t0), t0);

        for step in 1..=5 {
            let at = t0 + ms(step * 50);
            assert_eq!(m.apply(&observed(false, false, at), at), Evaluation::Ignored("capacity lock"));
        }
        assert_eq!(m.state(), AvailabilityState::SoldOut);
    }

    #[test]
    fn test_two_confirmations_required_after_poll_clears_lock() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.apply(&observed(true, false, t0), t0);
        m.release_capacity_lock("test");

        let first = m.apply(&observed(false, false, t0 + ms(10)), t0 + ms(10));
        assert_eq!(
            first,
            Evaluation::AwaitingConfirmation {
                deadline: t0 + ms(110)
            }
        );
        assert_eq!(m.state(), AvailabilityState::SoldOut);

        let second = m.apply(&observed(false, false, t0 + ms(110)), t0 + ms(110));
        let t = second.transition().unwrap();
        assert_eq!(t.to, AvailabilityState::Available);
        assert!(!t.trigger.as_ref().unwrap().skip_select_unit);
    }

    #[test]
    fn test_confirmation_outside_window_restarts() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.apply(&observed(true, false, t0), t0);
        m.release_capacity_lock("test");

        m.apply(&observed(false, false, t0), t0);
        let late = m.apply(&observed(false, false, t0 + ms(101)), t0 + ms(101));
        assert!(matches!(late, Evaluation::AwaitingConfirmation { .. }));
        assert_eq!(m.state(), AvailabilityState::SoldOut);
    }

    #[test]
    fn test_visible_sub_units_clear_lock_and_skip_unit_step() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.apply(&observed(true, false, t0), t0);
        assert!(m.capacity_locked());

        m.apply(&observed(false, true, t0 + ms(20)), t0 + ms(20));
        let eval = m.apply(&observed(false, true, t0 + ms(60)), t0 + ms(60));
        let trigger = eval.transition().unwrap().trigger.clone().unwrap();
        assert!(trigger.skip_select_unit);
        assert!(!m.capacity_locked());
    }

    #[test]
    fn test_capacity_lock_expires_without_poll_session() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.apply(&observed(true, false, t0), t0);

        let late = t0 + Duration::from_secs(120);
        assert!(matches!(
            m.apply(&observed(false, false, late), late),
            Evaluation::AwaitingConfirmation { .. }
        ));
        assert!(!m.capacity_locked());
    }

    #[test]
    fn test_capacity_lock_holds_with_poll_session() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.on_poll_session();
        m.apply(&observed(true, false, t0), t0);
        let late = t0 + Duration::from_secs(600);
        assert_eq!(m.apply(&observed(false, false, late), late), Evaluation::Ignored("capacity lock"));
    }

    #[test]
    fn test_cooldown_ignores_everything() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.apply(&poll(json!([{}]), t0), t0);
        let at = t0 + Duration::from_secs(5);
        assert_eq!(m.apply(&observed(true, false, at), at), Evaluation::Ignored("cooldown"));
        assert_eq!(m.apply(&poll(json!([]), at), at), Evaluation::Ignored("cooldown"));
        assert_eq!(m.state(), AvailabilityState::Available);

        let after = t0 + Duration::from_secs(16);
        let eval = m.apply(&poll(json!([]), after), after);
        assert_eq!(eval.transition().unwrap().to, AvailabilityState::SoldOut);
        assert!(m.capacity_locked());
    }

    #[test]
    fn test_repeat_poll_while_available_is_unchanged() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.apply(&poll(json!([{}]), t0), t0);
        let first_transition = m.last_transition_at();

        let after = t0 + Duration::from_secs(20);
        assert_eq!(m.apply(&poll(json!([{}, {}]), after), after), Evaluation::Unchanged);
        assert_eq!(m.state(), AvailabilityState::Available);
        assert_eq!(m.last_transition_at(), first_transition);
        assert!(!m.in_cooldown(after));
    }

    #[test]
    fn test_preferred_days_filter_poll() {
        let t0 = Instant::now();
        let config = SentinelConfig {
            preferred_days: "10-12".into(),
            ..Default::default()
        };
        let mut m = AvailabilityMachine::new(&config, &Timings::default(), t0);
        m.apply(&observed(true, false, t0), t0);

        let eval = m.apply(&poll(json!([{"date": "2025-06-03"}]), t0), t0);
        assert_eq!(eval, Evaluation::Filtered(vec![3]));
        assert_eq!(m.state(), AvailabilityState::SoldOut);

        let eval = m.apply(&poll(json!([{"date": "2025-06-11"}]), t0), t0);
        assert_eq!(eval.transition().unwrap().to, AvailabilityState::Available);
    }

    #[test]
    fn test_poll_resume_demotes_available() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.apply(&poll(json!([{}]), t0), t0);
        let t = m.on_poll_resumed(t0 + Duration::from_secs(16)).unwrap();
        assert_eq!(t.to, AvailabilityState::SoldOut);
        assert!(m.capacity_locked());
        assert!(!m.in_cooldown(t0 + Duration::from_secs(16)));
    }

    #[test]
    fn test_navigation_resets() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.apply(&poll(json!([{}]), t0), t0);
        let t = m.on_navigation(t0 + ms(500)).unwrap();
        assert_eq!(t.to, AvailabilityState::Unknown);
        assert!(!m.in_cooldown(t0 + ms(500)));
        assert!(m.capacity_locked());
        assert!(m.on_navigation(t0 + ms(600)).is_none());
    }

    #[test]
    fn test_abort_claim_applies_cooldown() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.apply(&poll(json!([{}]), t0), t0);
        let t = m.abort_claim(t0 + ms(100), Duration::from_secs(10), "no preferred unit").unwrap();
        assert_eq!(t.to, AvailabilityState::SoldOut);
        assert!(m.in_cooldown(t0 + Duration::from_secs(10)));
    }

    #[derive(Debug, Clone)]
    struct Step {
        gap_ms: u64,
        sold_out: bool,
        has_sub_units: bool,
        context_selected: bool,
        fallback: bool,
    }

    fn step() -> impl Strategy<Value = Step> {
        (0u64..400, any::<bool>(), any::<bool>(), prop::bool::weighted(0.9), any::<bool>()).prop_map(
            |(gap_ms, sold_out, has_sub_units, context_selected, fallback)| Step {
                gap_ms,
                sold_out,
                has_sub_units,
                context_selected,
                fallback,
            },
        )
    }

    proptest! {
        #[test]
        fn prop_low_trust_needs_two_confirmations(
            steps in prop::collection::vec(step(), 1..120),
            unlocked in any::<bool>(),
        ) {
            let t0 = Instant::now();
            let mut m = machine(t0);
            if unlocked {
                m.release_capacity_lock("prop");
            }
            let debounce = ms(100);
            let mut now = t0;
            let mut previous: Option<(Instant, bool)> = None;

            for s in &steps {
                now += ms(s.gap_ms);
                let source = if s.fallback { SignalSource::Fallback } else { SignalSource::Structural };
                let signal = AvailabilitySignal::observed(
                    source,
                    StructuralReport {
                        sold_out: s.sold_out,
                        has_sub_units: s.has_sub_units,
                        context_selected: s.context_selected,
                    },
                    now,
                );
                let confirming = !s.sold_out && s.context_selected;
                let eval = m.apply(&signal, now);
                if let Some(t) = eval.transition() {
                    if t.to == AvailabilityState::Available {
                        let (at, was_confirming) = previous.expect("a prior signal");
                        prop_assert!(confirming);
                        prop_assert!(was_confirming);
                        prop_assert!(now.duration_since(at) <= debounce);
                    }
                }
                if eval != Evaluation::Ignored("cooldown") {
                    previous = Some((now, confirming));
                }
            }
        }
    }
}
