//! The claim sequence itself, as explicit retry loops in one task.
//!
//! Every wait and every page call races the ticket's cancellation token, so
//! a force release or a disabled automation switch stops the sequence at
//! the next await point. Step boundaries and retries re-arm the gate's
//! safety deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::{
    ConfirmProbe, GrabGate, GrabOutcome, GrabStep, GrabTicket, GrabTrigger, PageAdapter,
    UnitSelection,
};
use crate::config::{SentinelConfig, Timings};
use crate::events::{EventBus, SentinelEvent};
use crate::preference::{choose_sub_units, parse_preferred_days};
use crate::signals::SignalSource;

/// Config slice the sequence needs, captured when the claim starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrabSettings {
    pub chain_confirm: bool,
    pub preferred_days: Vec<u8>,
    pub preferred_time: String,
}

impl GrabSettings {
    pub fn from_config(config: &SentinelConfig) -> Self {
        Self {
            chain_confirm: config.chain_confirm_enabled,
            preferred_days: parse_preferred_days(&config.preferred_days),
            preferred_time: config.preferred_time.clone(),
        }
    }
}

/// What a finished sequence hands back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct GrabReport {
    pub generation: u64,
    pub outcome: GrabOutcome,
    pub elapsed: Duration,
}

/// The sequence was cancelled or lost the gate.
#[derive(Debug)]
struct Halted;

enum UnitStep {
    Proceed,
    Stop(GrabOutcome),
}

pub struct GrabSequence {
    page: Arc<dyn PageAdapter>,
    gate: GrabGate,
    ticket: GrabTicket,
    timings: Timings,
    settings: GrabSettings,
    automation: watch::Receiver<bool>,
    events: EventBus,
}

impl GrabSequence {
    pub fn new(
        page: Arc<dyn PageAdapter>,
        gate: GrabGate,
        ticket: GrabTicket,
        timings: Timings,
        settings: GrabSettings,
        automation: watch::Receiver<bool>,
        events: EventBus,
    ) -> Self {
        Self {
            page,
            gate,
            ticket,
            timings,
            settings,
            automation,
            events,
        }
    }

    /// Run to completion and release the gate.
    pub async fn run(self, trigger: GrabTrigger) -> GrabReport {
        let started = Instant::now();
        let outcome = match self.execute(&trigger).await {
            Ok(outcome) => outcome,
            Err(Halted) => GrabOutcome::Cancelled,
        };
        if !self.gate.release(self.ticket.generation).await {
            tracing::debug!(generation = self.ticket.generation, "gate already released");
        }
        GrabReport {
            generation: self.ticket.generation,
            outcome,
            elapsed: started.elapsed(),
        }
    }

    async fn execute(&self, trigger: &GrabTrigger) -> Result<GrabOutcome, Halted> {
        let start_url = self.guard(self.page.current_url()).await?;

        if trigger.source != SignalSource::Poll {
            self.pause(self.timings.structural_grab_delay).await?;
        }

        if trigger.skip_select_unit {
            tracing::info!("sub-units already visible, skipping {}", GrabStep::SelectUnit);
        } else {
            let refresh_first = trigger.source == SignalSource::Poll;
            if let UnitStep::Stop(outcome) = self.select_unit(refresh_first).await? {
                return Ok(outcome);
            }
        }

        if !self.select_sub_units().await? {
            return Ok(GrabOutcome::Exhausted {
                step: GrabStep::SelectSubunit,
            });
        }
        if !self.settings.chain_confirm {
            return Ok(GrabOutcome::SubunitsSelected);
        }
        self.confirm(&start_url).await
    }

    /// Await `fut` unless the ticket is cancelled first.
    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Halted> {
        tokio::select! {
            biased;
            _ = self.ticket.cancel.cancelled() => Err(Halted),
            out = fut => Ok(out),
        }
    }

    async fn pause(&self, duration: Duration) -> Result<(), Halted> {
        self.guard(tokio::time::sleep(duration)).await
    }

    /// Retry/step boundary: stop if cancelled, re-arm the safety deadline.
    async fn checkpoint(&self, step: GrabStep) -> Result<(), Halted> {
        if self.ticket.cancel.is_cancelled() {
            return Err(Halted);
        }
        let enabled = *self.automation.borrow();
        if !enabled {
            tracing::info!(%step, "automation disabled, cancelling claim");
            return Err(Halted);
        }
        if !self
            .gate
            .checkpoint(self.ticket.generation, step, Instant::now())
            .await
        {
            return Err(Halted);
        }
        Ok(())
    }

    fn enter(&self, step: GrabStep) {
        tracing::info!(generation = self.ticket.generation, "entering {step}");
        self.events.emit(SentinelEvent::GrabStep {
            step,
            timestamp: chrono::Utc::now(),
        });
    }

    async fn select_unit(&self, refresh_first: bool) -> Result<UnitStep, Halted> {
        self.enter(GrabStep::SelectUnit);
        let mut refreshed = false;
        if refresh_first {
            tracing::info!("poll-triggered claim, refreshing page data before selecting a unit");
            if !self.refresh().await? {
                return Ok(UnitStep::Stop(GrabOutcome::Exhausted {
                    step: GrabStep::SelectUnit,
                }));
            }
            refreshed = true;
        }

        let attempts = self.timings.select_unit_attempts;
        loop {
            for attempt in 1..=attempts {
                self.checkpoint(GrabStep::SelectUnit).await?;
                match self
                    .guard(self.page.select_unit(&self.settings.preferred_days))
                    .await?
                {
                    UnitSelection::Clicked => {
                        tracing::info!(attempt, refreshed, "unit selected");
                        self.pause(self.timings.select_unit_settle).await?;
                        return Ok(UnitStep::Proceed);
                    }
                    UnitSelection::Filtered => {
                        tracing::info!("units on page do not match preferred days, standing down");
                        return Ok(UnitStep::Stop(GrabOutcome::Filtered));
                    }
                    UnitSelection::NoCandidates => {
                        tracing::debug!(attempt, attempts, "no unit to select yet");
                        if attempt < attempts {
                            self.pause(self.timings.select_unit_interval).await?;
                        }
                    }
                }
            }

            if refreshed {
                tracing::warn!("still no unit after refresh, moving on to {}", GrabStep::SelectSubunit);
                return Ok(UnitStep::Proceed);
            }
            tracing::info!(attempts, "no unit found, forcing a context refresh");
            if !self.refresh().await? {
                return Ok(UnitStep::Stop(GrabOutcome::Exhausted {
                    step: GrabStep::SelectUnit,
                }));
            }
            refreshed = true;
        }
    }

    /// Forced-refresh side procedure, exclusive via the gate's refresh flag.
    async fn refresh(&self) -> Result<bool, Halted> {
        if !self.gate.begin_refresh(Instant::now()).await {
            tracing::debug!("refresh already in flight, waiting for it");
            self.pause(self.timings.refresh_settle).await?;
            return Ok(true);
        }
        let result = self.guard(self.page.force_refresh_context()).await;
        self.gate.end_refresh().await;
        let refreshed = result?;
        if refreshed {
            self.pause(self.timings.refresh_settle).await?;
        } else {
            tracing::warn!("forced refresh failed");
        }
        Ok(refreshed)
    }

    /// Returns `false` when no sub-unit appeared within the attempt budget.
    async fn select_sub_units(&self) -> Result<bool, Halted> {
        self.enter(GrabStep::SelectSubunit);
        let attempts = self.timings.subunit_attempts;
        for attempt in 1..=attempts {
            self.checkpoint(GrabStep::SelectSubunit).await?;
            let candidates = self.guard(self.page.select_sub_units()).await?;
            if !candidates.is_empty() {
                let choice = choose_sub_units(&candidates, &self.settings.preferred_time);
                if choice.fell_back {
                    tracing::warn!(
                        preferred = %self.settings.preferred_time,
                        "no sub-unit matches the preferred time, using the top-ranked one"
                    );
                }
                for unit in &choice.units {
                    self.guard(self.page.activate_sub_unit(unit)).await?;
                    tracing::info!(label = %unit.label, "sub-unit activated");
                }
                return Ok(true);
            }
            if attempt < attempts {
                self.pause(self.timings.subunit_interval).await?;
            }
        }
        tracing::warn!(attempts, "no sub-units appeared");
        Ok(false)
    }

    async fn confirm(&self, start_url: &str) -> Result<GrabOutcome, Halted> {
        self.enter(GrabStep::Confirm);
        self.pause(self.timings.confirm_delay).await?;

        let max_disabled = self.timings.confirm_disabled_retries;
        let budget = self.timings.confirm_total_budget;
        let mut disabled_streak = 0u32;
        let mut spent = 0u32;

        loop {
            self.checkpoint(GrabStep::Confirm).await?;
            let url = self.guard(self.page.current_url()).await?;
            if url != start_url {
                return Ok(GrabOutcome::Succeeded { url });
            }

            match self.guard(self.page.try_confirm(false)).await? {
                ConfirmProbe::Disabled if disabled_streak < max_disabled => {
                    disabled_streak += 1;
                    tracing::debug!(disabled_streak, max_disabled, "confirm control disabled");
                    self.pause(self.timings.confirm_interval).await?;
                }
                ConfirmProbe::Disabled => {
                    tracing::warn!("confirm control stuck disabled, forcing a click");
                    self.guard(self.page.try_confirm(true)).await?;
                    disabled_streak = 0;
                    spent += max_disabled;
                    if spent >= budget {
                        tracing::warn!(spent, "confirm budget spent");
                        return Ok(GrabOutcome::Exhausted {
                            step: GrabStep::Confirm,
                        });
                    }
                    self.pause(self.timings.confirm_interval).await?;
                }
                ConfirmProbe::Clicked => {
                    tracing::info!("confirm clicked");
                    disabled_streak = 0;
                    spent += 1;
                    self.pause(self.timings.confirm_settle).await?;
                    let url = self.guard(self.page.current_url()).await?;
                    if url != start_url {
                        return Ok(GrabOutcome::Succeeded { url });
                    }
                    if spent >= budget {
                        return Ok(GrabOutcome::Exhausted {
                            step: GrabStep::Confirm,
                        });
                    }
                }
                ConfirmProbe::Done => {
                    tracing::info!("no confirm control left");
                    return Ok(GrabOutcome::ConfirmChainEnded);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grab::{PageScript, ScriptedPage, UnitRef};
    use tokio_util::sync::CancellationToken;

    struct Harness {
        page: Arc<ScriptedPage>,
        gate: GrabGate,
        root: CancellationToken,
        automation: watch::Sender<bool>,
    }

    impl Harness {
        fn new(script: PageScript) -> Self {
            let (automation, _) = watch::channel(true);
            Self {
                page: Arc::new(ScriptedPage::new(script)),
                gate: GrabGate::new(Duration::from_secs(90), Duration::from_secs(15)),
                root: CancellationToken::new(),
                automation,
            }
        }

        async fn sequence(&self, settings: GrabSettings) -> GrabSequence {
            let ticket = self
                .gate
                .try_acquire(Instant::now(), &self.root)
                .await
                .expect("gate free");
            GrabSequence::new(
                self.page.clone(),
                self.gate.clone(),
                ticket,
                Timings::default(),
                settings,
                self.automation.subscribe(),
                EventBus::default(),
            )
        }
    }

    fn chained() -> GrabSettings {
        GrabSettings {
            chain_confirm: true,
            ..Default::default()
        }
    }

    fn structural(skip: bool) -> GrabTrigger {
        GrabTrigger {
            source: SignalSource::Structural,
            skip_select_unit: skip,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_claim_succeeds_on_navigation() {
        let h = Harness::new(PageScript {
            unit_selections: vec![UnitSelection::NoCandidates, UnitSelection::Clicked],
            sub_units: vec!["7am - 9am".into(), "10am - 12pm".into()],
            confirm_probes: vec![ConfirmProbe::Disabled, ConfirmProbe::Clicked],
            navigate_on_confirm: Some("https://scheduler.example/booked".into()),
            ..Default::default()
        });
        let report = h
            .sequence(GrabSettings {
                preferred_time: "10am-1pm".into(),
                ..chained()
            })
            .await
            .run(structural(false))
            .await;

        assert_eq!(
            report.outcome,
            GrabOutcome::Succeeded {
                url: "https://scheduler.example/booked".into()
            }
        );
        assert_eq!(h.page.activated().await, vec![UnitRef::new("sub-1", "10am - 12pm")]);
        assert!(!h.gate.in_flight().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sub_units_exhausts_after_25_attempts() {
        let h = Harness::new(PageScript::default());
        let started = Instant::now();
        let report = h.sequence(chained()).await.run(structural(true)).await;

        assert_eq!(
            report.outcome,
            GrabOutcome::Exhausted {
                step: GrabStep::SelectSubunit
            }
        );
        assert!(report.outcome.needs_reload());
        assert_eq!(h.page.sub_unit_calls().await, 25);
        // 500 ms start delay + 24 gaps of 800 ms
        assert_eq!(started.elapsed(), Duration::from_millis(500 + 24 * 800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_round_refresh_then_skip_to_sub_units() {
        let h = Harness::new(PageScript {
            sub_units: vec!["9am - 11am".into()],
            ..Default::default()
        });
        let report = h.sequence(GrabSettings::default()).await.run(structural(false)).await;

        assert_eq!(report.outcome, GrabOutcome::SubunitsSelected);
        assert_eq!(h.page.unit_calls().await, 20);
        assert_eq!(h.page.refreshes().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_trigger_refreshes_first() {
        let h = Harness::new(PageScript {
            unit_selections: vec![UnitSelection::Clicked],
            sub_units: vec!["9am - 11am".into()],
            ..Default::default()
        });
        let trigger = GrabTrigger {
            source: SignalSource::Poll,
            skip_select_unit: false,
        };
        let report = h.sequence(GrabSettings::default()).await.run(trigger).await;
        assert_eq!(report.outcome, GrabOutcome::SubunitsSelected);
        assert_eq!(h.page.refreshes().await, 1);
        assert_eq!(h.page.unit_calls().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_exhausts_unit_step() {
        let h = Harness::new(PageScript {
            refresh_succeeds: false,
            ..Default::default()
        });
        let report = h.sequence(chained()).await.run(structural(false)).await;
        assert_eq!(
            report.outcome,
            GrabOutcome::Exhausted {
                step: GrabStep::SelectUnit
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_filtered_units_stop_claim() {
        let h = Harness::new(PageScript {
            unit_selections: vec![UnitSelection::Filtered],
            ..Default::default()
        });
        let report = h.sequence(chained()).await.run(structural(false)).await;
        assert_eq!(report.outcome, GrabOutcome::Filtered);
        assert_eq!(h.page.sub_unit_calls().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_stuck_disabled_spends_budget() {
        let h = Harness::new(PageScript {
            sub_units: vec!["slot".into()],
            confirm_default: ConfirmProbe::Disabled,
            ..Default::default()
        });
        let report = h.sequence(chained()).await.run(structural(true)).await;
        assert_eq!(
            report.outcome,
            GrabOutcome::Exhausted {
                step: GrabStep::Confirm
            }
        );
        assert!(report.outcome.needs_reload());
        // 8 retries per forced click, budget 38
        assert_eq!(h.page.forced_confirms().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_chain_ends_without_controls() {
        let h = Harness::new(PageScript {
            sub_units: vec!["slot".into()],
            ..Default::default()
        });
        let report = h.sequence(chained()).await.run(structural(true)).await;
        assert_eq!(report.outcome, GrabOutcome::ConfirmChainEnded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_automation_cancels_at_next_boundary() {
        let h = Harness::new(PageScript::default());
        let seq = h.sequence(chained()).await;
        let task = tokio::spawn(seq.run(structural(true)));
        tokio::time::sleep(Duration::from_secs(3)).await;
        h.automation.send_replace(false);

        let report = task.await.unwrap();
        assert_eq!(report.outcome, GrabOutcome::Cancelled);
        assert!(h.page.sub_unit_calls().await < 25);
        assert!(!h.gate.in_flight().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_release_stops_hung_page() {
        let h = Harness::new(PageScript {
            stall_on_select_unit: true,
            ..Default::default()
        });
        let seq = h.sequence(chained()).await;
        let task = tokio::spawn(seq.run(structural(false)));

        tokio::time::sleep(Duration::from_secs(91)).await;
        let forced = h.gate.expire_overdue(Instant::now()).await.unwrap();
        assert_eq!(forced.step, Some(GrabStep::SelectUnit));

        let report = task.await.unwrap();
        assert_eq!(report.outcome, GrabOutcome::Cancelled);
        assert!(h.gate.try_acquire(Instant::now(), &h.root).await.is_some());
    }
}
