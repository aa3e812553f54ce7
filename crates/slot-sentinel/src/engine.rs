//! The engine: one event loop owning the availability state.
//!
//! The loop is the privileged context. It receives host commands through an
//! [`EngineHandle`], poller reports through the authenticated channel, and
//! finished claims from the grab task, and it runs every timer (mutation
//! coalescing, fallback re-check, debounce re-check, idle page refresh,
//! safety watchdog) with `tokio::time`. Nothing else mutates the state
//! machine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::availability::{AvailabilityMachine, AvailabilityState, Evaluation, Transition};
use crate::backoff::BackoffPolicy;
use crate::channel::{
    spawn_counterpart, spawn_privileged, ChannelBus, ChannelLink, ChannelMessage,
    HandshakeLimits, LinkStatus, SecretSlot,
};
use crate::config::{SentinelConfig, Timings};
use crate::error::{SentinelError, SentinelResult};
use crate::events::{EventBus, SentinelEvent};
use crate::grab::{
    GrabGate, GrabOutcome, GrabReport, GrabSequence, GrabSettings, GrabStep, GrabTrigger,
    PageAdapter,
};
use crate::signals::{
    spawn_poller, AvailabilitySignal, FallbackTimer, MutationCoalescer, PollReport,
    RequestTemplate, SignalSource, StatusTransport, StructuralReport,
};
use crate::safety::detect_block_page;
use crate::urgent::{consume_fresh, UrgentMarker};

/// Everything the engine needs from its host.
pub struct EngineParts {
    pub config: SentinelConfig,
    pub timings: Timings,
    pub backoff: BackoffPolicy,
    pub page: Arc<dyn PageAdapter>,
    pub transport: Arc<dyn StatusTransport>,
    pub marker: Arc<dyn UrgentMarker>,
    pub events: EventBus,
}

/// Point-in-time view of the engine, for status output and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub state: AvailabilityState,
    pub armed: bool,
    pub capacity_locked: bool,
    pub in_cooldown: bool,
    pub grab_in_flight: bool,
    pub channel_ready: bool,
    pub poll_active: bool,
    pub backoff_level: u8,
}

enum Command {
    Structural(StructuralReport),
    Poll(PollReport),
    TransportError(String),
    RateLimited,
    StatusRequest(RequestTemplate),
    Mutation,
    Navigate(String),
    SafetyTrigger(String),
    UpdateConfig(SentinelConfig),
    Snapshot(oneshot::Sender<EngineSnapshot>),
}

/// Cloneable host-side handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<AvailabilityState>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl EngineHandle {
    async fn send(&self, command: Command) -> SentinelResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SentinelError::ChannelClosed)
    }

    /// The page was inspected by the host.
    pub async fn report_structural(&self, report: StructuralReport) -> SentinelResult<()> {
        self.send(Command::Structural(report)).await
    }

    /// A status response was observed outside the poller.
    pub async fn report_poll(&self, report: PollReport) -> SentinelResult<()> {
        self.send(Command::Poll(report)).await
    }

    pub async fn report_transport_error(&self, kind: impl Into<String>) -> SentinelResult<()> {
        self.send(Command::TransportError(kind.into())).await
    }

    pub async fn report_rate_limited(&self) -> SentinelResult<()> {
        self.send(Command::RateLimited).await
    }

    /// A status request left the page; the poller replays it from now on.
    pub async fn observe_status_request(&self, template: RequestTemplate) -> SentinelResult<()> {
        self.send(Command::StatusRequest(template)).await
    }

    pub async fn notify_mutation(&self) -> SentinelResult<()> {
        self.send(Command::Mutation).await
    }

    pub async fn navigate(&self, url: impl Into<String>) -> SentinelResult<()> {
        self.send(Command::Navigate(url.into())).await
    }

    /// The host saw a block page (captcha, access denied). The engine
    /// disarms, cancels any claim and stays disarmed until re-armed.
    pub async fn report_safety_trigger(&self, reason: impl Into<String>) -> SentinelResult<()> {
        self.send(Command::SafetyTrigger(reason.into())).await
    }

    /// Validate and apply a new configuration.
    pub async fn update_config(&self, config: SentinelConfig) -> SentinelResult<()> {
        config.validate()?;
        self.send(Command::UpdateConfig(config.normalized())).await
    }

    pub async fn snapshot(&self) -> SentinelResult<EngineSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx)).await?;
        rx.await.map_err(|_| SentinelError::ChannelClosed)
    }

    pub fn state(&self) -> AvailabilityState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<AvailabilityState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SentinelEvent> {
        self.events.subscribe()
    }

    /// Stop the engine, the poller and any claim in flight.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub struct Engine {
    config: SentinelConfig,
    timings: Timings,
    machine: AvailabilityMachine,
    coalescer: MutationCoalescer,
    fallback: FallbackTimer,
    refresh_timer: FallbackTimer,
    gate: GrabGate,
    link: ChannelLink,
    link_open: bool,
    page: Arc<dyn PageAdapter>,
    marker: Arc<dyn UrgentMarker>,
    events: EventBus,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<AvailabilityState>,
    automation: watch::Sender<bool>,
    finished_tx: mpsc::Sender<GrabReport>,
    finished_rx: mpsc::Receiver<GrabReport>,
    active_generation: Option<u64>,
    recheck_at: Option<Instant>,
    last_template: Option<RequestTemplate>,
    poll_active: bool,
    backoff_level: u8,
    shutdown: CancellationToken,
    poller: JoinHandle<()>,
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Idle page refresh: the configured period plus up to the jitter.
fn refresh_timer(config: &SentinelConfig, timings: &Timings, now: Instant) -> FallbackTimer {
    let period = config.auto_refresh();
    FallbackTimer::new(period, period + timings.auto_refresh_jitter, now)
}

impl Engine {
    /// Wire up the channel, the poller and the event loop, and start them.
    pub fn spawn(parts: EngineParts) -> SentinelResult<(EngineHandle, JoinHandle<()>)> {
        parts.config.validate()?;
        parts.timings.validate()?;
        let config = parts.config.normalized();
        let timings = parts.timings;
        let shutdown = CancellationToken::new();

        let bus = ChannelBus::default();
        let slot = SecretSlot::new();
        let link = spawn_privileged(
            bus.clone(),
            slot.clone(),
            HandshakeLimits::from(&timings),
            parts.events.clone(),
            shutdown.child_token(),
        );
        let page_side = spawn_counterpart(
            bus,
            slot,
            timings.pending_queue_capacity,
            shutdown.child_token(),
        );
        let poller = spawn_poller(
            parts.transport,
            page_side,
            config.poll_interval(),
            parts.backoff,
            shutdown.child_token(),
        );

        let now = Instant::now();
        let (commands_tx, commands) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(AvailabilityState::Unknown);
        let (automation, _) = watch::channel(config.automation_enabled());
        let (finished_tx, finished_rx) = mpsc::channel(4);

        let engine = Engine {
            machine: AvailabilityMachine::new(&config, &timings, now),
            coalescer: MutationCoalescer::new(timings.structural_quiet),
            fallback: FallbackTimer::new(timings.fallback_min, timings.fallback_max, now),
            refresh_timer: refresh_timer(&config, &timings, now),
            gate: GrabGate::new(timings.safety_timeout, timings.refresh_safety),
            link,
            link_open: true,
            page: parts.page,
            marker: parts.marker,
            events: parts.events.clone(),
            commands,
            state_tx,
            automation,
            finished_tx,
            finished_rx,
            active_generation: None,
            recheck_at: None,
            last_template: None,
            poll_active: false,
            backoff_level: 0,
            shutdown: shutdown.clone(),
            poller,
            config,
            timings,
        };
        let handle = EngineHandle {
            commands: commands_tx,
            state: state_rx,
            events: parts.events,
            shutdown,
        };
        Ok((handle, tokio::spawn(engine.run())))
    }

    async fn run(mut self) {
        tracing::info!(
            armed = self.config.armed,
            automation = self.config.automation_enabled(),
            poll_interval_ms = self.config.poll_interval_ms,
            "engine started"
        );
        self.consume_urgent_marker().await;
        self.sync_poller().await;

        loop {
            let grab_deadline = self.gate.deadline().await;
            let mutation_due = self.coalescer.deadline();
            let fallback_due = self.fallback.deadline();
            let refresh_due = self.refresh_timer.deadline();
            let refresh_enabled = self.config.armed && self.config.auto_refresh_enabled;
            let recheck_at = self.recheck_at;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.on_command(command).await;
                }

                message = self.link.recv(), if self.link_open => match message {
                    Some(message) => self.on_channel(message).await,
                    None => {
                        tracing::debug!("channel link closed");
                        self.link_open = false;
                    }
                },

                Some(report) = self.finished_rx.recv() => self.on_grab_finished(report).await,

                _ = sleep_until_some(grab_deadline) => self.on_safety_deadline().await,

                _ = sleep_until_some(mutation_due) => {
                    if let Some(mutations) = self.coalescer.fire(Instant::now()) {
                        tracing::debug!(mutations, "mutation burst settled");
                        self.inspect(SignalSource::Structural).await;
                    }
                }

                _ = sleep_until_some(recheck_at) => {
                    self.recheck_at = None;
                    self.inspect(SignalSource::Structural).await;
                }

                _ = tokio::time::sleep_until(fallback_due) => {
                    if self.fallback.fire(Instant::now()) {
                        self.inspect(SignalSource::Fallback).await;
                    }
                }

                _ = tokio::time::sleep_until(refresh_due), if refresh_enabled => {
                    if self.refresh_timer.fire(Instant::now()) {
                        self.on_refresh_due().await;
                    }
                }
            }
        }

        if let Some(generation) = self.gate.cancel_active().await {
            tracing::info!(generation, "claim cancelled by shutdown");
        }
        self.shutdown.cancel();
        if let Err(e) = (&mut self.poller).await {
            tracing::debug!("poller task ended abnormally: {e}");
        }
        tracing::info!(state = %self.machine.state(), "engine stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Structural(report) => self.observe(SignalSource::Structural, report).await,
            Command::Poll(report) => self.on_poll(report).await,
            Command::TransportError(kind) => {
                self.to_poller(ChannelMessage::TransportError(kind)).await
            }
            Command::RateLimited => self.to_poller(ChannelMessage::RateLimited).await,
            Command::StatusRequest(template) => {
                tracing::debug!(url = %template.url, "status request observed");
                self.last_template = Some(template.clone());
                self.to_poller(ChannelMessage::CaptureTemplate(template)).await;
            }
            Command::Mutation => {
                self.coalescer.notify(Instant::now());
            }
            Command::Navigate(url) => {
                // a different page issues its own status request
                self.last_template = None;
                self.on_navigation(&url).await;
            }
            Command::SafetyTrigger(reason) => self.on_safety_trigger(&reason).await,
            Command::UpdateConfig(config) => self.apply_config(config).await,
            Command::Snapshot(reply) => {
                let snapshot = self.snapshot().await;
                let _ = reply.send(snapshot);
            }
        }
    }

    async fn on_channel(&mut self, message: ChannelMessage) {
        match message {
            ChannelMessage::PollReady { interval_ms } => {
                self.poll_active = true;
                self.machine.on_poll_session();
                self.events.emit(SentinelEvent::PollReady { interval_ms });
                self.events
                    .info(format!("status polling active every {interval_ms} ms"));
            }
            ChannelMessage::PollResult(report) => self.on_poll(report).await,
            ChannelMessage::PollBackoff {
                level,
                interval_ms,
                reason,
            } => {
                self.backoff_level = level;
                self.events.emit(SentinelEvent::PollBackoff {
                    level,
                    interval_ms,
                    reason,
                });
            }
            ChannelMessage::PollError { tick, error } => {
                tracing::warn!(tick, "status poll failed: {error}");
            }
            ChannelMessage::PollResumed => {
                self.events.emit(SentinelEvent::PollResumed);
                if let Some(transition) = self.machine.on_poll_resumed(Instant::now()) {
                    self.publish(&transition);
                }
            }
            ChannelMessage::PollSaturated { level, since_ms } => {
                self.events.emit(SentinelEvent::PollSaturated {
                    level,
                    since_secs: since_ms / 1000,
                });
                self.events.warn(format!(
                    "status polling stuck at backoff level {level} for {}s",
                    since_ms / 1000
                ));
                let idle = !self.gate.in_flight().await
                    && self.machine.state() != AvailabilityState::Available;
                if self.config.auto_refresh_enabled && self.config.armed && idle {
                    self.reload("status polling saturated", false).await;
                }
            }
            other => tracing::debug!(?other, "engine ignoring channel message"),
        }
    }

    async fn on_poll(&mut self, report: PollReport) {
        if !self.config.armed {
            return;
        }
        let now = Instant::now();
        let signal = AvailabilitySignal::poll(report, now);
        self.evaluate(signal, now).await;
    }

    /// Bound a page read by `inspect_timeout`; a hung page yields `None`.
    async fn read_page<T>(&self, what: &'static str, read: impl Future<Output = T>) -> Option<T> {
        match tokio::time::timeout(self.timings.inspect_timeout, read).await {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(
                    what,
                    timeout_ms = self.timings.inspect_timeout.as_millis() as u64,
                    "page did not answer, skipping"
                );
                None
            }
        }
    }

    async fn inspect(&mut self, source: SignalSource) {
        if !self.config.armed {
            return;
        }
        let text = self.read_page("page_text", self.page.page_text()).await;
        if let Some(pattern) = text.as_deref().and_then(detect_block_page) {
            self.on_safety_trigger(pattern).await;
            return;
        }
        let Some(report) = self.read_page("inspect", self.page.inspect()).await else {
            return;
        };
        self.observe(source, report).await;
    }

    async fn observe(&mut self, source: SignalSource, report: StructuralReport) {
        if !self.config.armed {
            return;
        }
        let now = Instant::now();
        if self.gate.refreshing(now).await {
            tracing::debug!(%source, "forced refresh running, signal ignored");
            return;
        }
        let signal = AvailabilitySignal::observed(source, report, now);
        self.evaluate(signal, now).await;
    }

    async fn evaluate(&mut self, signal: AvailabilitySignal, now: Instant) {
        match self.machine.apply(&signal, now) {
            Evaluation::Transition(transition) => {
                self.recheck_at = None;
                self.publish(&transition);
                if let Some(trigger) = transition.trigger {
                    self.start_grab(trigger).await;
                }
            }
            Evaluation::AwaitingConfirmation { .. } => {
                // Re-inspect well inside the window so the second look still counts.
                self.recheck_at = Some(now + self.config.debounce() / 2);
            }
            Evaluation::Filtered(days) => {
                self.events.info(format!(
                    "units reported on days {days:?}, none preferred; ignoring"
                ));
            }
            Evaluation::Ignored(reason) => {
                tracing::debug!(source = %signal.source, reason, "signal ignored");
            }
            Evaluation::Unchanged => {}
        }
    }

    fn publish(&self, transition: &Transition) {
        self.state_tx.send_replace(transition.to);
        self.events.emit(SentinelEvent::StateChanged {
            state: transition.to,
            previous: transition.from,
            reason: transition.reason.clone(),
            timestamp: Utc::now(),
        });
        self.events.info(format!(
            "{} -> {}: {}",
            transition.from, transition.to, transition.reason
        ));
    }

    async fn start_grab(&mut self, mut trigger: GrabTrigger) {
        // Polling pauses on every detection, claimed by us or by the operator.
        self.to_poller(ChannelMessage::PauseFor {
            duration_ms: self.timings.claim_pause.as_millis() as u64,
        })
        .await;
        if !self.config.automation_enabled() {
            self.events.info("availability detected, auto-claim is off");
            return;
        }
        let Some(ticket) = self.gate.try_acquire(Instant::now(), &self.shutdown).await else {
            return;
        };
        if trigger.source == SignalSource::Poll && !trigger.skip_select_unit {
            if let Some(report) = self.read_page("inspect", self.page.inspect()).await {
                trigger.skip_select_unit = report.has_sub_units;
            }
        }

        self.active_generation = Some(ticket.generation);
        self.events.emit(SentinelEvent::GrabStarted {
            trigger: trigger.source,
            skip_select_unit: trigger.skip_select_unit,
            timestamp: Utc::now(),
        });
        self.events.info(format!(
            "claim started on {} signal{}",
            trigger.source,
            if trigger.skip_select_unit {
                ", sub-units already visible"
            } else {
                ""
            }
        ));

        let sequence = GrabSequence::new(
            self.page.clone(),
            self.gate.clone(),
            ticket,
            self.timings.clone(),
            GrabSettings::from_config(&self.config),
            self.automation.subscribe(),
            self.events.clone(),
        );
        let done = self.finished_tx.clone();
        tokio::spawn(async move {
            let report = sequence.run(trigger).await;
            let _ = done.send(report).await;
        });
    }

    async fn on_grab_finished(&mut self, report: GrabReport) {
        if self.active_generation != Some(report.generation) {
            tracing::debug!(
                generation = report.generation,
                outcome = %report.outcome,
                "stale claim report ignored"
            );
            return;
        }
        self.active_generation = None;
        self.conclude(report.outcome, report.elapsed).await;
    }

    async fn on_safety_deadline(&mut self) {
        let Some(forced) = self.gate.expire_overdue(Instant::now()).await else {
            return;
        };
        if self.active_generation == Some(forced.generation) {
            self.active_generation = None;
        }
        let step = forced
            .step
            .map_or_else(|| "start".to_string(), |step| step.to_string());
        self.events.warn(format!(
            "{}; claim force-released during {step}",
            SentinelError::SafetyTimeoutExceeded(self.timings.safety_timeout)
        ));
        self.conclude(GrabOutcome::SafetyTimeout, forced.held_for).await;
    }

    async fn conclude(&mut self, outcome: GrabOutcome, elapsed: Duration) {
        self.events.emit(SentinelEvent::GrabFinished {
            outcome: outcome.to_string(),
            success: outcome.is_success(),
            elapsed_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        });

        let now = Instant::now();
        let cooldown = match &outcome {
            GrabOutcome::Succeeded { url } => {
                self.events.info(format!("claim succeeded, page moved to {url}"));
                None
            }
            GrabOutcome::SubunitsSelected | GrabOutcome::ConfirmChainEnded => {
                self.events.info(format!("claim finished: {outcome}"));
                None
            }
            GrabOutcome::Filtered => Some(self.timings.filtered_cooldown),
            GrabOutcome::Cancelled => Some(self.timings.cooldown),
            GrabOutcome::Exhausted { step } => {
                let attempts = match step {
                    GrabStep::SelectUnit => self.timings.select_unit_attempts * 2,
                    GrabStep::SelectSubunit => self.timings.subunit_attempts,
                    GrabStep::Confirm => self.timings.confirm_total_budget,
                };
                self.events.warn(
                    SentinelError::StepTimeout {
                        step: *step,
                        attempts,
                    }
                    .to_string(),
                );
                Some(self.timings.cooldown)
            }
            GrabOutcome::SafetyTimeout => Some(self.timings.cooldown),
        };

        if let Some(cooldown) = cooldown {
            let reason = format!("claim ended: {outcome}");
            if let Some(transition) = self.machine.abort_claim(now, cooldown, &reason) {
                self.publish(&transition);
            }
        }
        if outcome.needs_reload() {
            self.reload(&format!("claim ended: {outcome}"), true).await;
        }
    }

    /// Full reload fallback. `urgent` leaves a marker so the reloaded page
    /// skips the capacity lock.
    async fn reload(&mut self, reason: &str, urgent: bool) {
        if urgent {
            if let Err(e) = self.marker.mark(Utc::now()).await {
                tracing::warn!("could not set urgent marker: {e}");
            }
        }
        self.events.emit(SentinelEvent::ReloadRequested {
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        self.events.warn(format!("reloading page: {reason}"));
        self.page.reload().await;

        let url = self.page.current_url().await;
        self.on_navigation(&url).await;
        self.resume_polling().await;
        self.consume_urgent_marker().await;
    }

    /// The reloaded page issues the same status request again; replay the
    /// last one so polling survives the reload.
    async fn resume_polling(&mut self) {
        let Some(template) = self.last_template.clone() else {
            return;
        };
        tracing::info!(url = %template.url, "resuming status polling after reload");
        self.to_poller(ChannelMessage::CaptureTemplate(template)).await;
        self.sync_poller().await;
    }

    /// Idle page refresh. Skipped while a claim runs, while polling already
    /// keeps the data fresh, and while units are on offer.
    async fn on_refresh_due(&mut self) {
        if self.gate.in_flight().await {
            tracing::info!("page refresh skipped, claim in flight");
            return;
        }
        if self.poll_active {
            tracing::debug!("page refresh skipped, status polling active");
            return;
        }
        if self.machine.state() == AvailabilityState::Available {
            return;
        }
        self.reload("periodic refresh", false).await;
    }

    async fn on_safety_trigger(&mut self, reason: &str) {
        if !self.config.armed {
            return;
        }
        if let Some(generation) = self.gate.cancel_active().await {
            tracing::info!(generation, "claim cancelled by safety trigger");
            self.active_generation = None;
        }
        self.config.armed = false;
        self.automation.send_replace(false);
        self.recheck_at = None;
        self.sync_poller().await;
        self.events.warn(format!(
            "safety trigger ({reason}): monitoring disarmed until re-armed"
        ));
    }

    async fn on_navigation(&mut self, url: &str) {
        tracing::info!(url, "page navigated");
        if let Some(generation) = self.gate.cancel_active().await {
            tracing::info!(generation, "claim cancelled by navigation");
            self.active_generation = None;
        }
        let now = Instant::now();
        self.coalescer.cancel();
        self.recheck_at = None;
        self.fallback.reschedule(now);
        self.refresh_timer.reschedule(now);
        self.poll_active = false;
        self.backoff_level = 0;
        self.to_poller(ChannelMessage::StopPolling).await;
        if let Some(transition) = self.machine.on_navigation(now) {
            self.publish(&transition);
        }
    }

    async fn consume_urgent_marker(&mut self) {
        match consume_fresh(&*self.marker, Utc::now(), self.timings.urgent_freshness).await {
            Ok(true) => {
                self.machine.release_capacity_lock("urgent marker");
                self.events
                    .info("urgent re-grab after reload, capacity lock released");
                self.inspect(SignalSource::Structural).await;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("could not read urgent marker: {e}"),
        }
    }

    async fn apply_config(&mut self, config: SentinelConfig) {
        let was_armed = self.config.armed;
        let poll_changed = config.poll_interval_ms != self.config.poll_interval_ms
            || config.armed != was_armed;
        let refresh_restart = config.auto_refresh_sec != self.config.auto_refresh_sec
            || (config.auto_refresh_enabled && !self.config.auto_refresh_enabled)
            || (config.armed && !was_armed);

        self.machine.apply_config(&config);
        self.automation.send_replace(config.automation_enabled());
        self.config = config;
        tracing::info!(
            armed = self.config.armed,
            automation = self.config.automation_enabled(),
            chain_confirm = self.config.chain_confirm_enabled,
            "configuration updated"
        );

        if refresh_restart {
            self.refresh_timer = refresh_timer(&self.config, &self.timings, Instant::now());
        }
        if poll_changed {
            self.sync_poller().await;
        }
        match (was_armed, self.config.armed) {
            (false, true) => {
                self.events.info("monitoring armed");
                self.inspect(SignalSource::Structural).await;
            }
            (true, false) => self.events.info("monitoring paused"),
            _ => {}
        }
    }

    async fn sync_poller(&self) {
        self.to_poller(ChannelMessage::SetPoll {
            interval_ms: self.config.poll_interval_ms,
            paused: !self.config.armed,
        })
        .await;
    }

    async fn to_poller(&self, message: ChannelMessage) {
        if let Err(e) = self.link.send(message).await {
            tracing::debug!("poller unreachable: {e}");
        }
    }

    async fn snapshot(&self) -> EngineSnapshot {
        let now = Instant::now();
        EngineSnapshot {
            state: self.machine.state(),
            armed: self.config.armed,
            capacity_locked: self.machine.capacity_locked(),
            in_cooldown: self.machine.in_cooldown(now),
            grab_in_flight: self.gate.in_flight().await,
            channel_ready: self.link.current_status() == LinkStatus::Ready,
            poll_active: self.poll_active,
            backoff_level: self.backoff_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::Mutex;

    use super::*;
    use crate::events::LogLevel;
    use crate::grab::{PageScript, ScriptedPage, UnitSelection};
    use crate::urgent::MemoryMarker;

    /// Hands out queued responses, then `[]` forever.
    #[derive(Default)]
    struct QueueTransport {
        responses: Mutex<VecDeque<SentinelResult<Value>>>,
        calls: AtomicU32,
    }

    impl QueueTransport {
        fn with(responses: Vec<SentinelResult<Value>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusTransport for QueueTransport {
        async fn fetch(&self, _template: &RequestTemplate) -> SentinelResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(json!([])))
        }
    }

    fn armed() -> SentinelConfig {
        SentinelConfig {
            armed: true,
            auto_click_enabled: true,
            ..Default::default()
        }
    }

    fn start(
        config: SentinelConfig,
        page: Arc<ScriptedPage>,
        transport: Arc<QueueTransport>,
    ) -> (EngineHandle, Arc<MemoryMarker>) {
        let marker = Arc::new(MemoryMarker::new());
        let (handle, _task) = Engine::spawn(EngineParts {
            config,
            timings: Timings::default(),
            backoff: BackoffPolicy::default(),
            page,
            transport,
            marker: marker.clone(),
            events: EventBus::default(),
        })
        .unwrap();
        (handle, marker)
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<SentinelEvent>,
        pred: impl Fn(&SentinelEvent) -> bool,
    ) -> SentinelEvent {
        tokio::time::timeout(Duration::from_secs(300), async {
            loop {
                match rx.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
                }
            }
        })
        .await
        .expect("event not seen")
    }

    fn marker_gone(has_sub_units: bool) -> StructuralReport {
        StructuralReport {
            sold_out: false,
            has_sub_units,
            context_selected: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_with_units_starts_claim() {
        let page = Arc::new(ScriptedPage::new(PageScript {
            unit_selections: vec![UnitSelection::Clicked],
            sub_units: vec!["9am - 11am".into()],
            ..Default::default()
        }));
        let transport = QueueTransport::with(vec![Ok(json!([{"id": 1, "start": "2025-03-14"}]))]);
        let (handle, _) = start(armed(), page.clone(), transport);
        let mut rx = handle.subscribe();

        handle
            .observe_status_request(RequestTemplate::get("https://scheduler.example/api/slots"))
            .await
            .unwrap();

        let started = next_matching(&mut rx, |e| matches!(e, SentinelEvent::GrabStarted { .. })).await;
        assert!(matches!(
            started,
            SentinelEvent::GrabStarted {
                trigger: SignalSource::Poll,
                skip_select_unit: false,
                ..
            }
        ));
        let finished = next_matching(&mut rx, |e| matches!(e, SentinelEvent::GrabFinished { .. })).await;
        let SentinelEvent::GrabFinished { outcome, .. } = finished else {
            unreachable!()
        };
        assert_eq!(outcome, GrabOutcome::SubunitsSelected.to_string());
        assert_eq!(page.activated().await.len(), 1);
        assert!(!handle.snapshot().await.unwrap().grab_in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_lock_holds_sold_out_without_poll() {
        let page = Arc::new(ScriptedPage::new(PageScript::default()));
        let (handle, _) = start(armed(), page, QueueTransport::with(vec![]));

        handle
            .report_structural(StructuralReport {
                sold_out: true,
                has_sub_units: false,
                context_selected: true,
            })
            .await
            .unwrap();
        handle.report_structural(marker_gone(false)).await.unwrap();
        handle.report_structural(marker_gone(false)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, AvailabilityState::SoldOut);
        assert!(snapshot.capacity_locked);
        assert!(!snapshot.grab_in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_engine_ignores_signals() {
        let page = Arc::new(ScriptedPage::new(PageScript::default()));
        let (handle, _) = start(SentinelConfig::default(), page, QueueTransport::with(vec![]));

        handle
            .report_poll(PollReport::from_payload(json!([{"id": 1}]), None))
            .await
            .unwrap();
        assert_eq!(handle.snapshot().await.unwrap().state, AvailabilityState::Unknown);

        handle.update_config(armed()).await.unwrap();
        handle
            .report_poll(PollReport::from_payload(json!([{"id": 1}]), None))
            .await
            .unwrap();
        assert_eq!(handle.snapshot().await.unwrap().state, AvailabilityState::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_timeout_releases_and_accepts_next_trigger() {
        let page = Arc::new(ScriptedPage::new(PageScript {
            stall_on_select_unit: true,
            ..Default::default()
        }));
        let (handle, marker) = start(armed(), page.clone(), QueueTransport::with(vec![]));
        let mut rx = handle.subscribe();

        handle
            .report_poll(PollReport::from_payload(json!([{"id": 1}]), None))
            .await
            .unwrap();
        next_matching(&mut rx, |e| matches!(e, SentinelEvent::GrabStarted { .. })).await;

        let finished = next_matching(&mut rx, |e| matches!(e, SentinelEvent::GrabFinished { .. })).await;
        let SentinelEvent::GrabFinished { outcome, success, .. } = finished else {
            unreachable!()
        };
        assert_eq!(outcome, GrabOutcome::SafetyTimeout.to_string());
        assert!(!success);
        next_matching(&mut rx, |e| matches!(e, SentinelEvent::ReloadRequested { .. })).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert!(!snapshot.grab_in_flight);
        assert!(!snapshot.capacity_locked);
        assert_eq!(page.reloads().await, 1);
        assert!(marker.take().await.unwrap().is_none());

        handle
            .report_poll(PollReport::from_payload(json!([{"id": 2}]), None))
            .await
            .unwrap();
        next_matching(&mut rx, |e| matches!(e, SentinelEvent::GrabStarted { .. })).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_resets_to_unknown() {
        let page = Arc::new(ScriptedPage::new(PageScript::default()));
        let config = SentinelConfig {
            auto_click_enabled: false,
            ..armed()
        };
        let (handle, _) = start(config, page, QueueTransport::with(vec![]));

        handle
            .report_poll(PollReport::from_payload(json!([{"id": 1}]), None))
            .await
            .unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, AvailabilityState::Available);
        assert!(!snapshot.grab_in_flight);

        handle.navigate("https://scheduler.example/other").await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, AvailabilityState::Unknown);
        assert!(snapshot.capacity_locked);
        assert!(!snapshot.in_cooldown);
        assert_eq!(handle.state(), AvailabilityState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_trigger_disarms_and_cancels_claim() {
        let page = Arc::new(ScriptedPage::new(PageScript {
            stall_on_select_unit: true,
            ..Default::default()
        }));
        let (handle, _) = start(armed(), page.clone(), QueueTransport::with(vec![]));
        let mut rx = handle.subscribe();

        handle
            .report_poll(PollReport::from_payload(json!([{"id": 1}]), None))
            .await
            .unwrap();
        next_matching(&mut rx, |e| matches!(e, SentinelEvent::GrabStarted { .. })).await;

        handle.report_safety_trigger("captcha").await.unwrap();
        next_matching(&mut rx, |e| {
            matches!(e, SentinelEvent::Log { level: LogLevel::Warn, message, .. } if message.contains("captcha"))
        })
        .await;
        let snapshot = handle.snapshot().await.unwrap();
        assert!(!snapshot.armed);
        assert!(!snapshot.grab_in_flight);

        // stays disarmed: later signals start nothing
        handle
            .report_poll(PollReport::from_payload(json!([{"id": 2}]), None))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(page.unit_calls().await, 1);
        assert_eq!(page.reloads().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_page_text_disarms_on_inspection() {
        let page = Arc::new(ScriptedPage::new(PageScript {
            page_text: "Please verify you are not a robot".into(),
            ..Default::default()
        }));
        let (handle, _) = start(armed(), page.clone(), QueueTransport::with(vec![]));

        handle.notify_mutation().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert!(!snapshot.armed);
        assert_eq!(snapshot.state, AvailabilityState::Unknown);
        assert_eq!(page.inspections().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_refresh_reloads_without_polling() {
        let config = SentinelConfig {
            auto_refresh_enabled: true,
            auto_click_enabled: false,
            ..armed()
        };
        let page = Arc::new(ScriptedPage::new(PageScript::default()));
        let started = Instant::now();
        let (handle, _) = start(config, page.clone(), QueueTransport::with(vec![]));
        let mut rx = handle.subscribe();

        let event = next_matching(&mut rx, |e| matches!(e, SentinelEvent::ReloadRequested { .. })).await;
        let SentinelEvent::ReloadRequested { reason, .. } = event else {
            unreachable!()
        };
        assert_eq!(reason, "periodic refresh");
        // 30 s period plus up to 5 s of jitter
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30), "{elapsed:?}");
        assert!(elapsed <= Duration::from_secs(36), "{elapsed:?}");

        handle.snapshot().await.unwrap();
        assert_eq!(page.reloads().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_refresh_skipped_while_polling() {
        let config = SentinelConfig {
            auto_refresh_enabled: true,
            auto_click_enabled: false,
            ..armed()
        };
        let page = Arc::new(ScriptedPage::new(PageScript::default()));
        let (handle, _) = start(config, page.clone(), QueueTransport::with(vec![]));

        handle
            .observe_status_request(RequestTemplate::get("https://scheduler.example/api/slots"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(80)).await;

        assert!(handle.snapshot().await.unwrap().poll_active);
        assert_eq!(page.reloads().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_inspection_does_not_stall_loop() {
        let page = Arc::new(ScriptedPage::new(PageScript {
            stall_on_inspect: true,
            ..Default::default()
        }));
        let (handle, _) = start(SentinelConfig::default(), page.clone(), QueueTransport::with(vec![]));

        // arming inspects the page, which never answers
        handle.update_config(armed()).await.unwrap();
        let snapshot = tokio::time::timeout(Duration::from_secs(10), handle.snapshot())
            .await
            .expect("engine loop stalled on the page")
            .unwrap();
        assert!(snapshot.armed);
        assert_eq!(snapshot.state, AvailabilityState::Unknown);
        assert_eq!(page.inspections().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_pauses_polling_without_auto_claim() {
        let transport = QueueTransport::with(vec![Ok(json!([{"id": 1}]))]);
        let config = SentinelConfig {
            auto_click_enabled: false,
            ..armed()
        };
        let page = Arc::new(ScriptedPage::new(PageScript::default()));
        let (handle, _) = start(config, page, transport.clone());

        handle
            .observe_status_request(RequestTemplate::get("https://scheduler.example/api/slots"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.snapshot().await.unwrap().state, AvailabilityState::Available);
        assert_eq!(transport.calls(), 1);

        // 16 s claim pause, then polling resumes
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(transport.calls() > 1);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let page = Arc::new(ScriptedPage::new(PageScript::default()));
        let result = Engine::spawn(EngineParts {
            config: SentinelConfig {
                debounce_ms: 0,
                ..Default::default()
            },
            timings: Timings::default(),
            backoff: BackoffPolicy::default(),
            page,
            transport: QueueTransport::with(vec![]),
            marker: Arc::new(MemoryMarker::new()),
            events: EventBus::default(),
        });
        assert!(matches!(result, Err(SentinelError::Config(_))));
    }
}
