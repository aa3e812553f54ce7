//! Out-of-band status poller.
//!
//! Runs in its own task on the page side of the secure channel. Once the
//! engine hands it a captured [`RequestTemplate`], it replays that request
//! on the cadence chosen by its [`BackoffController`] and reports every
//! parsed response back as a [`ChannelMessage::PollResult`]. Its timers are
//! its own, so a stalled engine loop never slows the poll cadence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::PollReport;
use crate::backoff::{BackoffChange, BackoffController, BackoffPolicy, PauseReason};
use crate::channel::{ChannelLink, ChannelMessage};
use crate::error::{SentinelError, SentinelResult};

/// Keys under which a JSON object may carry its unit list.
const LIST_KEYS: &[&str] = &["slots", "capacity", "data"];

/// Phrases that mark a non-list payload as sold out.
const SOLD_OUT_PHRASES: &[&str] = &[
    "no slots available",
    "no slot available",
    "sold out",
    "fully booked",
    "no available",
    "unavailable",
    "no capacity",
    "all slots taken",
    "no time slots",
    "no delivery slots",
    "not available",
    "slots are full",
];

/// A status request captured once from observed traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl RequestTemplate {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// Issues one status request.
///
/// Implementations map rate-limit responses to [`SentinelError::RateLimited`]
/// and everything else that fails to [`SentinelError::Transport`].
#[async_trait]
pub trait StatusTransport: Send + Sync {
    async fn fetch(&self, template: &RequestTemplate) -> SentinelResult<Value>;
}

/// The unit list inside a payload: the payload itself when it is an array,
/// else the first array found under a known key.
pub fn unit_list(payload: &Value) -> Option<&[Value]> {
    match payload {
        Value::Array(items) => Some(items.as_slice()),
        Value::Object(map) => LIST_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .map(Vec::as_slice),
        _ => None,
    }
}

/// Classify a payload as `(sold_out, unit_count)`.
///
/// Payloads without a unit list are sold out when they contain a known
/// phrase; otherwise they report zero units and no explicit marker.
pub fn classify_payload(payload: &Value) -> (bool, u32) {
    if let Some(units) = unit_list(payload) {
        let count = u32::try_from(units.len()).unwrap_or(u32::MAX);
        return (count == 0, count);
    }
    let text = payload.to_string().to_lowercase();
    let sold_out = SOLD_OUT_PHRASES.iter().any(|p| text.contains(p));
    (sold_out, 0)
}

/// Poller task state. Created on the first captured template.
struct PollLoop {
    transport: Arc<dyn StatusTransport>,
    link: ChannelLink,
    policy: BackoffPolicy,
    template: Option<RequestTemplate>,
    controller: Option<BackoffController>,
    base_interval: Duration,
    held: bool,
    next_tick: Instant,
    tick: u64,
}

/// Spawn the poller on the page side of `link`.
pub fn spawn_poller(
    transport: Arc<dyn StatusTransport>,
    link: ChannelLink,
    base_interval: Duration,
    policy: BackoffPolicy,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let poller = PollLoop {
        transport,
        link,
        policy,
        template: None,
        controller: None,
        base_interval,
        held: false,
        next_tick: Instant::now(),
        tick: 0,
    };
    tokio::spawn(poller.run(shutdown))
}

impl PollLoop {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let active = self.template.is_some();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.link.recv() => {
                    let Some(command) = command else { break };
                    if self.handle_command(command).await.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(self.next_tick), if active => {
                    if self.on_tick().await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(ticks = self.tick, "poller stopped");
    }

    async fn report(&self, message: ChannelMessage) -> SentinelResult<()> {
        self.link.send(message).await
    }

    async fn report_change(&self, change: BackoffChange) -> SentinelResult<()> {
        tracing::warn!(
            level = change.level,
            interval_ms = change.interval.as_millis() as u64,
            "poll backoff: {}",
            change.reason
        );
        self.report(ChannelMessage::PollBackoff {
            level: change.level,
            interval_ms: change.interval.as_millis() as u64,
            reason: change.reason.to_string(),
        })
        .await
    }

    async fn handle_command(&mut self, command: ChannelMessage) -> SentinelResult<()> {
        let now = Instant::now();
        match command {
            ChannelMessage::CaptureTemplate(template) => {
                let first = self.template.is_none();
                tracing::info!(url = %template.url, first, "status request template captured");
                self.template = Some(template);
                if first {
                    self.controller = Some(BackoffController::new(
                        self.base_interval,
                        self.policy.clone(),
                    ));
                    self.next_tick = now;
                    self.report(ChannelMessage::PollReady {
                        interval_ms: self.base_interval.as_millis() as u64,
                    })
                    .await?;
                }
            }
            ChannelMessage::SetPoll {
                interval_ms,
                paused,
            } => {
                self.base_interval = Duration::from_millis(interval_ms);
                self.held = paused;
                if let Some(controller) = self.controller.as_mut() {
                    controller.set_base(self.base_interval);
                }
            }
            ChannelMessage::PauseFor { duration_ms } => {
                if let Some(controller) = self.controller.as_mut() {
                    let duration = Duration::from_millis(duration_ms);
                    controller.pause(now, duration, PauseReason::Claim);
                    self.next_tick = now + duration;
                    tracing::info!(duration_ms, "polling paused for claim");
                }
            }
            ChannelMessage::StopPolling => {
                self.template = None;
                self.controller = None;
                self.held = false;
            }
            ChannelMessage::RateLimited => {
                let change = self
                    .controller
                    .as_mut()
                    .and_then(|c| c.on_rate_limited(now));
                if let Some(change) = change {
                    self.report_change(change).await?;
                }
            }
            ChannelMessage::TransportError(error) => {
                self.on_transport_error(now, error).await?;
            }
            other => tracing::debug!(?other, "poller ignoring message"),
        }
        Ok(())
    }

    async fn on_transport_error(&mut self, now: Instant, error: String) -> SentinelResult<()> {
        let Some(controller) = self.controller.as_mut() else {
            return Ok(());
        };
        if let Some(pause) = controller.on_transport_error(now) {
            self.next_tick = now + pause;
            tracing::warn!(pause_ms = pause.as_millis() as u64, "too many transport errors, pausing");
        }
        self.report(ChannelMessage::PollError {
            tick: self.tick,
            error,
        })
        .await
    }

    async fn on_tick(&mut self) -> SentinelResult<()> {
        let now = Instant::now();
        let (Some(template), Some(controller)) = (self.template.clone(), self.controller.as_mut())
        else {
            return Ok(());
        };

        if let Some(reason) = controller.take_expired_pause(now) {
            if reason == PauseReason::Claim {
                tracing::info!("claim pause over, polling resumed");
                self.report(ChannelMessage::PollResumed).await?;
            }
        }
        let Some(controller) = self.controller.as_mut() else {
            return Ok(());
        };
        if let Some(until) = controller.session().paused_until {
            self.next_tick = until;
            return Ok(());
        }
        if self.held {
            self.next_tick = now + controller.interval();
            return Ok(());
        }

        if let Some(change) = controller.poll_recovery(now) {
            self.report_change(change).await?;
        }

        self.tick += 1;
        let result = self.transport.fetch(&template).await;
        let now = Instant::now();
        match result {
            Ok(payload) => {
                let change = self.controller.as_mut().and_then(|c| c.on_success(now));
                if let Some(change) = change {
                    self.report_change(change).await?;
                }
                let report = PollReport::from_payload(payload, Some(template.url.clone()));
                self.report(ChannelMessage::PollResult(report)).await?;
            }
            Err(SentinelError::RateLimited) => {
                let change = self.controller.as_mut().and_then(|c| c.on_rate_limited(now));
                if let Some(change) = change {
                    self.report_change(change).await?;
                }
            }
            Err(e) => self.on_transport_error(now, e.to_string()).await?,
        }

        let Some(controller) = self.controller.as_mut() else {
            return Ok(());
        };
        if let Some(since) = controller.check_saturation(now) {
            let level = controller.level();
            tracing::warn!(level, "poll backoff saturated");
            self.report(ChannelMessage::PollSaturated {
                level,
                since_ms: since.as_millis() as u64,
            })
            .await?;
        }
        let controller = self.controller.as_ref();
        self.next_tick = match controller.and_then(|c| c.session().paused_until) {
            Some(until) => until,
            None => now + controller.map_or(self.base_interval, |c| c.interval()),
        };
        Ok(())
    }
}
