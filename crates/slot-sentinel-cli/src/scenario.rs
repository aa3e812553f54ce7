//! Scripted simulations: drive a full engine from a JSON scenario file.
//!
//! A scenario supplies the engine config, a [`PageScript`] for the page
//! adapter, a queue of status responses for the poller, and a timeline of
//! host actions. Running it yields every emitted event plus a summary of
//! what the page saw.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use slot_sentinel::{
    BackoffPolicy, Engine, EngineHandle, EngineParts, EngineSnapshot, EventBus, MemoryMarker,
    PageScript, PollReport, RequestTemplate, ScriptedPage, SentinelConfig, SentinelError,
    SentinelEvent, SentinelResult, StatusTransport, StructuralReport, Timings, UnitRef,
};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

/// One canned response for the status poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollResponse {
    Ok { payload: Value },
    RateLimited,
    Error { message: String },
}

impl PollResponse {
    fn into_result(self) -> SentinelResult<Value> {
        match self {
            PollResponse::Ok { payload } => Ok(payload),
            PollResponse::RateLimited => Err(SentinelError::RateLimited),
            PollResponse::Error { message } => Err(SentinelError::Transport(message)),
        }
    }
}

/// A host action applied at a fixed offset from the scenario start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub at_ms: u64,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Report a page inspection directly.
    Structural { report: StructuralReport },
    /// Report a status response seen outside the poller.
    Poll {
        payload: Value,
        #[serde(default)]
        request_url: Option<String>,
    },
    /// Hand the poller a captured request template.
    StatusRequest { template: RequestTemplate },
    /// A DOM mutation burst.
    Mutation,
    Navigate { url: String },
    RateLimited,
    TransportError { kind: String },
    /// Change what the page reports on the next inspection.
    SetPage { report: StructuralReport },
    /// Change the visible page text, e.g. to a captcha notice.
    SetText { text: String },
    /// The host recognized a block page on its own.
    SafetyTrigger { reason: String },
    /// Flip the master switch.
    Arm { armed: bool },
}

/// A complete simulation description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub config: SentinelConfig,
    pub page: PageScript,
    pub poll_responses: Vec<PollResponse>,
    pub steps: Vec<Step>,
    /// Total run length; defaults to the last step plus ten seconds.
    pub run_ms: Option<u64>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing scenario {}", path.display()))
    }

    pub fn duration(&self) -> Duration {
        let last = self.steps.iter().map(|s| s.at_ms).max().unwrap_or(0);
        Duration::from_millis(self.run_ms.unwrap_or(last + 10_000))
    }
}

/// Status transport that replays queued responses, then reports an empty list.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<PollResponse>>,
    calls: Mutex<u32>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<PollResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(0),
        }
    }

    pub async fn calls(&self) -> u32 {
        *self.calls.lock().await
    }
}

#[async_trait]
impl StatusTransport for ScriptedTransport {
    async fn fetch(&self, _template: &RequestTemplate) -> SentinelResult<Value> {
        *self.calls.lock().await += 1;
        match self.responses.lock().await.pop_front() {
            Some(response) => response.into_result(),
            None => Ok(json!([])),
        }
    }
}

/// What a finished simulation observed.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub snapshot: EngineSnapshot,
    pub activated: Vec<UnitRef>,
    pub unit_calls: u32,
    pub sub_unit_calls: u32,
    pub refreshes: u32,
    pub reloads: u32,
    pub polls: u32,
    pub events: usize,
}

/// Run a scenario to completion. `on_event` sees every event in order.
pub async fn run(scenario: Scenario, mut on_event: impl FnMut(&SentinelEvent)) -> Result<SimulationSummary> {
    let duration = scenario.duration();
    let page = Arc::new(ScriptedPage::new(scenario.page.clone()));
    let transport = Arc::new(ScriptedTransport::new(scenario.poll_responses.clone()));
    let events = EventBus::new(4096);
    let mut rx = events.subscribe();

    let (handle, task) = Engine::spawn(EngineParts {
        config: scenario.config.clone(),
        timings: Timings::default(),
        backoff: BackoffPolicy::default(),
        page: page.clone(),
        transport: transport.clone(),
        marker: Arc::new(MemoryMarker::new()),
        events,
    })
    .context("starting engine")?;

    let start = Instant::now();
    let mut config = scenario.config.clone();
    let mut steps = scenario.steps.clone();
    steps.sort_by_key(|s| s.at_ms);
    let mut seen = 0usize;

    for step in steps {
        tokio::time::sleep_until(start + Duration::from_millis(step.at_ms)).await;
        seen += drain(&mut rx, &mut on_event);
        tracing::debug!(at_ms = step.at_ms, ?step.action, "scenario step");
        apply(&handle, &page, &mut config, step.action).await?;
    }
    tokio::time::sleep_until(start + duration).await;

    let snapshot = handle.snapshot().await.context("engine stopped early")?;
    handle.shutdown();
    let _ = task.await;
    seen += drain(&mut rx, &mut on_event);

    Ok(SimulationSummary {
        snapshot,
        activated: page.activated().await,
        unit_calls: page.unit_calls().await,
        sub_unit_calls: page.sub_unit_calls().await,
        refreshes: page.refreshes().await,
        reloads: page.reloads().await,
        polls: transport.calls().await,
        events: seen,
    })
}

async fn apply(
    handle: &EngineHandle,
    page: &ScriptedPage,
    config: &mut SentinelConfig,
    action: Action,
) -> Result<()> {
    match action {
        Action::Structural { report } => handle.report_structural(report).await?,
        Action::Poll {
            payload,
            request_url,
        } => {
            handle
                .report_poll(PollReport::from_payload(payload, request_url))
                .await?
        }
        Action::StatusRequest { template } => handle.observe_status_request(template).await?,
        Action::Mutation => handle.notify_mutation().await?,
        Action::Navigate { url } => handle.navigate(url).await?,
        Action::RateLimited => handle.report_rate_limited().await?,
        Action::TransportError { kind } => handle.report_transport_error(kind).await?,
        Action::SetPage { report } => page.set_report(report).await,
        Action::SetText { text } => page.set_page_text(text).await,
        Action::SafetyTrigger { reason } => {
            handle.report_safety_trigger(reason).await?;
            config.armed = false;
        }
        Action::Arm { armed } => {
            config.armed = armed;
            handle.update_config(config.clone()).await?;
        }
    }
    Ok(())
}

fn drain(rx: &mut broadcast::Receiver<SentinelEvent>, on_event: &mut impl FnMut(&SentinelEvent)) -> usize {
    let mut count = 0;
    loop {
        match rx.try_recv() {
            Ok(event) => {
                on_event(&event);
                count += 1;
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "simulation output fell behind");
            }
            Err(_) => return count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scenario() {
        let scenario: Scenario = serde_json::from_value(json!({
            "config": {"armed": true, "auto_click_enabled": true},
            "page": {"sold_out": true, "sub_units": ["9am - 10am"]},
            "poll_responses": [
                {"kind": "rate_limited"},
                {"kind": "ok", "payload": [{"id": 1}]},
                {"kind": "error", "message": "reset"}
            ],
            "steps": [
                {"at_ms": 0, "action": "status_request", "template": {"url": "https://x/api"}},
                {"at_ms": 200, "action": "set_page", "report": {"sold_out": false, "has_sub_units": true, "context_selected": true}},
                {"at_ms": 300, "action": "mutation"},
                {"at_ms": 400, "action": "arm", "armed": false}
            ]
        }))
        .unwrap();

        assert!(scenario.config.armed);
        assert_eq!(scenario.page.sub_units, vec!["9am - 10am".to_string()]);
        assert_eq!(scenario.poll_responses.len(), 3);
        assert!(matches!(scenario.steps[3].action, Action::Arm { armed: false }));
        assert_eq!(scenario.duration(), Duration::from_millis(10_400));
    }

    #[tokio::test]
    async fn test_transport_replays_then_empty() {
        let transport = ScriptedTransport::new(vec![PollResponse::RateLimited]);
        let template = RequestTemplate::get("https://x/api");
        assert_eq!(transport.fetch(&template).await, Err(SentinelError::RateLimited));
        assert_eq!(transport.fetch(&template).await, Ok(json!([])));
        assert_eq!(transport.calls().await, 2);
    }
}
