//! Telemetry relay: forwards engine events to a remote monitoring server.
//!
//! State changes go to `POST {base}/api/state`, everything else to
//! `POST {base}/api/log`. Both carry `Authorization: Bearer <token>` when a
//! token is configured. Delivery is best effort: failures are logged and
//! the event is dropped.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use slot_sentinel::{LogLevel, SentinelEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Pushes serialized events to the relay server.
pub struct RelayForwarder {
    endpoint: String,
    token: Option<String>,
    client_id: String,
    client: reqwest::Client,
}

impl RelayForwarder {
    /// Create a forwarder. `base` must be an absolute http(s) URL.
    pub fn new(base: &str, token: Option<String>) -> Result<Self> {
        let parsed = url::Url::parse(base).with_context(|| format!("invalid relay url {base}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("relay url must be http or https, got {}", parsed.scheme());
        }
        Ok(Self {
            endpoint: base.trim_end_matches('/').to_string(),
            token,
            client_id: Uuid::new_v4().to_string(),
            client: reqwest::Client::new(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Route and body for one event.
    pub fn route(&self, event: &SentinelEvent) -> (&'static str, Value) {
        match event {
            SentinelEvent::StateChanged {
                state,
                previous,
                reason,
                timestamp,
            } => (
                "api/state",
                json!({
                    "clientId": self.client_id,
                    "state": state,
                    "previous": previous,
                    "reason": reason,
                    "timestamp": timestamp,
                }),
            ),
            SentinelEvent::Log {
                level,
                message,
                timestamp,
            } => (
                "api/log",
                json!({
                    "clientId": self.client_id,
                    "level": level,
                    "message": message,
                    "timestamp": timestamp,
                }),
            ),
            other => {
                let level = match other {
                    SentinelEvent::ChannelDegraded { .. } | SentinelEvent::PollSaturated { .. } => {
                        LogLevel::Warn
                    }
                    _ => LogLevel::Info,
                };
                (
                    "api/log",
                    json!({
                        "clientId": self.client_id,
                        "level": level,
                        "message": other.kind(),
                        "event": other,
                        "timestamp": chrono::Utc::now(),
                    }),
                )
            }
        }
    }

    /// Deliver a single event.
    pub async fn send(&self, event: &SentinelEvent) -> Result<()> {
        let (path, body) = self.route(event);
        let url = format!("{}/{}", self.endpoint, path);

        let mut req = self.client.post(&url).json(&body);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.context("posting to relay")?;
        if !resp.status().is_success() {
            anyhow::bail!("relay rejected {}: {}", path, resp.status());
        }
        Ok(())
    }

    /// Forward every event from `rx` until the bus closes.
    pub fn spawn(self, mut rx: broadcast::Receiver<SentinelEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(endpoint = %self.endpoint, client_id = %self.client_id, "relay forwarding started");
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.send(&event).await {
                            tracing::debug!("relay delivery failed: {e:#}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "relay fell behind, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
