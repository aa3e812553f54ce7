//! Status transport over HTTP, wrapping reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use slot_sentinel::{RequestTemplate, SentinelError, SentinelResult, StatusTransport};

/// Replays captured status requests against the live endpoint.
#[derive(Clone)]
pub struct HttpStatusTransport {
    client: reqwest::Client,
}

impl HttpStatusTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("slot-sentinel/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StatusTransport for HttpStatusTransport {
    async fn fetch(&self, template: &RequestTemplate) -> SentinelResult<Value> {
        let method = Method::from_bytes(template.method.to_uppercase().as_bytes())
            .map_err(|_| SentinelError::Transport(format!("bad method {}", template.method)))?;
        let mut request = self.client.request(method, &template.url);
        for (name, value) in &template.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &template.body {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| SentinelError::Transport(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SentinelError::RateLimited);
        }
        if !status.is_success() {
            return Err(SentinelError::Transport(format!("HTTP {}", status.as_u16())));
        }

        let text = response
            .text()
            .await
            .map_err(|e| SentinelError::Transport(e.to_string()))?;
        // Non-JSON bodies are still searched for sold-out phrases.
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}
