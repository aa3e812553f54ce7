//! `slot-sentinel watch`: live polling against a real status endpoint.
//!
//! The status request is replayed over HTTP. Page interaction goes through
//! a scripted page (loaded from `--page` or defaulted), so the engine runs
//! its full decision loop while the claim steps stay inert.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use slot_sentinel::{
    BackoffPolicy, Engine, EngineParts, EventBus, PageScript, RequestTemplate, ScriptedPage,
    Timings,
};
use tokio::sync::broadcast;

use crate::config::FileConfig;
use crate::http_transport::HttpStatusTransport;
use crate::marker::FileMarker;
use crate::output::EventPrinter;

pub struct WatchArgs {
    pub url: String,
    pub method: String,
    pub headers: Vec<String>,
    pub body: Option<String>,
    pub page: Option<PathBuf>,
    pub timeout_secs: u64,
}

/// Parse `Name: value` header arguments.
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("header must look like 'Name: value', got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("header name is empty in '{raw}'");
    }
    Ok((name.to_string(), value.trim().to_string()))
}

pub fn build_template(args: &WatchArgs) -> Result<RequestTemplate> {
    let parsed = url::Url::parse(&args.url).with_context(|| format!("invalid url {}", args.url))?;
    let headers = args
        .headers
        .iter()
        .map(|h| parse_header(h))
        .collect::<Result<Vec<_>>>()?;
    Ok(RequestTemplate {
        url: parsed.to_string(),
        method: args.method.to_uppercase(),
        headers,
        body: args.body.clone(),
    })
}

fn load_page(path: Option<&PathBuf>) -> Result<PageScript> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading page script {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing page script {}", path.display()))
        }
        None => Ok(PageScript::default()),
    }
}

pub async fn run(config: FileConfig, args: WatchArgs, printer: EventPrinter) -> Result<()> {
    let template = build_template(&args)?;
    let page = Arc::new(ScriptedPage::new(load_page(args.page.as_ref())?));
    let transport = Arc::new(HttpStatusTransport::new(Duration::from_secs(args.timeout_secs))?);
    let marker = Arc::new(FileMarker::new(config.marker_path()));

    let events = EventBus::new(1024);
    let mut rx = events.subscribe();
    super::start_relay(&config, &events)?;

    let (handle, task) = Engine::spawn(EngineParts {
        config: config.sentinel.clone(),
        timings: Timings::default(),
        backoff: BackoffPolicy::default(),
        page,
        transport,
        marker,
        events,
    })?;

    tracing::info!(url = %template.url, method = %template.method, "watching status endpoint");
    handle.observe_status_request(template).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
            event = rx.recv() => match event {
                Ok(event) => printer.print(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if let Ok(snapshot) = handle.snapshot().await {
        eprintln!("  Final state: {}", snapshot.state);
    }
    handle.shutdown();
    let _ = task.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(url: &str, headers: &[&str]) -> WatchArgs {
        WatchArgs {
            url: url.into(),
            method: "get".into(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            body: None,
            page: None,
            timeout_secs: 10,
        }
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Authorization: Bearer abc:def").unwrap(),
            ("Authorization".to_string(), "Bearer abc:def".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_build_template() {
        let template = build_template(&args(
            "https://scheduler.example/api/capacity?date=2025-03-14",
            &["x-session: 1"],
        ))
        .unwrap();
        assert_eq!(template.method, "GET");
        assert_eq!(template.headers, vec![("x-session".to_string(), "1".to_string())]);
        assert!(template.url.ends_with("date=2025-03-14"));

        assert!(build_template(&args("not a url", &[])).is_err());
    }
}
