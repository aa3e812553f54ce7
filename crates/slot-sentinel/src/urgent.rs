//! Urgent re-grab marker that survives a full page reload.
//!
//! Set right before the engine falls back to a reload. The next engine
//! start consumes it once, and when it is fresh the capacity lock is
//! released immediately instead of waiting for a poll confirmation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::SentinelResult;

/// Storage for the marker timestamp.
#[async_trait]
pub trait UrgentMarker: Send + Sync {
    async fn mark(&self, at: DateTime<Utc>) -> SentinelResult<()>;

    /// Read and erase the marker.
    async fn take(&self) -> SentinelResult<Option<DateTime<Utc>>>;
}

/// Consume the marker; `true` when it was set within `freshness` of `now`.
pub async fn consume_fresh(
    marker: &dyn UrgentMarker,
    now: DateTime<Utc>,
    freshness: Duration,
) -> SentinelResult<bool> {
    let Some(at) = marker.take().await? else {
        return Ok(false);
    };
    let age = now.signed_duration_since(at);
    let fresh = age >= chrono::Duration::zero()
        && age.to_std().is_ok_and(|age| age <= freshness);
    if !fresh {
        tracing::debug!(age_s = age.num_seconds(), "stale urgent marker discarded");
    }
    Ok(fresh)
}

/// Process-local marker, for tests and single-run sessions.
#[derive(Debug, Default)]
pub struct MemoryMarker {
    slot: Mutex<Option<DateTime<Utc>>>,
}

impl MemoryMarker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UrgentMarker for MemoryMarker {
    async fn mark(&self, at: DateTime<Utc>) -> SentinelResult<()> {
        *self.slot.lock().await = Some(at);
        Ok(())
    }

    async fn take(&self) -> SentinelResult<Option<DateTime<Utc>>> {
        Ok(self.slot.lock().await.take())
    }
}
