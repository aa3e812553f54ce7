//! File-backed urgent marker, so a reload of the host process still sees it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slot_sentinel::{SentinelError, SentinelResult, UrgentMarker};

#[derive(Debug, Serialize, Deserialize)]
struct Stored {
    at: DateTime<Utc>,
}

/// Stores the marker as `{"at": "<rfc3339>"}` at a fixed path.
#[derive(Debug, Clone)]
pub struct FileMarker {
    path: PathBuf,
}

impl FileMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn storage(e: impl std::fmt::Display) -> SentinelError {
    SentinelError::Storage(e.to_string())
}

#[async_trait]
impl UrgentMarker for FileMarker {
    async fn mark(&self, at: DateTime<Utc>) -> SentinelResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(storage)?;
        }
        let json = serde_json::to_vec(&Stored { at }).map_err(storage)?;
        tokio::fs::write(&self.path, json).await.map_err(storage)?;
        tracing::debug!(path = %self.path.display(), "urgent marker written");
        Ok(())
    }

    async fn take(&self) -> SentinelResult<Option<DateTime<Utc>>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage(e)),
        };
        tokio::fs::remove_file(&self.path).await.map_err(storage)?;
        match serde_json::from_slice::<Stored>(&raw) {
            Ok(stored) => Ok(Some(stored.at)),
            Err(e) => {
                // a corrupt marker is treated as absent
                tracing::warn!(path = %self.path.display(), "discarding unreadable urgent marker: {e}");
                Ok(None)
            }
        }
    }
}
