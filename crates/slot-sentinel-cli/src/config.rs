//! Configuration loading and resolution.
//!
//! Lookup order for the config file: `--config`, then `SLOT_SENTINEL_CONFIG`,
//! then `~/.slot-sentinel/config.json`. A missing default file means
//! built-in defaults; a missing explicit file is an error. Command-line
//! flags are applied on top.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use slot_sentinel::SentinelConfig;

pub const CONFIG_ENV: &str = "SLOT_SENTINEL_CONFIG";

/// On-disk configuration: engine toggles plus host settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    #[serde(flatten)]
    pub sentinel: SentinelConfig,
    /// Base URL of the monitoring relay.
    pub relay_url: Option<String>,
    pub relay_token: Option<String>,
    /// Where the urgent marker is persisted between runs.
    pub marker_path: Option<PathBuf>,
}

/// Flag values that override the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub armed: Option<bool>,
    pub auto_click: Option<bool>,
    pub chain_confirm: Option<bool>,
    pub poll_interval_ms: Option<u64>,
    pub preferred_days: Option<String>,
    pub preferred_time: Option<String>,
    pub relay_url: Option<String>,
    pub relay_token: Option<String>,
}

/// Directory for per-user state, `~/.slot-sentinel`.
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".slot-sentinel")
}

pub fn default_config_path() -> PathBuf {
    state_dir().join("config.json")
}

pub fn default_marker_path() -> PathBuf {
    state_dir().join("urgent.json")
}

/// Resolve which config file to read, if any.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        if !env_path.trim().is_empty() {
            return Some(PathBuf::from(env_path));
        }
    }
    let default = default_config_path();
    default.exists().then_some(default)
}

pub fn load_file(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: FileConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

/// Load, apply overrides, validate.
pub fn load(explicit: Option<&Path>, overrides: &Overrides) -> Result<FileConfig> {
    let mut config = match resolve_config_path(explicit) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            load_file(&path)?
        }
        None => FileConfig::default(),
    };
    config.apply(overrides);
    config.sentinel = config.sentinel.normalized();
    config
        .sentinel
        .validate()
        .context("invalid engine configuration")?;
    Ok(config)
}

impl FileConfig {
    pub fn apply(&mut self, overrides: &Overrides) {
        let s = &mut self.sentinel;
        if let Some(v) = overrides.armed {
            s.armed = v;
        }
        if let Some(v) = overrides.auto_click {
            s.auto_click_enabled = v;
        }
        if let Some(v) = overrides.chain_confirm {
            s.chain_confirm_enabled = v;
        }
        if let Some(v) = overrides.poll_interval_ms {
            s.poll_interval_ms = v;
        }
        if let Some(v) = &overrides.preferred_days {
            s.preferred_days = v.clone();
        }
        if let Some(v) = &overrides.preferred_time {
            s.preferred_time = v.clone();
        }
        if overrides.relay_url.is_some() {
            self.relay_url = overrides.relay_url.clone();
        }
        if overrides.relay_token.is_some() {
            self.relay_token = overrides.relay_token.clone();
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.marker_path.clone().unwrap_or_else(default_marker_path)
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}
