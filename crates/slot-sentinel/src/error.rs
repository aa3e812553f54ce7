//! Error taxonomy for the coordination engine.

use std::time::Duration;

use crate::grab::GrabStep;

/// All errors the engine can surface.
///
/// Most of these never escape their component: rate limits and transport
/// failures are absorbed by the backoff controller, forged messages are
/// dropped by the channel. They exist as values so the components can log
/// and count them uniformly.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SentinelError {
    #[error("Rate limited by status endpoint")]
    RateLimited,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake timed out after {attempts} probes")]
    HandshakeTimeout { attempts: u32 },

    #[error("Step {step} timed out after {attempts} attempts")]
    StepTimeout { step: GrabStep, attempts: u32 },

    #[error("Grab sequence exceeded safety timeout of {0:?}")]
    SafetyTimeoutExceeded(Duration),

    #[error("Forged message dropped")]
    ForgedMessage,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Marker storage error: {0}")]
    Storage(String),
}

impl SentinelError {
    /// Whether the engine recovers from this error without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SentinelError::RateLimited
                | SentinelError::Transport(_)
                | SentinelError::ForgedMessage
                | SentinelError::HandshakeTimeout { .. }
        )
    }
}

pub type SentinelResult<T> = Result<T, SentinelError>;
