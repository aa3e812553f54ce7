//! Authenticated bridge between the engine and the poller context.
//!
//! Both sides share one broadcast [`ChannelBus`], which any other party in
//! the page could also read and write. Authentication works in two phases:
//!
//! 1. The privileged side puts a random secret into a [`SecretSlot`] that is
//!    not on the bus, then broadcasts [`Frame::Probe`] until answered.
//! 2. The counterpart takes the secret out of the slot (once) and answers
//!    with [`Frame::Ack`] carrying a short digest, never the secret.
//!
//! From then on every [`Frame::Message`] carries the full secret and frames
//! with the wrong one are dropped.

pub mod endpoint;
pub mod handshake;

use std::sync::Arc;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, Mutex};

use crate::signals::poller::RequestTemplate;
use crate::signals::PollReport;

pub use endpoint::{spawn_counterpart, spawn_privileged, ChannelLink, HandshakeLimits, LinkStatus};
pub use handshake::Handshake;

/// Hex chars of the SHA-256 digest used as the acknowledgement.
pub const ACK_DIGEST_LEN: usize = 8;

/// Which end of the bridge produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Privileged,
    Counterpart,
}

/// Wire unit on the shared bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// "Secret is in the slot, please acknowledge."
    Probe { from: Side },
    Ack { from: Side, digest: String },
    Message {
        from: Side,
        nonce: String,
        body: ChannelMessage,
    },
}

impl Frame {
    pub fn sender_side(&self) -> Side {
        match self {
            Frame::Probe { from } | Frame::Ack { from, .. } | Frame::Message { from, .. } => *from,
        }
    }
}

/// Payloads exchanged once the channel is authenticated.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    // engine → poller
    /// A status request was observed; start polling with it.
    CaptureTemplate(RequestTemplate),
    /// Adjust the base interval or pause state.
    SetPoll { interval_ms: u64, paused: bool },
    /// Pause for a fixed time, then resume and report [`ChannelMessage::PollResumed`].
    PauseFor { duration_ms: u64 },
    /// Forget the template and stop polling (navigation).
    StopPolling,
    /// The host observed a rate-limited status response of its own.
    RateLimited,
    /// The host observed a failed status request of its own.
    TransportError(String),

    // poller → engine
    PollReady { interval_ms: u64 },
    PollResult(PollReport),
    PollBackoff {
        level: u8,
        interval_ms: u64,
        reason: String,
    },
    PollError { tick: u64, error: String },
    PollResumed,
    PollSaturated { level: u8, since_ms: u64 },
}

/// The shared, untrusted broadcast medium.
#[derive(Clone)]
pub struct ChannelBus {
    sender: broadcast::Sender<Frame>,
}

impl ChannelBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, frame: Frame) {
        let _ = self.sender.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new(512)
    }
}

/// Side channel holding the secret until the counterpart reads it.
#[derive(Clone, Default)]
pub struct SecretSlot {
    inner: Arc<Mutex<Option<String>>>,
}

impl SecretSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, secret: String) {
        *self.inner.lock().await = Some(secret);
    }

    /// Read and erase the secret. Later calls return `None`.
    pub async fn take(&self) -> Option<String> {
        self.inner.lock().await.take()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

/// Fresh 16-byte secret, hex encoded.
pub fn generate_secret() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Acknowledgement digest for a secret.
pub fn ack_digest(secret: &str) -> String {
    let mut digest = hex::encode(Sha256::digest(secret.as_bytes()));
    digest.truncate(ACK_DIGEST_LEN);
    digest
}
