//! Pure handshake state: secret, acknowledgement, and the pending queue.
//!
//! No I/O happens here. The endpoint tasks feed events in and publish
//! whatever frames come back out.

use std::collections::VecDeque;

use super::{ack_digest, ChannelMessage, Frame, Side};
use crate::error::SentinelError;

/// One side's view of the handshake.
#[derive(Debug)]
pub struct Handshake {
    side: Side,
    secret: Option<String>,
    established: bool,
    pending: VecDeque<ChannelMessage>,
    capacity: usize,
    dropped: u64,
}

impl Handshake {
    /// Privileged side: owns the secret, waits for an acknowledgement.
    pub fn privileged(secret: String, capacity: usize) -> Self {
        Self::with(Side::Privileged, Some(secret), capacity)
    }

    /// Counterpart: learns the secret from the slot.
    pub fn counterpart(capacity: usize) -> Self {
        Self::with(Side::Counterpart, None, capacity)
    }

    fn with(side: Side, secret: Option<String>, capacity: usize) -> Self {
        Self {
            side,
            secret,
            established: false,
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Messages lost to queue overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Wrap an outbound message, or queue it until the handshake completes.
    ///
    /// When the queue is full the oldest message is discarded.
    pub fn outbound(&mut self, body: ChannelMessage) -> Option<Frame> {
        if self.established {
            return self.wrap(body);
        }
        if self.pending.len() >= self.capacity {
            self.pending.pop_front();
            self.dropped += 1;
        }
        self.pending.push_back(body);
        None
    }

    fn wrap(&self, body: ChannelMessage) -> Option<Frame> {
        self.secret.as_ref().map(|nonce| Frame::Message {
            from: self.side,
            nonce: nonce.clone(),
            body,
        })
    }

    /// Drain the pending queue into frames, in original order.
    fn flush(&mut self) -> Vec<Frame> {
        let queued: Vec<ChannelMessage> = self.pending.drain(..).collect();
        queued.into_iter().filter_map(|m| self.wrap(m)).collect()
    }

    /// Privileged side: handle an acknowledgement.
    ///
    /// Returns the flushed queue on the first valid ack, and `None` for
    /// forged or repeated acks so the queue is replayed exactly once.
    pub fn on_ack(&mut self, digest: &str) -> Option<Vec<Frame>> {
        if self.side != Side::Privileged || self.established {
            return None;
        }
        let expected = ack_digest(self.secret.as_deref()?);
        if digest != expected {
            return None;
        }
        self.established = true;
        Some(self.flush())
    }

    /// Counterpart: adopt the secret read from the slot.
    ///
    /// Returns the acknowledgement frame followed by the flushed queue.
    pub fn adopt_secret(&mut self, secret: String) -> Vec<Frame> {
        let digest = ack_digest(&secret);
        self.secret = Some(secret);
        self.established = true;
        let mut frames = vec![Frame::Ack {
            from: self.side,
            digest,
        }];
        frames.extend(self.flush());
        frames
    }

    /// Repeat the acknowledgement for a probe that arrives after adoption.
    pub fn repeat_ack(&self) -> Option<Frame> {
        self.secret.as_deref().map(|s| Frame::Ack {
            from: self.side,
            digest: ack_digest(s),
        })
    }

    /// Accept an inbound message only if it carries the secret.
    pub fn verify(&self, nonce: &str) -> Result<(), SentinelError> {
        match self.secret.as_deref() {
            Some(secret) if secret == nonce => Ok(()),
            _ => Err(SentinelError::ForgedMessage),
        }
    }
}
