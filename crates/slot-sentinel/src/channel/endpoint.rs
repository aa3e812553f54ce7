//! Endpoint tasks that run the handshake and relay authenticated messages.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{generate_secret, ChannelBus, ChannelMessage, Frame, Handshake, SecretSlot, Side};
use crate::config::Timings;
use crate::error::{SentinelError, SentinelResult};
use crate::events::{EventBus, SentinelEvent};

/// Handshake progress as seen by the owner of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Handshaking,
    Ready,
    /// The counterpart never answered. Only locally observable signals remain.
    Degraded,
}

/// Owner's handle to an endpoint task.
pub struct ChannelLink {
    outbound: mpsc::Sender<ChannelMessage>,
    pub inbound: mpsc::Receiver<ChannelMessage>,
    pub status: watch::Receiver<LinkStatus>,
    pub task: JoinHandle<()>,
}

impl ChannelLink {
    /// Queue a message for the other side.
    pub async fn send(&self, message: ChannelMessage) -> SentinelResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| SentinelError::ChannelClosed)
    }

    /// Cloneable sender for tasks that only write.
    pub fn sender(&self) -> mpsc::Sender<ChannelMessage> {
        self.outbound.clone()
    }

    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.inbound.recv().await
    }

    pub fn current_status(&self) -> LinkStatus {
        *self.status.borrow()
    }
}

/// Probe and queue limits for the privileged endpoint.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeLimits {
    pub probe_interval: Duration,
    pub max_probes: u32,
    pub queue_capacity: usize,
}

impl From<&Timings> for HandshakeLimits {
    fn from(timings: &Timings) -> Self {
        Self {
            probe_interval: timings.handshake_probe_interval,
            max_probes: timings.handshake_max_probes,
            queue_capacity: timings.pending_queue_capacity,
        }
    }
}

/// Start the privileged endpoint: generate a secret, publish it to the slot,
/// and probe until the counterpart acknowledges.
pub fn spawn_privileged(
    bus: ChannelBus,
    slot: SecretSlot,
    limits: HandshakeLimits,
    events: EventBus,
    shutdown: CancellationToken,
) -> ChannelLink {
    let (out_tx, mut out_rx) = mpsc::channel(256);
    let (in_tx, in_rx) = mpsc::channel(256);
    let (status_tx, status_rx) = watch::channel(LinkStatus::Handshaking);
    let mut frames = bus.subscribe();

    let task = tokio::spawn(async move {
        let secret = generate_secret();
        slot.publish(secret.clone()).await;
        let mut hs = Handshake::privileged(secret, limits.queue_capacity);

        let mut probes = 0u32;
        let mut probe_timer = tokio::time::interval(limits.probe_interval);
        let deadline = tokio::time::sleep(limits.probe_interval * limits.max_probes);
        tokio::pin!(deadline);
        let mut degraded = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = probe_timer.tick(), if !hs.is_established() && probes < limits.max_probes => {
                    probes += 1;
                    bus.publish(Frame::Probe { from: Side::Privileged });
                }

                _ = &mut deadline, if !hs.is_established() && !degraded => {
                    degraded = true;
                    let _ = status_tx.send(LinkStatus::Degraded);
                    tracing::warn!(
                        attempts = probes,
                        "{}; continuing with local signals only",
                        SentinelError::HandshakeTimeout { attempts: probes }
                    );
                    events.emit(SentinelEvent::ChannelDegraded { attempts: probes });
                }

                outgoing = out_rx.recv() => {
                    let Some(message) = outgoing else { break };
                    if let Some(frame) = hs.outbound(message) {
                        bus.publish(frame);
                    }
                }

                incoming = frames.recv() => {
                    let frame = match incoming {
                        Ok(frame) => frame,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(skipped = n, "channel bus lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if frame.sender_side() == Side::Privileged {
                        continue;
                    }
                    match frame {
                        Frame::Ack { digest, .. } => {
                            let Some(flushed) = hs.on_ack(&digest) else {
                                tracing::debug!("ignoring unexpected acknowledgement");
                                continue;
                            };
                            tracing::info!(replayed = flushed.len(), probes, "channel handshake complete");
                            for frame in flushed {
                                bus.publish(frame);
                            }
                            let _ = status_tx.send(LinkStatus::Ready);
                            events.emit(SentinelEvent::ChannelReady);
                        }
                        Frame::Message { nonce, body, .. } => {
                            if let Err(e) = hs.verify(&nonce) {
                                tracing::debug!("{e}");
                                continue;
                            }
                            if in_tx.send(body).await.is_err() {
                                break;
                            }
                        }
                        Frame::Probe { .. } => {}
                    }
                }
            }
        }
    });

    ChannelLink {
        outbound: out_tx,
        inbound: in_rx,
        status: status_rx,
        task,
    }
}

/// Start the counterpart endpoint: wait for a probe, read the secret once,
/// acknowledge with its digest.
pub fn spawn_counterpart(
    bus: ChannelBus,
    slot: SecretSlot,
    queue_capacity: usize,
    shutdown: CancellationToken,
) -> ChannelLink {
    let (out_tx, mut out_rx) = mpsc::channel(256);
    let (in_tx, in_rx) = mpsc::channel(256);
    let (status_tx, status_rx) = watch::channel(LinkStatus::Handshaking);
    let mut frames = bus.subscribe();

    let task = tokio::spawn(async move {
        let mut hs = Handshake::counterpart(queue_capacity);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                outgoing = out_rx.recv() => {
                    let Some(message) = outgoing else { break };
                    if let Some(frame) = hs.outbound(message) {
                        bus.publish(frame);
                    }
                }

                incoming = frames.recv() => {
                    let frame = match incoming {
                        Ok(frame) => frame,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(skipped = n, "channel bus lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if frame.sender_side() == Side::Counterpart {
                        continue;
                    }
                    match frame {
                        Frame::Probe { .. } if hs.is_established() => {
                            if let Some(ack) = hs.repeat_ack() {
                                bus.publish(ack);
                            }
                        }
                        Frame::Probe { .. } => match slot.take().await {
                            Some(secret) => {
                                for frame in hs.adopt_secret(secret) {
                                    bus.publish(frame);
                                }
                                let _ = status_tx.send(LinkStatus::Ready);
                            }
                            None => tracing::debug!("probe received but secret slot is empty"),
                        },
                        Frame::Message { nonce, body, .. } => {
                            if let Err(e) = hs.verify(&nonce) {
                                tracing::debug!("{e}");
                                continue;
                            }
                            if in_tx.send(body).await.is_err() {
                                break;
                            }
                        }
                        Frame::Ack { .. } => {}
                    }
                }
            }
        }
    });

    ChannelLink {
        outbound: out_tx,
        inbound: in_rx,
        status: status_rx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> HandshakeLimits {
        HandshakeLimits {
            probe_interval: Duration::from_millis(200),
            max_probes: 25,
            queue_capacity: 100,
        }
    }

    fn poll(n: u64) -> ChannelMessage {
        ChannelMessage::SetPoll {
            interval_ms: n,
            paused: false,
        }
    }

    async fn next(link: &mut ChannelLink) -> Option<ChannelMessage> {
        tokio::time::timeout(Duration::from_secs(2), link.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_handshake_messages_replayed_once_in_order() {
        let bus = ChannelBus::default();
        let slot = SecretSlot::new();
        let token = CancellationToken::new();
        let engine = spawn_privileged(
            bus.clone(),
            slot.clone(),
            limits(),
            EventBus::default(),
            token.clone(),
        );
        for n in 1..=3 {
            engine.send(poll(n)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(450)).await;

        let mut page = spawn_counterpart(bus.clone(), slot.clone(), 100, token.clone());
        for n in 1..=3 {
            assert_eq!(next(&mut page).await, Some(poll(n)));
        }
        assert_eq!(next(&mut page).await, None);
        assert_eq!(engine.current_status(), LinkStatus::Ready);
        assert!(slot.is_empty().await);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forged_message_dropped() {
        let bus = ChannelBus::default();
        let slot = SecretSlot::new();
        let token = CancellationToken::new();
        let engine = spawn_privileged(
            bus.clone(),
            slot.clone(),
            limits(),
            EventBus::default(),
            token.clone(),
        );
        let mut page = spawn_counterpart(bus.clone(), slot, 100, token.clone());
        let mut status = engine.status.clone();
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| *s == LinkStatus::Ready),
        )
        .await
        .unwrap()
        .unwrap();

        bus.publish(Frame::Message {
            from: Side::Privileged,
            nonce: "not-the-secret".into(),
            body: ChannelMessage::StopPolling,
        });
        engine.send(poll(9)).await.unwrap();
        assert_eq!(next(&mut page).await, Some(poll(9)));
        assert_eq!(next(&mut page).await, None);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_counterpart_to_privileged_delivery() {
        let bus = ChannelBus::default();
        let slot = SecretSlot::new();
        let token = CancellationToken::new();
        let mut engine = spawn_privileged(
            bus.clone(),
            slot.clone(),
            limits(),
            EventBus::default(),
            token.clone(),
        );
        let page = spawn_counterpart(bus, slot, 100, token.clone());
        page.send(ChannelMessage::PollResumed).await.unwrap();
        assert_eq!(next(&mut engine).await, Some(ChannelMessage::PollResumed));
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_degrades() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let token = CancellationToken::new();
        let engine = spawn_privileged(
            ChannelBus::default(),
            SecretSlot::new(),
            limits(),
            events,
            token.clone(),
        );
        let mut status = engine.status.clone();
        tokio::time::timeout(
            Duration::from_secs(10),
            status.wait_for(|s| *s == LinkStatus::Degraded),
        )
        .await
        .unwrap()
        .unwrap();

        match rx.recv().await.unwrap() {
            SentinelEvent::ChannelDegraded { attempts } => assert_eq!(attempts, 25),
            other => panic!("unexpected event {}", other.kind()),
        }
        token.cancel();
    }
}
