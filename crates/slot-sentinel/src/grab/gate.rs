//! Exclusive grab lock with a safety release.
//!
//! Each acquisition gets a generation number. Releases and deadline
//! re-arms carrying an older generation are ignored, so a sequence that
//! was force-released cannot unlock (or keep alive) the claim that
//! replaced it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::GrabStep;

/// Proof of holding the gate.
#[derive(Debug, Clone)]
pub struct GrabTicket {
    pub generation: u64,
    /// Cancelled on force release or engine shutdown.
    pub cancel: CancellationToken,
}

#[derive(Debug)]
struct ActiveGrab {
    generation: u64,
    started_at: Instant,
    deadline: Instant,
    step: Option<GrabStep>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct GateState {
    generation: u64,
    active: Option<ActiveGrab>,
    refresh_started: Option<Instant>,
}

/// Shared between the engine loop and the running sequence.
#[derive(Debug, Clone)]
pub struct GrabGate {
    state: Arc<Mutex<GateState>>,
    safety_timeout: Duration,
    refresh_safety: Duration,
}

/// Snapshot of a force release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedRelease {
    pub generation: u64,
    pub step: Option<GrabStep>,
    pub held_for: Duration,
}

impl GrabGate {
    pub fn new(safety_timeout: Duration, refresh_safety: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState::default())),
            safety_timeout,
            refresh_safety,
        }
    }

    /// Take the lock, or `None` when a claim is already in flight.
    pub async fn try_acquire(&self, now: Instant, parent: &CancellationToken) -> Option<GrabTicket> {
        let mut state = self.state.lock().await;
        if let Some(active) = &state.active {
            tracing::info!(
                generation = active.generation,
                step = ?active.step,
                "grab already in flight, ignoring trigger"
            );
            return None;
        }
        state.generation += 1;
        let cancel = parent.child_token();
        state.active = Some(ActiveGrab {
            generation: state.generation,
            started_at: now,
            deadline: now + self.safety_timeout,
            step: None,
            cancel: cancel.clone(),
        });
        Some(GrabTicket {
            generation: state.generation,
            cancel,
        })
    }

    /// Re-arm the safety deadline at a step boundary.
    ///
    /// Returns `false` when the ticket no longer holds the gate.
    pub async fn checkpoint(&self, generation: u64, step: GrabStep, now: Instant) -> bool {
        let mut state = self.state.lock().await;
        match state.active.as_mut() {
            Some(active) if active.generation == generation => {
                active.deadline = now + self.safety_timeout;
                active.step = Some(step);
                true
            }
            _ => false,
        }
    }

    /// Release the lock if `generation` still holds it.
    pub async fn release(&self, generation: u64) -> bool {
        let mut state = self.state.lock().await;
        match &state.active {
            Some(active) if active.generation == generation => {
                state.active = None;
                true
            }
            _ => false,
        }
    }

    /// Force-release a claim whose deadline has passed and cancel it.
    pub async fn expire_overdue(&self, now: Instant) -> Option<ForcedRelease> {
        let mut state = self.state.lock().await;
        let overdue = state.active.as_ref().is_some_and(|a| now >= a.deadline);
        if !overdue {
            return None;
        }
        let active = state.active.take()?;
        active.cancel.cancel();
        Some(ForcedRelease {
            generation: active.generation,
            step: active.step,
            held_for: now.saturating_duration_since(active.started_at),
        })
    }

    /// Release whatever holds the gate (navigation, shutdown).
    pub async fn cancel_active(&self) -> Option<u64> {
        let mut state = self.state.lock().await;
        let active = state.active.take()?;
        active.cancel.cancel();
        Some(active.generation)
    }

    pub async fn deadline(&self) -> Option<Instant> {
        self.state.lock().await.active.as_ref().map(|a| a.deadline)
    }

    pub async fn in_flight(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    /// Claim the forced-refresh flag. `false` when another refresh is running.
    pub async fn begin_refresh(&self, now: Instant) -> bool {
        let mut state = self.state.lock().await;
        if let Some(started) = state.refresh_started {
            if now.saturating_duration_since(started) < self.refresh_safety {
                return false;
            }
            tracing::warn!("forced refresh flag stuck, releasing");
        }
        state.refresh_started = Some(now);
        true
    }

    pub async fn end_refresh(&self) {
        self.state.lock().await.refresh_started = None;
    }

    /// Whether a forced refresh is running; structural signals are unreliable meanwhile.
    pub async fn refreshing(&self, now: Instant) -> bool {
        self.state
            .lock()
            .await
            .refresh_started
            .is_some_and(|started| now.saturating_duration_since(started) < self.refresh_safety)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> GrabGate {
        GrabGate::new(Duration::from_secs(90), Duration::from_secs(15))
    }

    #[tokio::test]
    async fn test_second_acquire_is_noop() {
        let g = gate();
        let root = CancellationToken::new();
        let now = Instant::now();
        let ticket = g.try_acquire(now, &root).await.unwrap();
        assert!(g.try_acquire(now, &root).await.is_none());
        assert!(g.release(ticket.generation).await);
        assert!(g.try_acquire(now, &root).await.is_some());
    }

    #[tokio::test]
    async fn test_safety_release_cancels_and_fences() {
        let g = gate();
        let root = CancellationToken::new();
        let t0 = Instant::now();
        let stale = g.try_acquire(t0, &root).await.unwrap();
        assert!(g.checkpoint(stale.generation, GrabStep::SelectUnit, t0).await);

        assert!(g.expire_overdue(t0 + Duration::from_secs(89)).await.is_none());
        let forced = g.expire_overdue(t0 + Duration::from_secs(90)).await.unwrap();
        assert_eq!(forced.step, Some(GrabStep::SelectUnit));
        assert!(stale.cancel.is_cancelled());

        let fresh = g.try_acquire(t0 + Duration::from_secs(91), &root).await.unwrap();
        assert!(!g.release(stale.generation).await);
        assert!(!g.checkpoint(stale.generation, GrabStep::Confirm, t0).await);
        assert!(g.in_flight().await);
        assert!(g.release(fresh.generation).await);
    }

    #[tokio::test]
    async fn test_checkpoint_rearms_deadline() {
        let g = gate();
        let root = CancellationToken::new();
        let t0 = Instant::now();
        let ticket = g.try_acquire(t0, &root).await.unwrap();
        let later = t0 + Duration::from_secs(60);
        g.checkpoint(ticket.generation, GrabStep::SelectSubunit, later).await;
        assert!(g.expire_overdue(t0 + Duration::from_secs(100)).await.is_none());
        assert_eq!(g.deadline().await, Some(later + Duration::from_secs(90)));
    }

    #[tokio::test]
    async fn test_refresh_flag_exclusive_with_safety_release() {
        let g = gate();
        let t0 = Instant::now();
        assert!(g.begin_refresh(t0).await);
        assert!(!g.begin_refresh(t0 + Duration::from_secs(1)).await);
        assert!(g.refreshing(t0 + Duration::from_secs(14)).await);
        assert!(!g.refreshing(t0 + Duration::from_secs(15)).await);
        assert!(g.begin_refresh(t0 + Duration::from_secs(15)).await);
        g.end_refresh().await;
        assert!(!g.refreshing(t0 + Duration::from_secs(16)).await);
    }

    #[tokio::test]
    async fn test_root_cancellation_propagates() {
        let g = gate();
        let root = CancellationToken::new();
        let ticket = g.try_acquire(Instant::now(), &root).await.unwrap();
        root.cancel();
        assert!(ticket.cancel.is_cancelled());
    }
}
