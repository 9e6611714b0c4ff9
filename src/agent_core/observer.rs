//! Caller-facing delivery of deltas and terminal signals.
//!
//! Callers implement [`StreamObserver`]; the engine funnels every callback
//! through a [`DeliveryGate`] so that a turn produces exactly one terminal
//! signal and nothing at all once it has been cancelled.
//!
//! Observer methods run on the engine's task. They must return quickly.
//! Callbacks may query the registry or a handle (`is_active`,
//! `active_turns`, `is_finished`); inside `on_delta` the turn's state is
//! [`StreamUpdate::state`]. Cancelling the callback's own turn synchronously
//! is not allowed, so hand that off through a [`ChannelObserver`] instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::inference::delta::Delta;

use super::state::{StreamState, TurnOutcome};

// ─── Observer trait ─────────────────────────────────────────────────────────

/// One merged delta, as seen by an observer.
#[derive(Debug)]
pub struct StreamUpdate<'a> {
    pub turn_id: &'a str,
    pub round: usize,
    pub delta: &'a Delta,
    /// State after the delta was folded in.
    pub state: &'a StreamState,
}

pub trait StreamObserver: Send + Sync {
    /// Called once per delta that changed the draft, in arrival order.
    fn on_delta(&self, update: &StreamUpdate<'_>);

    /// Called exactly once per turn.
    fn on_terminal(&self, turn_id: &str, outcome: &TurnOutcome);
}

/// Observer that ignores everything. Used by awaitable entry points.
pub struct NoopObserver;

impl StreamObserver for NoopObserver {
    fn on_delta(&self, _update: &StreamUpdate<'_>) {}
    fn on_terminal(&self, _turn_id: &str, _outcome: &TurnOutcome) {}
}

// ─── Channel observer ───────────────────────────────────────────────────────

/// Owned form of an observer callback.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Delta {
        turn_id: String,
        round: usize,
        delta: Delta,
    },
    Terminal {
        turn_id: String,
        outcome: TurnOutcome,
    },
}

/// Forwards callbacks into an unbounded channel so the receiver can react
/// (including cancelling the turn) from its own task.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StreamObserver for ChannelObserver {
    fn on_delta(&self, update: &StreamUpdate<'_>) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(StreamEvent::Delta {
            turn_id: update.turn_id.to_string(),
            round: update.round,
            delta: update.delta.clone(),
        });
    }

    fn on_terminal(&self, turn_id: &str, outcome: &TurnOutcome) {
        let _ = self.tx.send(StreamEvent::Terminal {
            turn_id: turn_id.to_string(),
            outcome: outcome.clone(),
        });
    }
}

// ─── Delivery gate ──────────────────────────────────────────────────────────

#[derive(Default)]
struct GateInner {
    outcome: Option<TurnOutcome>,
}

/// Serialises observer callbacks for one turn.
///
/// Every callback happens under the gate's lock. Closing the gate (by
/// delivering the terminal signal) therefore happens-before any later
/// delivery attempt, which is then refused.
///
/// `closed` is only written under the lock but can be read without it, so
/// [`DeliveryGate::is_closed`] never waits on a running callback.
pub(crate) struct DeliveryGate {
    turn_id: String,
    observer: Arc<dyn StreamObserver>,
    closed: AtomicBool,
    inner: Mutex<GateInner>,
}

impl DeliveryGate {
    pub(crate) fn new(turn_id: impl Into<String>, observer: Arc<dyn StreamObserver>) -> Self {
        Self {
            turn_id: turn_id.into(),
            observer,
            closed: AtomicBool::new(false),
            inner: Mutex::new(GateInner::default()),
        }
    }

    pub(crate) fn turn_id(&self) -> &str {
        &self.turn_id
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        // A panicking observer must not wedge the turn.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock-free; safe to call from inside an observer callback.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deliver a delta. Returns `false` if the gate is already closed.
    pub(crate) fn deliver_delta(&self, round: usize, delta: &Delta, state: &StreamState) -> bool {
        let _inner = self.lock();
        if self.is_closed() {
            return false;
        }
        self.observer.on_delta(&StreamUpdate {
            turn_id: &self.turn_id,
            round,
            delta,
            state,
        });
        true
    }

    /// Deliver the terminal signal and close the gate.
    ///
    /// `before` runs under the lock, ahead of the observer, and only if this
    /// call wins. Returns `false` if a terminal signal was already delivered.
    pub(crate) fn deliver_terminal(
        &self,
        outcome: TurnOutcome,
        before: impl FnOnce(&TurnOutcome),
    ) -> bool {
        let mut inner = self.lock();
        if self.is_closed() {
            return false;
        }
        self.closed.store(true, Ordering::Release);
        before(&outcome);
        tracing::info!(
            turn_id = %self.turn_id,
            status = ?outcome.status(),
            error = outcome.error().map(|e| e.to_string()).unwrap_or_default(),
            "turn finished"
        );
        self.observer.on_terminal(&self.turn_id, &outcome);
        inner.outcome = Some(outcome);
        true
    }

    /// Take the delivered outcome, if any. Subsequent calls return `None`.
    pub(crate) fn take_outcome(&self) -> Option<TurnOutcome> {
        self.lock().outcome.take()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
