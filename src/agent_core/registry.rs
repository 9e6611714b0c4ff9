//! Stream registry — the process-wide index of in-flight turns.
//!
//! At most one non-terminal stream exists per turn id. Explicit
//! cancellation removes the entry at once; a turn that finishes on its own
//! stays readable for the configured retention period and is then evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::inference::config::RegistryConfig;
use crate::inference::types::ConversationRequest;

use super::errors::AgentError;
use super::observer::{DeliveryGate, StreamObserver};
use super::orchestrator::ToolOrchestrator;
use super::session::{cancel_turn, spawn_turn, StreamHandle, TurnContext};
use super::state::StreamState;

struct TurnEntry {
    /// Distinguishes successive streams on the same turn id so a stale
    /// eviction never removes a newer entry.
    generation: u64,
    cancel: CancellationToken,
    gate: Arc<DeliveryGate>,
    state: watch::Receiver<StreamState>,
}

impl TurnEntry {
    /// Never blocks on the gate's callback lock, so observers may call into
    /// the registry.
    fn is_active(&self) -> bool {
        !self.gate.is_closed()
    }
}

type TurnMap = Arc<Mutex<HashMap<String, TurnEntry>>>;

fn lock(turns: &Mutex<HashMap<String, TurnEntry>>) -> MutexGuard<'_, HashMap<String, TurnEntry>> {
    turns.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every in-flight turn for the process.
pub struct StreamRegistry {
    orchestrator: Arc<ToolOrchestrator>,
    turns: TurnMap,
    retention: Duration,
    next_generation: AtomicU64,
}

impl StreamRegistry {
    pub fn new(orchestrator: Arc<ToolOrchestrator>, config: &RegistryConfig) -> Self {
        Self::with_retention(orchestrator, config.retention())
    }

    pub fn with_retention(orchestrator: Arc<ToolOrchestrator>, retention: Duration) -> Self {
        Self {
            orchestrator,
            turns: Arc::new(Mutex::new(HashMap::new())),
            retention,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start streaming a turn.
    ///
    /// Fails with `AlreadyStreaming` if the turn id has a non-terminal
    /// stream, or with an inference error if the request is invalid. Must be
    /// called from within a Tokio runtime.
    pub fn start(
        &self,
        turn_id: impl Into<String>,
        request: ConversationRequest,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<StreamHandle, AgentError> {
        let turn_id = turn_id.into();
        request.validate()?;

        let (ctx, state_rx) = TurnContext::new(turn_id.clone(), observer);
        let ctx = Arc::new(ctx);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut turns = lock(&self.turns);
            if turns.get(&turn_id).is_some_and(TurnEntry::is_active) {
                tracing::warn!(turn_id = %turn_id, "rejecting second stream for active turn");
                return Err(AgentError::AlreadyStreaming { turn_id });
            }
            turns.insert(
                turn_id.clone(),
                TurnEntry {
                    generation,
                    cancel: ctx.cancel.clone(),
                    gate: ctx.gate.clone(),
                    state: state_rx.clone(),
                },
            );
        }

        let cancel = ctx.cancel.clone();
        let gate = ctx.gate.clone();
        let orchestrator = self.orchestrator.clone();
        let turns = self.turns.clone();
        let retention = self.retention;
        let run_ctx = ctx.clone();
        let evicted_id = turn_id.clone();

        let task = spawn_turn(
            ctx,
            async move { orchestrator.run_turn(request, &run_ctx).await },
            move || {
                tokio::spawn(evict_after(turns, evicted_id, generation, retention));
            },
        );

        Ok(StreamHandle {
            turn_id,
            cancel,
            gate,
            state: state_rx,
            task,
        })
    }

    /// Cancel a turn and drop it from the registry.
    ///
    /// Returns `true` if a running turn was cancelled; unknown or already
    /// finished turns return `false`.
    pub fn cancel(&self, turn_id: &str) -> bool {
        let entry = lock(&self.turns).remove(turn_id);
        match entry {
            Some(entry) => {
                let cancelled = cancel_turn(&entry.cancel, &entry.gate, &entry.state);
                tracing::info!(turn_id, cancelled, "turn cancelled");
                cancelled
            }
            None => false,
        }
    }

    /// Cancel every turn. Returns how many were still running.
    pub fn cancel_all(&self) -> usize {
        let entries: Vec<(String, TurnEntry)> = lock(&self.turns).drain().collect();
        let cancelled = entries
            .iter()
            .filter(|(_, entry)| cancel_turn(&entry.cancel, &entry.gate, &entry.state))
            .count();
        tracing::info!(cancelled, total = entries.len(), "cancelled all turns");
        cancelled
    }

    /// Latest state of a turn, if it is still registered.
    pub fn state(&self, turn_id: &str) -> Option<StreamState> {
        lock(&self.turns)
            .get(turn_id)
            .map(|entry| entry.state.borrow().clone())
    }

    /// Watch a turn's state changes.
    pub fn subscribe(&self, turn_id: &str) -> Option<watch::Receiver<StreamState>> {
        lock(&self.turns).get(turn_id).map(|entry| entry.state.clone())
    }

    pub fn is_active(&self, turn_id: &str) -> bool {
        lock(&self.turns)
            .get(turn_id)
            .is_some_and(TurnEntry::is_active)
    }

    /// Sorted ids of turns that have not reached a terminal state.
    pub fn active_turns(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.turns)
            .iter()
            .filter(|(_, entry)| entry.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Registered turns, finished ones still within retention included.
    pub fn len(&self) -> usize {
        lock(&self.turns).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn evict_after(turns: TurnMap, turn_id: String, generation: u64, retention: Duration) {
    if !retention.is_zero() {
        tokio::time::sleep(retention).await;
    }
    let mut turns = lock(&turns);
    if turns
        .get(&turn_id)
        .is_some_and(|entry| entry.generation == generation)
    {
        turns.remove(&turn_id);
        tracing::debug!(turn_id = %turn_id, "evicted finished turn");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
