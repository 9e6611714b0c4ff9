//! Per-turn stream state and terminal outcomes.
//!
//! A turn's [`StreamState`] lives inside a `tokio::sync::watch` channel.
//! Whoever holds the [`StateWriter`] owns the state: the stream session while
//! a round is streaming, the tool orchestrator while tools run. The writer is
//! moved, never shared, so there is exactly one mutator at any time; the
//! registry and late observers only hold receivers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::inference::delta::{Delta, DraftMessage, Usage};
use crate::inference::types::ChatMessage;

use super::errors::AgentError;

// ─── Status ─────────────────────────────────────────────────────────────────

/// Lifecycle of a turn. Terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Streaming,
    ToolExecuting,
    Completed,
    Cancelled,
    Failed,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamStatus::Completed | StreamStatus::Cancelled | StreamStatus::Failed
        )
    }
}

// ─── State ──────────────────────────────────────────────────────────────────

/// Observable state of one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamState {
    pub turn_id: String,
    pub status: StreamStatus,
    /// 1-based generation round; 0 before the first round opens.
    pub round: usize,
    /// Draft of the current (or last) round.
    pub draft: DraftMessage,
    /// Usage of rounds that have already finished.
    pub settled_usage: Usage,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StreamState {
    fn new(turn_id: &str) -> Self {
        Self {
            turn_id: turn_id.to_string(),
            status: StreamStatus::Streaming,
            round: 0,
            draft: DraftMessage::new(),
            settled_usage: Usage::default(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    /// Usage across all rounds so far, including the one in progress.
    pub fn total_usage(&self) -> Usage {
        let mut total = self.settled_usage;
        total.add(self.draft.usage);
        total
    }
}

/// Exclusive write handle for a turn's state.
pub struct StateWriter {
    tx: watch::Sender<StreamState>,
}

impl StateWriter {
    pub(crate) fn new(turn_id: &str) -> (Self, watch::Receiver<StreamState>) {
        let (tx, rx) = watch::channel(StreamState::new(turn_id));
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> StreamState {
        self.tx.borrow().clone()
    }

    pub fn draft(&self) -> DraftMessage {
        self.tx.borrow().draft.clone()
    }

    pub fn total_usage(&self) -> Usage {
        self.tx.borrow().total_usage()
    }

    /// Run `f` against the current state without cloning it.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&StreamState) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Open the next round: settle the previous draft's usage and start a
    /// fresh draft. Returns the new round number.
    pub(crate) fn begin_round(&self) -> usize {
        let mut round = 0;
        self.tx.send_modify(|state| {
            let previous = std::mem::take(&mut state.draft);
            state.settled_usage.add(previous.usage);
            state.round += 1;
            if !state.status.is_terminal() {
                state.status = StreamStatus::Streaming;
            }
            round = state.round;
        });
        round
    }

    /// Discard a draft that produced nothing visible (provider fallback).
    pub(crate) fn reset_draft(&self) {
        self.tx.send_modify(|state| state.draft = DraftMessage::new());
    }

    /// Fold a delta into the current draft. Returns `true` if it changed.
    pub(crate) fn apply(&self, delta: &Delta) -> bool {
        self.tx.send_if_modified(|state| state.draft.apply(delta))
    }

    pub(crate) fn set_status(&self, status: StreamStatus) {
        self.tx.send_if_modified(|state| {
            if state.status.is_terminal() || state.status == status {
                return false;
            }
            state.status = status;
            true
        });
    }

    /// Move to a terminal status. A state that is already terminal is left alone.
    pub(crate) fn finish(&self, status: StreamStatus, error: Option<String>) {
        self.tx.send_if_modified(|state| {
            if state.status.is_terminal() {
                return false;
            }
            state.status = status;
            state.error = error;
            state.finished_at = Some(Utc::now());
            true
        });
    }
}

// ─── Outcomes ───────────────────────────────────────────────────────────────

/// A turn that finished normally.
#[derive(Debug, Clone)]
pub struct CompletedTurn {
    /// Draft of the final round.
    pub draft: DraftMessage,
    /// Request history plus every assistant and tool message the turn produced.
    pub conversation: Vec<ChatMessage>,
    /// Number of generation rounds (stream sessions) used.
    pub rounds: usize,
    pub usage: Usage,
    /// The final round stopped on `length` or `content_filter`.
    pub truncated: bool,
}

/// The single terminal signal of a turn.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Completed(CompletedTurn),
    Cancelled {
        partial: DraftMessage,
    },
    Failed {
        error: AgentError,
        /// Draft of the round that was in progress; never retracted.
        partial: DraftMessage,
        /// History accumulated up to the failure.
        conversation: Vec<ChatMessage>,
    },
}

impl TurnOutcome {
    pub fn status(&self) -> StreamStatus {
        match self {
            TurnOutcome::Completed(_) => StreamStatus::Completed,
            TurnOutcome::Cancelled { .. } => StreamStatus::Cancelled,
            TurnOutcome::Failed { .. } => StreamStatus::Failed,
        }
    }

    /// Text of the final (or partial) draft.
    pub fn text(&self) -> &str {
        match self {
            TurnOutcome::Completed(turn) => &turn.draft.text,
            TurnOutcome::Cancelled { partial } | TurnOutcome::Failed { partial, .. } => &partial.text,
        }
    }

    pub fn error(&self) -> Option<&AgentError> {
        match self {
            TurnOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
