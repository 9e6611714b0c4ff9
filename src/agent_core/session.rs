//! Stream session — drives one generation round against the gateway.
//!
//! A round opens the transport, decodes SSE frames, parses each payload into
//! deltas, folds them into the draft and delivers them to the observer. It
//! ends when the stream is exhausted, fails, or the turn is cancelled.
//!
//! Provider fallback: the first attempt takes the gateway's default route.
//! With fallback providers `[a, b]` the next attempt asks for `[a, b]`, then
//! `[b]`. An attempt is only abandoned for the next one if it failed with a
//! retriable error before any delta of the turn reached the observer. After
//! that, errors are final, in this round and every later one.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::inference::delta::{parse_deltas, Delta, DraftMessage, FinishReason};
use crate::inference::errors::InferenceError;
use crate::inference::sse::{decode_sse, SseFrame};
use crate::inference::transport::ChatTransport;
use crate::inference::types::{ChatCompletionRequest, ChatMessage, ConversationRequest};

use super::errors::AgentError;
use super::observer::{DeliveryGate, StreamObserver};
use super::state::{CompletedTurn, StateWriter, StreamState, StreamStatus, TurnOutcome};

// ─── Turn context ───────────────────────────────────────────────────────────

/// Everything a running turn needs. Owned by the task driving the turn.
pub(crate) struct TurnContext {
    pub turn_id: String,
    pub writer: StateWriter,
    pub gate: Arc<DeliveryGate>,
    pub cancel: CancellationToken,
    /// Deltas handed to the observer across all rounds of the turn.
    delivered: AtomicUsize,
}

impl TurnContext {
    pub(crate) fn new(
        turn_id: String,
        observer: Arc<dyn StreamObserver>,
    ) -> (Self, watch::Receiver<StreamState>) {
        let (writer, state_rx) = StateWriter::new(&turn_id);
        let gate = Arc::new(DeliveryGate::new(turn_id.clone(), observer));
        let ctx = Self {
            turn_id,
            writer,
            gate,
            cancel: CancellationToken::new(),
            delivered: AtomicUsize::new(0),
        };
        (ctx, state_rx)
    }

    pub(crate) fn deltas_delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Record the terminal status and deliver the outcome.
    ///
    /// If a cancel already closed the gate, the state still ends as
    /// `Cancelled` so it agrees with what the observer was told.
    pub(crate) fn finish(&self, outcome: TurnOutcome) {
        let delivered = self.gate.deliver_terminal(outcome, |outcome| {
            self.writer
                .finish(outcome.status(), outcome.error().map(ToString::to_string));
        });
        if !delivered {
            self.writer.finish(StreamStatus::Cancelled, None);
        }
    }
}

pub(crate) fn new_turn_id() -> String {
    format!("turn_{}", Uuid::new_v4())
}

/// Cancel a turn from outside its task.
///
/// Closes the gate with a `Cancelled` outcome built from the latest state,
/// then trips the token. Returns `true` if this call produced the terminal
/// signal, `false` if the turn had already finished.
pub(crate) fn cancel_turn(
    cancel: &CancellationToken,
    gate: &DeliveryGate,
    state: &watch::Receiver<StreamState>,
) -> bool {
    let partial = state.borrow().draft.clone();
    let acknowledged = gate.deliver_terminal(TurnOutcome::Cancelled { partial }, |_| {});
    cancel.cancel();
    acknowledged
}

/// Spawn the task driving a turn.
///
/// `run` produces the outcome; this task delivers it and then calls
/// `on_exit`. A panic inside `run` becomes a `Failed` outcome, so the state
/// still ends terminal, the observer still hears exactly once and `on_exit`
/// still runs.
pub(crate) fn spawn_turn<F, D>(ctx: Arc<TurnContext>, run: F, on_exit: D) -> JoinHandle<()>
where
    F: Future<Output = TurnOutcome> + Send + 'static,
    D: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_reason(&*panic);
                tracing::error!(turn_id = %ctx.turn_id, %reason, "turn task panicked");
                TurnOutcome::Failed {
                    error: AgentError::Internal { reason },
                    partial: ctx.writer.draft(),
                    conversation: Vec::new(),
                }
            }
        };
        if std::panic::catch_unwind(AssertUnwindSafe(|| ctx.finish(outcome))).is_err() {
            tracing::error!(turn_id = %ctx.turn_id, "observer panicked on the terminal signal");
        }
        on_exit();
    })
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

// ─── Round driver ───────────────────────────────────────────────────────────

/// How a generation round ended.
pub(crate) enum RoundEnd {
    /// Stream finished; the draft is frozen.
    Finished(DraftMessage),
    Cancelled,
    /// Failed after fallback was exhausted or no longer allowed.
    Failed(InferenceError),
}

enum AttemptEnd {
    Finished(DraftMessage),
    Cancelled,
    Failed(InferenceError),
}

/// Provider order for each attempt.
///
/// The first attempt carries no provider preference. Each fallback provider
/// then gets one attempt, led by that provider and followed by the rest.
fn provider_attempts(providers: &[String]) -> Vec<Option<&[String]>> {
    std::iter::once(None)
        .chain((0..providers.len()).map(|i| Some(&providers[i..])))
        .collect()
}

/// Run one generation round, falling back across providers as allowed.
pub(crate) async fn drive_round(
    transport: &dyn ChatTransport,
    request: &ConversationRequest,
    ctx: &TurnContext,
) -> RoundEnd {
    let round = ctx.writer.begin_round();
    let attempts = provider_attempts(&request.fallback_providers);

    tracing::debug!(turn_id = %ctx.turn_id, round, attempts = attempts.len(), "starting round");

    for (attempt, order) in attempts.iter().enumerate() {
        if attempt > 0 {
            ctx.writer.reset_draft();
        }
        let body = ChatCompletionRequest::streaming(request, *order);

        match run_attempt(transport, &body, round, ctx).await {
            AttemptEnd::Finished(draft) => return RoundEnd::Finished(draft),
            AttemptEnd::Cancelled => return RoundEnd::Cancelled,
            AttemptEnd::Failed(e) => {
                let has_next = attempt + 1 < attempts.len();
                if ctx.deltas_delivered() == 0 && e.is_retriable() && has_next {
                    tracing::warn!(
                        turn_id = %ctx.turn_id,
                        round,
                        provider = order.and_then(|o| o.first()).map(String::as_str).unwrap_or("default"),
                        error = %e,
                        "provider failed before first delta, falling back"
                    );
                    continue;
                }
                tracing::warn!(
                    turn_id = %ctx.turn_id,
                    round,
                    delivered = ctx.deltas_delivered(),
                    error = %e,
                    "round failed"
                );
                return RoundEnd::Failed(e);
            }
        }
    }

    // Unreachable: the last attempt never continues.
    RoundEnd::Failed(InferenceError::Transport {
        endpoint: transport.endpoint().to_string(),
        reason: "no provider attempt was made".into(),
    })
}

async fn run_attempt(
    transport: &dyn ChatTransport,
    body: &ChatCompletionRequest,
    round: usize,
    ctx: &TurnContext,
) -> AttemptEnd {
    let opened = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return AttemptEnd::Cancelled,
        opened = transport.open_stream(body) => opened,
    };
    let bytes = match opened {
        Ok(bytes) => bytes,
        Err(e) => return AttemptEnd::Failed(e),
    };

    let mut frames = pin!(decode_sse(bytes));
    let mut saw_done = false;

    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return AttemptEnd::Cancelled,
            frame = frames.next() => frame,
        };

        let event = match frame {
            None => break,
            Some(Err(e)) => return AttemptEnd::Failed(e),
            Some(Ok(SseFrame::Done)) => {
                saw_done = true;
                break;
            }
            Some(Ok(SseFrame::Event(event))) => event,
        };

        let deltas = match parse_deltas(&event.data) {
            Ok(deltas) => deltas,
            Err(e) => return AttemptEnd::Failed(e),
        };

        for delta in &deltas {
            if ctx.cancel.is_cancelled() {
                return AttemptEnd::Cancelled;
            }
            if !ctx.writer.apply(delta) {
                continue;
            }
            let accepted = ctx
                .writer
                .with_state(|state| ctx.gate.deliver_delta(round, delta, state));
            if !accepted {
                return AttemptEnd::Cancelled;
            }
            ctx.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    let draft = ctx.writer.draft();
    if draft.finish_reason.is_some() {
        return AttemptEnd::Finished(draft);
    }
    if saw_done {
        // Some providers omit the finish reason and just send the sentinel.
        ctx.writer.apply(&Delta::Finish(FinishReason::Stop));
        return AttemptEnd::Finished(ctx.writer.draft());
    }
    AttemptEnd::Failed(InferenceError::Transport {
        endpoint: transport.endpoint().to_string(),
        reason: "stream ended before a finish reason".into(),
    })
}

/// Assistant message for a finished draft, keeping only well-formed calls.
pub(crate) fn assistant_message(draft: &DraftMessage) -> ChatMessage {
    let calls: Vec<_> = draft
        .tool_calls
        .clone()
        .finalize()
        .into_iter()
        .filter_map(Result::ok)
        .collect();
    if calls.is_empty() {
        ChatMessage::assistant(draft.text.clone())
    } else {
        ChatMessage::assistant_with_tool_calls(draft.text.clone(), calls)
    }
}

// ─── Public session API ─────────────────────────────────────────────────────

/// A single generation round with no tool execution.
///
/// A `tool_calls` finish completes the session; the caller (or
/// [`crate::agent_core::ToolOrchestrator`]) decides what to do with the calls.
pub struct StreamSession;

impl StreamSession {
    /// Validate the request and start streaming on the current Tokio runtime.
    pub fn open(
        transport: Arc<dyn ChatTransport>,
        request: ConversationRequest,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<StreamHandle, AgentError> {
        request.validate()?;

        let (ctx, state_rx) = TurnContext::new(new_turn_id(), observer);
        let ctx = Arc::new(ctx);
        let turn_id = ctx.turn_id.clone();
        let cancel = ctx.cancel.clone();
        let gate = ctx.gate.clone();

        tracing::info!(turn_id = %turn_id, model = %request.model, "opening stream session");

        let run_ctx = ctx.clone();
        let task = spawn_turn(
            ctx,
            async move { run_single_round(transport.as_ref(), &request, &run_ctx).await },
            || {},
        );

        Ok(StreamHandle {
            turn_id,
            cancel,
            gate,
            state: state_rx,
            task,
        })
    }
}

async fn run_single_round(
    transport: &dyn ChatTransport,
    request: &ConversationRequest,
    ctx: &TurnContext,
) -> TurnOutcome {
    match drive_round(transport, request, ctx).await {
        RoundEnd::Finished(draft) => {
            let mut conversation = request.messages.clone();
            conversation.push(assistant_message(&draft));
            TurnOutcome::Completed(CompletedTurn {
                truncated: draft.is_truncated(),
                usage: ctx.writer.total_usage(),
                rounds: 1,
                conversation,
                draft,
            })
        }
        RoundEnd::Cancelled => TurnOutcome::Cancelled {
            partial: ctx.writer.draft(),
        },
        RoundEnd::Failed(e) => TurnOutcome::Failed {
            error: e.into(),
            partial: ctx.writer.draft(),
            conversation: request.messages.clone(),
        },
    }
}

// ─── Handle ─────────────────────────────────────────────────────────────────

/// Caller's handle on a running turn.
///
/// Dropping the handle does not stop the turn.
pub struct StreamHandle {
    pub(crate) turn_id: String,
    pub(crate) cancel: CancellationToken,
    pub(crate) gate: Arc<DeliveryGate>,
    pub(crate) state: watch::Receiver<StreamState>,
    pub(crate) task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    /// Cancel the turn. Once this returns, no further callbacks are made.
    ///
    /// Returns `true` if the turn was still running.
    pub fn cancel(&self) -> bool {
        cancel_turn(&self.cancel, &self.gate, &self.state)
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> StreamState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    /// Whether the terminal signal has been delivered.
    pub fn is_finished(&self) -> bool {
        self.gate.is_closed()
    }

    /// Wait for the driving task to stop and return the terminal outcome.
    ///
    /// Returns `None` only if the outcome was already taken elsewhere.
    pub async fn wait(self) -> Option<TurnOutcome> {
        if let Err(e) = self.task.await {
            tracing::error!(turn_id = %self.turn_id, error = %e, "turn task did not complete");
        }
        self.gate.take_outcome()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
