//! Tool orchestrator — the multi-round tool-calling loop.
//!
//! Each round is one stream session. When a round finishes with
//! `tool_calls`, the assistant message (text plus calls) is appended to the
//! conversation, every call is executed, one tool message per call is
//! appended in call order, and the next round starts from the extended
//! history. The loop ends on any other finish reason, on failure, on
//! cancellation, or when `max_rounds` sessions have been used.
//!
//! Tool failures never fail the turn: unknown tools, malformed calls, tool
//! errors, timeouts and panics all become `error: ...` tool messages the
//! model can read and react to.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::inference::accumulator::ToolCall;
use crate::inference::config::ToolLoopConfig;
use crate::inference::delta::{DraftMessage, NextAction};
use crate::inference::errors::InferenceError;
use crate::inference::transport::ChatTransport;
use crate::inference::types::{ChatMessage, ConversationRequest};

use super::errors::{AgentError, ToolExecutionError};
use super::observer::NoopObserver;
use super::session::{drive_round, new_turn_id, RoundEnd, TurnContext};
use super::state::{CompletedTurn, StreamStatus, TurnOutcome};
use super::tools::{Tool, ToolRegistry};

// ─── Planned calls ──────────────────────────────────────────────────────────

/// A finalized call from the model, ready to run or already rejected.
#[derive(Debug, Clone)]
enum PlannedCall {
    Execute(ToolCall),
    /// Echoed to the model with `{}` arguments and an error result.
    Rejected { call: ToolCall, reason: String },
}

impl PlannedCall {
    fn call(&self) -> &ToolCall {
        match self {
            PlannedCall::Execute(call) | PlannedCall::Rejected { call, .. } => call,
        }
    }
}

fn plan_calls(draft: &DraftMessage) -> Vec<PlannedCall> {
    draft
        .tool_calls
        .clone()
        .finalize()
        .into_iter()
        .map(|result| match result {
            Ok(call) => PlannedCall::Execute(call),
            Err(InferenceError::MalformedToolCall {
                index,
                id,
                name,
                reason,
            }) => {
                tracing::warn!(index, tool = %name, %reason, "malformed tool call");
                let id = id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));
                PlannedCall::Rejected {
                    call: ToolCall::complete(id, name, "{}"),
                    reason,
                }
            }
            Err(other) => PlannedCall::Rejected {
                call: ToolCall::complete(format!("call_{}", Uuid::new_v4()), "", "{}"),
                reason: other.to_string(),
            },
        })
        .collect()
}

/// Aborts the wrapped task when dropped (e.g. when the round is cancelled).
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ─── ToolOrchestrator ───────────────────────────────────────────────────────

/// Runs conversation turns that may call tools.
pub struct ToolOrchestrator {
    transport: Arc<dyn ChatTransport>,
    tools: Arc<ToolRegistry>,
    config: ToolLoopConfig,
}

impl ToolOrchestrator {
    pub fn new(transport: Arc<dyn ChatTransport>, tools: Arc<ToolRegistry>, config: ToolLoopConfig) -> Self {
        Self {
            transport,
            tools,
            config,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.config.max_rounds = max_rounds;
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }

    fn max_rounds(&self) -> usize {
        self.config.max_rounds.max(1)
    }

    /// Run a turn to completion without an observer.
    ///
    /// Validation failures come back as a `Failed` outcome before any
    /// network activity.
    pub async fn run(&self, request: ConversationRequest) -> TurnOutcome {
        if let Err(e) = request.validate() {
            return TurnOutcome::Failed {
                error: e.into(),
                partial: DraftMessage::new(),
                conversation: request.messages,
            };
        }
        let (ctx, _state) = TurnContext::new(new_turn_id(), Arc::new(NoopObserver));
        let outcome = self.run_turn(request, &ctx).await;
        ctx.finish(outcome.clone());
        outcome
    }

    /// Drive every round of a turn. The caller delivers the outcome.
    pub(crate) async fn run_turn(&self, request: ConversationRequest, ctx: &TurnContext) -> TurnOutcome {
        let request = self.prepare_request(request);
        let tools_active = request.tools_enabled && !request.tools.is_empty();
        let max_rounds = self.max_rounds();
        let mut conversation = request.messages.clone();

        tracing::info!(
            turn_id = %ctx.turn_id,
            model = %request.model,
            tool_count = request.tools.len(),
            max_rounds,
            "starting turn"
        );

        for round in 1..=max_rounds {
            let round_request = request.with_messages(conversation.clone());

            let draft = match drive_round(self.transport.as_ref(), &round_request, ctx).await {
                RoundEnd::Finished(draft) => draft,
                RoundEnd::Cancelled => {
                    return TurnOutcome::Cancelled {
                        partial: ctx.writer.draft(),
                    }
                }
                RoundEnd::Failed(e) => {
                    return TurnOutcome::Failed {
                        error: e.into(),
                        partial: ctx.writer.draft(),
                        conversation,
                    }
                }
            };

            let wants_tools = draft.next_action() == Some(NextAction::RunTools);
            let planned = if wants_tools && tools_active {
                plan_calls(&draft)
            } else {
                Vec::new()
            };

            if planned.is_empty() {
                if wants_tools {
                    tracing::warn!(
                        turn_id = %ctx.turn_id,
                        round,
                        tools_active,
                        "tool_calls finish without runnable calls, completing turn"
                    );
                }
                conversation.push(ChatMessage::assistant(draft.text.clone()));
                return TurnOutcome::Completed(CompletedTurn {
                    truncated: draft.is_truncated(),
                    usage: ctx.writer.total_usage(),
                    rounds: round,
                    conversation,
                    draft,
                });
            }

            let echoed: Vec<ToolCall> = planned.iter().map(|p| p.call().clone()).collect();
            conversation.push(ChatMessage::assistant_with_tool_calls(
                draft.text.clone(),
                echoed,
            ));

            if round == max_rounds {
                tracing::warn!(
                    turn_id = %ctx.turn_id,
                    max_rounds,
                    pending_calls = planned.len(),
                    "round limit reached with tool calls outstanding"
                );
                return TurnOutcome::Failed {
                    error: AgentError::DepthExceeded { max_rounds },
                    partial: draft,
                    conversation,
                };
            }

            ctx.writer.set_status(StreamStatus::ToolExecuting);
            tracing::info!(
                turn_id = %ctx.turn_id,
                round,
                calls = planned.len(),
                "executing tool calls"
            );

            let results = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    return TurnOutcome::Cancelled { partial: draft };
                }
                results = self.execute_round(&planned) => results,
            };
            conversation.extend(results);
        }

        // Only reachable if the loop body never ran.
        TurnOutcome::Failed {
            error: AgentError::DepthExceeded { max_rounds },
            partial: DraftMessage::new(),
            conversation,
        }
    }

    /// Fill in the registry's definitions when tools are enabled but none
    /// were declared on the request.
    fn prepare_request(&self, mut request: ConversationRequest) -> ConversationRequest {
        if request.tools_enabled && request.tools.is_empty() {
            request.tools = self.tools.definitions();
        }
        request
    }

    /// Execute one round's calls with bounded concurrency. Results come back
    /// in call order regardless of completion order.
    async fn execute_round(&self, planned: &[PlannedCall]) -> Vec<ChatMessage> {
        let limit = self.config.concurrency.max(1);
        stream::iter(planned.iter().cloned())
            .map(|call| self.invoke(call))
            .buffered(limit)
            .collect()
            .await
    }

    async fn invoke(&self, planned: PlannedCall) -> ChatMessage {
        let call = match planned {
            PlannedCall::Rejected { call, reason } => {
                return ChatMessage::tool_result(call.id, format!("error: malformed tool call: {reason}"));
            }
            PlannedCall::Execute(call) => call,
        };

        let Some(tool) = self.tools.get(&call.name) else {
            let suggestions = self.tools.find_similar(&call.name, 3);
            tracing::warn!(tool = %call.name, ?suggestions, "model called an unknown tool");
            let mut text = format!("error: tool not found: '{}'", call.name);
            if !suggestions.is_empty() {
                text.push_str(&format!(" (did you mean: {}?)", suggestions.join(", ")));
            }
            return ChatMessage::tool_result(call.id, text);
        };

        if let Err(e) = self.tools.validate_arguments(&call.name, &call.arguments) {
            return ChatMessage::tool_result(call.id, format!("error: {e}"));
        }

        let timeout = self.config.timeout();
        let started = Instant::now();
        let result = run_tool(tool, call.arguments.clone(), timeout).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let text = match result {
            Ok(output) => {
                tracing::info!(tool = %call.name, call_id = %call.id, duration_ms, "tool call succeeded");
                truncate_result(output, self.config.max_result_bytes, &call.name)
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, call_id = %call.id, duration_ms, error = %e, "tool call failed");
                format!("error: {e}")
            }
        };
        ChatMessage::tool_result(call.id, text)
    }
}

/// Cap tool output at `max_bytes` (on a char boundary). `0` means no cap.
fn truncate_result(output: String, max_bytes: usize, tool_name: &str) -> String {
    if max_bytes == 0 || output.len() <= max_bytes {
        return output;
    }
    let mut end = max_bytes;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    tracing::warn!(
        tool = %tool_name,
        original_len = output.len(),
        truncated_to = end,
        "tool result truncated"
    );
    format!(
        "{}\n\n[... truncated: showing first {end} of {} bytes]",
        &output[..end],
        output.len()
    )
}

/// Run a tool on its own task under a deadline. A panic inside the tool is
/// contained to that task.
async fn run_tool(
    tool: Arc<dyn Tool>,
    arguments: String,
    timeout: Duration,
) -> Result<String, ToolExecutionError> {
    let handle = tokio::spawn(async move {
        tokio::time::timeout(timeout, tool.execute(&arguments, timeout)).await
    });
    let _guard = AbortOnDrop(handle.abort_handle());

    match handle.await {
        Ok(Ok(result)) => result,
        Ok(Err(_elapsed)) => Err(ToolExecutionError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
        Err(join_err) => Err(ToolExecutionError::Panicked {
            reason: join_err.to_string(),
        }),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
