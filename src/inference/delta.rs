//! Delta parsing and folding.
//!
//! Each decoded SSE payload becomes zero or more typed [`Delta`]s, which are
//! folded into a [`DraftMessage`]: text is concatenated, tool-call fragments
//! go to the accumulator, and the first finish reason freezes the draft.

use serde::Serialize;

use super::accumulator::ToolCallAccumulator;
use super::errors::InferenceError;
use super::types::ChatCompletionChunk;

/// Payload excerpt length kept in decode errors.
const MAX_PAYLOAD_EXCERPT: usize = 512;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Why a generation round stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" => FinishReason::Stop,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "length" | "max_tokens" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other(s) => s,
        }
    }

    /// The output was cut short by a limit or a filter.
    pub fn is_truncation(&self) -> bool {
        matches!(self, FinishReason::Length | FinishReason::ContentFilter)
    }
}

/// What the owner of a frozen draft should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Complete,
    CompleteTruncated,
    RunTools,
}

/// Token counters for one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    /// Fold a newer report in, never letting a counter go backwards.
    ///
    /// Returns `true` if anything changed.
    pub fn merge_monotonic(&mut self, other: Usage) -> bool {
        let before = *self;
        self.prompt_tokens = self.prompt_tokens.max(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.max(other.completion_tokens);
        before != *self
    }

    /// Sum two rounds' usage.
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
    }
}

/// One typed increment decoded from an event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    Text(String),
    ToolCall {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Finish(FinishReason),
    Usage(Usage),
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

/// Parse one event's JSON payload into deltas.
///
/// Within a payload the order is: text, tool-call fragments, usage, finish.
/// Only the first choice is considered. An `error` object in the payload
/// becomes [`InferenceError::Upstream`].
pub fn parse_deltas(payload: &str) -> Result<Vec<Delta>, InferenceError> {
    let chunk: ChatCompletionChunk =
        serde_json::from_str(payload).map_err(|e| InferenceError::Decode {
            reason: format!("failed to parse SSE chunk: {e}"),
            payload: excerpt(payload),
        })?;

    if let Some(error) = chunk.error {
        return Err(InferenceError::Upstream {
            code: error.code.as_ref().and_then(|c| {
                c.as_i64()
                    .or_else(|| c.as_str().and_then(|s| s.parse().ok()))
            }),
            message: error.message,
        });
    }

    let mut deltas = Vec::new();
    let choice = chunk.choices.into_iter().find(|c| c.index == 0);
    let mut finish = None;

    if let Some(choice) = choice {
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            deltas.push(Delta::Text(content));
        }

        for (position, tc) in choice.delta.tool_calls.unwrap_or_default().into_iter().enumerate() {
            let (name, arguments) = match tc.function {
                Some(f) => (f.name, f.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            deltas.push(Delta::ToolCall {
                index: tc.index.unwrap_or(position as u32),
                id: tc.id,
                name,
                arguments,
            });
        }

        finish = choice
            .finish_reason
            .filter(|r| !r.is_empty())
            .map(|r| FinishReason::parse(&r));
    }

    if let Some(usage) = chunk.usage {
        deltas.push(Delta::Usage(Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }));
    }

    if let Some(reason) = finish {
        deltas.push(Delta::Finish(reason));
    }

    Ok(deltas)
}

fn excerpt(payload: &str) -> String {
    if payload.len() <= MAX_PAYLOAD_EXCERPT {
        return payload.to_string();
    }
    let mut end = MAX_PAYLOAD_EXCERPT;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &payload[..end])
}

// ─── Draft ───────────────────────────────────────────────────────────────────

/// The assistant message being built by one generation round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftMessage {
    pub text: String,
    pub tool_calls: ToolCallAccumulator,
    pub usage: Usage,
    pub finish_reason: Option<FinishReason>,
}

impl DraftMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one delta in. Returns `true` if the draft changed.
    ///
    /// Once a finish reason has been seen the draft is frozen: later text,
    /// tool-call and finish deltas are ignored. Usage is still folded.
    pub fn apply(&mut self, delta: &Delta) -> bool {
        match delta {
            Delta::Usage(usage) => self.usage.merge_monotonic(*usage),
            _ if self.is_frozen() => {
                tracing::debug!(?delta, "ignoring delta after finish reason");
                false
            }
            Delta::Text(text) => {
                self.text.push_str(text);
                true
            }
            Delta::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                self.tool_calls
                    .feed(*index, id.as_deref(), name.as_deref(), arguments);
                true
            }
            Delta::Finish(reason) => {
                self.finish_reason = Some(reason.clone());
                true
            }
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.finish_reason.is_some()
    }

    pub fn is_truncated(&self) -> bool {
        self.finish_reason
            .as_ref()
            .is_some_and(FinishReason::is_truncation)
    }

    /// Decision implied by the finish reason, once frozen.
    pub fn next_action(&self) -> Option<NextAction> {
        self.finish_reason.as_ref().map(|reason| match reason {
            FinishReason::ToolCalls => NextAction::RunTools,
            r if r.is_truncation() => NextAction::CompleteTruncated,
            _ => NextAction::Complete,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(payloads: &[&str]) -> DraftMessage {
        let mut draft = DraftMessage::new();
        for payload in payloads {
            for delta in parse_deltas(payload).unwrap() {
                draft.apply(&delta);
            }
        }
        draft
    }

    #[test]
    fn test_hello_scenario() {
        let draft = fold(&[
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        ]);
        assert_eq!(draft.text, "Hello");
        assert_eq!(draft.finish_reason, Some(FinishReason::Stop));
        assert_eq!(draft.next_action(), Some(NextAction::Complete));
    }

    #[test]
    fn test_tool_call_fragments() {
        let mut draft = fold(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"calculate","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"expression\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"2+2\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ]);
        assert_eq!(draft.next_action(), Some(NextAction::RunTools));
        let call = draft.tool_calls.finalize().remove(0).unwrap();
        assert_eq!(call.id, "call_1");
        assert_eq!(call.name, "calculate");
        assert_eq!(call.arguments, "{\"expression\":\"2+2\"}");
    }

    #[test]
    fn test_truncation_reasons() {
        let draft = fold(&[r#"{"choices":[{"delta":{"content":"abc"},"finish_reason":"length"}]}"#]);
        assert!(draft.is_truncated());
        assert_eq!(draft.next_action(), Some(NextAction::CompleteTruncated));
        assert_eq!(draft.text, "abc");

        let draft = fold(&[r#"{"choices":[{"delta":{},"finish_reason":"content_filter"}]}"#]);
        assert_eq!(draft.next_action(), Some(NextAction::CompleteTruncated));
    }

    #[test]
    fn test_frozen_draft_ignores_content_but_folds_usage() {
        let draft = fold(&[
            r#"{"choices":[{"delta":{"content":"done"},"finish_reason":"stop"}]}"#,
            r#"{"choices":[{"delta":{"content":" extra"}}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#,
        ]);
        assert_eq!(draft.text, "done");
        assert_eq!(draft.usage.total(), 15);
    }

    #[test]
    fn test_usage_never_decreases() {
        let draft = fold(&[
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":8}}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#,
        ]);
        assert_eq!(draft.usage.completion_tokens, 8);
        assert_eq!(draft.usage.prompt_tokens, 10);
    }

    #[test]
    fn test_usage_total_saturates() {
        let payload = format!(
            r#"{{"choices":[],"usage":{{"prompt_tokens":{},"completion_tokens":7}}}}"#,
            u32::MAX
        );
        let draft = fold(&[payload.as_str()]);
        assert_eq!(draft.usage.total(), u32::MAX);
    }

    #[test]
    fn test_delta_order_within_payload() {
        let deltas = parse_deltas(
            r#"{"choices":[{"delta":{"content":"x","tool_calls":[{"index":0,"id":"a","function":{"name":"f","arguments":"{}"}}]},"finish_reason":"tool_calls"}],"usage":{"prompt_tokens":1,"completion_tokens":2}}"#,
        )
        .unwrap();
        assert!(matches!(deltas[0], Delta::Text(_)));
        assert!(matches!(deltas[1], Delta::ToolCall { index: 0, .. }));
        assert!(matches!(deltas[2], Delta::Usage(_)));
        assert_eq!(deltas[3], Delta::Finish(FinishReason::ToolCalls));
    }

    #[test]
    fn test_role_only_and_empty_content_produce_nothing() {
        let deltas = parse_deltas(r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#).unwrap();
        assert!(deltas.is_empty());
    }

    #[test]
    fn test_decode_error_keeps_excerpt() {
        let err = parse_deltas("{not json").unwrap_err();
        match err {
            InferenceError::Decode { payload, .. } => assert_eq!(payload, "{not json"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_upstream_error_payload() {
        let err = parse_deltas(r#"{"error":{"code":429,"message":"Rate limit exceeded"}}"#).unwrap_err();
        assert!(matches!(
            err,
            InferenceError::Upstream { code: Some(429), ref message } if message == "Rate limit exceeded"
        ));
    }

    #[test]
    fn test_finish_reason_parse() {
        assert_eq!(FinishReason::parse("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::parse("function_call"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::parse("error"), FinishReason::Other("error".into()));
        assert_eq!(FinishReason::Other("error".into()).as_str(), "error");
    }
}
