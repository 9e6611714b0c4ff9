//! Tool-call fragment reassembly.
//!
//! Streaming gateways split each tool call across many deltas: the id and
//! function name usually arrive with the first fragment for an index, and the
//! JSON arguments trickle in as arbitrary substrings. The accumulator keys
//! fragments by index and validates the assembled calls on `finalize`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::InferenceError;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Assembly state of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Pending,
    Complete,
}

/// A model-requested tool invocation.
///
/// `arguments` is syntactically valid JSON exactly when `state` is `Complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub state: ToolCallState,
}

impl ToolCall {
    /// A finished call, e.g. when rebuilding history from storage.
    pub fn complete(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            state: ToolCallState::Complete,
        }
    }
}

/// In-progress call at one fragment index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PendingToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

// ─── Accumulator ─────────────────────────────────────────────────────────────

/// Reassembles tool calls from streamed fragments, ordered by index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallAccumulator {
    pending: BTreeMap<u32, PendingToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one fragment to the call at `index`, creating it on first sighting.
    ///
    /// The first non-empty id wins. Name fragments are concatenated, except
    /// that a provider repeating the full name on every fragment is tolerated.
    pub fn feed(&mut self, index: u32, id: Option<&str>, name: Option<&str>, arguments: &str) {
        let call = self.pending.entry(index).or_default();

        if let Some(id) = id.filter(|id| !id.is_empty()) {
            if call.id.is_none() {
                call.id = Some(id.to_string());
            }
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            if call.name != name {
                call.name.push_str(name);
            }
        }
        call.arguments.push_str(arguments);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of the calls seen so far, all in `Pending` state.
    pub fn pending_calls(&self) -> Vec<ToolCall> {
        self.pending
            .values()
            .map(|call| ToolCall {
                id: call.id.clone().unwrap_or_default(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                state: ToolCallState::Pending,
            })
            .collect()
    }

    /// Validate and drain every accumulated call, in ascending index order.
    ///
    /// A call with an empty name or unparseable arguments yields a
    /// `MalformedToolCall` error in its slot; sibling calls are unaffected.
    /// Empty argument text is treated as `{}`.
    pub fn finalize(&mut self) -> Vec<Result<ToolCall, InferenceError>> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(index, call)| finalize_one(index, call))
            .collect()
    }
}

fn finalize_one(index: u32, call: PendingToolCall) -> Result<ToolCall, InferenceError> {
    let PendingToolCall {
        id,
        name,
        arguments,
    } = call;

    if name.trim().is_empty() {
        return Err(InferenceError::MalformedToolCall {
            index,
            id,
            name,
            reason: "empty tool name".into(),
        });
    }

    let arguments = if arguments.trim().is_empty() {
        "{}".to_string()
    } else {
        arguments
    };

    if let Err(e) = serde_json::from_str::<serde_json::Value>(&arguments) {
        return Err(InferenceError::MalformedToolCall {
            index,
            id,
            name,
            reason: format!("invalid JSON arguments: {e}"),
        });
    }

    Ok(ToolCall {
        id: id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4())),
        name,
        arguments,
        state: ToolCallState::Complete,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
