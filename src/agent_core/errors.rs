//! Agent Core error types.

use thiserror::Error;

use crate::inference::errors::InferenceError;

/// Errors surfaced as the failure reason of a turn.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// The turn already has a non-terminal stream.
    #[error("turn '{turn_id}' already has an active stream")]
    AlreadyStreaming { turn_id: String },

    /// The tool loop hit its round limit while the model still wanted tools.
    #[error("tool loop exceeded {max_rounds} rounds")]
    DepthExceeded { max_rounds: usize },

    /// The caller cancelled the turn.
    #[error("stream cancelled")]
    Cancelled,

    /// The task driving the turn panicked.
    #[error("internal error: {reason}")]
    Internal { reason: String },

    /// Transport, HTTP, decode or request-validation failure.
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Errors a tool may report. Always fed back to the model as tool-result
/// text, never surfaced as a turn failure.
#[derive(Debug, Clone, Error)]
pub enum ToolExecutionError {
    #[error("tool failed: {reason}")]
    Failed { reason: String },

    #[error("tool timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("invalid arguments: {reason}")]
    InvalidArguments { reason: String },

    #[error("tool panicked: {reason}")]
    Panicked { reason: String },
}

impl From<serde_json::Error> for ToolExecutionError {
    fn from(e: serde_json::Error) -> Self {
        ToolExecutionError::InvalidArguments {
            reason: e.to_string(),
        }
    }
}
