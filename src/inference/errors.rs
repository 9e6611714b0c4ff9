//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility — these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors that can occur while talking to the gateway or decoding its stream.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the gateway failed, or the body stream broke.
    #[error("transport error talking to {endpoint}: {reason}")]
    Transport {
        endpoint: String,
        reason: String,
    },

    /// The gateway did not respond within the configured timeout.
    #[error("gateway timeout after {duration_secs}s")]
    Timeout {
        duration_secs: u64,
    },

    /// Non-2xx HTTP response (auth, rate limit, insufficient balance, ...).
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        status: u16,
        body: String,
    },

    /// An event payload could not be parsed.
    #[error("decode error: {reason}")]
    Decode {
        reason: String,
        payload: String,
    },

    /// The gateway reported an error object inside the event stream.
    #[error("upstream error{}: {message}", .code.map(|c| format!(" [{c}]")).unwrap_or_default())]
    Upstream {
        code: Option<i64>,
        message: String,
    },

    /// A finalized tool call had no name or its arguments were not valid JSON.
    #[error("malformed tool call #{index} ({name}): {reason}")]
    MalformedToolCall {
        index: u32,
        id: Option<String>,
        name: String,
        reason: String,
    },

    /// The conversation request violates its invariants.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        reason: String,
    },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl InferenceError {
    /// Whether this error, seen before any delta was delivered, should move
    /// the session on to the next fallback provider.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            InferenceError::Transport { .. }
                | InferenceError::Timeout { .. }
                | InferenceError::HttpStatus { .. }
                | InferenceError::Decode { .. }
                | InferenceError::Upstream { .. }
        )
    }

    /// HTTP status code, if this is an `HttpStatus` error.
    pub fn status(&self) -> Option<u16> {
        match self {
            InferenceError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Extract the error body text, if this is an `HttpStatus` error.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpStatus { body, .. } => Some(body),
            _ => None,
        }
    }
}
