//! Inference — wire-level pieces of the gateway protocol.
//!
//! This module handles everything between raw bytes and typed deltas:
//! - SSE decoding across arbitrary chunk boundaries
//! - Delta parsing and folding into a draft message
//! - Tool-call fragment reassembly
//! - Request construction and the HTTP transport
//! - Configuration loading from `gateway-chat.yaml`
//!
//! The gateway speaks the OpenAI Chat Completions API and multiplexes many
//! model providers behind it; switching model or provider order is a config
//! or request change, not a code change.

pub mod accumulator;
pub mod client;
pub mod config;
pub mod delta;
pub mod errors;
pub mod sse;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use accumulator::{ToolCall, ToolCallAccumulator, ToolCallState};
pub use client::GatewayClient;
pub use config::GatewayConfig;
pub use delta::{Delta, DraftMessage, FinishReason, NextAction, Usage};
pub use errors::InferenceError;
pub use sse::{SseDecoder, SseEvent};
pub use transport::{ByteStream, ChatTransport};
pub use types::{ChatMessage, ContentPart, ConversationRequest, Role, ToolChoice, ToolDefinition};
