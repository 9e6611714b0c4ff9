//! gateway-chat — streaming chat-completion engine for OpenAI-compatible
//! LLM gateways.
//!
//! - [`inference`]: SSE decoding, delta merging, tool-call reassembly,
//!   request types, configuration and the HTTP transport
//! - [`agent_core`]: stream sessions, the tool-calling loop and the
//!   process-wide stream registry
//! - [`logging`]: tracing subscriber setup

pub mod agent_core;
pub mod inference;
pub mod logging;
