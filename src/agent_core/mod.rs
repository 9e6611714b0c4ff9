//! Agent Core — turn lifecycle on top of the inference layer.
//!
//! Submodules:
//! - `session`: One generation round: transport → SSE → deltas → draft, with provider fallback
//! - `orchestrator`: Multi-round tool-calling loop with bounded, ordered tool execution
//! - `registry`: Process-wide index of in-flight turns, cancellation and retention
//! - `tools`: Tool trait and registry of executable tools
//! - `state`: Observable per-turn state and terminal outcomes
//! - `observer`: Caller callbacks and the exactly-once delivery gate
//! - `errors`: Agent-level error types

pub mod errors;
pub mod observer;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod state;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use errors::{AgentError, ToolExecutionError};
pub use observer::{ChannelObserver, NoopObserver, StreamEvent, StreamObserver, StreamUpdate};
pub use orchestrator::ToolOrchestrator;
pub use registry::StreamRegistry;
pub use session::{StreamHandle, StreamSession};
pub use state::{CompletedTurn, StateWriter, StreamState, StreamStatus, TurnOutcome};
pub use tools::{parse_arguments, FnTool, Tool, ToolRegistry};
