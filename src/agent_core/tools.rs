//! Tool registry — name → executable tool, plus the definitions advertised
//! to the model.
//!
//! Provides:
//! - Registration and lookup by name
//! - OpenAI-style function definitions, sorted by name
//! - A structural check of arguments against the declared schema
//! - Near-miss suggestions for unknown tool names

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::inference::types::ToolDefinition;

use super::errors::ToolExecutionError;

// ─── Tool trait ─────────────────────────────────────────────────────────────

/// An executable tool the model may call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn parameter_schema(&self) -> Value;

    /// Run the tool with the raw JSON argument text.
    ///
    /// `timeout` is the deadline the orchestrator enforces; it is passed in so
    /// tools that call out can bound their own I/O.
    async fn execute(&self, arguments: &str, timeout: Duration) -> Result<String, ToolExecutionError>;
}

/// Deserialize tool arguments into a typed struct.
pub fn parse_arguments<T: DeserializeOwned>(arguments: &str) -> Result<T, ToolExecutionError> {
    Ok(serde_json::from_str(arguments)?)
}

/// A tool backed by an async closure over the parsed arguments.
pub struct FnTool<F> {
    name: String,
    description: String,
    schema: Value,
    handler: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ToolExecutionError>> + Send,
{
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: F,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ToolExecutionError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameter_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, arguments: &str, _timeout: Duration) -> Result<String, ToolExecutionError> {
        let args: Value = parse_arguments(arguments)?;
        (self.handler)(args).await
    }
}

// ─── ToolRegistry ───────────────────────────────────────────────────────────

/// Tools available to the orchestrator, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Returns the tool it replaced, if any.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        tracing::debug!(tool = %name, "registering tool");
        self.tools.insert(name, tool)
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Sorted tool names.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Function definitions for the request body, sorted by name so the
    /// prompt is stable across runs.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tool_names()
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                ToolDefinition::function(tool.name(), tool.description(), tool.parameter_schema())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check that every `required` field of the tool's schema is present.
    ///
    /// This is a structural check only. Type validation is left to the tool.
    pub fn validate_arguments(&self, tool_name: &str, arguments: &str) -> Result<(), ToolExecutionError> {
        let Some(tool) = self.tools.get(tool_name) else {
            return Ok(());
        };
        let schema = tool.parameter_schema();
        let Some(required) = schema.get("required").and_then(Value::as_array) else {
            return Ok(());
        };

        let args: Value = parse_arguments(arguments)?;
        let args_obj = args.as_object();
        for field_name in required.iter().filter_map(Value::as_str) {
            let has_field = args_obj
                .map(|obj| obj.contains_key(field_name))
                .unwrap_or(false);
            if !has_field {
                return Err(ToolExecutionError::InvalidArguments {
                    reason: format!("missing required field: '{field_name}'"),
                });
            }
        }
        Ok(())
    }

    /// Up to `max_results` registered names close to `name`, best first.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let mut scored: Vec<(&str, f64)> = self
            .tools
            .keys()
            .map(|candidate| (candidate.as_str(), similarity(name, candidate)))
            .filter(|(_, score)| *score > 0.3)
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name.to_string()).collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

// ─── Edit distance ──────────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// 0.0 = nothing in common, 1.0 = identical.
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
