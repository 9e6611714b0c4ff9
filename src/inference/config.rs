//! Gateway configuration loading and validation.
//!
//! Reads `gateway-chat.yaml` and resolves environment variables. Config is the
//! single source of truth for the gateway endpoint, default model, provider
//! fallback list, and tool-loop limits.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::InferenceError;

/// File name searched for by [`find_config_path`].
pub const CONFIG_FILE_NAME: &str = "gateway-chat.yaml";

/// Env var that overrides config discovery.
pub const CONFIG_ENV_VAR: &str = "GATEWAY_CHAT_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration (mirrors `gateway-chat.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the OpenAI-compatible gateway, e.g. `https://openrouter.ai/api/v1`.
    pub base_url: String,
    /// Bearer token, normally given as `${SOME_ENV_VAR}`.
    #[serde(default)]
    pub api_key: Option<String>,
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Ordered provider identifiers; the first is the primary.
    #[serde(default)]
    pub fallback_providers: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_fallbacks: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Whole-request ceiling for a streaming exchange.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    /// Sent as `X-Title` for gateway-side attribution.
    #[serde(default)]
    pub app_name: Option<String>,
    /// Sent as `HTTP-Referer` for gateway-side attribution.
    #[serde(default)]
    pub app_url: Option<String>,
    /// Directory for `gateway-chat.log`; logs go to stderr when absent.
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Emit one JSON object per log event instead of text lines.
    #[serde(default)]
    pub log_json: bool,
    #[serde(default)]
    pub tools: ToolLoopConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Limits for the tool-calling loop.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolLoopConfig {
    /// Maximum generation rounds per turn.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// Tool calls executed at once within a round.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Per-call deadline.
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Longest tool output fed back to the model, in bytes. `0` disables
    /// truncation.
    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: usize,
}

impl ToolLoopConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            concurrency: default_concurrency(),
            timeout_secs: default_tool_timeout_secs(),
            max_result_bytes: default_max_result_bytes(),
        }
    }
}

/// Stream registry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// How long a finished turn stays readable. `0` evicts immediately.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl RegistryConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
        }
    }
}

fn default_temperature() -> f32 {
    0.7
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_stream_timeout_secs() -> u64 {
    300
}
fn default_max_rounds() -> usize {
    5
}
fn default_concurrency() -> usize {
    4
}
fn default_tool_timeout_secs() -> u64 {
    30
}
fn default_max_result_bytes() -> usize {
    6_000
}
fn default_retention_secs() -> u64 {
    30
}

impl GatewayConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), InferenceError> {
        let reason = if self.base_url.trim().is_empty() {
            "base_url is empty"
        } else if self.default_model.trim().is_empty() {
            "default_model is empty"
        } else if self.tools.max_rounds == 0 {
            "tools.max_rounds must be at least 1"
        } else if self.tools.concurrency == 0 {
            "tools.concurrency must be at least 1"
        } else {
            return Ok(());
        };
        Err(InferenceError::ConfigError {
            reason: reason.into(),
        })
    }

    /// `log_dir` with `~` expanded.
    pub fn log_dir_path(&self) -> Option<PathBuf> {
        self.log_dir
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(|d| PathBuf::from(expand_tilde(d)))
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `GATEWAY_CHAT_CONFIG` first, then searches upward from `start` for
/// `gateway-chat.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, InferenceError> {
    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(InferenceError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load, interpolate, parse and validate the configuration file.
///
/// Performs environment-variable interpolation on values matching
/// `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_gateway_config(path: &Path) -> Result<GatewayConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    parse_gateway_config(&raw)
}

/// Parse configuration text (already read from disk).
pub fn parse_gateway_config(raw: &str) -> Result<GatewayConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);

    let config: GatewayConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        base_url: "https://gateway.example/api/v1"
        default_model: "openai/gpt-4o-mini"
    "#;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__GATEWAY_TEST_NONEXISTENT__");
        let result = interpolate_env_vars("${__GATEWAY_TEST_NONEXISTENT__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__GATEWAY_TEST_KEY__", "sk-test");
        let result = interpolate_env_vars("api_key: ${__GATEWAY_TEST_KEY__}");
        assert_eq!(result, "api_key: sk-test");
        std::env::remove_var("__GATEWAY_TEST_KEY__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with $ and { but no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/logs");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/logs"));
    }

    #[test]
    fn test_defaults() {
        let config = parse_gateway_config(MINIMAL).unwrap();
        assert_eq!(config.temperature, 0.7);
        assert!(config.fallback_providers.is_empty());
        assert!(config.allow_fallbacks);
        assert_eq!(config.tools.max_rounds, 5);
        assert_eq!(config.tools.concurrency, 4);
        assert_eq!(config.tools.timeout(), Duration::from_secs(30));
        assert_eq!(config.tools.max_result_bytes, 6_000);
        assert_eq!(config.registry.retention(), Duration::from_secs(30));
        assert!(config.api_key.is_none());
        assert!(config.log_dir_path().is_none());
        assert!(!config.log_json);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
            base_url: "https://gateway.example/api/v1"
            api_key: "sk-abc"
            default_model: "anthropic/claude-3.5-sonnet"
            temperature: 0.2
            fallback_providers: ["anthropic", "amazon-bedrock"]
            allow_fallbacks: false
            app_name: "gateway-chat"
            tools:
              max_rounds: 3
              concurrency: 2
              timeout_secs: 5
            registry:
              retention_secs: 0
        "#;
        let config = parse_gateway_config(yaml).unwrap();
        assert_eq!(config.fallback_providers, vec!["anthropic", "amazon-bedrock"]);
        assert!(!config.allow_fallbacks);
        assert_eq!(config.tools.max_rounds, 3);
        assert_eq!(config.registry.retention_secs, 0);
        assert_eq!(config.app_name.as_deref(), Some("gateway-chat"));
    }

    #[test]
    fn test_validation_rejects_zero_rounds() {
        let yaml = format!("{MINIMAL}\n        tools:\n          max_rounds: 0\n");
        let err = parse_gateway_config(&yaml).unwrap_err();
        assert!(err.to_string().contains("max_rounds"));
    }

    #[test]
    fn test_load_from_file_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, MINIMAL).unwrap();

        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, path);

        let config = load_gateway_config(&found).unwrap();
        assert_eq!(config.default_model, "openai/gpt-4o-mini");
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_gateway_config(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, InferenceError::ConfigError { .. }));
    }
}
