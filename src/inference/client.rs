//! OpenAI-compatible gateway client.
//!
//! Sends streaming chat completion requests to the gateway and hands the raw
//! body back as a byte stream. Status classification happens here; decoding
//! and provider fallback belong to the stream session.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::Client as HttpClient;

use super::config::GatewayConfig;
use super::errors::InferenceError;
use super::transport::{ByteStream, ChatTransport};
use super::types::ChatCompletionRequest;

// ─── GatewayClient ───────────────────────────────────────────────────────────

/// HTTP client for the gateway's `/chat/completions` endpoint.
pub struct GatewayClient {
    http: HttpClient,
    url: String,
    api_key: Option<String>,
    app_name: Option<String>,
    app_url: Option<String>,
    stream_timeout: Duration,
}

impl GatewayClient {
    /// Create a client from the gateway configuration.
    ///
    /// Does NOT check connectivity — that happens on the first request.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, InferenceError> {
        let base_url = config.base_url.trim_end_matches('/');
        let stream_timeout = Duration::from_secs(config.stream_timeout_secs);

        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(stream_timeout)
            .build()
            .map_err(|e| InferenceError::Transport {
                endpoint: base_url.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            url: format!("{base_url}/chat/completions"),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            app_name: config.app_name.clone(),
            app_url: config.app_url.clone(),
            stream_timeout,
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                duration_secs: self.stream_timeout.as_secs(),
            }
        } else {
            InferenceError::Transport {
                endpoint: self.url.clone(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl ChatTransport for GatewayClient {
    async fn open_stream(&self, body: &ChatCompletionRequest) -> Result<ByteStream, InferenceError> {
        // Log the request metadata (not the full body — it can be huge)
        tracing::info!(
            url = %self.url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            providers = ?body.provider.as_ref().map(|p| &p.order),
            "opening chat completion stream"
        );

        let mut request = self
            .http
            .post(&self.url)
            .json(body)
            .header("Accept", "text/event-stream");
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(name) = &self.app_name {
            request = request.header("X-Title", name);
        }
        if let Some(url) = &self.app_url {
            request = request.header("HTTP-Referer", url);
        }

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), body = %body_text, "gateway rejected request");
            return Err(InferenceError::HttpStatus {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let endpoint = self.url.clone();
        let timeout_secs = self.stream_timeout.as_secs();
        let bytes = response.bytes_stream().map_err(move |e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: timeout_secs,
                }
            } else {
                InferenceError::Transport {
                    endpoint: endpoint.clone(),
                    reason: format!("stream read error: {e}"),
                }
            }
        });

        Ok(Box::pin(bytes))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::config::parse_gateway_config;

    fn config(base_url: &str) -> GatewayConfig {
        parse_gateway_config(&format!(
            "base_url: \"{base_url}\"\ndefault_model: \"m\"\napi_key: \"\"\n"
        ))
        .unwrap()
    }

    #[test]
    fn test_url_joins_trailing_slash() {
        let client = GatewayClient::from_config(&config("https://gw.example/api/v1/")).unwrap();
        assert_eq!(client.endpoint(), "https://gw.example/api/v1/chat/completions");
    }

    #[test]
    fn test_empty_api_key_is_ignored() {
        let client = GatewayClient::from_config(&config("https://gw.example")).unwrap();
        assert!(client.api_key.is_none());
    }
}
