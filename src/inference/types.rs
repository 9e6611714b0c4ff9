//! Shared types for the gateway client.
//!
//! The conversation model (`ChatMessage`, `ConversationRequest`) is what
//! callers build; the request/chunk structs below it mirror the OpenAI-style
//! Chat Completions wire format the gateway speaks.

use serde::{Deserialize, Serialize};

use super::accumulator::ToolCall;
use super::errors::InferenceError;

// ─── Conversation Types ──────────────────────────────────────────────────────

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One piece of message content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    /// Image reference (URL or `data:` URI).
    Image { url: String },
    /// Output of a tool invocation, carried by `tool` role messages.
    ToolResult(String),
}

/// A single message in the conversation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
    /// Correlates a `tool` message with the call it answers.
    pub tool_call_id: Option<String>,
    /// Calls requested by an `assistant` message.
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    fn with_text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::Text(text.into())],
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_text(Role::User, text)
    }

    /// A user message with text followed by image references.
    pub fn user_with_images(text: impl Into<String>, image_urls: Vec<String>) -> Self {
        let mut content = vec![ContentPart::Text(text.into())];
        content.extend(image_urls.into_iter().map(|url| ContentPart::Image { url }));
        Self {
            role: Role::User,
            content,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_text(Role::Assistant, text)
    }

    /// An assistant turn that requested tool calls.
    pub fn assistant_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let text = text.into();
        Self {
            role: Role::Assistant,
            content: if text.is_empty() {
                Vec::new()
            } else {
                vec![ContentPart::Text(text)]
            },
            tool_call_id: None,
            tool_calls,
        }
    }

    /// A `tool` role message answering the call `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentPart::ToolResult(output.into())],
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Concatenated text of all text and tool-result parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(t) | ContentPart::ToolResult(t) => Some(t.as_str()),
                ContentPart::Image { .. } => None,
            })
            .collect()
    }

    fn has_images(&self) -> bool {
        self.content
            .iter()
            .any(|part| matches!(part, ContentPart::Image { .. }))
    }
}

/// Wire shape of a message.
///
/// `content` is emitted as `""` rather than `null` for assistant messages
/// that only carry tool calls; several gateway backends reject `null`.
#[derive(Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: WireContent<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ToolCallResponse>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireContent<'a> {
    Text(String),
    Parts(Vec<WirePart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: WireImageUrl<'a> },
}

#[derive(Serialize)]
struct WireImageUrl<'a> {
    url: &'a str,
}

impl Serialize for ChatMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let content = if self.has_images() {
            WireContent::Parts(
                self.content
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text(t) | ContentPart::ToolResult(t) => WirePart::Text { text: t },
                        ContentPart::Image { url } => WirePart::ImageUrl {
                            image_url: WireImageUrl { url },
                        },
                    })
                    .collect(),
            )
        } else {
            WireContent::Text(self.text())
        };

        WireMessage {
            role: self.role,
            content,
            tool_call_id: self.tool_call_id.as_deref(),
            tool_calls: self.tool_calls.iter().map(ToolCallResponse::from).collect(),
        }
        .serialize(serializer)
    }
}

/// Tool definition sent in the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Function definition within a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// How the model may use the declared tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
}

/// Everything needed to run one conversation turn against the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRequest {
    /// Target model identifier, e.g. `"openai/gpt-4o-mini"`.
    pub model: String,
    /// Conversation so far, in order. Never ends with an assistant message.
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Providers to try, in order, after the default route fails.
    pub fallback_providers: Vec<String>,
    /// Lets the gateway itself route around providers in the list.
    pub allow_fallbacks: bool,
    pub tools_enabled: bool,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
}

impl ConversationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.7,
            max_tokens: None,
            fallback_providers: Vec::new(),
            allow_fallbacks: true,
            tools_enabled: false,
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_fallback_providers(mut self, providers: Vec<String>) -> Self {
        self.fallback_providers = providers;
        self
    }

    /// Declare tools and enable tool use.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools_enabled = !tools.is_empty();
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    /// Same settings, different history (used between tool rounds).
    pub fn with_messages(&self, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..self.clone()
        }
    }

    /// Check the request invariants before any network activity.
    pub fn validate(&self) -> Result<(), InferenceError> {
        let invalid = |reason: &str| {
            Err(InferenceError::InvalidRequest {
                reason: reason.to_string(),
            })
        };

        if self.model.trim().is_empty() {
            return invalid("model identifier is empty");
        }
        match self.messages.last() {
            None => return invalid("message sequence is empty"),
            Some(last) if last.role == Role::Assistant => {
                return invalid("final message must not have the assistant role")
            }
            Some(_) => {}
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return invalid("temperature must be within 0.0..=2.0");
        }
        if let Some(msg) = self
            .messages
            .iter()
            .find(|m| m.role == Role::Tool && m.tool_call_id.is_none())
        {
            return Err(InferenceError::InvalidRequest {
                reason: format!("tool message without tool_call_id: {:?}", msg.text()),
            });
        }
        Ok(())
    }
}

// ─── Request Types ───────────────────────────────────────────────────────────

/// Gateway routing preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderPreferences {
    pub order: Vec<String>,
    pub allow_fallbacks: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// Request body for `POST /chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderPreferences>,
}

impl ChatCompletionRequest {
    /// Build the streaming body for one attempt.
    ///
    /// `provider_order` is the slice of providers this attempt should try, or
    /// `None` to let the gateway route freely.
    pub fn streaming(request: &ConversationRequest, provider_order: Option<&[String]>) -> Self {
        let tools = (request.tools_enabled && !request.tools.is_empty()).then(|| request.tools.clone());
        let tool_choice = tools
            .as_ref()
            .map(|_| request.tool_choice.unwrap_or(ToolChoice::Auto));

        Self {
            model: request.model.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
            tools,
            tool_choice,
            provider: provider_order.map(|order| ProviderPreferences {
                order: order.to_vec(),
                allow_fallbacks: request.allow_fallbacks,
            }),
        }
    }
}

/// Tool call as echoed back in assistant messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCallResponse,
}

impl From<&ToolCall> for ToolCallResponse {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            r#type: "function".to_string(),
            function: FunctionCallResponse {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

/// Function call details in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    pub arguments: String,
}

// ─── Response Types ──────────────────────────────────────────────────────────

/// Raw SSE chunk from the gateway.
///
/// Unknown fields (`reasoning`, `role`, provider metadata) are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<ChunkUsage>,
    #[serde(default)]
    pub error: Option<ChunkError>,
}

/// A single choice within a streaming chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// The delta (incremental update) within a chunk choice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChunkToolCall>>,
}

/// A tool call fragment within a streaming delta.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkToolCall {
    pub index: Option<u32>,
    pub id: Option<String>,
    pub function: Option<ChunkFunction>,
}

/// A function call fragment within a streaming tool call.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkFunction {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Token accounting, usually sent once near the end of the stream.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChunkUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

/// Error object a gateway may emit mid-stream.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkError {
    /// Numeric on most gateways, occasionally a string.
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    #[serde(default)]
    pub message: String,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weather_tool() -> ToolDefinition {
        ToolDefinition::function(
            "weather",
            "Current weather for a city",
            json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        )
    }

    #[test]
    fn test_validate_rejects_empty_messages() {
        let req = ConversationRequest::new("m", vec![]);
        assert!(matches!(req.validate(), Err(InferenceError::InvalidRequest { .. })));
    }

    #[test]
    fn test_validate_rejects_trailing_assistant() {
        let req = ConversationRequest::new(
            "m",
            vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
        );
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("assistant"));
    }

    #[test]
    fn test_validate_rejects_bad_temperature_and_model() {
        let req = ConversationRequest::new("m", vec![ChatMessage::user("hi")]).with_temperature(3.5);
        assert!(req.validate().is_err());
        let req = ConversationRequest::new("  ", vec![ChatMessage::user("hi")]);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_tool_history() {
        let call = ToolCall::complete("call_1", "weather", "{\"city\":\"Oslo\"}");
        let req = ConversationRequest::new(
            "m",
            vec![
                ChatMessage::user("weather?"),
                ChatMessage::assistant_with_tool_calls("", vec![call]),
                ChatMessage::tool_result("call_1", "sunny"),
            ],
        );
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_streaming_body_shape() {
        let req = ConversationRequest::new("openai/gpt-4o-mini", vec![ChatMessage::user("hi")])
            .with_tools(vec![weather_tool()])
            .with_fallback_providers(vec!["openai".into(), "azure".into()]);
        let body = ChatCompletionRequest::streaming(&req, Some(&req.fallback_providers[1..]));
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(value["stream"], true);
        assert_eq!(value["stream_options"]["include_usage"], true);
        assert_eq!(value["tool_choice"], "auto");
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["function"]["name"], "weather");
        assert_eq!(value["provider"]["order"], json!(["azure"]));
        assert_eq!(value["provider"]["allow_fallbacks"], true);
        assert_eq!(value["messages"][0], json!({"role": "user", "content": "hi"}));
        assert!(value.get("max_tokens").is_none());
    }

    #[test]
    fn test_tools_omitted_when_disabled() {
        let mut req = ConversationRequest::new("m", vec![ChatMessage::user("hi")]).with_tools(vec![weather_tool()]);
        req.tools_enabled = false;
        let value = serde_json::to_value(ChatCompletionRequest::streaming(&req, None)).unwrap();
        assert!(value.get("tools").is_none());
        assert!(value.get("tool_choice").is_none());
        assert!(value.get("provider").is_none());
    }

    #[test]
    fn test_assistant_tool_call_message_serialization() {
        let call = ToolCall::complete("call_9", "calculate", "{\"expression\":\"2+2\"}");
        let msg = ChatMessage::assistant_with_tool_calls("", vec![call]);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["content"], "");
        assert_eq!(value["tool_calls"][0]["id"], "call_9");
        assert_eq!(value["tool_calls"][0]["function"]["arguments"], "{\"expression\":\"2+2\"}");
        assert!(value.get("tool_call_id").is_none());
    }

    #[test]
    fn test_tool_result_and_image_serialization() {
        let value = serde_json::to_value(ChatMessage::tool_result("call_9", "4")).unwrap();
        assert_eq!(value, json!({"role": "tool", "content": "4", "tool_call_id": "call_9"}));

        let msg = ChatMessage::user_with_images("what is this?", vec!["https://x/cat.png".into()]);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["content"][0], json!({"type": "text", "text": "what is this?"}));
        assert_eq!(
            value["content"][1],
            json!({"type": "image_url", "image_url": {"url": "https://x/cat.png"}})
        );
    }

    #[test]
    fn test_chunk_ignores_unknown_fields() {
        let raw = r#"{"id":"gen-1","provider":"x","choices":[{"index":0,"delta":{"role":"assistant","content":"","reasoning":"hmm"},"finish_reason":null,"native_finish_reason":null}]}"#;
        let chunk: ChatCompletionChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(chunk.choices.len(), 1);
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some(""));
        assert!(chunk.usage.is_none());
    }
}
