use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One chat message in the client's (OpenAI-compatible) shape.
///
/// `content` stays a raw JSON value because clients legally send strings,
/// structured part arrays, or `null` alongside tool calls; adapters decide
/// how much structure they need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn user(text: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(Value::String(text.to_string())),
            tool_calls: None,
            function_call: None,
            name: None,
        }
    }

    pub fn system(text: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(Value::String(text.to_string())),
            tool_calls: None,
            function_call: None,
            name: None,
        }
    }

    /// Best-effort plain-text view of `content`: strings pass through,
    /// OpenAI part arrays have their text parts joined.
    pub fn content_text(&self) -> String {
        match &self.content {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Some(other) if !other.is_null() => other.to_string(),
            _ => String::new(),
        }
    }
}

/// What an adapter needs to place one upstream call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Provider-side model name (already resolved from the alias).
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
    pub stop: Option<Value>,
    pub tools: Option<Value>,
    pub access_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

fn assistant_role() -> String {
    "assistant".to_string()
}

/// The assistant message from a single-shot completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default = "assistant_role")]
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<Value>,
}

impl AssistantMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            role: assistant_role(),
            content: Some(Value::String(content.into())),
            tool_calls: None,
            function_call: None,
        }
    }
}

/// Provider-shaped completion after adapter parsing, before normalization.
/// `finish_reason` already uses the canonical vocabulary.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// Incremental update within a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderStreamChunk {
    pub delta: StreamDelta,
    pub finish_reason: Option<String>,
}
