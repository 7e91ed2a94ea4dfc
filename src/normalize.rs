use crate::error::GatewayError;
use crate::providers::{AssistantMessage, ProviderResponse, ProviderStreamChunk, StreamDelta, TokenUsage};
use serde::Serialize;
use serde_json::Value;

/// Canonical chat-completion envelope in the OpenAI wire shape.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
    pub logprobs: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: StreamDelta,
    pub finish_reason: Option<String>,
    pub logprobs: Option<Value>,
}

/// Canonical error payload: `{"error": {"message", "type", "code"}}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub code: Option<&'static str>,
}

pub fn new_stream_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

fn created_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Finish reasons outside the canonical vocabulary collapse to "stop".
fn normalize_finish(reason: Option<String>) -> Option<String> {
    reason.map(|reason| match reason.as_str() {
        "stop" | "length" | "tool_calls" | "content_filter" | "function_call" => reason,
        _ => "stop".to_string(),
    })
}

/// Provider response → canonical completion under the model name the client
/// asked for, with a fabricated id and timestamp.
pub fn to_canonical_response(resp: ProviderResponse, requested_model: &str) -> ChatCompletion {
    ChatCompletion {
        id: new_stream_id(),
        object: "chat.completion",
        created: created_now(),
        model: requested_model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: resp.message,
            finish_reason: normalize_finish(resp.finish_reason).or_else(|| Some("stop".to_string())),
            logprobs: None,
        }],
        usage: resp.usage.unwrap_or_default(),
    }
}

/// Stream chunk → canonical chunk. The caller supplies the stream id so it
/// stays identical across every chunk of one response.
pub fn to_canonical_chunk(
    chunk: ProviderStreamChunk,
    requested_model: &str,
    stream_id: &str,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: stream_id.to_string(),
        object: "chat.completion.chunk",
        created: created_now(),
        model: requested_model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: chunk.delta,
            finish_reason: normalize_finish(chunk.finish_reason),
            logprobs: None,
        }],
    }
}

pub fn to_canonical_error(err: &GatewayError) -> ErrorEnvelope {
    let kind = err.kind();
    ErrorEnvelope {
        error: ErrorPayload {
            message: err.to_string(),
            error_type: kind.wire_type(),
            code: kind.wire_code(),
        },
    }
}

pub fn format_sse(payload: &impl Serialize) -> String {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    format!("data: {json}\n\n")
}

pub fn format_sse_done() -> String {
    "data: [DONE]\n\n".to_string()
}
