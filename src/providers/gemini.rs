use super::gemini_types::{
    Candidate, Content, FunctionCall, FunctionDeclaration, FunctionResponse,
    GenerateContentRequest, GenerateContentResponse, GeminiTool, GenerationConfig, Part,
};
use super::sse::{LineBuffer, data_payload};
use super::types::{
    AssistantMessage, ChatMessage, ProviderRequest, ProviderResponse, ProviderStreamChunk,
    StreamDelta, TokenUsage,
};
use super::{ChunkStream, ProviderAdapter};
use crate::agent_pool::UserAgentPool;
use crate::error::ProviderError;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;

/// Adapter for the Gemini `generateContent` wire format.
///
/// The canonical request is OpenAI-shaped, so this adapter owns the real
/// translation work: role mapping, system-message folding, function-call
/// conversion, and generation-knob renaming.
pub struct GeminiAdapter {
    name: String,
    endpoint: String,
    client: Client,
    agents: Arc<UserAgentPool>,
}

/// OpenAI function payload (`{name, arguments}` with stringified JSON
/// arguments) to a Gemini `functionCall` part with decoded args.
fn function_call_part(function: &Value) -> Part {
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("function")
        .to_string();
    let args = match function.get("arguments") {
        Some(Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| json!({ "input": raw }))
        }
        Some(other) => other.clone(),
        None => json!({}),
    };
    Part::function_call(FunctionCall { name, args })
}

impl GeminiAdapter {
    pub fn new(name: String, endpoint: String, client: Client, agents: Arc<UserAgentPool>) -> Self {
        Self {
            name,
            endpoint,
            client,
            agents,
        }
    }

    fn url(&self, model: &str, streaming: bool) -> String {
        let base = self.endpoint.trim_end_matches('/');
        if streaming {
            format!("{base}/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}/models/{model}:generateContent")
        }
    }

    /// Gemini has no system role; consecutive system messages are folded
    /// into a `[System] …` preamble on the next user turn.
    fn build_contents(messages: &[ChatMessage]) -> Vec<Content> {
        let mut contents = Vec::new();
        let mut pending_system: Vec<String> = Vec::new();

        for message in messages {
            match message.role.as_str() {
                "system" => pending_system.push(message.content_text()),
                "assistant" => {
                    let mut parts = Vec::new();
                    let text = message.content_text();
                    if !text.is_empty() {
                        parts.push(Part::text(text));
                    }
                    if let Some(call) = &message.function_call {
                        parts.push(function_call_part(call));
                    }
                    if let Some(Value::Array(calls)) = &message.tool_calls {
                        for call in calls {
                            if let Some(function) = call.get("function") {
                                parts.push(function_call_part(function));
                            }
                        }
                    }
                    if parts.is_empty() {
                        parts.push(Part::text(String::new()));
                    }
                    contents.push(Content {
                        role: Some("model".to_string()),
                        parts,
                    });
                }
                "tool" | "function" => {
                    let name = message
                        .name
                        .clone()
                        .unwrap_or_else(|| "tool".to_string());
                    let raw = message.content_text();
                    let response = serde_json::from_str::<Value>(&raw)
                        .ok()
                        .filter(Value::is_object)
                        .unwrap_or_else(|| json!({ "content": raw }));
                    contents.push(Content {
                        role: Some("user".to_string()),
                        parts: vec![Part::function_response(FunctionResponse { name, response })],
                    });
                }
                _ => {
                    let mut text = message.content_text();
                    if !pending_system.is_empty() {
                        let preamble = pending_system.join("\n\n");
                        pending_system.clear();
                        text = format!("[System] {preamble}\n\n{text}");
                    }
                    contents.push(Content {
                        role: Some("user".to_string()),
                        parts: vec![Part::text(text)],
                    });
                }
            }
        }

        // Trailing system messages with no user turn to attach to.
        if !pending_system.is_empty() {
            contents.push(Content {
                role: Some("user".to_string()),
                parts: vec![Part::text(format!(
                    "[System] {}",
                    pending_system.join("\n\n")
                ))],
            });
        }

        contents
    }

    fn build_tools(tools: &Value) -> Option<Vec<GeminiTool>> {
        let entries = tools.as_array()?;
        let declarations: Vec<FunctionDeclaration> = entries
            .iter()
            .filter_map(|entry| {
                let function = entry.get("function").unwrap_or(entry);
                let name = function.get("name")?.as_str()?.to_string();
                Some(FunctionDeclaration {
                    name,
                    description: function
                        .get("description")
                        .and_then(Value::as_str)
                        .map(String::from),
                    parameters: function.get("parameters").cloned(),
                })
            })
            .collect();

        if declarations.is_empty() {
            None
        } else {
            Some(vec![GeminiTool {
                function_declarations: declarations,
            }])
        }
    }

    fn build_request(req: &ProviderRequest) -> GenerateContentRequest {
        let stop_sequences = req.stop.as_ref().map(|stop| match stop {
            Value::String(single) => vec![single.clone()],
            Value::Array(entries) => entries
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        });

        let generation_config = GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            max_output_tokens: req.max_tokens,
            stop_sequences: stop_sequences.filter(|sequences| !sequences.is_empty()),
        };

        GenerateContentRequest {
            contents: Self::build_contents(&req.messages),
            tools: req.tools.as_ref().and_then(Self::build_tools),
            generation_config: Some(generation_config),
        }
    }

    fn translate_finish(reason: Option<&str>) -> Option<String> {
        reason.map(|reason| {
            match reason {
                "MAX_TOKENS" => "length",
                "SAFETY" | "RECITATION" => "content_filter",
                _ => "stop",
            }
            .to_string()
        })
    }

    /// First candidate's parts, split into joined text and OpenAI-style
    /// tool calls.
    fn candidate_payload(candidate: &Candidate) -> (String, Option<Value>) {
        let Some(content) = &candidate.content else {
            return (String::new(), None);
        };

        let mut texts = Vec::new();
        let mut calls = Vec::new();
        for part in &content.parts {
            if let Some(text) = &part.text {
                texts.push(text.as_str());
            }
            if let Some(call) = &part.function_call {
                let index = calls.len() + 1;
                calls.push(json!({
                    "id": format!("call_{index}"),
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.args.to_string(),
                    }
                }));
            }
        }

        let tool_calls = if calls.is_empty() {
            None
        } else {
            Some(Value::Array(calls))
        };
        (texts.join(""), tool_calls)
    }

    async fn send(
        &self,
        req: &ProviderRequest,
        streaming: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(self.url(&req.model, streaming))
            .bearer_auth(&req.access_token)
            .header("Content-Type", "application/json")
            .header("User-Agent", self.agents.next())
            .json(&Self::build_request(req))
            .send()
            .await
            .map_err(|e| ProviderError::transport(&self.name, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                &self.name,
                status.as_u16(),
                format!("upstream returned {status}: {body}"),
            ));
        }
        Ok(response)
    }

    fn embedded_error(&self, parsed: &GenerateContentResponse) -> Option<ProviderError> {
        let error = parsed.error.as_ref()?;
        let status = u16::try_from(error.code).ok().filter(|code| *code >= 100);
        Some(match status {
            Some(status) => ProviderError::from_status(&self.name, status, error.message.clone()),
            None => ProviderError::unavailable(&self.name, error.message.clone()),
        })
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, req: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let response = self.send(req, false).await?;
        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::transport(&self.name, &e))?;

        if let Some(error) = self.embedded_error(&parsed) {
            return Err(error);
        }

        let candidate = parsed
            .candidates
            .as_ref()
            .and_then(|candidates| candidates.first())
            .ok_or_else(|| {
                ProviderError::unavailable(&self.name, "upstream response had no candidates")
            })?;

        let (text, tool_calls) = Self::candidate_payload(candidate);
        let usage = parsed.usage_metadata.map(|usage| TokenUsage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
        });

        Ok(ProviderResponse {
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: Some(Value::String(text)),
                tool_calls,
                function_call: None,
            },
            finish_reason: Self::translate_finish(candidate.finish_reason.as_deref()),
            usage,
        })
    }

    async fn stream(&self, req: &ProviderRequest) -> Result<ChunkStream, ProviderError> {
        let response = self.send(req, true).await?;
        let provider = self.name.clone();
        let mut bytes = response.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut lines = LineBuffer::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| ProviderError::transport(&provider, &e))?;
                lines.push_chunk(&chunk);

                while let Some(line) = lines.next_line() {
                    let Some(payload) = data_payload(&line) else {
                        continue;
                    };
                    let Ok(parsed) = serde_json::from_str::<GenerateContentResponse>(payload)
                    else {
                        continue;
                    };

                    if let Some(error) = parsed.error.as_ref() {
                        Err(ProviderError::unavailable(&provider, error.message.clone()))?;
                    }

                    for candidate in parsed.candidates.as_deref().unwrap_or_default() {
                        let (text, tool_calls) = GeminiAdapter::candidate_payload(candidate);
                        let delta = StreamDelta {
                            role: None,
                            content: if text.is_empty() {
                                None
                            } else {
                                Some(Value::String(text))
                            },
                            tool_calls,
                            function_call: None,
                        };
                        yield ProviderStreamChunk {
                            delta,
                            finish_reason: GeminiAdapter::translate_finish(
                                candidate.finish_reason.as_deref(),
                            ),
                        };
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
