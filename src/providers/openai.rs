use super::sse::{DONE_SENTINEL, LineBuffer, data_payload};
use super::types::{
    AssistantMessage, ProviderRequest, ProviderResponse, ProviderStreamChunk, StreamDelta,
    TokenUsage,
};
use super::{ChunkStream, ProviderAdapter};
use crate::agent_pool::UserAgentPool;
use crate::error::ProviderError;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Adapter for providers speaking the OpenAI chat-completions wire format.
/// The canonical request is already OpenAI-shaped, so translation is a
/// near-identity passthrough plus the `stream` flag.
pub struct OpenAiAdapter {
    name: String,
    endpoint: String,
    client: Client,
    agents: Arc<UserAgentPool>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

impl OpenAiAdapter {
    pub fn new(name: String, endpoint: String, client: Client, agents: Arc<UserAgentPool>) -> Self {
        Self {
            name,
            endpoint,
            client,
            agents,
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
    }

    fn build_body(req: &ProviderRequest) -> Value {
        let mut body = Map::new();
        body.insert("model".to_string(), Value::String(req.model.clone()));
        body.insert(
            "messages".to_string(),
            serde_json::to_value(&req.messages).unwrap_or_default(),
        );
        body.insert("stream".to_string(), Value::Bool(req.stream));
        if let Some(temperature) = req.temperature
            && let Some(number) = serde_json::Number::from_f64(temperature)
        {
            body.insert("temperature".to_string(), Value::Number(number));
        }
        if let Some(top_p) = req.top_p
            && let Some(number) = serde_json::Number::from_f64(top_p)
        {
            body.insert("top_p".to_string(), Value::Number(number));
        }
        if let Some(max_tokens) = req.max_tokens {
            body.insert("max_tokens".to_string(), Value::from(max_tokens));
        }
        if let Some(stop) = &req.stop {
            body.insert("stop".to_string(), stop.clone());
        }
        if let Some(tools) = &req.tools {
            body.insert("tools".to_string(), tools.clone());
        }
        Value::Object(body)
    }

    async fn send(&self, req: &ProviderRequest) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(self.url())
            .bearer_auth(&req.access_token)
            .header("Content-Type", "application/json")
            .header("User-Agent", self.agents.next())
            .json(&Self::build_body(req))
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
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, req: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let response = self.send(req).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::transport(&self.name, &e))?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            ProviderError::unavailable(&self.name, "upstream response had no choices")
        })?;

        Ok(ProviderResponse {
            message: choice.message,
            finish_reason: choice.finish_reason,
            usage: parsed.usage,
        })
    }

    async fn stream(&self, req: &ProviderRequest) -> Result<ChunkStream, ProviderError> {
        let response = self.send(req).await?;
        let provider = self.name.clone();
        let mut bytes = response.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut lines = LineBuffer::new();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| ProviderError::transport(&provider, &e))?;
                lines.push_chunk(&chunk);

                while let Some(line) = lines.next_line() {
                    let Some(payload) = data_payload(&line) else {
                        continue;
                    };
                    if payload == DONE_SENTINEL {
                        break 'read;
                    }
                    // Malformed frames are dropped, not fatal.
                    let Ok(parsed) = serde_json::from_str::<ChunkResponse>(payload) else {
                        continue;
                    };
                    for choice in parsed.choices {
                        yield ProviderStreamChunk {
                            delta: choice.delta,
                            finish_reason: choice.finish_reason,
                        };
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
