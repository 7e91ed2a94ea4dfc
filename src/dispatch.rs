use crate::auth::AuthManager;
use crate::error::{GatewayError, ProviderError};
use crate::normalize::{
    self, ChatCompletion, format_sse, format_sse_done, to_canonical_chunk, to_canonical_error,
    to_canonical_response,
};
use crate::providers::{AdapterRegistry, ChatMessage, ProviderRequest};
use crate::rate_limit::RateLimiter;
use crate::router::Router;
use crate::usage::UsageTracker;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub type SseStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// A validated chat-completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
    pub stop: Option<Value>,
    pub tools: Option<Value>,
}

/// Orchestrates one request across the router, rate limiter, auth manager,
/// and provider adapters, retrying retryable failures on the next candidate
/// until the retry budget runs out.
///
/// Owns no state of its own; every collaborator is shared and internally
/// synchronized.
pub struct Dispatcher {
    router: Arc<Router>,
    limiter: Arc<RateLimiter>,
    auth: Arc<AuthManager>,
    adapters: Arc<AdapterRegistry>,
    usage: Arc<UsageTracker>,
    max_retries: u32,
}

impl Dispatcher {
    pub fn new(
        router: Arc<Router>,
        limiter: Arc<RateLimiter>,
        auth: Arc<AuthManager>,
        adapters: Arc<AdapterRegistry>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        Self {
            router,
            limiter,
            auth,
            adapters,
            usage,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Validate a raw JSON body into a [`ChatRequest`].
    ///
    /// Error messages use the "required" / "must be" / "must have"
    /// vocabulary the transport recognizes as 400-class failures.
    pub fn parse(body: &Value) -> Result<ChatRequest, GatewayError> {
        let object = body
            .as_object()
            .ok_or_else(|| GatewayError::validation("request body must be a JSON object"))?;

        let model = object
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .ok_or_else(|| {
                GatewayError::validation("'model' is required and must be a non-empty string")
            })?
            .to_string();

        let raw_messages = object
            .get("messages")
            .and_then(Value::as_array)
            .filter(|messages| !messages.is_empty())
            .ok_or_else(|| {
                GatewayError::validation("'messages' is required and must be a non-empty array")
            })?;

        let mut messages = Vec::with_capacity(raw_messages.len());
        for (index, raw) in raw_messages.iter().enumerate() {
            let role = raw.get("role").and_then(Value::as_str).ok_or_else(|| {
                GatewayError::validation(format!("message at index {index} must have a string 'role'"))
            })?;
            let has_content = raw.get("content").is_some_and(|content| !content.is_null());
            let has_tool_calls = raw.get("tool_calls").is_some_and(|calls| !calls.is_null());
            let has_function_call = raw
                .get("function_call")
                .is_some_and(|call| !call.is_null());
            if !has_content && !has_tool_calls && !has_function_call {
                return Err(GatewayError::validation(format!(
                    "message at index {index} (role '{role}') must have 'content', 'tool_calls', or 'function_call'"
                )));
            }
            let message: ChatMessage = serde_json::from_value(raw.clone()).map_err(|error| {
                GatewayError::validation(format!("message at index {index} must be well-formed: {error}"))
            })?;
            messages.push(message);
        }

        Ok(ChatRequest {
            model,
            messages,
            stream: object
                .get("stream")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            temperature: object.get("temperature").and_then(Value::as_f64),
            top_p: object.get("top_p").and_then(Value::as_f64),
            max_tokens: object.get("max_tokens").and_then(Value::as_u64),
            stop: object.get("stop").filter(|stop| !stop.is_null()).cloned(),
            tools: object.get("tools").filter(|tools| !tools.is_null()).cloned(),
        })
    }

    /// Non-streaming completion with retry/fallback.
    pub async fn complete(&self, req: &ChatRequest) -> Result<ChatCompletion, GatewayError> {
        let candidates = self.router.resolve(&req.model)?;
        let Some(mut selected) = self.router.select(&candidates) else {
            return Err(no_available_provider().into());
        };

        let mut last_error: Option<ProviderError> = None;
        let mut attempts = 0;
        while attempts < self.max_retries {
            attempts += 1;
            match self.attempt_call(&selected.provider, &selected.model, req).await {
                Ok(response) => {
                    self.usage
                        .record(&selected.provider, &selected.model, response.usage.as_ref());
                    tracing::debug!(
                        provider = selected.provider.as_str(),
                        model = selected.model.as_str(),
                        attempts,
                        "completion served"
                    );
                    return Ok(to_canonical_response(response, &req.model));
                }
                Err(error) => {
                    tracing::warn!(
                        provider = selected.provider.as_str(),
                        attempt = attempts,
                        retryable = error.retryable,
                        "provider attempt failed: {error}"
                    );
                    let retryable = error.retryable;
                    let failed_provider = selected.provider.clone();
                    last_error = Some(error);
                    if retryable && attempts < self.max_retries {
                        match self.router.next_provider(&req.model, &failed_provider) {
                            Some(next) => selected = next,
                            None => break,
                        }
                    } else {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(no_available_provider).into())
    }

    /// Streaming completion. The retry/fallback loop runs while obtaining
    /// the upstream stream; once chunks flow, the stream's identity is
    /// committed and failures surface as a final error frame + `[DONE]`.
    pub async fn complete_stream(&self, req: &ChatRequest) -> Result<SseStream, GatewayError> {
        let candidates = self.router.resolve(&req.model)?;
        let Some(mut selected) = self.router.select(&candidates) else {
            return Err(no_available_provider().into());
        };

        let mut last_error: Option<ProviderError> = None;
        let mut attempts = 0;
        while attempts < self.max_retries {
            attempts += 1;
            match self.attempt_stream(&selected.provider, &selected.model, req).await {
                Ok(chunks) => {
                    let provider = selected.provider.clone();
                    self.usage.record(&provider, &selected.model, None);
                    return Ok(render_sse(chunks, req.model.clone(), provider));
                }
                Err(error) => {
                    tracing::warn!(
                        provider = selected.provider.as_str(),
                        attempt = attempts,
                        retryable = error.retryable,
                        "provider stream attempt failed: {error}"
                    );
                    let retryable = error.retryable;
                    let failed_provider = selected.provider.clone();
                    last_error = Some(error);
                    if retryable && attempts < self.max_retries {
                        match self.router.next_provider(&req.model, &failed_provider) {
                            Some(next) => selected = next,
                            None => break,
                        }
                    } else {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(no_available_provider).into())
    }

    /// Run the admission + auth stages and build the upstream request.
    async fn prepare(
        &self,
        provider: &str,
        model: &str,
        req: &ChatRequest,
        streaming: bool,
    ) -> Result<(Arc<dyn crate::providers::ProviderAdapter>, ProviderRequest), ProviderError> {
        self.limiter.acquire(provider).await?;
        let token = self.auth.get_valid_token(provider).await?;
        let adapter = self.adapters.get(provider).ok_or_else(|| {
            ProviderError::unavailable(provider, format!("no adapter registered for '{provider}'"))
        })?;

        let provider_req = ProviderRequest {
            model: model.to_string(),
            messages: req.messages.clone(),
            stream: streaming,
            temperature: req.temperature,
            top_p: req.top_p,
            max_tokens: req.max_tokens,
            stop: req.stop.clone(),
            tools: req.tools.clone(),
            access_token: token.access_token,
        };
        Ok((adapter, provider_req))
    }

    async fn attempt_call(
        &self,
        provider: &str,
        model: &str,
        req: &ChatRequest,
    ) -> Result<crate::providers::ProviderResponse, ProviderError> {
        let (adapter, provider_req) = self.prepare(provider, model, req, false).await?;
        adapter.call(&provider_req).await
    }

    async fn attempt_stream(
        &self,
        provider: &str,
        model: &str,
        req: &ChatRequest,
    ) -> Result<crate::providers::ChunkStream, ProviderError> {
        let (adapter, provider_req) = self.prepare(provider, model, req, true).await?;
        adapter.stream(&provider_req).await
    }
}

fn no_available_provider() -> ProviderError {
    let mut error = ProviderError::unavailable("gateway", "No available provider");
    error.retryable = false;
    error
}

/// Map upstream chunks to SSE frames under one stream id. A failure after
/// delivery has begun is announced as a canonical error frame followed by
/// `[DONE]`; no provider fallback happens here.
fn render_sse(
    mut chunks: crate::providers::ChunkStream,
    requested_model: String,
    provider: String,
) -> SseStream {
    let stream_id = normalize::new_stream_id();
    let stream = async_stream::stream! {
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    yield format_sse(&to_canonical_chunk(chunk, &requested_model, &stream_id));
                }
                Err(error) => {
                    tracing::warn!(
                        provider = provider.as_str(),
                        "stream failed mid-flight: {error}"
                    );
                    yield format_sse(&to_canonical_error(&error.into()));
                    yield format_sse_done();
                    return;
                }
            }
        }
        yield format_sse_done();
    };
    Box::pin(stream)
}
