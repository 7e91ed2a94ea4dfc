pub mod gemini;
pub mod gemini_types;
pub mod openai;
pub mod sse;
pub mod types;

pub use types::{
    AssistantMessage, ChatMessage, ProviderRequest, ProviderResponse, ProviderStreamChunk,
    StreamDelta, TokenUsage,
};

use crate::agent_pool::UserAgentPool;
use crate::config::Config;
use crate::error::ProviderError;
use async_trait::async_trait;
use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Upstream calls are abandoned after this long.
pub const UPSTREAM_TIMEOUT_SECS: u64 = 30;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ProviderStreamChunk, ProviderError>> + Send>>;

/// One upstream provider's request shaping, response parsing, and error
/// classification.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Single-shot completion.
    async fn call(&self, req: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Lazy chunk sequence ending when the upstream signals completion.
    async fn stream(&self, req: &ProviderRequest) -> Result<ChunkStream, ProviderError>;
}

/// Shared HTTP client for all adapters. Building a `reqwest::Client` is
/// expensive (TLS init, pool setup), so one instance serves every provider.
pub fn build_provider_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Maps provider names to adapter values. Providers whose name mentions
/// gemini/google get the Gemini-shaped adapter; everything else speaks the
/// OpenAI wire format.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn from_config(config: &Config, agents: Arc<UserAgentPool>) -> Self {
        let client = build_provider_client();
        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();

        for (name, provider) in &config.providers {
            if !provider.enabled {
                continue;
            }
            let adapter: Arc<dyn ProviderAdapter> = if is_gemini_shaped(name) {
                Arc::new(gemini::GeminiAdapter::new(
                    name.clone(),
                    provider.api_endpoint.clone(),
                    client.clone(),
                    Arc::clone(&agents),
                ))
            } else {
                Arc::new(openai::OpenAiAdapter::new(
                    name.clone(),
                    provider.api_endpoint.clone(),
                    client.clone(),
                    Arc::clone(&agents),
                ))
            };
            adapters.insert(name.clone(), adapter);
        }

        Self { adapters }
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).cloned()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn with_adapters(adapters: HashMap<String, Arc<dyn ProviderAdapter>>) -> Self {
        Self { adapters }
    }
}

fn is_gemini_shaped(provider: &str) -> bool {
    let lower = provider.to_ascii_lowercase();
    lower.contains("gemini") || lower.contains("google")
}
