use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Fully parsed gateway configuration. Immutable after load.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub model_aliases: Vec<ModelAlias>,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_store_path")]
    pub token_store_path: PathBuf,
    #[serde(default)]
    pub watch_files: Vec<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_store_path: default_token_store_path(),
            watch_files: Vec::new(),
        }
    }
}

/// A client-visible model name expanding to prioritized provider routes.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelAlias {
    pub alias: String,
    pub providers: Vec<ProviderModel>,
}

/// One `(provider, model)` route; lower `priority` wins.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderModel {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub provider: String,
    pub requests_per_minute: usize,
    pub max_queue_size: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub auth_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub api_endpoint: String,
    #[serde(default)]
    pub scope: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_token_store_path() -> PathBuf {
    PathBuf::from("tokens.json")
}

/// The gateway only ever binds loopback; anything else is refused at startup.
pub fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-reference checks that only make sense once the whole file is
    /// parsed. Runs at startup so a bad config never serves traffic.
    pub fn validate(&self) -> Result<()> {
        if !is_loopback_host(&self.gateway.host) {
            bail!(
                "gateway.host '{}' is not a loopback address; use localhost, 127.0.0.1, or ::1",
                self.gateway.host
            );
        }

        for alias in &self.model_aliases {
            if alias.providers.is_empty() {
                bail!("model alias '{}' has no providers", alias.alias);
            }
            for route in &alias.providers {
                if !self.providers.contains_key(&route.provider) {
                    bail!(
                        "model alias '{}' references unknown provider '{}'",
                        alias.alias,
                        route.provider
                    );
                }
            }
        }

        for limit in &self.rate_limits {
            if !self.providers.contains_key(&limit.provider) {
                bail!(
                    "rate limit references unknown provider '{}'",
                    limit.provider
                );
            }
            if limit.requests_per_minute == 0 {
                bail!(
                    "rate limit for '{}' must allow at least one request per minute",
                    limit.provider
                );
            }
        }

        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}
