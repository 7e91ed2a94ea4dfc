mod watcher;

pub use watcher::provider_for_path;

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::token_store::{TokenSet, TokenStore, now_ms};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
const POLL_INTERVAL_SECS: u64 = 5;
const MAX_DEVICE_POLLS: u32 = 120;
const DEFAULT_TOKEN_LIFETIME_MS: i64 = 3_600_000;

/// Result of starting a device-flow authorization.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceFlowInit {
    pub device_code: String,
    pub user_code: String,
    pub verification_url: String,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct DeviceInitResponse {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_uri")]
    verification_url: String,
    #[serde(default = "default_device_expiry")]
    expires_in: u64,
}

fn default_device_expiry() -> u64 {
    900
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Token payload accepted by `sync_from_file`; external tools write either
/// snake_case or camelCase keys.
#[derive(Debug, Deserialize)]
struct FileTokenPayload {
    #[serde(alias = "accessToken")]
    access_token: Option<String>,
    #[serde(alias = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(alias = "expiresAt")]
    expires_at: Option<i64>,
}

/// OAuth token lifecycle per provider: device-flow acquisition, refresh on
/// expiry, and import from externally managed credential files.
///
/// Refresh is single-flight per provider: concurrent callers seeing an
/// expired token share one in-flight refresh and observe the same result.
pub struct AuthManager {
    providers: HashMap<String, ProviderConfig>,
    store: Arc<TokenStore>,
    client: reqwest::Client,
    refresh_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    watcher_started: AtomicBool,
    watcher_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl AuthManager {
    pub fn new(providers: HashMap<String, ProviderConfig>, store: Arc<TokenStore>) -> Self {
        Self {
            providers,
            store,
            client: crate::providers::build_provider_client(),
            refresh_locks: StdMutex::new(HashMap::new()),
            watcher_started: AtomicBool::new(false),
            watcher_handle: StdMutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    fn provider_config(&self, provider: &str) -> Result<&ProviderConfig> {
        let config = self
            .providers
            .get(provider)
            .with_context(|| format!("provider '{provider}' is not configured"))?;
        if !config.enabled {
            bail!("provider '{provider}' is disabled");
        }
        Ok(config)
    }

    /// Start a device-flow authorization with the provider's auth endpoint.
    pub async fn initiate_device_flow(&self, provider: &str) -> Result<DeviceFlowInit> {
        let config = self.provider_config(provider)?;
        let client_id = config
            .client_id
            .as_deref()
            .with_context(|| format!("provider '{provider}' has no client_id"))?;
        let auth_endpoint = config
            .auth_endpoint
            .as_deref()
            .with_context(|| format!("provider '{provider}' has no auth_endpoint"))?;

        let response = self
            .client
            .post(auth_endpoint)
            .form(&[("client_id", client_id), ("scope", config.scope.as_str())])
            .send()
            .await
            .with_context(|| format!("device flow init request to {auth_endpoint} failed"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("device flow init for '{provider}' failed ({status}): {body}");
        }

        let parsed: DeviceInitResponse = response
            .json()
            .await
            .context("device flow init response was not valid JSON")?;

        Ok(DeviceFlowInit {
            device_code: parsed.device_code,
            user_code: parsed.user_code,
            verification_url: parsed.verification_url,
            expires_in: parsed.expires_in,
        })
    }

    /// Poll the token endpoint until the user approves, the grant expires,
    /// or the poll budget runs out.
    pub async fn complete_device_flow(&self, provider: &str, device_code: &str) -> Result<TokenSet> {
        let config = self.provider_config(provider)?;
        let client_id = config
            .client_id
            .clone()
            .with_context(|| format!("provider '{provider}' has no client_id"))?;
        let token_endpoint = config
            .token_endpoint
            .clone()
            .with_context(|| format!("provider '{provider}' has no token_endpoint"))?;

        let mut interval_secs = POLL_INTERVAL_SECS;
        for _ in 0..MAX_DEVICE_POLLS {
            tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;

            let response = self
                .client
                .post(&token_endpoint)
                .form(&[
                    ("client_id", client_id.as_str()),
                    ("device_code", device_code),
                    ("grant_type", DEVICE_GRANT_TYPE),
                ])
                .send()
                .await
                .with_context(|| format!("device flow poll to {token_endpoint} failed"))?;

            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let parsed: TokenEndpointResponse = serde_json::from_str(&body).unwrap_or(
                TokenEndpointResponse {
                    access_token: None,
                    refresh_token: None,
                    expires_in: None,
                    error: None,
                    error_description: None,
                },
            );

            if let Some(error) = parsed.error.as_deref() {
                match error {
                    "authorization_pending" => continue,
                    "slow_down" => {
                        interval_secs = (interval_secs * 2).min(60);
                        continue;
                    }
                    "expired_token" | "access_denied" => {
                        bail!("device flow for '{provider}' failed: {error}");
                    }
                    other => {
                        let detail = parsed.error_description.unwrap_or_default();
                        bail!("device flow for '{provider}' failed: {other} {detail}");
                    }
                }
            }

            if !status.is_success() {
                bail!("device flow poll for '{provider}' failed ({status}): {body}");
            }

            let access_token = parsed
                .access_token
                .context("token endpoint responded without an access token")?;
            let token = TokenSet {
                provider: provider.to_string(),
                access_token,
                refresh_token: parsed.refresh_token,
                expires_at: now_ms() + parsed.expires_in.unwrap_or(3600) * 1000,
            };
            self.store.save(token.clone()).await?;
            tracing::info!(provider, "device flow completed, token stored");
            return Ok(token);
        }

        bail!("device flow for '{provider}' timed out after {MAX_DEVICE_POLLS} polls");
    }

    /// Exchange the stored refresh token for a new access token.
    ///
    /// On any failure the stored entry is deleted: a reported refresh
    /// failure always leaves the provider in the unauthenticated state.
    pub async fn refresh_token(&self, provider: &str) -> Result<TokenSet, ProviderError> {
        let stored = self.store.get(provider).await.ok_or_else(|| {
            ProviderError::auth(provider, "no token stored; authenticate first")
        })?;
        let refresh_token = stored.refresh_token.clone().ok_or_else(|| {
            ProviderError::auth(provider, "no refresh token stored; re-authenticate")
        })?;

        match self.request_refresh(provider, &refresh_token).await {
            Ok(mut token) => {
                if token.refresh_token.is_none() {
                    token.refresh_token = Some(refresh_token);
                }
                if let Err(error) = self.store.save(token.clone()).await {
                    tracing::warn!(provider, "failed to persist refreshed token: {error}");
                }
                tracing::info!(provider, "access token refreshed");
                Ok(token)
            }
            Err(error) => {
                if let Err(delete_error) = self.store.delete(provider).await {
                    tracing::warn!(
                        provider,
                        "failed to delete token after refresh failure: {delete_error}"
                    );
                }
                Err(error)
            }
        }
    }

    async fn request_refresh(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<TokenSet, ProviderError> {
        let config = self.providers.get(provider).ok_or_else(|| {
            ProviderError::auth(provider, format!("provider '{provider}' is not configured"))
        })?;
        let client_id = config.client_id.as_deref().ok_or_else(|| {
            ProviderError::auth(provider, format!("provider '{provider}' has no client_id"))
        })?;
        let token_endpoint = config.token_endpoint.as_deref().ok_or_else(|| {
            ProviderError::auth(
                provider,
                format!("provider '{provider}' has no token_endpoint"),
            )
        })?;

        let mut form = vec![
            ("client_id", client_id.to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("grant_type", "refresh_token".to_string()),
        ];
        if let Some(secret) = &config.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .client
            .post(token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::transport(provider, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::auth(
                provider,
                format!("token refresh failed ({status}): {body}"),
            ));
        }

        let parsed: TokenEndpointResponse = response.json().await.map_err(|e| {
            ProviderError::auth(provider, format!("token refresh response invalid: {e}"))
        })?;
        let access_token = parsed.access_token.ok_or_else(|| {
            ProviderError::auth(provider, "token refresh response missing access_token")
        })?;

        Ok(TokenSet {
            provider: provider.to_string(),
            access_token,
            refresh_token: parsed.refresh_token,
            expires_at: now_ms() + parsed.expires_in.unwrap_or(3600) * 1000,
        })
    }

    /// A valid bearer for `provider`, refreshing once if the stored token
    /// has expired.
    pub async fn get_valid_token(&self, provider: &str) -> Result<TokenSet, ProviderError> {
        if !self.store.is_expired(provider).await
            && let Some(token) = self.store.get(provider).await
        {
            return Ok(token);
        }

        // Serialize concurrent refreshes per provider; the re-check after
        // acquiring means followers reuse the winner's token.
        let flight = self.refresh_lock(provider);
        let _guard = flight.lock().await;

        if !self.store.is_expired(provider).await
            && let Some(token) = self.store.get(provider).await
        {
            return Ok(token);
        }

        match self.store.get(provider).await {
            Some(token) if token.refresh_token.is_some() => self.refresh_token(provider).await,
            Some(_) => Err(ProviderError::auth(
                provider,
                "token expired and no refresh token stored; re-authenticate",
            )),
            None => Err(ProviderError::auth(
                provider,
                "no token stored; authenticate first",
            )),
        }
    }

    fn refresh_lock(&self, provider: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().expect("refresh lock map poisoned");
        Arc::clone(
            locks
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Import a token set written by an external tool. Never panics or
    /// propagates I/O and shape errors beyond its `Result`; the watcher
    /// logs and moves on.
    pub async fn sync_from_file(&self, path: &Path, provider: &str) -> Result<()> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read token file {}", path.display()))?;
        let payload: FileTokenPayload = serde_json::from_str(&contents)
            .with_context(|| format!("token file {} is not valid JSON", path.display()))?;

        let access_token = payload
            .access_token
            .filter(|token| !token.trim().is_empty())
            .with_context(|| format!("token file {} has no access token", path.display()))?;

        let expires_at = payload
            .expires_at
            .unwrap_or_else(|| now_ms() + DEFAULT_TOKEN_LIFETIME_MS);
        if expires_at <= now_ms() {
            bail!(
                "token file {} holds an already-expired token",
                path.display()
            );
        }

        self.store
            .save(TokenSet {
                provider: provider.to_string(),
                access_token,
                refresh_token: payload.refresh_token,
                expires_at,
            })
            .await?;
        tracing::info!(provider, path = %path.display(), "token imported from file");
        Ok(())
    }
}
