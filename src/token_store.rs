use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// One provider's OAuth credential set. `expires_at` is the absolute
/// wall-clock deadline in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub provider: String,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: i64,
}

impl TokenSet {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `provider → TokenSet` map persisted as one pretty-printed JSON file.
///
/// Loaded lazily on first use: a missing file is an empty store, a malformed
/// one is logged and replaced on the next save. Writes go through a temp
/// file + rename so a crash never truncates the live file.
pub struct TokenStore {
    path: PathBuf,
    inner: Mutex<Option<HashMap<String, TokenSet>>>,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, token: TokenSet) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let map = Self::loaded(&self.path, &mut guard);
        map.insert(token.provider.clone(), token);
        Self::persist(&self.path, map)
    }

    pub async fn get(&self, provider: &str) -> Option<TokenSet> {
        let mut guard = self.inner.lock().await;
        Self::loaded(&self.path, &mut guard).get(provider).cloned()
    }

    pub async fn delete(&self, provider: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let map = Self::loaded(&self.path, &mut guard);
        if map.remove(provider).is_some() {
            Self::persist(&self.path, map)?;
        }
        Ok(())
    }

    /// Snapshot of all stored token sets; mutations to the result never
    /// touch the shared state.
    pub async fn get_all(&self) -> HashMap<String, TokenSet> {
        let mut guard = self.inner.lock().await;
        Self::loaded(&self.path, &mut guard).clone()
    }

    /// True when no token is stored or its deadline has passed.
    pub async fn is_expired(&self, provider: &str) -> bool {
        match self.get(provider).await {
            Some(token) => token.is_expired_at(now_ms()),
            None => true,
        }
    }

    fn loaded<'a>(
        path: &Path,
        guard: &'a mut Option<HashMap<String, TokenSet>>,
    ) -> &'a mut HashMap<String, TokenSet> {
        guard.get_or_insert_with(|| Self::load_from_disk(path))
    }

    fn load_from_disk(path: &Path) -> HashMap<String, TokenSet> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => return HashMap::new(),
        };
        match serde_json::from_str(&contents) {
            Ok(map) => map,
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    "token store file is malformed, starting empty: {error}"
                );
                HashMap::new()
            }
        }
    }

    fn persist(path: &Path, map: &HashMap<String, TokenSet>) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create token store directory {}",
                    parent.display()
                )
            })?;
        }

        let json = serde_json::to_string_pretty(map)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write token store {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace token store {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn token(provider: &str, expires_at: i64) -> TokenSet {
        TokenSet {
            provider: provider.to_string(),
            access_token: format!("at-{provider}"),
            refresh_token: Some(format!("rt-{provider}")),
            expires_at,
        }
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));

        let expected = token("openai", now_ms() + 3_600_000);
        store.save(expected.clone()).await.unwrap();

        assert_eq!(store.get("openai").await, Some(expected));
    }

    #[tokio::test]
    async fn persists_across_fresh_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");

        let expected = token("gemini", now_ms() + 1000);
        TokenStore::new(&path).save(expected.clone()).await.unwrap();

        let reopened = TokenStore::new(&path);
        assert_eq!(reopened.get("gemini").await, Some(expected));
    }

    #[tokio::test]
    async fn missing_file_is_an_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("absent.json"));
        assert!(store.get("openai").await.is_none());
        assert!(store.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = TokenStore::new(&path);
        assert!(store.get("openai").await.is_none());

        // A save afterwards replaces the junk with a valid file.
        store.save(token("openai", now_ms() + 1000)).await.unwrap();
        let reopened = TokenStore::new(&path);
        assert!(reopened.get("openai").await.is_some());
    }

    #[tokio::test]
    async fn delete_removes_entry_durably() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");
        let store = TokenStore::new(&path);

        store.save(token("openai", now_ms() + 1000)).await.unwrap();
        store.save(token("gemini", now_ms() + 1000)).await.unwrap();
        store.delete("openai").await.unwrap();

        assert!(store.get("openai").await.is_none());
        let reopened = TokenStore::new(&path);
        assert!(reopened.get("openai").await.is_none());
        assert!(reopened.get("gemini").await.is_some());
    }

    #[tokio::test]
    async fn expiry_checks() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));

        assert!(store.is_expired("absent").await);

        store.save(token("stale", now_ms() - 1)).await.unwrap();
        assert!(store.is_expired("stale").await);

        store.save(token("fresh", now_ms() + 60_000)).await.unwrap();
        assert!(!store.is_expired("fresh").await);
    }

    #[tokio::test]
    async fn creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("tokens.json");
        let store = TokenStore::new(&path);
        store.save(token("openai", now_ms() + 1000)).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn file_is_pretty_printed_provider_map() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");
        let store = TokenStore::new(&path);
        store.save(token("openai", 123)).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\n  \"openai\""));
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["openai"]["expires_at"], 123);
    }
}
