use crate::config::{ModelAlias, ProviderModel};
use crate::error::GatewayError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_FAILURE_TTL: Duration = Duration::from_secs(60);

/// Resolves client-visible model names to prioritized provider routes and
/// remembers recent provider failures.
///
/// A provider stays "failed" for `failure_ttl` after being reported; entries
/// are evicted lazily whenever the map is consulted. Selection prefers
/// non-failed candidates but degrades to the best failed one rather than
/// refusing outright, so a recovered upstream gets traffic again without
/// waiting for the TTL.
pub struct Router {
    aliases: HashMap<String, Vec<ProviderModel>>,
    failed: Mutex<HashMap<String, Instant>>,
    failure_ttl: Duration,
}

impl Router {
    pub fn new(aliases: &[ModelAlias]) -> Self {
        Self::with_failure_ttl(aliases, DEFAULT_FAILURE_TTL)
    }

    pub fn with_failure_ttl(aliases: &[ModelAlias], failure_ttl: Duration) -> Self {
        let aliases = aliases
            .iter()
            .map(|alias| {
                let mut routes = alias.providers.clone();
                routes.sort_by_key(|route| route.priority);
                (alias.alias.clone(), routes)
            })
            .collect();
        Self {
            aliases,
            failed: Mutex::new(HashMap::new()),
            failure_ttl,
        }
    }

    pub fn alias_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.aliases.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn alias_routes(&self, alias: &str) -> Option<&[ProviderModel]> {
        self.aliases.get(alias).map(Vec::as_slice)
    }

    /// Candidates for `model`, best-first. Unaliased `provider/model` names
    /// resolve to a single candidate.
    pub fn resolve(&self, model: &str) -> Result<Vec<ProviderModel>, GatewayError> {
        if let Some(routes) = self.aliases.get(model) {
            return Ok(routes.clone());
        }
        if let Some((provider, model_name)) = model.split_once('/') {
            return Ok(vec![ProviderModel {
                provider: provider.to_string(),
                model: model_name.to_string(),
                priority: 0,
            }]);
        }
        Err(GatewayError::UnknownModel(model.to_string()))
    }

    /// Best candidate: lowest priority not currently failed, else the lowest
    /// priority failed one, else `None` for an empty list.
    pub fn select(&self, candidates: &[ProviderModel]) -> Option<ProviderModel> {
        let mut failed = self.failed.lock().expect("failure map poisoned");
        let ttl = self.failure_ttl;
        failed.retain(|_, at| at.elapsed() <= ttl);

        let available = candidates
            .iter()
            .filter(|candidate| !failed.contains_key(&candidate.provider))
            .min_by_key(|candidate| candidate.priority);
        if let Some(candidate) = available {
            return Some(candidate.clone());
        }

        candidates
            .iter()
            .min_by_key(|candidate| candidate.priority)
            .cloned()
    }

    /// Record a failure for `failed_provider` and pick the next candidate
    /// for `model`.
    pub fn next_provider(&self, model: &str, failed_provider: &str) -> Option<ProviderModel> {
        self.mark_failed(failed_provider);
        let candidates = self.resolve(model).ok()?;
        self.select(&candidates)
    }

    pub fn mark_failed(&self, provider: &str) {
        self.failed
            .lock()
            .expect("failure map poisoned")
            .insert(provider.to_string(), Instant::now());
    }

    /// Providers currently in the failure map, with seconds left on their
    /// TTL. Evicts stale entries as a side effect.
    pub fn failed_providers(&self) -> Vec<(String, u64)> {
        let mut failed = self.failed.lock().expect("failure map poisoned");
        let ttl = self.failure_ttl;
        failed.retain(|_, at| at.elapsed() <= ttl);
        let mut entries: Vec<(String, u64)> = failed
            .iter()
            .map(|(provider, at)| {
                let remaining = ttl.saturating_sub(at.elapsed());
                (provider.clone(), remaining.as_secs())
            })
            .collect();
        entries.sort();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alias(name: &str, routes: &[(&str, &str, u32)]) -> ModelAlias {
        ModelAlias {
            alias: name.to_string(),
            providers: routes
                .iter()
                .map(|(provider, model, priority)| ProviderModel {
                    provider: (*provider).to_string(),
                    model: (*model).to_string(),
                    priority: *priority,
                })
                .collect(),
        }
    }

    fn router() -> Router {
        Router::new(&[alias(
            "gpt-4",
            &[("gemini", "gemini-pro", 2), ("openai", "gpt-4", 1)],
        )])
    }

    #[test]
    fn resolve_returns_candidates_sorted_by_priority() {
        let router = router();
        let candidates = router.resolve("gpt-4").unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].provider, "openai");
        assert_eq!(candidates[1].provider, "gemini");
    }

    #[test]
    fn resolve_splits_provider_slash_model() {
        let router = router();
        let candidates = router.resolve("openai/gpt-4o-mini").unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provider, "openai");
        assert_eq!(candidates[0].model, "gpt-4o-mini");
        assert_eq!(candidates[0].priority, 0);
    }

    #[test]
    fn resolve_splits_at_first_slash_only() {
        let router = router();
        let candidates = router.resolve("openai/org/model").unwrap();
        assert_eq!(candidates[0].provider, "openai");
        assert_eq!(candidates[0].model, "org/model");
    }

    #[test]
    fn resolve_rejects_unknown_models() {
        let router = router();
        let err = router.resolve("made-up").unwrap_err();
        assert!(err.to_string().contains("Unknown model: made-up"));
    }

    #[test]
    fn select_prefers_lowest_priority_available() {
        let router = router();
        let candidates = router.resolve("gpt-4").unwrap();
        let selected = router.select(&candidates).unwrap();
        assert_eq!(selected.provider, "openai");
    }

    #[test]
    fn select_skips_failed_providers() {
        let router = router();
        router.mark_failed("openai");
        let candidates = router.resolve("gpt-4").unwrap();
        let selected = router.select(&candidates).unwrap();
        assert_eq!(selected.provider, "gemini");
    }

    #[test]
    fn select_degrades_to_best_failed_when_all_failed() {
        let router = router();
        router.mark_failed("openai");
        router.mark_failed("gemini");
        let candidates = router.resolve("gpt-4").unwrap();
        let selected = router.select(&candidates).unwrap();
        assert_eq!(selected.provider, "openai");
    }

    #[test]
    fn select_of_empty_list_is_none() {
        let router = router();
        assert!(router.select(&[]).is_none());
    }

    #[test]
    fn next_provider_never_repeats_the_failed_one() {
        let router1 = router();
        let next = router1.next_provider("gpt-4", "openai").unwrap();
        assert_eq!(next.provider, "gemini");

        let router2 = router();
        let next = router2.next_provider("gpt-4", "gemini").unwrap();
        assert_eq!(next.provider, "openai");
    }

    #[test]
    fn failures_expire_after_ttl() {
        let router = Router::with_failure_ttl(
            &[alias("gpt-4", &[("openai", "gpt-4", 1), ("gemini", "g", 2)])],
            Duration::from_millis(10),
        );
        router.mark_failed("openai");
        std::thread::sleep(Duration::from_millis(25));

        let candidates = router.resolve("gpt-4").unwrap();
        let selected = router.select(&candidates).unwrap();
        assert_eq!(selected.provider, "openai");
        assert!(router.failed_providers().is_empty());
    }

    #[test]
    fn failed_providers_reports_remaining_ttl() {
        let router = router();
        router.mark_failed("openai");
        let failed = router.failed_providers();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "openai");
        assert!(failed[0].1 <= 60);
    }
}
