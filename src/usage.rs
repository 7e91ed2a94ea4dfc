use crate::providers::TokenUsage;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Best-effort usage counters per `(provider, model)`, reset on restart.
/// Recording never fails and never blocks a request outcome.
pub struct UsageTracker {
    inner: Mutex<UsageState>,
}

struct UsageState {
    since: chrono::DateTime<chrono::Utc>,
    entries: HashMap<(String, String), Counter>,
}

#[derive(Default, Clone)]
struct Counter {
    requests: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageEntry {
    pub provider: String,
    pub model: String,
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub since: String,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub entries: Vec<UsageEntry>,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(UsageState {
                since: chrono::Utc::now(),
                entries: HashMap::new(),
            }),
        }
    }
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, provider: &str, model: &str, usage: Option<&TokenUsage>) {
        let mut state = self.inner.lock().expect("usage state poisoned");
        let counter = state
            .entries
            .entry((provider.to_string(), model.to_string()))
            .or_default();
        counter.requests += 1;
        if let Some(usage) = usage {
            counter.prompt_tokens += usage.prompt_tokens;
            counter.completion_tokens += usage.completion_tokens;
            counter.total_tokens += usage.total_tokens;
        }
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let state = self.inner.lock().expect("usage state poisoned");
        let mut entries: Vec<UsageEntry> = state
            .entries
            .iter()
            .map(|((provider, model), counter)| UsageEntry {
                provider: provider.clone(),
                model: model.clone(),
                requests: counter.requests,
                prompt_tokens: counter.prompt_tokens,
                completion_tokens: counter.completion_tokens,
                total_tokens: counter.total_tokens,
            })
            .collect();
        entries.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));

        UsageSnapshot {
            since: state.since.to_rfc3339(),
            total_requests: entries.iter().map(|entry| entry.requests).sum(),
            total_tokens: entries.iter().map(|entry| entry.total_tokens).sum(),
            entries,
        }
    }
}
