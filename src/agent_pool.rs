use std::sync::atomic::{AtomicUsize, Ordering};

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) Version/17.4 Safari/605.1.15",
];

/// Hands out User-Agent strings round-robin. Deterministic modulo the pool
/// size; the counter is relaxed because exact interleaving doesn't matter.
#[derive(Debug, Default)]
pub struct UserAgentPool {
    counter: AtomicUsize,
}

impl UserAgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> &'static str {
        let index = self.counter.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[index % USER_AGENTS.len()]
    }

    pub fn len(&self) -> usize {
        USER_AGENTS.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}
