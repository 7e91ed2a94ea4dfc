use crate::config::RateLimitConfig;
use crate::error::ProviderError;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Duration, Instant, interval};

const WINDOW: Duration = Duration::from_secs(60);
const RELEASE_TICK: Duration = Duration::from_secs(1);

/// Sliding-window admission control per provider with a bounded FIFO wait
/// queue.
///
/// Admissions are timestamps inside the last 60 s. When the window is full,
/// callers queue (up to `max_queue_size`) and a per-provider 1 s ticker
/// releases them in FIFO order as capacity frees up. Providers are fully
/// independent: saturating one never delays another.
pub struct RateLimiter {
    limiters: HashMap<String, Arc<ProviderLimiter>>,
    disposed: Arc<AtomicBool>,
}

struct ProviderLimiter {
    provider: String,
    requests_per_minute: usize,
    max_queue_size: usize,
    state: Mutex<LimiterState>,
}

#[derive(Default)]
struct LimiterState {
    window: VecDeque<Instant>,
    queue: VecDeque<Waiter>,
    ticker_running: bool,
}

struct Waiter {
    tx: oneshot::Sender<Result<(), ProviderError>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub requests_in_window: usize,
    pub queue_length: usize,
    pub next_available_slot_epoch_ms: i64,
}

impl LimiterState {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.window.front() {
            if now.duration_since(*oldest) > WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateLimiter {
    pub fn new(configs: &[RateLimitConfig]) -> Self {
        let limiters = configs
            .iter()
            .map(|config| {
                (
                    config.provider.clone(),
                    Arc::new(ProviderLimiter {
                        provider: config.provider.clone(),
                        requests_per_minute: config.requests_per_minute,
                        max_queue_size: config.max_queue_size,
                        state: Mutex::new(LimiterState::default()),
                    }),
                )
            })
            .collect();
        Self {
            limiters,
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Completes when a slot is granted. Unconfigured providers are admitted
    /// immediately. Fails with a `rate_limit` error when the wait queue is
    /// full or the limiter has been disposed; neither failure is retryable.
    pub async fn acquire(&self, provider: &str) -> Result<(), ProviderError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(disposed_error(provider));
        }
        let Some(limiter) = self.limiters.get(provider) else {
            return Ok(());
        };

        let rx = {
            let mut state = limiter.state.lock().await;
            let now = Instant::now();
            state.prune(now);

            if state.window.len() < limiter.requests_per_minute {
                state.window.push_back(now);
                return Ok(());
            }

            if state.queue.len() >= limiter.max_queue_size {
                return Err(ProviderError::rate_limited(
                    provider,
                    format!("rate limit queue full for {provider}"),
                ));
            }

            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter { tx });
            if !state.ticker_running {
                state.ticker_running = true;
                spawn_release_ticker(Arc::clone(limiter));
            }
            rx
        };

        match rx.await {
            Ok(result) => result,
            // Sender dropped without a verdict; treat as disposal.
            Err(_) => Err(disposed_error(provider)),
        }
    }

    /// Current window/queue occupancy. `next_available_slot_epoch_ms` is 0
    /// while under capacity, otherwise when the oldest admission ages out.
    pub async fn status(&self, provider: &str) -> RateLimitStatus {
        let Some(limiter) = self.limiters.get(provider) else {
            return RateLimitStatus {
                requests_in_window: 0,
                queue_length: 0,
                next_available_slot_epoch_ms: 0,
            };
        };

        let mut state = limiter.state.lock().await;
        let now = Instant::now();
        state.prune(now);

        let next_available_slot_epoch_ms = if state.window.len() < limiter.requests_per_minute {
            0
        } else {
            state.window.front().map_or(0, |oldest| {
                let elapsed_ms = i64::try_from(now.duration_since(*oldest).as_millis())
                    .unwrap_or(i64::MAX);
                let window_ms = i64::try_from(WINDOW.as_millis()).unwrap_or(60_000);
                chrono::Utc::now().timestamp_millis() - elapsed_ms + window_ms
            })
        };

        RateLimitStatus {
            requests_in_window: state.window.len(),
            queue_length: state.queue.len(),
            next_available_slot_epoch_ms,
        }
    }

    pub fn configured_providers(&self) -> Vec<String> {
        self.limiters.keys().cloned().collect()
    }

    /// Rejects every queued waiter and refuses further admissions. The
    /// release tickers observe their queues drained and stop on their next
    /// tick.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        for limiter in self.limiters.values() {
            let mut state = limiter.state.lock().await;
            while let Some(waiter) = state.queue.pop_front() {
                let _ = waiter.tx.send(Err(disposed_error(&limiter.provider)));
            }
        }
    }
}

fn disposed_error(provider: &str) -> ProviderError {
    ProviderError::rate_limited(provider, "rate limiter disposed")
}

fn spawn_release_ticker(limiter: Arc<ProviderLimiter>) {
    tokio::spawn(async move {
        let mut tick = interval(RELEASE_TICK);
        // The first tick of a tokio interval fires immediately; skip it so
        // releases happen on the 1 s cadence.
        tick.tick().await;
        loop {
            tick.tick().await;
            let mut state = limiter.state.lock().await;
            let now = Instant::now();
            state.prune(now);

            while !state.queue.is_empty() && state.window.len() < limiter.requests_per_minute {
                if let Some(waiter) = state.queue.pop_front() {
                    state.window.push_back(now);
                    let _ = waiter.tx.send(Ok(()));
                }
            }

            if state.queue.is_empty() {
                state.ticker_running = false;
                return;
            }
        }
    });
}
