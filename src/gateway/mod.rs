//! Axum HTTP surface: the OpenAI-compatible API, health, and the dashboard.
//!
//! Listens on loopback only; non-loopback hosts are refused before a socket
//! is ever bound. Body size and request timeouts are enforced by tower-http
//! layers so slow or oversized clients never reach a handler.

mod dashboard;
mod handlers;

use crate::auth::AuthManager;
use crate::config::{Config, is_loopback_host};
use crate::dispatch::Dispatcher;
use crate::providers::AdapterRegistry;
use crate::rate_limit::RateLimiter;
use crate::router::Router as ModelRouter;
use crate::token_store::TokenStore;
use crate::usage::UsageTracker;
use anyhow::{Context, Result, bail};
use axum::Router;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (256 KiB).
pub const MAX_BODY_SIZE: usize = 262_144;
/// Per-request timeout covering everything up to the response head.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub model_router: Arc<ModelRouter>,
    pub limiter: Arc<RateLimiter>,
    pub auth: Arc<AuthManager>,
    pub store: Arc<TokenStore>,
    pub usage: Arc<UsageTracker>,
}

/// Wire every long-lived component together from the parsed config.
pub fn build_state(config: Config) -> AppState {
    let config = Arc::new(config);
    let store = Arc::new(TokenStore::new(config.auth.token_store_path.clone()));
    let agents = Arc::new(crate::agent_pool::UserAgentPool::new());
    let adapters = Arc::new(AdapterRegistry::from_config(&config, agents));
    let model_router = Arc::new(ModelRouter::new(&config.model_aliases));
    let limiter = Arc::new(RateLimiter::new(&config.rate_limits));
    let auth = Arc::new(AuthManager::new(
        config.providers.clone(),
        Arc::clone(&store),
    ));
    let usage = Arc::new(UsageTracker::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&model_router),
        Arc::clone(&limiter),
        Arc::clone(&auth),
        adapters,
        Arc::clone(&usage),
    ));

    AppState {
        config,
        dispatcher,
        model_router,
        limiter,
        auth,
        store,
        usage,
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health))
        .route("/api/dashboard/status", get(dashboard::status))
        .route("/api/dashboard/tokens", get(dashboard::tokens))
        .route("/api/dashboard/usage", get(dashboard::usage))
        .route("/api/dashboard/models", get(dashboard::models))
        .route(
            "/api/dashboard/tokens/{provider}/device-flow",
            post(dashboard::device_flow_start),
        )
        .route(
            "/api/dashboard/tokens/{provider}/device-flow/complete",
            post(dashboard::device_flow_complete),
        )
        .route(
            "/api/dashboard/tokens/{provider}/refresh",
            post(dashboard::refresh_token),
        )
        .route(
            "/api/dashboard/tokens/{provider}",
            post(dashboard::insert_token),
        )
        .fallback(handlers::not_found)
        .layer(axum::middleware::from_fn(stamp_request_id))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .with_state(state)
}

/// Every response carries a fresh `X-Request-Id`.
async fn stamp_request_id(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Bind and serve until ctrl-c. Refuses non-loopback hosts, starts the
/// token-file watcher, and disposes the rate limiter on the way out so
/// queued waiters fail deterministically.
pub async fn serve(config: Config) -> Result<()> {
    if !is_loopback_host(&config.gateway.host) {
        bail!(
            "refusing to bind non-loopback host '{}'",
            config.gateway.host
        );
    }

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let watch_files = config.auth.watch_files.clone();
    let state = build_state(config);

    if !watch_files.is_empty() {
        Arc::clone(&state.auth).watch_files(watch_files);
    }

    let limiter = Arc::clone(&state.limiter);
    let auth = Arc::clone(&state.auth);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = addr.as_str(), "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    auth.stop_watching();
    limiter.dispose().await;
    Ok(())
}
