//! Read-only observability endpoints plus token management, all under
//! `/api/dashboard`. Access tokens are never surfaced whole.

use super::AppState;
use super::handlers::error_response;
use crate::error::GatewayError;
use crate::token_store::{TokenSet, now_ms};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

/// `"..."` plus the last 8 characters; short tokens are fully masked.
fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "...".to_string();
    }
    let tail: String = chars[chars.len() - 8..].iter().collect();
    format!("...{tail}")
}

fn token_summary(token: &TokenSet) -> serde_json::Value {
    json!({
        "provider": token.provider,
        "access_token": mask_token(&token.access_token),
        "has_refresh_token": token.refresh_token.is_some(),
        "expires_at": token.expires_at,
        "expired": token.is_expired_at(now_ms()),
    })
}

pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut rate_limits = serde_json::Map::new();
    let mut providers = state.limiter.configured_providers();
    providers.sort();
    for provider in providers {
        let status = state.limiter.status(&provider).await;
        rate_limits.insert(provider, serde_json::to_value(status).unwrap_or_default());
    }

    let failed: Vec<serde_json::Value> = state
        .model_router
        .failed_providers()
        .into_iter()
        .map(|(provider, ttl_secs)| json!({ "provider": provider, "ttl_secs": ttl_secs }))
        .collect();

    let enabled: Vec<&String> = state
        .config
        .providers
        .iter()
        .filter(|(_, config)| config.enabled)
        .map(|(name, _)| name)
        .collect();

    Json(json!({
        "status": "ok",
        "providers": enabled,
        "failed_providers": failed,
        "rate_limits": rate_limits,
    }))
}

pub async fn tokens(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut entries: Vec<serde_json::Value> = state
        .store
        .get_all()
        .await
        .values()
        .map(token_summary)
        .collect();
    entries.sort_by_key(|entry| entry["provider"].as_str().map(String::from));
    Json(json!({ "tokens": entries }))
}

pub async fn usage(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.usage.snapshot()).unwrap_or_default())
}

pub async fn models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let aliases: Vec<serde_json::Value> = state
        .model_router
        .alias_names()
        .into_iter()
        .map(|alias| {
            let routes: Vec<serde_json::Value> = state
                .model_router
                .alias_routes(&alias)
                .unwrap_or_default()
                .iter()
                .map(|route| {
                    json!({
                        "provider": route.provider,
                        "model": route.model,
                        "priority": route.priority,
                    })
                })
                .collect();
            json!({ "alias": alias, "providers": routes })
        })
        .collect();
    Json(json!({ "models": aliases }))
}

pub async fn device_flow_start(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Response {
    match state.auth.initiate_device_flow(&provider).await {
        Ok(init) => Json(serde_json::to_value(init).unwrap_or_default()).into_response(),
        Err(error) => anyhow_error_response(&error),
    }
}

#[derive(Debug, Deserialize)]
pub struct DeviceFlowCompleteBody {
    pub device_code: String,
}

pub async fn device_flow_complete(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(body): Json<DeviceFlowCompleteBody>,
) -> Response {
    match state
        .auth
        .complete_device_flow(&provider, &body.device_code)
        .await
    {
        Ok(token) => Json(token_summary(&token)).into_response(),
        Err(error) => anyhow_error_response(&error),
    }
}

pub async fn refresh_token(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Response {
    match state.auth.refresh_token(&provider).await {
        Ok(token) => Json(token_summary(&token)).into_response(),
        Err(error) => error_response(&GatewayError::Provider(error)),
    }
}

#[derive(Debug, Deserialize)]
pub struct InsertTokenBody {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

pub async fn insert_token(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(body): Json<InsertTokenBody>,
) -> Response {
    if body.access_token.trim().is_empty() {
        return error_response(&GatewayError::validation(
            "'access_token' is required and must be a non-empty string",
        ));
    }

    let expires_at = body
        .expires_at
        .or_else(|| body.expires_in.map(|secs| now_ms() + secs * 1000))
        .unwrap_or_else(|| now_ms() + 3_600_000);

    let token = TokenSet {
        provider: provider.clone(),
        access_token: body.access_token,
        refresh_token: body.refresh_token,
        expires_at,
    };

    match state.store.save(token.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(token_summary(&token))).into_response(),
        Err(error) => anyhow_error_response(&error),
    }
}

fn anyhow_error_response(error: &anyhow::Error) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": {
                "message": format!("{error:#}"),
                "type": "invalid_request_error",
                "code": null,
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_keeps_only_the_tail() {
        assert_eq!(mask_token("sk-abcdefghijklmnop"), "...ijklmnop");
        assert_eq!(mask_token("short"), "...");
        assert_eq!(mask_token(""), "...");
    }

    #[test]
    fn token_summary_never_contains_the_full_token() {
        let token = TokenSet {
            provider: "openai".to_string(),
            access_token: "sk-secret-value-12345678".to_string(),
            refresh_token: Some("rt-secret".to_string()),
            expires_at: now_ms() + 1000,
        };
        let summary = token_summary(&token);
        let text = summary.to_string();
        assert!(!text.contains("sk-secret-value-12345678"));
        assert!(!text.contains("rt-secret"));
        assert_eq!(summary["access_token"], "...12345678");
        assert_eq!(summary["has_refresh_token"], true);
        assert_eq!(summary["expired"], false);
    }
}
