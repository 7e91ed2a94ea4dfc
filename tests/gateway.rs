//! End-to-end tests: a real gateway listener in front of wiremock upstreams.

use llm_gateway::config::{
    AuthConfig, Config, GatewayConfig, ModelAlias, ProviderConfig, ProviderModel,
};
use llm_gateway::gateway::{build_router, build_state};
use llm_gateway::token_store::{TokenSet, TokenStore, now_ms};
use std::collections::HashMap;
use std::path::PathBuf;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Gateway {
    base_url: String,
    _dir: TempDir,
}

fn provider_config(api_endpoint: &str, token_endpoint: Option<&str>) -> ProviderConfig {
    ProviderConfig {
        enabled: true,
        client_id: token_endpoint.map(|_| "client-123".to_string()),
        client_secret: None,
        auth_endpoint: None,
        token_endpoint: token_endpoint.map(String::from),
        api_endpoint: api_endpoint.to_string(),
        scope: String::new(),
    }
}

fn gateway_config(
    token_store_path: PathBuf,
    providers: HashMap<String, ProviderConfig>,
) -> Config {
    Config {
        gateway: GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        auth: AuthConfig {
            token_store_path,
            watch_files: Vec::new(),
        },
        model_aliases: vec![ModelAlias {
            alias: "gpt-4".to_string(),
            providers: vec![
                ProviderModel {
                    provider: "openai".to_string(),
                    model: "gpt-4".to_string(),
                    priority: 1,
                },
                ProviderModel {
                    provider: "gemini".to_string(),
                    model: "gemini-pro".to_string(),
                    priority: 2,
                },
            ],
        }],
        rate_limits: Vec::new(),
        providers,
    }
}

async fn seed_token(path: &PathBuf, provider: &str, token: TokenSet) {
    let store = TokenStore::new(path.clone());
    let mut token = token;
    token.provider = provider.to_string();
    store.save(token).await.unwrap();
}

fn fresh_token(access: &str) -> TokenSet {
    TokenSet {
        provider: String::new(),
        access_token: access.to_string(),
        refresh_token: None,
        expires_at: now_ms() + 3_600_000,
    }
}

async fn start_gateway(openai: &MockServer, gemini: &MockServer) -> Gateway {
    start_gateway_with(openai, gemini, None, true).await
}

/// Boot a gateway against the two mock upstreams. `token_endpoint` wires the
/// openai provider for refresh; `seed_fresh` stores valid tokens for both.
async fn start_gateway_with(
    openai: &MockServer,
    gemini: &MockServer,
    token_endpoint: Option<String>,
    seed_fresh: bool,
) -> Gateway {
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("tokens.json");

    if seed_fresh {
        seed_token(&store_path, "openai", fresh_token("openai-token")).await;
        seed_token(&store_path, "gemini", fresh_token("gemini-token")).await;
    }

    let providers = HashMap::from([
        (
            "openai".to_string(),
            provider_config(&openai.uri(), token_endpoint.as_deref()),
        ),
        ("gemini".to_string(), provider_config(&gemini.uri(), None)),
    ]);

    let state = build_state(gateway_config(store_path, providers));
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Gateway {
        base_url: format!("http://{addr}"),
        _dir: dir,
    }
}

fn chat_body(model: &str, stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hi"}],
        "stream": stream,
    })
}

fn openai_completion(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "upstream-id",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    })
}

fn gemini_completion(text: &str) -> serde_json::Value {
    serde_json::json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": "STOP"
        }],
        "usageMetadata": {
            "promptTokenCount": 4,
            "candidatesTokenCount": 3,
            "totalTokenCount": 7
        }
    })
}

#[tokio::test]
async fn s1_happy_path_completion() {
    let openai = MockServer::start().await;
    let gemini = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer openai-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_completion("Hello")))
        .expect(1)
        .mount(&openai)
        .await;

    let gateway = start_gateway(&openai, &gemini).await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway.base_url))
        .json(&chat_body("gpt-4", false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-request-id"));

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gpt-4");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 15);
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
}

#[tokio::test]
async fn s2_streaming_fans_chunks_through() {
    let openai = MockServer::start().await;
    let gemini = MockServer::start().await;

    let sse_body = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hello\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\" world\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .expect(1)
        .mount(&openai)
        .await;

    let gateway = start_gateway(&openai, &gemini).await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway.base_url))
        .json(&chat_body("gpt-4", true))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(response.headers()["cache-control"].to_str().unwrap(), "no-cache");
    assert_eq!(response.headers()["x-accel-buffering"].to_str().unwrap(), "no");

    let body = response.text().await.unwrap();
    let frames: Vec<&str> = body
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .collect();
    assert!(frames.len() >= 3);
    assert_eq!(*frames.last().unwrap(), "data: [DONE]");

    let data_frames: Vec<serde_json::Value> = frames
        .iter()
        .filter(|frame| *frame != &"data: [DONE]")
        .map(|frame| serde_json::from_str(frame.trim_start_matches("data: ")).unwrap())
        .collect();
    assert!(data_frames.len() >= 2);
    let first_id = data_frames[0]["id"].as_str().unwrap();
    for frame in &data_frames {
        assert_eq!(frame["object"], "chat.completion.chunk");
        assert_eq!(frame["id"], first_id);
        assert_eq!(frame["model"], "gpt-4");
    }
    assert_eq!(data_frames[0]["choices"][0]["delta"]["content"], "Hello");
}

#[tokio::test]
async fn s3_fallback_to_second_provider() {
    let openai = MockServer::start().await;
    let gemini = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .expect(1)
        .mount(&openai)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-pro:generateContent"))
        .and(header("authorization", "Bearer gemini-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_completion("from gemini")))
        .expect(1)
        .mount(&gemini)
        .await;

    let gateway = start_gateway(&openai, &gemini).await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway.base_url))
        .json(&chat_body("gpt-4", false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "from gemini");
    assert_eq!(body["usage"]["total_tokens"], 7);
}

#[tokio::test]
async fn s4_exhaustion_returns_503() {
    let openai = MockServer::start().await;
    let gemini = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&openai)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-pro:generateContent"))
        .respond_with(ResponseTemplate::new(503).set_body_string("also down"))
        .mount(&gemini)
        .await;

    let gateway = start_gateway(&openai, &gemini).await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway.base_url))
        .json(&chat_body("gpt-4", false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "server_error");
    assert_eq!(body["error"]["code"], "service_unavailable");
}

#[tokio::test]
async fn s5_validation_failure_is_400() {
    let openai = MockServer::start().await;
    let gemini = MockServer::start().await;
    let gateway = start_gateway(&openai, &gemini).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway.base_url))
        .json(&serde_json::json!({
            "messages": [{"role": "user", "content": "x"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert!(response.headers().contains_key("x-request-id"));
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("'model' is required")
    );
}

#[tokio::test]
async fn s6_expired_token_is_refreshed_before_the_call() {
    let openai = MockServer::start().await;
    let gemini = MockServer::start().await;
    let auth_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "refreshed-token",
            "refresh_token": "next-refresh",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&auth_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer refreshed-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_completion("after refresh")))
        .expect(1)
        .mount(&openai)
        .await;

    let gateway = start_gateway_with(
        &openai,
        &gemini,
        Some(format!("{}/token", auth_server.uri())),
        false,
    )
    .await;

    // Stored openai token is a second past expiry but refreshable.
    let store_path = gateway._dir.path().join("tokens.json");
    seed_token(
        &store_path,
        "openai",
        TokenSet {
            provider: String::new(),
            access_token: "stale-token".to_string(),
            refresh_token: Some("refresh-me".to_string()),
            expires_at: now_ms() - 1000,
        },
    )
    .await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gateway.base_url))
        .json(&chat_body("openai/gpt-4", false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "after refresh");
}

#[tokio::test]
async fn models_endpoint_lists_aliases() {
    let openai = MockServer::start().await;
    let gemini = MockServer::start().await;
    let gateway = start_gateway(&openai, &gemini).await;

    let body: serde_json::Value = reqwest::get(format!("{}/v1/models", gateway.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "gpt-4");
    assert_eq!(body["data"][0]["object"], "model");
    assert_eq!(body["data"][0]["owned_by"], "llm-gateway");
}

#[tokio::test]
async fn health_and_unknown_routes() {
    let openai = MockServer::start().await;
    let gemini = MockServer::start().await;
    let gateway = start_gateway(&openai, &gemini).await;

    let health: serde_json::Value = reqwest::get(format!("{}/health", gateway.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let missing = reqwest::get(format!("{}/nope", gateway.base_url))
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    let body: serde_json::Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn dashboard_masks_tokens_and_reports_usage() {
    let openai = MockServer::start().await;
    let gemini = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_completion("hi")))
        .mount(&openai)
        .await;

    let gateway = start_gateway(&openai, &gemini).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/v1/chat/completions", gateway.base_url))
        .json(&chat_body("gpt-4", false))
        .send()
        .await
        .unwrap();

    let tokens: serde_json::Value = client
        .get(format!("{}/api/dashboard/tokens", gateway.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let text = tokens.to_string();
    assert!(!text.contains("openai-token"));
    assert!(text.contains("..."));

    let usage: serde_json::Value = client
        .get(format!("{}/api/dashboard/usage", gateway.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(usage["total_requests"], 1);
    assert_eq!(usage["total_tokens"], 15);

    let status: serde_json::Value = client
        .get(format!("{}/api/dashboard/status", gateway.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "ok");
}
