use super::AppState;
use crate::dispatch::{Dispatcher, SseStream};
use crate::error::GatewayError;
use crate::normalize::to_canonical_error;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use futures_util::StreamExt;
use std::convert::Infallible;

pub async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return error_response(&GatewayError::validation(
                "request body must be a JSON object",
            ));
        }
    };

    let request = match Dispatcher::parse(&value) {
        Ok(request) => request,
        Err(error) => return error_response(&error),
    };

    if request.stream {
        match state.dispatcher.complete_stream(&request).await {
            Ok(stream) => sse_response(stream),
            Err(error) => error_response(&error),
        }
    } else {
        match state.dispatcher.complete(&request).await {
            Ok(completion) => Json(completion).into_response(),
            Err(error) => error_response(&error),
        }
    }
}

pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let created = chrono::Utc::now().timestamp();
    let data: Vec<serde_json::Value> = state
        .model_router
        .alias_names()
        .into_iter()
        .map(|alias| {
            serde_json::json!({
                "id": alias,
                "object": "model",
                "created": created,
                "owned_by": "llm-gateway",
            })
        })
        .collect();
    Json(serde_json::json!({ "object": "list", "data": data }))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn not_found() -> Response {
    let envelope = serde_json::json!({
        "error": {
            "message": "Not found",
            "type": "invalid_request_error",
            "code": null,
        }
    });
    (StatusCode::NOT_FOUND, Json(envelope)).into_response()
}

pub(super) fn error_response(error: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(error.kind().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(to_canonical_error(error))).into_response()
}

fn sse_response(stream: SseStream) -> Response {
    let body = Body::from_stream(stream.map(Ok::<_, Infallible>));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        header::CONNECTION,
        header::HeaderValue::from_static("keep-alive"),
    );
    headers.insert(
        "x-accel-buffering",
        header::HeaderValue::from_static("no"),
    );
    response
}
