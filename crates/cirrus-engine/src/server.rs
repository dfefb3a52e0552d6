// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface.
//!
//! `/run/{user_name}/{function_name}` is the public gateway; `/api/*` is the
//! management surface. Both identify the caller by the `api-key` header.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::handlers::{self, CreateFunctionRequest, FaasHandlerState};
use crate::orchestrator::FunctionUpdate;
use crate::sandbox::InvocationContext;

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "api-key";

type SharedState = Arc<FaasHandlerState>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.error_code(), "Request failed");
        }
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "code": self.error_code(),
        });
        (status, Json(body)).into_response()
    }
}

/// Build the router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/functions", post(create_function).get(list_functions))
        .route(
            "/api/functions/{id}",
            get(get_function)
                .patch(update_function)
                .delete(delete_function),
        )
        .route("/api/functions/{id}/redeploy", post(redeploy_function))
        .route("/api/functions/{id}/logs", get(list_logs).delete(clear_logs))
        .route(
            "/api/functions/{id}/logs/{log_id}",
            get(get_log).delete(delete_log),
        )
        .route(
            "/api/functions/{id}/usage",
            get(list_usage).delete(clear_usage),
        )
        .route(
            "/api/functions/{id}/usage/{usage_id}",
            get(get_usage).delete(delete_usage),
        )
        .route("/api/usage", get(recent_usage))
        .route("/run/{user_name}/{function_name}", any(invoke))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
}

/// Parsed JSON when possible, else the raw text, else null.
fn parse_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    if let Ok(value) = serde_json::from_slice(body) {
        return value;
    }
    match std::str::from_utf8(body) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::Null,
    }
}

/// Invocation context from an inbound request. The API key is not forwarded.
fn invocation_context(
    method: &Method,
    headers: &HeaderMap,
    query: BTreeMap<String, String>,
    body: &[u8],
) -> InvocationContext {
    let mut combined: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers
        .iter()
        .filter(|(name, _)| name.as_str() != API_KEY_HEADER)
    {
        let Ok(value) = value.to_str() else {
            continue;
        };
        combined
            .entry(name.as_str().to_string())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    InvocationContext {
        method: method.as_str().to_string(),
        headers: combined,
        query,
        body: parse_body(body),
    }
}

async fn health(State(state): State<SharedState>) -> Result<Response> {
    let health = handlers::handle_health_check(&state).await?;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(health)).into_response())
}

async fn create_function(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<CreateFunctionRequest>,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    let function = handlers::handle_create_function(&state, &caller, request).await?;
    Ok((StatusCode::CREATED, Json(function)).into_response())
}

async fn list_functions(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    let functions = handlers::handle_list_functions(&state, &caller).await?;
    Ok(Json(functions).into_response())
}

async fn get_function(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    let function = handlers::handle_get_function(&state, &caller, &id).await?;
    Ok(Json(function).into_response())
}

async fn update_function(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<FunctionUpdate>,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    let function = handlers::handle_update_function(&state, &caller, &id, patch).await?;
    Ok(Json(function).into_response())
}

async fn delete_function(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    handlers::handle_delete_function(&state, &caller, &id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn redeploy_function(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    let function = handlers::handle_redeploy_function(&state, &caller, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(function)).into_response())
}

async fn list_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    Ok(Json(handlers::handle_list_logs(&state, &caller, &id).await?).into_response())
}

async fn clear_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    Ok(Json(handlers::handle_clear_logs(&state, &caller, &id).await?).into_response())
}

async fn get_log(
    State(state): State<SharedState>,
    Path((id, log_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    Ok(Json(handlers::handle_get_log(&state, &caller, &id, &log_id).await?).into_response())
}

async fn delete_log(
    State(state): State<SharedState>,
    Path((id, log_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    handlers::handle_delete_log(&state, &caller, &id, &log_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_usage(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    Ok(Json(handlers::handle_list_usage(&state, &caller, &id).await?).into_response())
}

async fn clear_usage(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    Ok(Json(handlers::handle_clear_usage(&state, &caller, &id).await?).into_response())
}

async fn get_usage(
    State(state): State<SharedState>,
    Path((id, usage_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    Ok(Json(handlers::handle_get_usage(&state, &caller, &id, &usage_id).await?).into_response())
}

async fn delete_usage(
    State(state): State<SharedState>,
    Path((id, usage_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    handlers::handle_delete_usage(&state, &caller, &id, &usage_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn recent_usage(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = handlers::authenticate(&state, api_key(&headers)).await?;
    Ok(Json(handlers::handle_recent_usage(&state, &caller).await?).into_response())
}

async fn invoke(
    State(state): State<SharedState>,
    Path((user_name, function_name)): Path<(String, String)>,
    Query(query): Query<BTreeMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let context = invocation_context(&method, &headers, query, &body);
    let response = handlers::handle_invoke(
        &state,
        &user_name,
        &function_name,
        api_key(&headers),
        context,
    )
    .await;
    (response.status, Json(response.body)).into_response()
}
