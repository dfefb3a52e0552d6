// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface tests driven through the router without a socket.

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use cirrus_core::FunctionStatus;
use cirrus_engine::server::{API_KEY_HEADER, router};
use common::TestContext;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

const HELLO: &str = "module.exports = async () => ({ hello: 'world' });";

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    api_key: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = api_key {
        builder = builder.header(API_KEY_HEADER, key);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create(ctx: &TestContext, app: &Router, name: &str) -> String {
    let (status, body) = send(
        app,
        Method::POST,
        "/api/functions",
        Some("alice-key"),
        Some(json!({"name": name, "code": HELLO})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["status"], "pending");
    let id = body["functionId"].as_str().unwrap().to_string();
    let function = ctx.wait_for_terminal_status(&id).await;
    assert_eq!(function.status, FunctionStatus::Active);
    id
}

#[tokio::test]
async fn test_health() {
    let ctx = TestContext::new().await;
    let app = router(ctx.state());

    let (status, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_management_requires_api_key() {
    let ctx = TestContext::new().await;
    let app = router(ctx.state());

    let (status, body) = send(&app, Method::GET, "/api/functions", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = send(&app, Method::GET, "/api/functions", Some("nope"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_function_crud() {
    let ctx = TestContext::new().await;
    let app = router(ctx.state());
    let id = create(&ctx, &app, "crud").await;

    let (status, body) = send(&app, Method::GET, "/api/functions", Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let uri = format!("/api/functions/{}", id);
    let (status, body) = send(&app, Method::GET, &uri, Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "crud");
    assert_eq!(body["code"], HELLO);
    assert_eq!(body["version"], 1);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/functions",
        Some("alice-key"),
        Some(json!({"name": "crud", "code": HELLO})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "FUNCTION_ALREADY_EXISTS");

    let (status, body) = send(
        &app,
        Method::PATCH,
        &uri,
        Some("alice-key"),
        Some(json!({"isActive": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isActive"], false);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("{}/redeploy", uri),
        Some("alice-key"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    ctx.wait_for_terminal_status(&id).await;

    let (status, _) = send(&app, Method::DELETE, &uri, Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, Method::GET, &uri, Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Function not found");
}

#[tokio::test]
async fn test_other_owners_functions_are_hidden() {
    let ctx = TestContext::new().await;
    ctx.create_user("bob", "bob-key").await;
    let app = router(ctx.state());
    let id = create(&ctx, &app, "mine").await;

    let uri = format!("/api/functions/{}", id);
    let (status, _) = send(&app, Method::GET, &uri, Some("bob-key"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, Method::DELETE, &uri, Some("bob-key"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, Method::GET, "/api/functions", Some("bob-key"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_invoke_route_builds_context() {
    let ctx = TestContext::new().await;
    let app = router(ctx.state());
    create(&ctx, &app, "echo").await;

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/run/alice/echo?q=search&page=2")
        .header(API_KEY_HEADER, "alice-key")
        .header("x-trace", "abc")
        .body(Body::from("plain text"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["method"], "PUT");
    assert_eq!(body["result"]["query"], json!({"q": "search", "page": "2"}));
    assert_eq!(body["result"]["body"], "plain text");

    let forwarded = ctx.sandbox.last_request().await.unwrap();
    assert_eq!(
        forwarded.context.headers.get("x-trace").map(String::as_str),
        Some("abc")
    );
    assert!(!forwarded.context.headers.contains_key(API_KEY_HEADER));

    let (status, _) = send(&app, Method::GET, "/run/alice/echo", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logs_and_usage_endpoints() {
    let ctx = TestContext::new().await;
    let app = router(ctx.state());
    let id = create(&ctx, &app, "counted").await;

    for _ in 0..3 {
        let (status, _) = send(
            &app,
            Method::POST,
            "/run/alice/counted",
            Some("alice-key"),
            Some(json!({"n": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let logs_uri = format!("/api/functions/{}/logs", id);
    let (status, logs) = send(&app, Method::GET, &logs_uri, Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::OK);
    let logs = logs.as_array().unwrap().clone();
    assert_eq!(logs.len(), 3);
    assert_eq!(logs[0]["status"], "success");

    let log_id = logs[0]["logId"].as_str().unwrap();
    let log_uri = format!("{}/{}", logs_uri, log_id);
    let (status, log) = send(&app, Method::GET, &log_uri, Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(log["logId"], log_id);

    let (status, _) = send(&app, Method::DELETE, &log_uri, Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::GET, &log_uri, Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, Method::DELETE, &logs_uri, Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 2);

    let usage_uri = format!("/api/functions/{}/usage", id);
    let (status, usage) = send(&app, Method::GET, &usage_uri, Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::OK);
    let usage = usage.as_array().unwrap().clone();
    assert_eq!(usage.len(), 3);

    let usage_id = usage[0]["usageId"].as_str().unwrap();
    let one_uri = format!("{}/{}", usage_uri, usage_id);
    let (status, record) = send(&app, Method::GET, &one_uri, Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["usageId"], usage_id);
    let (status, _) = send(&app, Method::DELETE, &one_uri, Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, recent) = send(&app, Method::GET, "/api/usage", Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::OK);
    let recent = recent.as_array().unwrap().clone();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0]["functionName"], "counted");

    let (status, body) = send(&app, Method::DELETE, &usage_uri, Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 2);
}

#[tokio::test]
async fn test_invalid_filename_is_bad_request() {
    let ctx = TestContext::new().await;
    let app = router(ctx.state());

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/functions",
        Some("alice-key"),
        Some(json!({"name": "bad", "code": HELLO, "filename": "index.py"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}
