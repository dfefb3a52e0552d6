// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment lifecycle tests against in-memory stores and mock tools.

mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use cirrus_core::{FunctionStatus, layout};
use cirrus_engine::orchestrator::{FunctionUpdate, OrchestratorConfig, sha256_hex};
use cirrus_engine::sandbox::InvocationContext;
use cirrus_engine::{
    DependencyCache, DeploymentOrchestrator, Error, MockBundler, MockInstaller, MockSandbox,
};
use common::{PUBLIC_URL, TestContext};

const HELLO: &str = "module.exports = async () => ({ hello: 'world' });";
const WITH_LODASH: &str =
    "const _ = require('lodash');\nmodule.exports = async () => _.identity(1);";

#[tokio::test]
async fn test_deploy_returns_pending_then_becomes_active() {
    let ctx = TestContext::new().await;

    let created = ctx
        .orchestrator
        .deploy(&ctx.user.user_id, "hello", HELLO, None)
        .await
        .unwrap();
    assert_eq!(created.status, FunctionStatus::Pending);
    assert_eq!(created.version, 1);
    assert_eq!(created.endpoint, format!("{}/run/alice/hello", PUBLIC_URL));
    assert!(created.bundle_hash.is_none());

    let function = ctx.wait_for_terminal_status(&created.function_id).await;
    assert_eq!(function.status, FunctionStatus::Active);
    assert_eq!(function.version, 1);
    assert!(function.deploy_error.is_none());
    assert!(function.deployed_at.is_some());
    assert!(function.dependency_hash.is_none());
    assert_eq!(function.source_path, layout::source(&function.function_id, "index.js"));

    let bundle = ctx.store.get(&function.bundle_path).await.unwrap().unwrap();
    assert_eq!(
        function.bundle_hash.as_deref(),
        Some(cirrus_engine::orchestrator::sha256_hex(&bundle).as_str())
    );
    assert!(
        ctx.store
            .exists(&layout::manifest(&function.function_id))
            .await
            .unwrap()
    );
    assert_eq!(ctx.installer.install_count(), 0);
}

#[tokio::test]
async fn test_deploy_with_dependencies_populates_shared_cache() {
    let ctx = TestContext::new().await;

    let first = ctx.deploy("first", WITH_LODASH).await;
    assert_eq!(first.status, FunctionStatus::Active);
    let hash = first.dependency_hash.clone().unwrap();
    assert!(
        ctx.store
            .exists(&layout::dependency_archive(&hash))
            .await
            .unwrap()
    );
    assert_eq!(ctx.installer.install_count(), 1);

    // Same dependency set, different function: cache hit.
    let second = ctx.deploy("second", WITH_LODASH).await;
    assert_eq!(second.dependency_hash.as_deref(), Some(hash.as_str()));
    assert_eq!(ctx.installer.install_count(), 1);
}

#[tokio::test]
async fn test_invalid_dependency_rejected_before_artifacts() {
    let ctx = TestContext::new().await;

    let err = ctx
        .orchestrator
        .deploy(
            &ctx.user.user_id,
            "bad",
            "const x = require('bad name');\nmodule.exports = () => x;",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

    assert!(ctx.orchestrator.list(&ctx.user.user_id).await.unwrap().is_empty());
    assert!(ctx.store.list("").await.unwrap().is_empty());
    assert_eq!(ctx.installer.install_count(), 0);
}

#[tokio::test]
async fn test_invalid_name_and_filename_rejected() {
    let ctx = TestContext::new().await;

    let err = ctx
        .orchestrator
        .deploy(&ctx.user.user_id, "has space", HELLO, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = ctx
        .orchestrator
        .deploy(&ctx.user.user_id, "ok", HELLO, Some("../escape.js"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_duplicate_name_conflicts() {
    let ctx = TestContext::new().await;
    ctx.deploy("dup", HELLO).await;

    let err = ctx
        .orchestrator
        .deploy(&ctx.user.user_id, "dup", HELLO, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FunctionAlreadyExists(_)));
    assert_eq!(err.status_code(), StatusCode::CONFLICT);

    // Names are unique per owner only.
    let bob = ctx.create_user("bob", "bob-key").await;
    let function = ctx
        .orchestrator
        .deploy(&bob.user_id, "dup", HELLO, None)
        .await
        .unwrap();
    assert_eq!(function.endpoint, format!("{}/run/bob/dup", PUBLIC_URL));
}

#[tokio::test]
async fn test_build_failure_marks_function_failed() {
    let ctx = TestContext::with_mocks(
        MockBundler::failing_on("SYNTAX_ERROR"),
        MockInstaller::new(),
        MockSandbox::new(),
    )
    .await;

    let function = ctx.deploy("broken", "SYNTAX_ERROR(").await;
    assert_eq!(function.status, FunctionStatus::Failed);
    let message = function.deploy_error.unwrap();
    assert!(message.starts_with("Build failed:"), "{message}");
    assert!(function.bundle_hash.is_none());
}

#[tokio::test]
async fn test_install_failure_marks_function_failed() {
    let ctx = TestContext::with_mocks(
        MockBundler::new(),
        MockInstaller::failing(),
        MockSandbox::new(),
    )
    .await;

    let function = ctx.deploy("needs-deps", WITH_LODASH).await;
    assert_eq!(function.status, FunctionStatus::Failed);
    assert!(
        function
            .deploy_error
            .unwrap()
            .contains("Dependency installation failed")
    );
}

#[tokio::test]
async fn test_version_bumps_only_on_code_change() {
    let ctx = TestContext::new().await;
    let function = ctx.deploy("versions", HELLO).await;
    let id = function.function_id.clone();
    assert_eq!(function.version, 1);

    // Settings only.
    let updated = ctx
        .orchestrator
        .update(
            &id,
            FunctionUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!updated.is_active);
    assert_eq!(updated.status, FunctionStatus::Active);
    assert_eq!(updated.version, 1);

    // New code.
    let updated = ctx
        .orchestrator
        .update(
            &id,
            FunctionUpdate {
                code: Some("module.exports = async () => 2;".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.status, FunctionStatus::Pending);
    let function = ctx.wait_for_terminal_status(&id).await;
    assert_eq!(function.status, FunctionStatus::Active);
    assert_eq!(function.version, 2);

    // Identical code is a no-op.
    let bundles_before = ctx.bundler.bundle_count();
    let updated = ctx
        .orchestrator
        .update(
            &id,
            FunctionUpdate {
                code: Some("module.exports = async () => 2;".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.status, FunctionStatus::Active);
    assert_eq!(updated.version, 2);
    assert_eq!(ctx.bundler.bundle_count(), bundles_before);

    // Redeploy keeps the version.
    ctx.orchestrator.redeploy(&id).await.unwrap();
    let function = ctx.wait_for_terminal_status(&id).await;
    assert_eq!(function.status, FunctionStatus::Active);
    assert_eq!(function.version, 2);
}

#[tokio::test]
async fn test_rename_recomputes_endpoint() {
    let ctx = TestContext::new().await;
    let function = ctx.deploy("old-name", HELLO).await;
    ctx.deploy("taken", HELLO).await;

    let err = ctx
        .orchestrator
        .update(
            &function.function_id,
            FunctionUpdate {
                name: Some("taken".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FunctionAlreadyExists(_)));

    let renamed = ctx
        .orchestrator
        .update(
            &function.function_id,
            FunctionUpdate {
                name: Some("new-name".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "new-name");
    assert_eq!(renamed.endpoint, format!("{}/run/alice/new-name", PUBLIC_URL));
    assert_eq!(renamed.version, 1);
}

#[tokio::test]
async fn test_filename_change_moves_source() {
    let ctx = TestContext::new().await;
    let function = ctx.deploy("typed", HELLO).await;
    let old_source = function.source_path.clone();

    let err = ctx
        .orchestrator
        .update(
            &function.function_id,
            FunctionUpdate {
                filename: Some("main.ts".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    ctx.orchestrator
        .update(
            &function.function_id,
            FunctionUpdate {
                code: Some("export default async () => 1;".to_string()),
                filename: Some("main.ts".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let function = ctx.wait_for_terminal_status(&function.function_id).await;
    assert_eq!(function.status, FunctionStatus::Active);
    assert_eq!(function.source_path, layout::source(&function.function_id, "main.ts"));
    assert!(!ctx.store.exists(&old_source).await.unwrap());

    let with_code = ctx
        .orchestrator
        .get_with_code(&function.function_id)
        .await
        .unwrap();
    assert_eq!(with_code.code.as_deref(), Some("export default async () => 1;"));
}

#[tokio::test]
async fn test_dependency_change_invalidates_function_cache() {
    let ctx = TestContext::new().await;
    let function = ctx.deploy("cached", WITH_LODASH).await;
    let old_hash = function.dependency_hash.clone().unwrap();
    let cache_key = layout::function_cache(&function.function_id, &old_hash);
    ctx.store
        .put(&cache_key, bytes::Bytes::from_static(b"stale"))
        .await
        .unwrap();

    ctx.orchestrator
        .update(
            &function.function_id,
            FunctionUpdate {
                code: Some(
                    "const d = require('dayjs');\nmodule.exports = async () => d();".to_string(),
                ),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let function = ctx.wait_for_terminal_status(&function.function_id).await;
    assert_eq!(function.status, FunctionStatus::Active);
    assert_ne!(function.dependency_hash.as_deref(), Some(old_hash.as_str()));
    assert!(!ctx.store.exists(&cache_key).await.unwrap());
}

#[tokio::test]
async fn test_redeploy_after_failed_update_bumps_version() {
    let ctx = TestContext::with_mocks(
        MockBundler::new(),
        MockInstaller::failing(),
        MockSandbox::new(),
    )
    .await;
    let function = ctx.deploy("flaky", HELLO).await;
    let id = function.function_id.clone();
    assert_eq!(function.version, 1);

    ctx.orchestrator
        .update(
            &id,
            FunctionUpdate {
                code: Some(WITH_LODASH.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let failed = ctx.wait_for_terminal_status(&id).await;
    assert_eq!(failed.status, FunctionStatus::Failed);
    assert_eq!(failed.version, 1);
    assert_eq!(failed.bundle_hash, function.bundle_hash);

    // The registry recovers; redeploying the stored source publishes it.
    let recovered = DeploymentOrchestrator::new(
        ctx.persistence.clone(),
        ctx.store.clone(),
        Arc::new(MockBundler::new()),
        DependencyCache::new(ctx.store.clone(), Arc::new(MockInstaller::new())),
        OrchestratorConfig {
            public_url: PUBLIC_URL.to_string(),
            ..Default::default()
        },
    );
    recovered.redeploy(&id).await.unwrap();
    let function = ctx.wait_for_terminal_status(&id).await;
    assert_eq!(function.status, FunctionStatus::Active);
    assert_eq!(function.version, 2);
    assert_eq!(
        function.bundle_hash.as_deref(),
        Some(sha256_hex(WITH_LODASH.as_bytes()).as_str())
    );

    // Same bundle again: version unchanged.
    recovered.redeploy(&id).await.unwrap();
    let function = ctx.wait_for_terminal_status(&id).await;
    assert_eq!(function.status, FunctionStatus::Active);
    assert_eq!(function.version, 2);
}

#[tokio::test]
async fn test_overlapping_updates_publish_latest_code() {
    let ctx = TestContext::with_mocks(
        MockBundler::new(),
        MockInstaller::with_delay(200),
        MockSandbox::new(),
    )
    .await;
    let function = ctx.deploy("racy", HELLO).await;
    let id = function.function_id.clone();

    // Slow pipeline: installs dependencies.
    ctx.orchestrator
        .update(
            &id,
            FunctionUpdate {
                code: Some(WITH_LODASH.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // Fast pipeline, submitted while the slow one is still installing.
    const LATEST: &str = "module.exports = async () => 'latest';";
    let queued = ctx
        .orchestrator
        .update(
            &id,
            FunctionUpdate {
                code: Some(LATEST.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(queued.status, FunctionStatus::Pending);
    assert_eq!(queued.deploy_seq, 3);

    // Pipelines of one function run in turn, so the slow one is done here.
    let function = ctx.wait_for_terminal_status(&id).await;
    assert_eq!(function.status, FunctionStatus::Active);
    assert_eq!(function.version, 2);
    assert!(function.dependency_hash.is_none());
    assert_eq!(function.source_hash, sha256_hex(LATEST.as_bytes()));
    assert_eq!(
        function.bundle_hash.as_deref(),
        Some(sha256_hex(LATEST.as_bytes()).as_str())
    );
    let bundle = ctx.store.get(&function.bundle_path).await.unwrap().unwrap();
    assert_eq!(bundle.as_ref(), LATEST.as_bytes());
    assert!(ctx.installer.install_count() <= 1);
}

#[tokio::test]
async fn test_delete_removes_everything() {
    let ctx = TestContext::new().await;
    let function = ctx.deploy("doomed", HELLO).await;
    let id = function.function_id.clone();

    let response = ctx
        .gateway
        .invoke("alice", "doomed", Some("alice-key"), InvocationContext::default())
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(ctx.persistence.list_logs(&id).await.unwrap().len(), 1);
    assert_eq!(
        ctx.persistence
            .list_usage(&id, &ctx.user.user_id)
            .await
            .unwrap()
            .len(),
        1
    );

    ctx.orchestrator.delete(&id).await.unwrap();

    assert!(ctx.persistence.get_function(&id).await.unwrap().is_none());
    assert!(ctx.persistence.list_logs(&id).await.unwrap().is_empty());
    assert!(
        ctx.persistence
            .list_usage(&id, &ctx.user.user_id)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        ctx.store
            .list(&layout::function_prefix(&id))
            .await
            .unwrap()
            .is_empty()
    );

    let response = ctx
        .gateway
        .invoke("alice", "doomed", Some("alice-key"), InvocationContext::default())
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);

    let err = ctx.orchestrator.delete(&id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
