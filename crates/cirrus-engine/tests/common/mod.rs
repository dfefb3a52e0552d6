// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cirrus-engine integration tests.
//!
//! Provides TestContext wiring in-memory stores with mock bundler, installer
//! and sandbox.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cirrus_core::{ArtifactStore, FunctionRecord, Persistence, SqlitePersistence, UserRecord};
use cirrus_engine::handlers::FaasHandlerState;
use cirrus_engine::orchestrator::OrchestratorConfig;
use cirrus_engine::{
    DependencyCache, DeploymentOrchestrator, GatewayDispatcher, MockBundler, MockInstaller,
    MockSandbox,
};

pub const PUBLIC_URL: &str = "http://faas.test";

/// Test context with in-memory persistence and artifact store.
pub struct TestContext {
    pub persistence: Arc<dyn Persistence>,
    pub store: ArtifactStore,
    pub bundler: Arc<MockBundler>,
    pub installer: Arc<MockInstaller>,
    pub sandbox: Arc<MockSandbox>,
    pub orchestrator: DeploymentOrchestrator,
    pub gateway: GatewayDispatcher,
    pub user: UserRecord,
}

impl TestContext {
    /// Create a context with default mocks and one user `alice` / `alice-key`.
    pub async fn new() -> Self {
        Self::with_mocks(MockBundler::new(), MockInstaller::new(), MockSandbox::new()).await
    }

    /// Create a context with the given sandbox.
    pub async fn with_sandbox(sandbox: MockSandbox) -> Self {
        Self::with_mocks(MockBundler::new(), MockInstaller::new(), sandbox).await
    }

    pub async fn with_mocks(
        bundler: MockBundler,
        installer: MockInstaller,
        sandbox: MockSandbox,
    ) -> Self {
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("Failed to open in-memory database"),
        );
        let store = ArtifactStore::in_memory();
        let bundler = Arc::new(bundler);
        let installer = Arc::new(installer);
        let sandbox = Arc::new(sandbox);

        let cache = DependencyCache::new(store.clone(), installer.clone());
        let orchestrator = DeploymentOrchestrator::new(
            persistence.clone(),
            store.clone(),
            bundler.clone(),
            cache,
            OrchestratorConfig {
                public_url: PUBLIC_URL.to_string(),
                ..Default::default()
            },
        );
        let gateway = GatewayDispatcher::new(
            persistence.clone(),
            store.clone(),
            sandbox.clone(),
            orchestrator.clone(),
        );

        let user = UserRecord::new("alice", "alice-key");
        persistence
            .create_user(&user)
            .await
            .expect("Failed to create user");

        Self {
            persistence,
            store,
            bundler,
            installer,
            sandbox,
            orchestrator,
            gateway,
            user,
        }
    }

    /// Handler state over the same components.
    pub fn state(&self) -> Arc<FaasHandlerState> {
        Arc::new(FaasHandlerState::new(
            self.persistence.clone(),
            self.orchestrator.clone(),
            self.gateway.clone(),
        ))
    }

    /// Create another user.
    pub async fn create_user(&self, user_name: &str, api_key: &str) -> UserRecord {
        let user = UserRecord::new(user_name, api_key);
        self.persistence
            .create_user(&user)
            .await
            .expect("Failed to create user");
        user
    }

    /// Poll until the function's pipeline finishes.
    pub async fn wait_for_terminal_status(&self, function_id: &str) -> FunctionRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let function = self
                .persistence
                .get_function(function_id)
                .await
                .expect("Failed to read function")
                .expect("Function disappeared");
            if function.status.is_terminal() {
                return function;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "Function {} stuck in {}",
                function_id,
                function.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Deploy for the default user and wait for the pipeline.
    pub async fn deploy(&self, name: &str, code: &str) -> FunctionRecord {
        let function = self
            .orchestrator
            .deploy(&self.user.user_id, name, code, None)
            .await
            .expect("Failed to create function");
        self.wait_for_terminal_status(&function.function_id).await
    }
}
