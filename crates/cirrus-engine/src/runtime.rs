// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for cirrus-engine.
//!
//! [`FaasRuntime`] wires the bundler, dependency cache, orchestrator, sandbox
//! and gateway together and serves them over HTTP.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cirrus_core::{ArtifactStore, SqlitePersistence};
//! use cirrus_engine::runtime::FaasRuntime;
//! use cirrus_engine::{MockBundler, MockInstaller, MockSandbox};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::connect("sqlite::memory:").await?);
//!
//!     let runtime = FaasRuntime::builder()
//!         .persistence(persistence)
//!         .store(ArtifactStore::in_memory())
//!         .bundler(Arc::new(MockBundler::new()))
//!         .installer(Arc::new(MockInstaller::new()))
//!         .sandbox(Arc::new(MockSandbox::new()))
//!         .bind_addr("127.0.0.1:8080".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use cirrus_core::{ArtifactStore, Persistence};
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bundler::{Bundler, EsbuildBundler, EsbuildConfig};
use crate::config::Config;
use crate::dependencies::{
    DependencyCache, NpmInstaller, NpmInstallerConfig, PackageInstaller, RuntimeTarget,
};
use crate::dependency_cleanup_worker::{DependencyCleanupWorker, DependencyCleanupWorkerConfig};
use crate::gateway::GatewayDispatcher;
use crate::handlers::FaasHandlerState;
use crate::orchestrator::{DeploymentOrchestrator, OrchestratorConfig};
use crate::sandbox::{NodeSandbox, NodeSandboxConfig, Sandbox};

/// Builder for creating a [`FaasRuntime`].
pub struct FaasRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    store: Option<ArtifactStore>,
    bundler: Option<Arc<dyn Bundler>>,
    installer: Option<Arc<dyn PackageInstaller>>,
    sandbox: Option<Arc<dyn Sandbox>>,
    bind_addr: SocketAddr,
    public_url: Option<String>,
    runtime_target: RuntimeTarget,
    dependency_version_policy: String,
    scratch_root: Option<PathBuf>,
    cleanup_config: DependencyCleanupWorkerConfig,
}

impl Default for FaasRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            store: None,
            bundler: None,
            installer: None,
            sandbox: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_url: None,
            runtime_target: RuntimeTarget::host(),
            dependency_version_policy: "latest".to_string(),
            scratch_root: None,
            cleanup_config: DependencyCleanupWorkerConfig::default(),
        }
    }
}

impl FaasRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pre-populated from a loaded [`Config`], with the esbuild
    /// bundler, npm installer and Node sandbox.
    ///
    /// Persistence and the artifact store still have to be supplied.
    pub fn from_config(config: &Config) -> Self {
        let bundler = EsbuildBundler::new(EsbuildConfig {
            binary: config.esbuild_bin.clone(),
            node_major: config.runtime_target.node_major,
            ..Default::default()
        });
        let installer = NpmInstaller::new(NpmInstallerConfig {
            binary: config.npm_bin.clone(),
            timeout: config.dependency_install_timeout,
        });

        Self {
            bundler: Some(Arc::new(bundler)),
            installer: Some(Arc::new(installer)),
            bind_addr: config.http_addr,
            public_url: Some(config.public_url.clone()),
            runtime_target: config.runtime_target.clone(),
            dependency_version_policy: config.dependency_version_policy.clone(),
            scratch_root: Some(config.data_dir.join("scratch")),
            cleanup_config: config.dependency_cleanup.clone(),
            ..Self::default()
        }
    }

    /// Set the document store (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the artifact store (required).
    pub fn store(mut self, store: ArtifactStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the bundler (required).
    pub fn bundler(mut self, bundler: Arc<dyn Bundler>) -> Self {
        self.bundler = Some(bundler);
        self
    }

    /// Set the package installer (required).
    pub fn installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Set the sandbox (required unless built from a config).
    pub fn sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Set the HTTP bind address. Port 0 picks a free port.
    ///
    /// Default: `0.0.0.0:8080`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the base URL used for function endpoints.
    ///
    /// Default: `http://localhost:{port}`
    pub fn public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = Some(url.into());
        self
    }

    /// Set the runtime identifiers folded into dependency hashes.
    pub fn runtime_target(mut self, target: RuntimeTarget) -> Self {
        self.runtime_target = target;
        self
    }

    /// Set the version constraint written for discovered packages.
    ///
    /// Default: `latest`
    pub fn dependency_version_policy(mut self, policy: impl Into<String>) -> Self {
        self.dependency_version_policy = policy.into();
        self
    }

    /// Set the dependency cleanup worker configuration.
    ///
    /// Default: disabled.
    pub fn cleanup_config(mut self, config: DependencyCleanupWorkerConfig) -> Self {
        self.cleanup_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<FaasRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let bundler = self
            .bundler
            .ok_or_else(|| anyhow::anyhow!("bundler is required"))?;
        let installer = self
            .installer
            .ok_or_else(|| anyhow::anyhow!("installer is required"))?;
        let sandbox = self
            .sandbox
            .ok_or_else(|| anyhow::anyhow!("sandbox is required"))?;

        Ok(FaasRuntimeConfig {
            persistence,
            store,
            bundler,
            installer,
            sandbox,
            bind_addr: self.bind_addr,
            public_url: self.public_url,
            runtime_target: self.runtime_target,
            dependency_version_policy: self.dependency_version_policy,
            scratch_root: self.scratch_root,
            cleanup_config: self.cleanup_config,
        })
    }
}

/// Node sandbox for a loaded [`Config`].
pub fn node_sandbox(config: &Config, store: ArtifactStore) -> NodeSandbox {
    NodeSandbox::new(
        NodeSandboxConfig {
            node_binary: config.node_bin.clone(),
            timeout: config.sandbox_timeout,
            worker_timeout: config.worker_timeout,
            memory_limit_mb: Some(config.sandbox_memory_mb),
            permission_model: config.sandbox_permissions,
            scratch_root: Some(config.data_dir.join("scratch")),
        },
        store,
    )
}

/// Configuration for a [`FaasRuntime`].
pub struct FaasRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    store: ArtifactStore,
    bundler: Arc<dyn Bundler>,
    installer: Arc<dyn PackageInstaller>,
    sandbox: Arc<dyn Sandbox>,
    bind_addr: SocketAddr,
    public_url: Option<String>,
    runtime_target: RuntimeTarget,
    dependency_version_policy: String,
    scratch_root: Option<PathBuf>,
    cleanup_config: DependencyCleanupWorkerConfig,
}

impl FaasRuntimeConfig {
    /// Shared handler state without a running server.
    pub fn into_state(self) -> Arc<FaasHandlerState> {
        let bind_addr = self.bind_addr;
        let (state, _) = self.assemble(bind_addr);
        state
    }

    /// Endpoints default to `http://localhost:{port}` of the bound listener.
    fn assemble(self, bind_addr: SocketAddr) -> (Arc<FaasHandlerState>, DependencyCleanupWorker) {
        let public_url = self
            .public_url
            .unwrap_or_else(|| format!("http://localhost:{}", bind_addr.port()));
        let orchestrator_config = OrchestratorConfig {
            public_url: public_url.trim_end_matches('/').to_string(),
            runtime_target: self.runtime_target,
            dependency_version_policy: self.dependency_version_policy,
        };

        let mut cache = DependencyCache::new(self.store.clone(), self.installer);
        if let Some(root) = &self.scratch_root {
            cache = cache.with_scratch_root(root.clone());
        }

        let orchestrator = DeploymentOrchestrator::new(
            self.persistence.clone(),
            self.store.clone(),
            self.bundler,
            cache.clone(),
            orchestrator_config,
        );
        let gateway = GatewayDispatcher::new(
            self.persistence.clone(),
            self.store,
            self.sandbox,
            orchestrator.clone(),
        );
        let cleanup_worker =
            DependencyCleanupWorker::new(self.persistence.clone(), cache, self.cleanup_config);

        let state = Arc::new(FaasHandlerState::new(
            self.persistence,
            orchestrator,
            gateway,
        ));
        (state, cleanup_worker)
    }

    /// Start the runtime, spawning the HTTP server and cleanup worker tasks.
    pub async fn start(self) -> Result<FaasRuntime> {
        if let Some(root) = &self.scratch_root {
            tokio::fs::create_dir_all(root).await?;
        }
        let listener = TcpListener::bind(self.bind_addr).await?;
        let bind_addr = listener.local_addr()?;
        let (state, cleanup_worker) = self.assemble(bind_addr);

        let cleanup_shutdown = cleanup_worker.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move {
            cleanup_worker.run().await;
        });

        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(run_http_server_with_shutdown(
            listener,
            state.clone(),
            server_shutdown_rx,
        ));

        info!(bind_addr = %bind_addr, "FaasRuntime started");

        Ok(FaasRuntime {
            server_handle,
            cleanup_handle,
            server_shutdown_tx,
            cleanup_shutdown,
            state,
            bind_addr,
        })
    }
}

/// A running cirrus engine that can be embedded in an application.
///
/// The runtime manages:
/// - HTTP server for the gateway and management API
/// - Dependency cleanup worker
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct FaasRuntime {
    server_handle: JoinHandle<Result<()>>,
    cleanup_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    cleanup_shutdown: Arc<Notify>,
    state: Arc<FaasHandlerState>,
    bind_addr: SocketAddr,
}

impl FaasRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FaasRuntimeBuilder {
        FaasRuntimeBuilder::new()
    }

    /// Address the HTTP server is listening on.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &Arc<FaasHandlerState> {
        &self.state
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!("FaasRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.cleanup_shutdown.notify_one();

        if let Err(e) = self.cleanup_handle.await {
            error!("Dependency cleanup worker task panicked: {}", e);
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("FaasRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("FaasRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("FaasRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }
}

async fn run_http_server_with_shutdown(
    listener: TcpListener,
    state: Arc<FaasHandlerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let app = crate::server::router(state);

    info!(addr = %listener.local_addr()?, "HTTP server starting");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown_rx.changed().await.is_ok() {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            info!("HTTP server received shutdown signal");
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}
