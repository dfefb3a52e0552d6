// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cirrus - function deployment and invocation server
//!
//! An HTTP server responsible for:
//! - Function management (create, update, redeploy, delete)
//! - Bundling and dependency caching
//! - Sandboxed invocation through `/run/{user}/{function}`
//! - Invocation logs and usage records

use std::sync::Arc;
use tracing::{info, warn};

use cirrus_core::{ArtifactStore, SqlitePersistence};
use cirrus_engine::config::Config;
use cirrus_engine::runtime::{FaasRuntimeBuilder, node_sandbox};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cirrus_engine=info,cirrus_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        public_url = %config.public_url,
        data_dir = %config.data_dir.display(),
        "Starting Cirrus"
    );

    tokio::fs::create_dir_all(&config.data_dir).await?;

    let persistence = Arc::new(SqlitePersistence::connect(&config.database_url).await?);
    info!("Connected to database");

    let store = ArtifactStore::from_url(&config.artifact_store_url)?;
    let sandbox = Arc::new(node_sandbox(&config, store.clone()));

    let runtime = FaasRuntimeBuilder::from_config(&config)
        .persistence(persistence)
        .store(store)
        .sandbox(sandbox)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.bind_addr(), "Cirrus server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Cirrus shut down");

    Ok(())
}
