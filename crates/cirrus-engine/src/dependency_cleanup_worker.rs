// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for evicting unused dependency bundles.
//!
//! Bundles under `deps/{hash}/` are shared by content and never mutated, so
//! nothing on the deploy path ever deletes them. This worker removes bundles
//! that no function references any more once their metadata is older than
//! `max_age`. Bundles without metadata are skipped: the metadata object is
//! written last, so its absence may mean a build is still uploading.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cirrus_core::Persistence;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::dependencies::DependencyCache;
use crate::error::Result;

/// Configuration for the dependency cleanup worker.
#[derive(Debug, Clone)]
pub struct DependencyCleanupWorkerConfig {
    /// Whether cleanup is enabled.
    pub enabled: bool,
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// Minimum age of an unreferenced bundle before it is evicted.
    pub max_age: Duration,
    /// Maximum bundles to evict per cycle.
    pub batch_size: usize,
}

impl Default for DependencyCleanupWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(6 * 3600),
            max_age: Duration::from_secs(30 * 24 * 3600),
            batch_size: 50,
        }
    }
}

impl DependencyCleanupWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CIRRUS_DEP_CLEANUP_ENABLED`: "true" or "1" to enable (default: false)
    /// - `CIRRUS_DEP_CLEANUP_POLL_INTERVAL_SECS`: seconds between runs (default: 21600)
    /// - `CIRRUS_DEP_CLEANUP_MAX_AGE_DAYS`: days before unreferenced bundles are evicted (default: 30)
    /// - `CIRRUS_DEP_CLEANUP_BATCH_SIZE`: max bundles per cycle (default: 50)
    pub fn from_env() -> Self {
        let enabled = std::env::var("CIRRUS_DEP_CLEANUP_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let poll_interval_secs = std::env::var("CIRRUS_DEP_CLEANUP_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(6 * 3600);

        let max_age_days = std::env::var("CIRRUS_DEP_CLEANUP_MAX_AGE_DAYS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let batch_size = std::env::var("CIRRUS_DEP_CLEANUP_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);

        Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_age: Duration::from_secs(max_age_days * 24 * 3600),
            batch_size,
        }
    }
}

/// Background worker that evicts unreferenced dependency bundles.
pub struct DependencyCleanupWorker {
    persistence: Arc<dyn Persistence>,
    cache: DependencyCache,
    config: DependencyCleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl DependencyCleanupWorker {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        cache: DependencyCache,
        config: DependencyCleanupWorkerConfig,
    ) -> Self {
        Self {
            persistence,
            cache,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until shutdown is signalled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Dependency cleanup worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_days = self.config.max_age.as_secs() / 86400,
            batch_size = self.config.batch_size,
            "Dependency cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Dependency cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.cleanup_once().await {
                        error!(error = %e, "Failed to clean up dependency bundles");
                    }
                }
            }
        }

        info!("Dependency cleanup worker stopped");
    }

    /// Run one cleanup cycle. Returns the evicted hashes.
    pub async fn cleanup_once(&self) -> Result<Vec<String>> {
        let referenced: HashSet<String> = self
            .persistence
            .list_dependency_hashes()
            .await?
            .into_iter()
            .collect();
        let cached = self.cache.list_hashes().await?;
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        let cutoff = Utc::now() - max_age;

        let mut evicted = Vec::new();
        for hash in cached.into_iter().filter(|h| !referenced.contains(h)) {
            if evicted.len() >= self.config.batch_size {
                debug!("Dependency cleanup batch limit reached");
                break;
            }

            let metadata = match self.cache.metadata(&hash).await {
                Ok(Some(metadata)) => metadata,
                Ok(None) => {
                    debug!(dependency_hash = %hash, "Skipping bundle without metadata");
                    continue;
                }
                Err(e) => {
                    warn!(dependency_hash = %hash, error = %e, "Failed to read bundle metadata");
                    continue;
                }
            };

            if metadata.created_at > cutoff {
                continue;
            }

            match self.cache.evict(&hash).await {
                Ok(_) => evicted.push(hash),
                Err(e) => warn!(dependency_hash = %hash, error = %e, "Failed to evict bundle"),
            }
        }

        if evicted.is_empty() {
            debug!("Dependency cleanup cycle completed, nothing to clean");
        } else {
            info!(evicted = evicted.len(), "Dependency cleanup cycle completed");
        }
        Ok(evicted)
    }
}
