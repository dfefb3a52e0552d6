// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content-addressed dependency bundle cache.
//!
//! A bundle is cached when `deps/{hash}/node_modules.tar.gz` exists. Concurrent
//! builds of the same hash are tolerated rather than locked: both install, both
//! upload identical content to the same key, and the last write wins.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use cirrus_core::{ArtifactStore, layout};
use serde::{Deserialize, Serialize};

use super::installer::PackageInstaller;
use super::{DependencyError, DependencyManifest, archive};

/// Result of [`DependencyCache::ensure_bundle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Bundle already existed.
    Hit,
    /// Bundle was installed and uploaded.
    Built {
        /// Size of the uploaded tarball.
        size_bytes: u64,
    },
}

/// `deps/{hash}/metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyBundleMetadata {
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub dependencies: std::collections::BTreeMap<String, String>,
    pub size_bytes: u64,
}

/// Shared cache of installed dependency sets.
#[derive(Clone)]
pub struct DependencyCache {
    store: ArtifactStore,
    installer: Arc<dyn PackageInstaller>,
    scratch_root: Option<PathBuf>,
}

impl DependencyCache {
    /// Create a cache over an artifact store.
    pub fn new(store: ArtifactStore, installer: Arc<dyn PackageInstaller>) -> Self {
        Self {
            store,
            installer,
            scratch_root: None,
        }
    }

    /// Create scratch directories under `dir` instead of the system temp dir.
    pub fn with_scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(dir.into());
        self
    }

    /// Whether a bundle exists for a hash.
    pub async fn contains(&self, dependency_hash: &str) -> Result<bool, DependencyError> {
        Ok(self
            .store
            .exists(&layout::dependency_archive(dependency_hash))
            .await?)
    }

    /// Make sure a bundle exists for `dependency_hash`, installing it if needed.
    ///
    /// Idempotent and safe to call concurrently for the same hash. Nothing is
    /// uploaded unless installation and packing both succeed.
    pub async fn ensure_bundle(
        &self,
        dependency_hash: &str,
        manifest: &DependencyManifest,
    ) -> Result<CacheOutcome, DependencyError> {
        if self.contains(dependency_hash).await? {
            tracing::info!(dependency_hash = %dependency_hash, "Dependency bundle cache hit");
            return Ok(CacheOutcome::Hit);
        }

        tracing::info!(
            dependency_hash = %dependency_hash,
            packages = manifest.dependencies.len(),
            installer = self.installer.installer_type(),
            "Dependency bundle cache miss, installing"
        );

        // Dropped on every path, including errors.
        let scratch = match &self.scratch_root {
            Some(root) => {
                tokio::fs::create_dir_all(root).await?;
                tempfile::Builder::new().prefix("cirrus-deps-").tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix("cirrus-deps-").tempdir()?,
        };

        self.installer.install(manifest, scratch.path()).await?;
        let tarball = archive::pack_node_modules(scratch.path()).await?;
        let size_bytes = tarball.len() as u64;

        self.store
            .put(&layout::dependency_archive(dependency_hash), tarball)
            .await?;

        let metadata = DependencyBundleMetadata {
            hash: dependency_hash.to_string(),
            created_at: Utc::now(),
            dependencies: manifest.dependencies.clone(),
            size_bytes,
        };
        self.store
            .put(
                &layout::dependency_metadata(dependency_hash),
                Bytes::from(serde_json::to_vec_pretty(&metadata)?),
            )
            .await?;

        tracing::info!(
            dependency_hash = %dependency_hash,
            size_bytes = size_bytes,
            "Dependency bundle published"
        );

        Ok(CacheOutcome::Built { size_bytes })
    }

    /// Read the metadata record for a hash.
    pub async fn metadata(
        &self,
        dependency_hash: &str,
    ) -> Result<Option<DependencyBundleMetadata>, DependencyError> {
        match self
            .store
            .get(&layout::dependency_metadata(dependency_hash))
            .await?
        {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Hashes of every cached bundle.
    pub async fn list_hashes(&self) -> Result<Vec<String>, DependencyError> {
        let objects = self.store.list(layout::DEPENDENCIES_PREFIX).await?;
        let hashes: BTreeSet<String> = objects
            .iter()
            .filter_map(|meta| {
                meta.key
                    .strip_prefix(layout::DEPENDENCIES_PREFIX)?
                    .trim_start_matches('/')
                    .split('/')
                    .next()
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
            })
            .collect();
        Ok(hashes.into_iter().collect())
    }

    /// Remove a cached bundle. Returns how many objects were deleted.
    pub async fn evict(&self, dependency_hash: &str) -> Result<usize, DependencyError> {
        let deleted = self
            .store
            .delete_prefix(&layout::dependency_prefix(dependency_hash))
            .await?;
        tracing::info!(dependency_hash = %dependency_hash, deleted, "Evicted dependency bundle");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::{
        MockInstaller, RuntimeTarget, compute_dependency_hash, resolve_versions,
    };

    fn manifest(names: &[&str]) -> (String, DependencyManifest) {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let deps = resolve_versions(&names, "latest");
        let hash = compute_dependency_hash(&deps, &RuntimeTarget::host());
        let manifest = DependencyManifest::for_bundle(&hash, deps);
        (hash, manifest)
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let store = ArtifactStore::in_memory();
        let installer = Arc::new(MockInstaller::new());
        let cache = DependencyCache::new(store.clone(), installer.clone());
        let (hash, manifest) = manifest(&["left-pad"]);

        let first = cache.ensure_bundle(&hash, &manifest).await.unwrap();
        assert!(matches!(first, CacheOutcome::Built { size_bytes } if size_bytes > 0));

        let second = cache.ensure_bundle(&hash, &manifest).await.unwrap();
        assert_eq!(second, CacheOutcome::Hit);
        assert_eq!(installer.install_count(), 1);

        let metadata = cache.metadata(&hash).await.unwrap().unwrap();
        assert_eq!(metadata.hash, hash);
        assert_eq!(metadata.dependencies.len(), 1);
        assert_eq!(cache.list_hashes().await.unwrap(), vec![hash.clone()]);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_same_hash() {
        let store = ArtifactStore::in_memory();
        let installer = Arc::new(MockInstaller::with_delay(50));
        let cache = DependencyCache::new(store.clone(), installer.clone());
        let (hash, manifest) = manifest(&["left-pad", "lodash"]);

        let (a, b) = tokio::join!(
            cache.ensure_bundle(&hash, &manifest),
            cache.ensure_bundle(&hash, &manifest)
        );
        a.unwrap();
        b.unwrap();

        let objects = store
            .list(&layout::dependency_prefix(&hash))
            .await
            .unwrap();
        let tarballs = objects
            .iter()
            .filter(|o| o.key.ends_with("node_modules.tar.gz"))
            .count();
        assert_eq!(tarballs, 1);
        assert!(cache.contains(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_install_failure_publishes_nothing() {
        let store = ArtifactStore::in_memory();
        let cache = DependencyCache::new(store.clone(), Arc::new(MockInstaller::failing()));
        let (hash, manifest) = manifest(&["does-not-exist"]);

        let err = cache.ensure_bundle(&hash, &manifest).await.unwrap_err();
        assert!(matches!(err, DependencyError::Install(_)));
        assert!(!cache.contains(&hash).await.unwrap());
        assert!(store.list(layout::DEPENDENCIES_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_evict_removes_bundle() {
        let store = ArtifactStore::in_memory();
        let cache = DependencyCache::new(store, Arc::new(MockInstaller::new()));
        let (hash, manifest) = manifest(&["left-pad"]);

        cache.ensure_bundle(&hash, &manifest).await.unwrap();
        assert_eq!(cache.evict(&hash).await.unwrap(), 2);
        assert!(!cache.contains(&hash).await.unwrap());
        assert!(cache.list_hashes().await.unwrap().is_empty());
    }
}
