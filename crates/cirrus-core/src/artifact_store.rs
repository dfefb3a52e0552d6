// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Artifact store.
//!
//! Key/value blob storage for function sources, bundles, package manifests and
//! dependency archives. Backed by any [`object_store`] implementation: local
//! filesystem (`file://`), in-memory (`memory://`) or S3-compatible (`s3://`).
//!
//! Keys are `/`-separated; see [`layout`] for the key scheme.

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreScheme, PutPayload, parse_url_opts};
use url::Url;

use crate::error::CoreError;

/// Key layout inside the artifact store.
pub mod layout {
    /// Prefix under which shared dependency archives live.
    pub const DEPENDENCIES_PREFIX: &str = "deps";

    /// Everything owned by one function.
    pub fn function_prefix(function_id: &str) -> String {
        format!("{function_id}/")
    }

    /// Directory holding the submitted source.
    pub fn source_prefix(function_id: &str) -> String {
        format!("{function_id}/src/")
    }

    /// Submitted source file.
    pub fn source(function_id: &str, filename: &str) -> String {
        format!("{function_id}/src/{filename}")
    }

    /// Production bundle.
    pub fn bundle(function_id: &str) -> String {
        format!("{function_id}/bundle/bundle.js")
    }

    /// Generated `package.json`.
    pub fn manifest(function_id: &str) -> String {
        format!("{function_id}/package.json")
    }

    /// Prefix of all per-function dependency caches.
    pub fn function_cache_prefix(function_id: &str) -> String {
        format!("{function_id}/cache/")
    }

    /// Per-function copy of the dependency archive for one dependency hash.
    pub fn function_cache(function_id: &str, dependency_hash: &str) -> String {
        format!("{function_id}/cache/{dependency_hash}/node_modules.tar.gz")
    }

    /// Shared dependency archive for a dependency hash.
    pub fn dependency_archive(dependency_hash: &str) -> String {
        format!("{DEPENDENCIES_PREFIX}/{dependency_hash}/node_modules.tar.gz")
    }

    /// Metadata written next to a shared dependency archive.
    pub fn dependency_metadata(dependency_hash: &str) -> String {
        format!("{DEPENDENCIES_PREFIX}/{dependency_hash}/metadata.json")
    }

    /// Directory of a shared dependency archive.
    pub fn dependency_prefix(dependency_hash: &str) -> String {
        format!("{DEPENDENCIES_PREFIX}/{dependency_hash}/")
    }
}

/// An object listed from the store.
#[derive(Debug, Clone)]
pub struct ArtifactMeta {
    /// Key relative to the store root.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub last_modified: chrono::DateTime<chrono::Utc>,
}

/// Blob storage for deployment artifacts.
#[derive(Clone)]
pub struct ArtifactStore {
    object_store: Arc<dyn ObjectStore>,
    root: Path,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("object_store", &self.object_store.to_string())
            .field("root", &self.root)
            .finish()
    }
}

impl ArtifactStore {
    /// Wrap an existing object store. Keys are resolved under `root`.
    pub fn new(object_store: Arc<dyn ObjectStore>, root: Path) -> Self {
        Self { object_store, root }
    }

    /// Ephemeral in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), Path::default())
    }

    /// Build a store from a URL.
    ///
    /// - `file:///abs/dir`: local directory, created if missing
    /// - `memory://`: in-memory store
    /// - `s3://bucket/prefix`: S3, configured from `AWS_*` environment variables
    pub fn from_url(url_str: &str) -> Result<Self, CoreError> {
        let url = Url::parse(url_str).map_err(|e| CoreError::InvalidStoreUrl(e.to_string()))?;

        if url.scheme() == "memory" {
            return Ok(Self::in_memory());
        }

        let (scheme, _) = ObjectStoreScheme::parse(&url)
            .map_err(|e| CoreError::InvalidStoreUrl(e.to_string()))?;
        match scheme {
            ObjectStoreScheme::Local => {
                let dir = url
                    .to_file_path()
                    .map_err(|_| CoreError::InvalidStoreUrl(url_str.to_string()))?;
                std::fs::create_dir_all(&dir)?;
                let store = LocalFileSystem::new_with_prefix(&dir)?;
                tracing::info!(path = %dir.display(), "Using local artifact store");
                Ok(Self::new(Arc::new(store), Path::default()))
            }
            ObjectStoreScheme::AmazonS3 => {
                // Explicit keys take precedence over instance metadata credentials.
                let opts: Vec<(String, String)> = std::env::vars()
                    .filter(|(key, _)| key.starts_with("AWS_"))
                    .map(|(key, value)| (key.to_ascii_lowercase(), value))
                    .collect();
                let (store, root) = parse_url_opts(&url, opts)?;
                tracing::info!(url = %url_str, "Using S3 artifact store");
                Ok(Self::new(Arc::from(store), root))
            }
            other => Err(CoreError::InvalidStoreUrl(format!(
                "unsupported artifact store scheme {:?} in {}",
                other, url_str
            ))),
        }
    }

    fn path(&self, key: &str) -> Path {
        let root = self.root.as_ref();
        if root.is_empty() {
            Path::from(key)
        } else {
            Path::from(format!("{}/{}", root, key))
        }
    }

    fn relative_key(&self, path: &Path) -> String {
        let root = self.root.as_ref();
        let full = path.as_ref();
        if root.is_empty() {
            full.to_string()
        } else {
            full.strip_prefix(root)
                .map(|s| s.trim_start_matches('/'))
                .unwrap_or(full)
                .to_string()
        }
    }

    /// Store bytes under a key, replacing any previous object.
    pub async fn put(&self, key: &str, data: Bytes) -> Result<(), CoreError> {
        let size = data.len();
        self.object_store
            .put(&self.path(key), PutPayload::from(data))
            .await?;
        tracing::debug!(key = %key, size_bytes = size, "Stored artifact");
        Ok(())
    }

    /// Read an object. Returns `None` if the key does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, CoreError> {
        match self.object_store.get(&self.path(key)).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether an object exists.
    pub async fn exists(&self, key: &str) -> Result<bool, CoreError> {
        match self.object_store.head(&self.path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List objects under a key prefix.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ArtifactMeta>, CoreError> {
        let prefix_path = self.path(prefix.trim_end_matches('/'));
        let objects: Vec<object_store::ObjectMeta> = self
            .object_store
            .list(Some(&prefix_path))
            .try_collect()
            .await?;

        Ok(objects
            .into_iter()
            .map(|meta| ArtifactMeta {
                key: self.relative_key(&meta.location),
                size: meta.size,
                last_modified: meta.last_modified,
            })
            .collect())
    }

    /// Delete one object. Returns false if it did not exist.
    pub async fn delete(&self, key: &str) -> Result<bool, CoreError> {
        if !self.exists(key).await? {
            return Ok(false);
        }
        match self.object_store.delete(&self.path(key)).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every object under a prefix. Returns how many were removed.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, CoreError> {
        let objects = self.list(prefix).await?;
        let mut deleted = 0;
        for object in &objects {
            if self.delete(&object.key).await? {
                deleted += 1;
            }
        }
        tracing::debug!(prefix = %prefix, deleted, "Deleted artifacts under prefix");
        Ok(deleted)
    }
}
