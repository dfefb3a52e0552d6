// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment orchestrator.
//!
//! Owns the function lifecycle `pending -> deploying -> {active | failed}`.
//! Requests are validated synchronously; the pipeline itself runs on a
//! detached task and reports its outcome only through the function record.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use cirrus_core::{
    ArtifactStore, FunctionBuilder, FunctionRecord, FunctionSettings, FunctionStatus,
    Persistence, PublishedBundle, layout,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::bundler::{BuildError, Bundler, SourceFile};
use crate::dependencies::{
    CacheOutcome, DependencyCache, DependencyManifest, RuntimeTarget, compute_dependency_hash,
    resolve_versions, validate_dependencies,
};
use crate::error::{Error, Result};

/// Entry filename used when none is given.
pub const DEFAULT_FILENAME: &str = "index.js";

const SOURCE_EXTENSIONS: &[&str] = &[".js", ".cjs", ".mjs", ".ts"];

static FUNCTION_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").ok());

/// Hex-encoded SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Check a function name.
pub fn validate_name(name: &str) -> Result<()> {
    if FUNCTION_NAME.as_ref().is_some_and(|re| re.is_match(name)) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Invalid function name \"{}\": use letters, digits, '-' or '_' (max 64 characters)",
            name
        )))
    }
}

/// Check an entry filename, defaulting to `index.js`.
pub fn validate_filename(filename: Option<&str>) -> Result<String> {
    let Some(filename) = filename else {
        return Ok(DEFAULT_FILENAME.to_string());
    };

    let single_segment = !filename.is_empty()
        && !filename.contains(['/', '\\'])
        && !filename.starts_with('.');
    let known_extension = SOURCE_EXTENSIONS.iter().any(|ext| {
        filename
            .strip_suffix(ext)
            .is_some_and(|stem| !stem.is_empty())
    });

    if single_segment && known_extension {
        Ok(filename.to_string())
    } else {
        Err(Error::Validation(format!(
            "Invalid filename \"{}\": expected a .js, .cjs, .mjs or .ts file name",
            filename
        )))
    }
}

fn filename_of(source_path: &str) -> &str {
    source_path
        .rsplit('/')
        .next()
        .filter(|f| !f.is_empty())
        .unwrap_or(DEFAULT_FILENAME)
}

/// Text stored in `deployError` for a failed pipeline.
fn deploy_error_message(err: &Error) -> String {
    match err {
        // Compile messages already read "Build failed: ...".
        Error::Build(BuildError::Compile(message)) => message.clone(),
        other => other.to_string(),
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Base URL of the public gateway.
    pub public_url: String,
    /// Runtime identifiers folded into dependency hashes.
    pub runtime_target: RuntimeTarget,
    /// Version constraint written for each discovered package.
    pub dependency_version_policy: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            public_url: "http://localhost:8080".to_string(),
            runtime_target: RuntimeTarget::host(),
            dependency_version_policy: "latest".to_string(),
        }
    }
}

/// Partial update of a function.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionUpdate {
    pub code: Option<String>,
    pub name: Option<String>,
    pub is_active: Option<bool>,
    pub filename: Option<String>,
}

/// A function together with its stored entry source.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionWithCode {
    #[serde(flatten)]
    pub function: FunctionRecord,
    pub code: Option<String>,
}

/// Per-function locks serializing pipeline runs and bundle repairs.
type PipelineLocks = Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Drives deployments from submitted source to a published bundle.
///
/// Every update or redeploy starts a new deployment generation. Pipelines of
/// one function run one at a time, and a pipeline whose generation has been
/// superseded stops without touching the record.
#[derive(Clone)]
pub struct DeploymentOrchestrator {
    persistence: Arc<dyn Persistence>,
    store: ArtifactStore,
    bundler: Arc<dyn Bundler>,
    dependencies: DependencyCache,
    config: OrchestratorConfig,
    locks: PipelineLocks,
}

impl DeploymentOrchestrator {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        store: ArtifactStore,
        bundler: Arc<dyn Bundler>,
        dependencies: DependencyCache,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            persistence,
            store,
            bundler,
            dependencies,
            config,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Public invocation URL of a function.
    pub fn endpoint_for(&self, user_name: &str, function_name: &str) -> String {
        format!(
            "{}/run/{}/{}",
            self.config.public_url, user_name, function_name
        )
    }

    /// Create a function and start its first deployment.
    ///
    /// Returns the `pending` record as soon as it is persisted.
    pub async fn deploy(
        &self,
        owner_id: &str,
        name: &str,
        code: &str,
        filename: Option<&str>,
    ) -> Result<FunctionRecord> {
        validate_name(name)?;
        let filename = validate_filename(filename)?;

        let owner = self
            .persistence
            .get_user(owner_id)
            .await?
            .ok_or_else(|| Error::NotFound("User not found".to_string()))?;

        if self
            .persistence
            .get_function_by_name(owner_id, name)
            .await?
            .is_some()
        {
            return Err(Error::FunctionAlreadyExists(name.to_string()));
        }

        let source = SourceFile::new(&filename, code);
        self.prescan(&source).await?;

        let function_id = uuid::Uuid::new_v4().to_string();
        let function = FunctionBuilder::new(
            owner_id,
            name,
            self.endpoint_for(&owner.user_name, name),
        )
        .function_id(&function_id)
        .source(
            layout::source(&function_id, &filename),
            sha256_hex(code.as_bytes()),
        )
        .bundle_path(layout::bundle(&function_id))
        .build();

        self.persistence.insert_function(&function).await?;

        info!(
            function_id = %function_id,
            owner_id = %owner_id,
            name = %name,
            "Function created, deployment queued"
        );

        self.spawn_pipeline(function_id, source, function.deploy_seq);
        Ok(function)
    }

    /// Apply a patch. New code starts a new deployment generation.
    pub async fn update(&self, function_id: &str, patch: FunctionUpdate) -> Result<FunctionRecord> {
        let function = self.get(function_id).await?;
        let current_filename = filename_of(&function.source_path).to_string();

        let mut settings = FunctionSettings {
            is_active: patch.is_active,
            ..Default::default()
        };

        if let Some(name) = patch.name.filter(|n| *n != function.name) {
            validate_name(&name)?;
            if self
                .persistence
                .get_function_by_name(&function.owner_id, &name)
                .await?
                .is_some()
            {
                return Err(Error::FunctionAlreadyExists(name));
            }
            let owner = self
                .persistence
                .get_user(&function.owner_id)
                .await?
                .ok_or_else(|| Error::NotFound("User not found".to_string()))?;
            settings.endpoint = Some(self.endpoint_for(&owner.user_name, &name));
            settings.name = Some(name);
        }

        let source = match (patch.code, patch.filename.as_deref()) {
            (Some(code), filename) => {
                let filename = match filename {
                    Some(f) => validate_filename(Some(f))?,
                    None => current_filename.clone(),
                };
                let unchanged = sha256_hex(code.as_bytes()) == function.source_hash
                    && filename == current_filename
                    && function.status == FunctionStatus::Active;
                if unchanged {
                    debug!(function_id = %function_id, "Submitted code unchanged, skipping deployment");
                    None
                } else {
                    let source = SourceFile::new(filename, code);
                    self.prescan(&source).await?;
                    Some(source)
                }
            }
            (None, Some(_)) => {
                return Err(Error::Validation(
                    "filename can only be changed together with code".to_string(),
                ));
            }
            (None, None) => None,
        };

        if !settings.is_empty() {
            self.persistence
                .update_function_settings(function_id, &settings)
                .await?;
            info!(function_id = %function_id, "Function settings updated");
        }

        if let Some(source) = source {
            let deploy_seq = self.persistence.begin_deployment(function_id).await?;
            info!(function_id = %function_id, deploy_seq, "Code changed, deployment queued");
            self.spawn_pipeline(function_id.to_string(), source, deploy_seq);
        }

        self.get(function_id).await
    }

    /// Re-run the pipeline against the stored source.
    pub async fn redeploy(&self, function_id: &str) -> Result<FunctionRecord> {
        let function = self.get(function_id).await?;
        let code = self.read_source(&function).await?.ok_or_else(|| {
            Error::NotFound(format!("Source for function {} not found", function_id))
        })?;

        let deploy_seq = self.persistence.begin_deployment(function_id).await?;
        info!(function_id = %function_id, deploy_seq, "Redeployment queued");

        let source = SourceFile::new(filename_of(&function.source_path), code);
        self.spawn_pipeline(function_id.to_string(), source, deploy_seq);
        self.get(function_id).await
    }

    /// Delete a function with its artifacts, logs and usage records.
    pub async fn delete(&self, function_id: &str) -> Result<()> {
        if !self.persistence.delete_function(function_id).await? {
            return Err(Error::NotFound("Function not found".to_string()));
        }
        self.locks.lock().await.remove(function_id);

        let objects = self
            .store
            .delete_prefix(&layout::function_prefix(function_id))
            .await?;
        let logs = self
            .persistence
            .delete_logs_for_function(function_id)
            .await?;
        let usage = self
            .persistence
            .delete_usage_for_function(function_id, None)
            .await?;

        info!(
            function_id = %function_id,
            objects,
            logs,
            usage,
            "Function deleted"
        );
        Ok(())
    }

    pub async fn get(&self, function_id: &str) -> Result<FunctionRecord> {
        self.persistence
            .get_function(function_id)
            .await?
            .ok_or_else(|| Error::NotFound("Function not found".to_string()))
    }

    /// A function with its stored entry source.
    pub async fn get_with_code(&self, function_id: &str) -> Result<FunctionWithCode> {
        let function = self.get(function_id).await?;
        let code = self.read_source(&function).await?;
        Ok(FunctionWithCode { function, code })
    }

    pub async fn list(&self, owner_id: &str) -> Result<Vec<FunctionRecord>> {
        Ok(self.persistence.list_functions(owner_id).await?)
    }

    /// Repair a bundle whose stored bytes do not match the recorded hash.
    ///
    /// Waits for any running pipeline of the function, then re-checks: bytes
    /// that match the now-current record are returned as they are. Otherwise
    /// an `active` function is rebuilt from its stored source, the new hash
    /// recorded and `version` bumped. Functions with a deployment in flight
    /// are not repaired.
    pub async fn heal_bundle(&self, function_id: &str) -> Result<(Bytes, FunctionRecord)> {
        let lock = self.pipeline_lock(function_id).await;
        let _guard = lock.lock().await;

        let function = self.get(function_id).await?;
        let Some(expected_hash) = function.bundle_hash.clone() else {
            return Err(Error::FunctionNotDeployed);
        };

        if let Some(bundle) = self.store.get(&function.bundle_path).await?
            && sha256_hex(&bundle) == expected_hash
        {
            debug!(function_id = %function_id, "Bundle matches current record, no repair needed");
            return Ok((bundle, function));
        }

        match function.status {
            FunctionStatus::Active => {}
            FunctionStatus::Pending | FunctionStatus::Deploying => {
                return Err(Error::FunctionDeploying);
            }
            FunctionStatus::Failed => {
                return Err(Error::Integrity(
                    "stored source belongs to a failed deployment".to_string(),
                ));
            }
        }

        let code = self.read_source(&function).await?.ok_or_else(|| {
            Error::NotFound(format!("Source for function {} not found", function_id))
        })?;
        let source = SourceFile::new(filename_of(&function.source_path), code);

        let output = self.bundler.bundle(&source).await?;
        let bundle = Bytes::from(output.code);
        let bundle_hash = sha256_hex(&bundle);

        self.store.put(&function.bundle_path, bundle.clone()).await?;
        let repaired = self
            .persistence
            .repair_bundle(function_id, &expected_hash, &bundle_hash)
            .await?;
        if !repaired {
            warn!(function_id = %function_id, "Deployment started during repair, record left as is");
        }

        info!(
            function_id = %function_id,
            bundle_hash = %bundle_hash,
            repaired,
            "Bundle rebuilt from source"
        );
        let function = self.get(function_id).await?;
        Ok((bundle, function))
    }

    async fn read_source(&self, function: &FunctionRecord) -> Result<Option<String>> {
        if function.source_path.is_empty() {
            return Ok(None);
        }
        Ok(self
            .store
            .get(&function.source_path)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Reject bad dependency names before anything is persisted.
    ///
    /// A scan that fails to build is left for the pipeline to record.
    async fn prescan(&self, source: &SourceFile) -> Result<()> {
        match self.bundler.scan_dependencies(source).await {
            Ok(names) => {
                validate_dependencies(&names).map_err(|e| Error::Validation(e.to_string()))
            }
            Err(e) => {
                debug!(error = %e, "Dependency pre-scan failed, deferring to pipeline");
                Ok(())
            }
        }
    }

    async fn pipeline_lock(&self, function_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(function_id.to_string())
            .or_default()
            .clone()
    }

    /// Whether `deploy_seq` is still the function's current generation.
    async fn is_current(&self, function_id: &str, deploy_seq: i64) -> Result<bool> {
        let current = self.get(function_id).await?.deploy_seq == deploy_seq;
        if !current {
            info!(function_id = %function_id, deploy_seq, "Deployment superseded, stopping");
        }
        Ok(current)
    }

    fn spawn_pipeline(&self, function_id: String, source: SourceFile, deploy_seq: i64) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let lock = orchestrator.pipeline_lock(&function_id).await;
            let _guard = lock.lock().await;

            if let Err(e) = orchestrator
                .run_pipeline(&function_id, &source, deploy_seq)
                .await
            {
                let message = deploy_error_message(&e);
                error!(function_id = %function_id, deploy_seq, error = %message, "Deployment failed");

                match orchestrator
                    .persistence
                    .update_function_status(
                        &function_id,
                        deploy_seq,
                        FunctionStatus::Failed,
                        Some(&message),
                    )
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(function_id = %function_id, deploy_seq, "Failure of superseded deployment not recorded");
                    }
                    Err(e) => {
                        error!(
                            function_id = %function_id,
                            error = %e,
                            "Failed to record deployment failure"
                        );
                    }
                }
            }
        });
    }

    /// Build and publish one deployment generation. Callers hold the
    /// function's pipeline lock.
    async fn run_pipeline(
        &self,
        function_id: &str,
        source: &SourceFile,
        deploy_seq: i64,
    ) -> Result<()> {
        let start = Instant::now();
        let previous = self.get(function_id).await?;
        if previous.deploy_seq != deploy_seq {
            info!(function_id = %function_id, deploy_seq, "Deployment superseded before start");
            return Ok(());
        }

        if !self
            .persistence
            .update_function_status(function_id, deploy_seq, FunctionStatus::Deploying, None)
            .await?
        {
            return Ok(());
        }
        info!(function_id = %function_id, deploy_seq, "Deployment started");

        // Source
        let source_key = layout::source(function_id, &source.filename);
        self.store
            .put(&source_key, Bytes::from(source.content.clone()))
            .await?;
        if !self
            .persistence
            .update_source(
                function_id,
                deploy_seq,
                &source_key,
                &sha256_hex(source.content.as_bytes()),
            )
            .await?
        {
            info!(function_id = %function_id, deploy_seq, "Deployment superseded, stopping");
            return Ok(());
        }
        if !previous.source_path.is_empty() && previous.source_path != source_key {
            self.store.delete(&previous.source_path).await?;
        }

        // Bundle
        let output = self.bundler.bundle(source).await?;
        validate_dependencies(&output.dependencies).map_err(|e| Error::Validation(e.to_string()))?;
        debug!(
            function_id = %function_id,
            dependencies = output.dependencies.len(),
            "Bundle built"
        );

        // Dependencies
        let resolved = resolve_versions(
            &output.dependencies,
            &self.config.dependency_version_policy,
        );
        let manifest = DependencyManifest::for_function(function_id, resolved.clone());

        let dependency_hash = if manifest.is_empty() {
            None
        } else {
            let hash = compute_dependency_hash(&resolved, &self.config.runtime_target);
            let outcome = self
                .dependencies
                .ensure_bundle(&hash, &DependencyManifest::for_bundle(&hash, resolved))
                .await?;
            if let CacheOutcome::Built { size_bytes } = outcome {
                info!(function_id = %function_id, dependency_hash = %hash, size_bytes, "Dependency bundle built for function");
            }
            Some(hash)
        };

        // Publish
        if !self.is_current(function_id, deploy_seq).await? {
            return Ok(());
        }
        self.store
            .put(&layout::manifest(function_id), Bytes::from(manifest.to_json()?))
            .await?;
        let bundle = Bytes::from(output.code);
        let bundle_hash = sha256_hex(&bundle);
        self.store.put(&layout::bundle(function_id), bundle).await?;

        let published = PublishedBundle {
            bundle_path: layout::bundle(function_id),
            bundle_hash,
            dependency_hash,
            deployed_at: Utc::now(),
            deploy_seq,
        };
        match self.persistence.publish_bundle(function_id, &published).await {
            Ok(true) => {}
            Ok(false) => {
                info!(function_id = %function_id, deploy_seq, "Deployment superseded at publish");
                return Ok(());
            }
            Err(e) => {
                if e.is_not_found() {
                    warn!(function_id = %function_id, "Function deleted during deployment");
                }
                return Err(e.into());
            }
        }

        if let Some(old_hash) = previous
            .dependency_hash
            .as_deref()
            .filter(|old| published.dependency_hash.as_deref() != Some(*old))
            && self
                .store
                .delete(&layout::function_cache(function_id, old_hash))
                .await?
        {
            info!(function_id = %function_id, dependency_hash = %old_hash, "Invalidated per-function dependency cache");
        }

        info!(
            function_id = %function_id,
            deploy_seq,
            bundle_hash = %published.bundle_hash,
            dependency_hash = ?published.dependency_hash,
            duration_ms = start.elapsed().as_millis() as u64,
            "Function deployed"
        );
        Ok(())
    }
}
