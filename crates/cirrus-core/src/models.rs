// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Records kept by the document store.
//!
//! A [`FunctionRecord`] is the deployment state of one user function. Every
//! invocation adds one [`LogRecord`] and one [`UsageRecord`] and folds its
//! duration and memory into the running averages in [`FunctionStats`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deployment lifecycle of a function.
///
/// `pending -> deploying -> active | failed`. Updates and redeploys move a
/// function back to `pending`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionStatus {
    /// Accepted, waiting for the deploy pipeline.
    #[default]
    Pending,
    /// Pipeline is running.
    Deploying,
    /// Bundle published and invocable.
    Active,
    /// Pipeline failed; see `deploy_error`.
    Failed,
}

impl FunctionStatus {
    /// Whether the pipeline has finished with this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FunctionStatus::Active | FunctionStatus::Failed)
    }
}

impl std::fmt::Display for FunctionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionStatus::Pending => write!(f, "pending"),
            FunctionStatus::Deploying => write!(f, "deploying"),
            FunctionStatus::Active => write!(f, "active"),
            FunctionStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for FunctionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(FunctionStatus::Pending),
            "deploying" => Ok(FunctionStatus::Deploying),
            "active" => Ok(FunctionStatus::Active),
            "failed" => Ok(FunctionStatus::Failed),
            _ => Err(format!("Unknown function status: {}", s)),
        }
    }
}

/// Aggregated invocation statistics of a function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStats {
    /// Number of invocations.
    pub executed: i64,
    /// Number of failed or timed-out invocations.
    pub errors: i64,
    /// Running mean of invocation wall time, in milliseconds.
    pub avg_latency: f64,
    /// Running mean of reported heap usage, in MB.
    pub avg_memory: f64,
    /// When the function was last invoked.
    pub last_executed: Option<DateTime<Utc>>,
}

impl FunctionStats {
    /// Fold one invocation sample into the statistics.
    ///
    /// Uses the incremental mean `new = (old * n + x) / (n + 1)`, the same
    /// formula the SQL backends apply atomically.
    pub fn record(&mut self, sample: &InvocationSample) {
        let n = self.executed as f64;
        self.avg_latency = (self.avg_latency * n + sample.duration_ms as f64) / (n + 1.0);
        self.avg_memory = (self.avg_memory * n + sample.memory_used_mb as f64) / (n + 1.0);
        self.executed += 1;
        if sample.is_error {
            self.errors += 1;
        }
        self.last_executed = Some(sample.at);
    }
}

/// One user function and its deployment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRecord {
    /// Unique function ID.
    pub function_id: String,
    /// Owning user ID.
    pub owner_id: String,
    /// Name, unique per owner.
    pub name: String,
    /// Deployment status.
    pub status: FunctionStatus,
    /// Last pipeline failure message.
    pub deploy_error: Option<String>,
    /// When the current bundle was published.
    pub deployed_at: Option<DateTime<Utc>>,
    /// Artifact key of the submitted source file.
    pub source_path: String,
    /// Artifact key of the production bundle.
    pub bundle_path: String,
    /// SHA-256 of the submitted source.
    pub source_hash: String,
    /// SHA-256 of the stored bundle. Unset until the first publish.
    pub bundle_hash: Option<String>,
    /// Dependency hash of the bundle's bare imports. Unset when there are none.
    pub dependency_hash: Option<String>,
    /// Public invocation URL.
    pub endpoint: String,
    /// Starts at 1; bumped when a publish changes the bundle and by repairs.
    pub version: i64,
    /// Deployment generation. Each update/redeploy starts a new one, and
    /// only the pipeline of the current generation may write.
    #[serde(skip)]
    pub deploy_seq: i64,
    /// Inactive functions are rejected by the gateway.
    pub is_active: bool,
    /// Invocation statistics.
    pub stats: FunctionStats,
    /// When the function was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Builder for new function records.
pub struct FunctionBuilder {
    function_id: Option<String>,
    owner_id: String,
    name: String,
    endpoint: String,
    source_path: String,
    source_hash: String,
    bundle_path: String,
}

impl FunctionBuilder {
    /// Create a builder for a function owned by `owner_id`.
    pub fn new(
        owner_id: impl Into<String>,
        name: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            function_id: None,
            owner_id: owner_id.into(),
            name: name.into(),
            endpoint: endpoint.into(),
            source_path: String::new(),
            source_hash: String::new(),
            bundle_path: String::new(),
        }
    }

    /// Set custom function ID (defaults to UUID if not set)
    pub fn function_id(mut self, function_id: impl Into<String>) -> Self {
        self.function_id = Some(function_id.into());
        self
    }

    /// Set the source artifact key and its hash
    pub fn source(mut self, path: impl Into<String>, hash: impl Into<String>) -> Self {
        self.source_path = path.into();
        self.source_hash = hash.into();
        self
    }

    /// Set the bundle artifact key
    pub fn bundle_path(mut self, path: impl Into<String>) -> Self {
        self.bundle_path = path.into();
        self
    }

    /// Build a pending function record
    pub fn build(self) -> FunctionRecord {
        let now = Utc::now();
        FunctionRecord {
            function_id: self
                .function_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            owner_id: self.owner_id,
            name: self.name,
            status: FunctionStatus::Pending,
            deploy_error: None,
            deployed_at: None,
            source_path: self.source_path,
            bundle_path: self.bundle_path,
            source_hash: self.source_hash,
            bundle_hash: None,
            dependency_hash: None,
            endpoint: self.endpoint,
            version: 1,
            deploy_seq: 1,
            is_active: true,
            stats: FunctionStats::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of a successful deploy pipeline run.
#[derive(Debug, Clone)]
pub struct PublishedBundle {
    /// Artifact key of the bundle.
    pub bundle_path: String,
    /// SHA-256 of the bundle bytes.
    pub bundle_hash: String,
    /// Dependency hash, `None` when the bundle has no bare imports.
    pub dependency_hash: Option<String>,
    /// Publish time.
    pub deployed_at: DateTime<Utc>,
    /// Generation of the pipeline that built the bundle.
    pub deploy_seq: i64,
}

/// Partial update of user-editable function settings.
#[derive(Debug, Clone, Default)]
pub struct FunctionSettings {
    /// New name.
    pub name: Option<String>,
    /// New endpoint, required whenever the name changes.
    pub endpoint: Option<String>,
    /// New activation flag.
    pub is_active: Option<bool>,
}

impl FunctionSettings {
    /// Whether the patch changes anything.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.endpoint.is_none() && self.is_active.is_none()
    }
}

/// One invocation folded into function statistics.
#[derive(Debug, Clone, Copy)]
pub struct InvocationSample {
    /// Wall time in milliseconds.
    pub duration_ms: i64,
    /// Heap used in MB.
    pub memory_used_mb: i64,
    /// Failed or timed out.
    pub is_error: bool,
    /// Invocation end time.
    pub at: DateTime<Utc>,
}

/// Console level of a captured log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Log,
    Info,
    Warn,
    Error,
}

/// One line of console output captured from user code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl LogLine {
    /// Create a line stamped with the current time.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Outcome of one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    #[default]
    Success,
    Error,
    Timeout,
}

impl InvocationStatus {
    /// Whether the invocation counts as an error in statistics.
    pub fn is_error(&self) -> bool {
        !matches!(self, InvocationStatus::Success)
    }
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationStatus::Success => write!(f, "success"),
            InvocationStatus::Error => write!(f, "error"),
            InvocationStatus::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::str::FromStr for InvocationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" => Ok(InvocationStatus::Success),
            "error" => Ok(InvocationStatus::Error),
            "timeout" => Ok(InvocationStatus::Timeout),
            _ => Err(format!("Unknown invocation status: {}", s)),
        }
    }
}

/// Per-invocation execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub log_id: String,
    pub function_id: String,
    pub invocation_id: String,
    pub lines: Vec<LogLine>,
    pub status: InvocationStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub memory_used_mb: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-invocation billing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub usage_id: String,
    pub function_id: String,
    pub user_id: String,
    pub invocation_id: String,
    pub duration_ms: i64,
    pub memory_used_mb: i64,
    pub status: InvocationStatus,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Usage record joined with the name of its function.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageActivity {
    #[serde(flatten)]
    pub usage: UsageRecord,
    /// `None` when the function has since been deleted.
    pub function_name: Option<String>,
}

/// Counters kept on the owner across all their functions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUsage {
    pub executed: i64,
    pub last_executed: Option<DateTime<Utc>>,
}

/// A function owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: String,
    /// Lowercase, unique.
    pub user_name: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub usage: UserUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    /// Create a user with a generated ID. The name is lowercased.
    pub fn new(user_name: impl AsRef<str>, api_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: uuid::Uuid::new_v4().to_string(),
            user_name: user_name.as_ref().to_lowercase(),
            api_key: api_key.into(),
            usage: UserUsage::default(),
            created_at: now,
            updated_at: now,
        }
    }
}
