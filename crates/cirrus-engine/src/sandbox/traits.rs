// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandbox trait definitions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use cirrus_core::{InvocationStatus, LogLine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while preparing or supervising a worker.
///
/// These never reach callers of [`Sandbox::execute`]; they are folded into a
/// failed [`ExecutionResult`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// The worker process could not be started.
    #[error("Failed to start worker: {0}")]
    Spawn(String),

    /// The function's dependency bundle is missing.
    #[error("Dependency bundle {0} not found")]
    DependenciesMissing(String),

    /// Unpacking dependencies failed.
    #[error("Failed to prepare dependencies: {0}")]
    Dependencies(#[from] crate::dependencies::DependencyError),

    /// Artifact store operation failed.
    #[error("Artifact store error: {0}")]
    Store(#[from] cirrus_core::CoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Request data handed to the handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationContext {
    pub method: String,
    /// Lowercase header names. Repeated headers are joined with `", "`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Query parameters. A repeated key keeps its last value.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

/// One invocation to run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Unique per call.
    pub invocation_id: String,
    pub function_id: String,
    /// Bundle bytes to execute.
    pub bundle: Bytes,
    /// Dependency bundle to make available as `node_modules`.
    pub dependency_hash: Option<String>,
    pub context: InvocationContext,
}

/// Which export was used as the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// `module.exports` itself is callable.
    Direct,
    /// `exports.default` is callable.
    Default,
    /// `exports.handler` is callable.
    Handler,
    /// Nothing callable; the exports are the result.
    Exports,
}

/// Process memory reported by the worker, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    #[serde(default)]
    pub heap_used: u64,
    #[serde(default)]
    pub heap_total: u64,
    #[serde(default)]
    pub external: u64,
    #[serde(default)]
    pub rss: u64,
}

impl MemoryUsage {
    /// Heap used, rounded to whole MB.
    pub fn heap_used_mb(&self) -> i64 {
        (self.heap_used as f64 / (1024.0 * 1024.0)).round() as i64
    }
}

/// Outcome of one invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogLine>,
    #[serde(default)]
    pub memory_usage: Option<MemoryUsage>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<HandlerKind>,
    /// PID of the worker that ran the invocation.
    #[serde(skip)]
    pub worker_pid: Option<u32>,
}

impl ExecutionResult {
    /// Successful result.
    pub fn success(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            ..Default::default()
        }
    }

    /// Failed result with an error message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Failed result for an invocation that ran out of time.
    pub fn timeout(error: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::failure(error)
        }
    }

    /// Attach captured log lines.
    pub fn with_logs(mut self, logs: Vec<LogLine>) -> Self {
        self.logs = logs;
        self
    }

    /// Status recorded in logs and usage.
    pub fn status(&self) -> InvocationStatus {
        if self.timed_out {
            InvocationStatus::Timeout
        } else if self.success {
            InvocationStatus::Success
        } else {
            InvocationStatus::Error
        }
    }

    /// Heap used in MB, 0 when unknown.
    pub fn memory_used_mb(&self) -> i64 {
        self.memory_usage.map(|m| m.heap_used_mb()).unwrap_or(0)
    }
}

/// Trait for execution sandboxes.
///
/// Implementations never share a process, a scratch directory or in-memory
/// state between invocations.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Sandbox type identifier (e.g., "node", "mock")
    fn sandbox_type(&self) -> &'static str;

    /// Run one invocation. Failures are reported in the result, never as `Err`.
    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ExecutionResult::success(Value::Null).status(),
            InvocationStatus::Success
        );
        assert_eq!(
            ExecutionResult::failure("boom").status(),
            InvocationStatus::Error
        );
        assert_eq!(
            ExecutionResult::timeout("Execution timed out").status(),
            InvocationStatus::Timeout
        );
    }

    #[test]
    fn test_memory_rounding() {
        let result = ExecutionResult {
            memory_usage: Some(MemoryUsage {
                heap_used: 5 * 1024 * 1024 + 600 * 1024,
                ..Default::default()
            }),
            ..ExecutionResult::success(Value::Null)
        };
        assert_eq!(result.memory_used_mb(), 6);
        assert_eq!(ExecutionResult::failure("x").memory_used_mb(), 0);
    }

    #[test]
    fn test_result_json_shape() {
        let json = serde_json::to_value(ExecutionResult::timeout("Execution timed out")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["timedOut"], true);
        assert_eq!(json["error"], "Execution timed out");
        assert!(json.get("workerPid").is_none());

        let json = serde_json::to_value(ExecutionResult::success(serde_json::json!({"ok": true})))
            .unwrap();
        assert_eq!(json["result"]["ok"], true);
        assert!(json.get("timedOut").is_none());
        assert!(json.get("error").is_none());
    }
}
