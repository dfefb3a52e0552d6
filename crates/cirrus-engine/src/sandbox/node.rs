// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node.js process sandbox.
//!
//! Every invocation gets its own scratch directory and its own `node` process
//! running the embedded worker script. The worker streams console output and
//! a final result as JSON lines on stdout. The supervisor races that result
//! against process exit and a hard deadline; on the deadline the whole process
//! group is killed with SIGKILL.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cirrus_core::{ArtifactStore, LogLine, layout};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::traits::{
    ExecutionRequest, ExecutionResult, HandlerKind, MemoryUsage, Sandbox, SandboxError,
};
use crate::dependencies::archive;

const WORKER_SOURCE: &str = include_str!("worker.js");
const WORKER_FILE: &str = "worker.js";
const BUNDLE_FILE: &str = "bundle.js";

/// Console lines kept per invocation.
const MAX_LOG_LINES: usize = 1000;
/// Stderr bytes kept for crash reports.
const MAX_STDERR_BYTES: u64 = 16 * 1024;
/// Stderr characters quoted in an error message.
const MAX_STDERR_IN_ERROR: usize = 1000;
/// How long a late result may trail process exit.
const EXIT_GRACE: Duration = Duration::from_millis(500);
/// How long a worker may linger after reporting.
const REPORT_GRACE: Duration = Duration::from_secs(1);

/// Configuration for [`NodeSandbox`].
#[derive(Debug, Clone)]
pub struct NodeSandboxConfig {
    /// Path to the node executable.
    pub node_binary: PathBuf,
    /// Hard deadline; the worker is killed when it passes.
    pub timeout: Duration,
    /// Soft deadline enforced by the worker itself.
    pub worker_timeout: Duration,
    /// V8 old-space limit, passed as `--max-old-space-size`.
    pub memory_limit_mb: Option<u32>,
    /// Run the worker under Node's permission model.
    pub permission_model: bool,
    /// Parent directory for per-invocation scratch directories.
    pub scratch_root: Option<PathBuf>,
}

impl Default for NodeSandboxConfig {
    fn default() -> Self {
        Self {
            node_binary: PathBuf::from("node"),
            timeout: Duration::from_secs(6),
            worker_timeout: Duration::from_secs(5),
            memory_limit_mb: Some(128),
            permission_model: false,
            scratch_root: None,
        }
    }
}

/// Sandbox running each invocation in a fresh `node` process.
pub struct NodeSandbox {
    config: NodeSandboxConfig,
    store: ArtifactStore,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WorkerEvent {
    Log(LogLine),
    Result(WorkerOutcome),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerOutcome {
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    memory_usage: Option<MemoryUsage>,
    #[serde(default)]
    timed_out: bool,
    #[serde(default)]
    handler: Option<HandlerKind>,
}

impl From<WorkerOutcome> for ExecutionResult {
    fn from(outcome: WorkerOutcome) -> Self {
        Self {
            success: outcome.success,
            result: if outcome.success {
                Some(outcome.result.unwrap_or(Value::Null))
            } else {
                None
            },
            error: outcome.error,
            logs: Vec::new(),
            memory_usage: outcome.memory_usage,
            timed_out: outcome.timed_out,
            handler: outcome.handler,
            worker_pid: None,
        }
    }
}

enum Completion {
    Reported(WorkerOutcome),
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
}

type SharedLogs = Arc<Mutex<Vec<LogLine>>>;

impl NodeSandbox {
    /// Create a sandbox reading dependency bundles from `store`.
    pub fn new(config: NodeSandboxConfig, store: ArtifactStore) -> Self {
        Self { config, store }
    }

    async fn scratch_dir(&self) -> Result<tempfile::TempDir, SandboxError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("cirrus-run-");
        Ok(match &self.config.scratch_root {
            Some(root) => {
                tokio::fs::create_dir_all(root).await?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        })
    }

    /// Write the worker, the bundle and `node_modules` into `dir`.
    async fn prepare(&self, request: &ExecutionRequest, dir: &Path) -> Result<(), SandboxError> {
        tokio::fs::write(dir.join(WORKER_FILE), WORKER_SOURCE).await?;
        tokio::fs::write(dir.join(BUNDLE_FILE), &request.bundle).await?;

        if let Some(hash) = &request.dependency_hash {
            self.materialize_dependencies(&request.function_id, hash, dir)
                .await?;
        }
        Ok(())
    }

    /// Unpack dependencies, preferring the function's own cached copy.
    ///
    /// On a miss the shared bundle is copied into the function's cache so the
    /// next cold start skips the shared lookup.
    async fn materialize_dependencies(
        &self,
        function_id: &str,
        dependency_hash: &str,
        dir: &Path,
    ) -> Result<(), SandboxError> {
        let function_key = layout::function_cache(function_id, dependency_hash);

        let tarball = match self.store.get(&function_key).await? {
            Some(bytes) => bytes,
            None => {
                let shared = self
                    .store
                    .get(&layout::dependency_archive(dependency_hash))
                    .await?
                    .ok_or_else(|| SandboxError::DependenciesMissing(dependency_hash.to_string()))?;

                if let Err(e) = self.store.put(&function_key, shared.clone()).await {
                    warn!(
                        function_id = %function_id,
                        error = %e,
                        "Failed to populate per-function dependency cache"
                    );
                }
                shared
            }
        };

        archive::unpack_node_modules(tarball, dir).await?;
        Ok(())
    }

    fn command(&self, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.node_binary);

        if let Some(mb) = self.config.memory_limit_mb {
            cmd.arg(format!("--max-old-space-size={}", mb));
        }
        if self.config.permission_model {
            cmd.arg("--permission")
                .arg(format!("--allow-fs-read={}", dir.display()));
        }

        cmd.arg(dir.join(WORKER_FILE))
            .current_dir(dir)
            .env_clear()
            .env("NODE_ENV", "production")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        cmd
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        dir: &Path,
    ) -> Result<ExecutionResult, SandboxError> {
        let mut child = self.command(dir).spawn().map_err(|e| {
            SandboxError::Spawn(format!(
                "{}: {}. Make sure Node.js is installed or set NODE_BIN",
                self.config.node_binary.display(),
                e
            ))
        })?;
        let pid = child.id();

        let payload = serde_json::to_vec(&serde_json::json!({
            "bundle": BUNDLE_FILE,
            "context": request.context,
            "timeoutMs": self.config.worker_timeout.as_millis() as u64,
        }))?;
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "Worker closed stdin early");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let logs: SharedLogs = Arc::new(Mutex::new(Vec::new()));
        let (outcome_tx, mut outcome_rx) = oneshot::channel();
        let reader = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_events(stdout, logs.clone(), outcome_tx)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_stderr(s)));

        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);
        let mut reader_open = true;

        let completion = loop {
            tokio::select! {
                biased;
                outcome = &mut outcome_rx, if reader_open => match outcome {
                    Ok(outcome) => break Completion::Reported(outcome),
                    Err(_) => reader_open = false,
                },
                status = child.wait() => break Completion::Exited(status),
                _ = &mut deadline => break Completion::TimedOut,
            }
        };

        let mut result = match completion {
            Completion::Reported(outcome) => {
                if tokio::time::timeout(REPORT_GRACE, child.wait()).await.is_err() {
                    debug!(pid = ?pid, "Worker lingered after reporting, killing");
                    kill_group(pid);
                    let _ = child.wait().await;
                }
                ExecutionResult::from(outcome)
            }
            Completion::Exited(status) => {
                // The result line may still be in flight.
                let late = if reader_open {
                    tokio::time::timeout(EXIT_GRACE, &mut outcome_rx)
                        .await
                        .ok()
                        .and_then(Result::ok)
                } else {
                    None
                };
                match late {
                    Some(outcome) => ExecutionResult::from(outcome),
                    None => {
                        let stderr = collect_stderr(stderr).await;
                        ExecutionResult::failure(exit_message(status, &stderr))
                    }
                }
            }
            Completion::TimedOut => {
                warn!(
                    invocation_id = %request.invocation_id,
                    pid = ?pid,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Worker exceeded hard timeout, killing process group"
                );
                kill_group(pid);
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Worker already reaped");
                }
                ExecutionResult::timeout(format!(
                    "Execution timed out after {}ms",
                    self.config.timeout.as_millis()
                ))
            }
        };

        // Grandchildren may still hold the pipes open.
        kill_group(pid);
        if let Some(reader) = reader
            && tokio::time::timeout(Duration::from_millis(200), reader).await.is_err()
        {
            debug!("Worker stdout reader did not finish");
        }

        result.logs = logs.lock().map(|mut l| std::mem::take(&mut *l)).unwrap_or_default();
        result.worker_pid = pid;
        Ok(result)
    }
}

fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    match signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pid = pid, error = %e, "Failed to kill worker process group"),
    }
}

async fn read_events(
    stdout: ChildStdout,
    logs: SharedLogs,
    outcome_tx: oneshot::Sender<WorkerOutcome>,
) {
    let mut outcome_tx = Some(outcome_tx);
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<WorkerEvent>(&line) {
            Ok(WorkerEvent::Log(entry)) => {
                if let Ok(mut guard) = logs.lock()
                    && guard.len() < MAX_LOG_LINES
                {
                    guard.push(entry);
                }
            }
            Ok(WorkerEvent::Result(outcome)) => {
                if let Some(tx) = outcome_tx.take() {
                    let _ = tx.send(outcome);
                }
            }
            Err(_) => debug!(line = %line, "Ignoring non-protocol worker output"),
        }
    }
}

async fn read_stderr(mut stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    let _ = (&mut stderr).take(MAX_STDERR_BYTES).read_to_end(&mut buf).await;
    // Keep draining so the worker never blocks on a full pipe.
    let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect_stderr(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(Duration::from_millis(200), handle).await {
        Ok(Ok(text)) => text,
        _ => String::new(),
    }
}

fn exit_message(status: std::io::Result<ExitStatus>, stderr: &str) -> String {
    let base = match status {
        Ok(status) => match (status.code(), status.signal()) {
            (Some(code), _) => format!("Worker exited with code {}", code),
            (None, Some(sig)) => format!("Worker terminated by signal {}", sig),
            (None, None) => "Worker exited unexpectedly".to_string(),
        },
        Err(e) => format!("Worker error: {}", e),
    };

    let stderr = stderr.trim();
    if stderr.is_empty() {
        return base;
    }
    let excerpt: String = stderr.chars().take(MAX_STDERR_IN_ERROR).collect();
    format!("{}: {}", base, excerpt)
}

#[async_trait]
impl Sandbox for NodeSandbox {
    fn sandbox_type(&self) -> &'static str {
        "node"
    }

    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let start = Instant::now();

        let scratch = match self.scratch_dir().await {
            Ok(dir) => dir,
            Err(e) => {
                error!(invocation_id = %request.invocation_id, error = %e, "Failed to create scratch directory");
                return ExecutionResult::failure(format!("Worker error: {}", e));
            }
        };

        if let Err(e) = self.prepare(request, scratch.path()).await {
            error!(
                invocation_id = %request.invocation_id,
                function_id = %request.function_id,
                error = %e,
                "Failed to prepare invocation"
            );
            return ExecutionResult::failure(format!("Worker error: {}", e));
        }

        let result = match self.run(request, scratch.path()).await {
            Ok(result) => result,
            Err(e) => {
                error!(invocation_id = %request.invocation_id, error = %e, "Worker failed to run");
                ExecutionResult::failure(format!("Worker error: {}", e))
            }
        };

        info!(
            invocation_id = %request.invocation_id,
            function_id = %request.function_id,
            success = result.success,
            timed_out = result.timed_out,
            duration_ms = start.elapsed().as_millis() as u64,
            "Invocation finished"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_message_with_stderr() {
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(
            exit_message(Ok(status), "  boom\n"),
            "Worker exited with code 3: boom"
        );
        assert_eq!(exit_message(Ok(status), ""), "Worker exited with code 3");
    }

    #[test]
    fn test_exit_message_for_signal() {
        let status = ExitStatus::from_raw(9);
        assert_eq!(exit_message(Ok(status), ""), "Worker terminated by signal 9");
    }

    #[test]
    fn test_worker_events_parse() {
        let log: WorkerEvent = serde_json::from_str(
            r#"{"type":"log","level":"warn","message":"careful","timestamp":"2025-01-01T00:00:00.000Z"}"#,
        )
        .unwrap();
        assert!(matches!(log, WorkerEvent::Log(ref l) if l.message == "careful"));

        let done: WorkerEvent = serde_json::from_str(
            r#"{"type":"result","success":true,"result":{"n":1},"handler":"default","memoryUsage":{"heapUsed":1048576,"heapTotal":2,"external":3,"rss":4}}"#,
        )
        .unwrap();
        let WorkerEvent::Result(outcome) = done else {
            panic!("expected result event");
        };
        let result = ExecutionResult::from(outcome);
        assert!(result.success);
        assert_eq!(result.handler, Some(HandlerKind::Default));
        assert_eq!(result.memory_used_mb(), 1);
    }

    #[test]
    fn test_missing_result_becomes_null() {
        let outcome: WorkerOutcome =
            serde_json::from_str(r#"{"success":true,"handler":"exports"}"#).unwrap();
        let result = ExecutionResult::from(outcome);
        assert_eq!(result.result, Some(Value::Null));
    }

    #[tokio::test]
    async fn test_missing_node_binary_reports_failure() {
        let sandbox = NodeSandbox::new(
            NodeSandboxConfig {
                node_binary: PathBuf::from("/nonexistent/node"),
                ..Default::default()
            },
            ArtifactStore::in_memory(),
        );
        let result = sandbox
            .execute(&ExecutionRequest {
                invocation_id: "inv-1".to_string(),
                function_id: "fn-1".to_string(),
                bundle: bytes::Bytes::from_static(b"module.exports = () => 1;"),
                dependency_hash: None,
                context: Default::default(),
            })
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("Worker error:"));
    }

    #[tokio::test]
    async fn test_missing_dependency_bundle_reports_failure() {
        let sandbox = NodeSandbox::new(NodeSandboxConfig::default(), ArtifactStore::in_memory());
        let result = sandbox
            .execute(&ExecutionRequest {
                invocation_id: "inv-1".to_string(),
                function_id: "fn-1".to_string(),
                bundle: bytes::Bytes::from_static(b"module.exports = () => 1;"),
                dependency_hash: Some("abc".to_string()),
                context: Default::default(),
            })
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Dependency bundle abc not found"));
    }

    async fn archive_with(content: &str) -> bytes::Bytes {
        let src = tempfile::tempdir().unwrap();
        let pkg = src.path().join("node_modules/dep");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("index.js"), content).unwrap();
        archive::pack_node_modules(src.path()).await.unwrap()
    }

    #[tokio::test]
    async fn test_function_cache_follows_dependency_hash() {
        let store = ArtifactStore::in_memory();
        store
            .put(&layout::dependency_archive("hash-a"), archive_with("a").await)
            .await
            .unwrap();
        store
            .put(&layout::dependency_archive("hash-b"), archive_with("b").await)
            .await
            .unwrap();
        let sandbox = NodeSandbox::new(NodeSandboxConfig::default(), store.clone());

        let first = tempfile::tempdir().unwrap();
        sandbox
            .materialize_dependencies("fn-1", "hash-a", first.path())
            .await
            .unwrap();
        assert!(store.exists(&layout::function_cache("fn-1", "hash-a")).await.unwrap());

        // A cached copy for the old hash must not be served for the new one.
        let second = tempfile::tempdir().unwrap();
        sandbox
            .materialize_dependencies("fn-1", "hash-b", second.path())
            .await
            .unwrap();
        let served =
            std::fs::read_to_string(second.path().join("node_modules/dep/index.js")).unwrap();
        assert_eq!(served, "b");
        assert!(store.exists(&layout::function_cache("fn-1", "hash-b")).await.unwrap());
    }
}
