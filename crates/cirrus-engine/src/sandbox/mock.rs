// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock sandbox for testing.
//!
//! Produces canned results without starting any process.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use cirrus_core::{LogLevel, LogLine};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::traits::*;

#[derive(Debug, Clone)]
enum MockBehavior {
    /// Echo the invocation context back.
    Echo,
    /// Return a fixed value.
    Value(Value),
    /// Fail with a message.
    Fail(String),
    /// Report a timeout.
    Timeout,
}

/// Mock sandbox for testing.
pub struct MockSandbox {
    behavior: MockBehavior,
    /// Optional delay to simulate execution time (in milliseconds)
    pub execution_delay_ms: u64,
    /// Heap usage reported for every invocation (in MB)
    pub memory_mb: u64,
    calls: AtomicUsize,
    last_request: Mutex<Option<ExecutionRequest>>,
}

impl Default for MockSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSandbox {
    /// Create a mock sandbox that echoes the request context.
    pub fn new() -> Self {
        Self {
            behavior: MockBehavior::Echo,
            execution_delay_ms: 0,
            memory_mb: 8,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Create a mock sandbox that always returns `value`.
    pub fn with_result(value: Value) -> Self {
        Self {
            behavior: MockBehavior::Value(value),
            ..Self::new()
        }
    }

    /// Create a mock sandbox whose invocations always fail.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            behavior: MockBehavior::Fail(message.into()),
            ..Self::new()
        }
    }

    /// Create a mock sandbox whose invocations always time out.
    pub fn timing_out() -> Self {
        Self {
            behavior: MockBehavior::Timeout,
            ..Self::new()
        }
    }

    /// Set a per-invocation delay.
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.execution_delay_ms = delay_ms;
        self
    }

    /// Number of invocations executed.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most recent request.
    pub async fn last_request(&self) -> Option<ExecutionRequest> {
        self.last_request.lock().await.clone()
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn sandbox_type(&self) -> &'static str {
        "mock"
    }

    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().await = Some(request.clone());

        if self.execution_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.execution_delay_ms)).await;
        }

        let logs = vec![LogLine::new(
            LogLevel::Log,
            format!("mock invocation {}", request.invocation_id),
        )];
        let memory_usage = Some(MemoryUsage {
            heap_used: self.memory_mb * 1024 * 1024,
            heap_total: self.memory_mb * 2 * 1024 * 1024,
            external: 0,
            rss: self.memory_mb * 4 * 1024 * 1024,
        });

        let result = match &self.behavior {
            MockBehavior::Echo => {
                let mut result = ExecutionResult::success(json!({
                    "method": request.context.method,
                    "query": request.context.query,
                    "body": request.context.body,
                }));
                result.handler = Some(HandlerKind::Default);
                result
            }
            MockBehavior::Value(value) => {
                let mut result = ExecutionResult::success(value.clone());
                result.handler = Some(HandlerKind::Default);
                result
            }
            MockBehavior::Fail(message) => ExecutionResult::failure(message.clone()),
            MockBehavior::Timeout => ExecutionResult::timeout("Execution timed out"),
        };

        ExecutionResult {
            memory_usage,
            ..result.with_logs(logs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request(body: Value) -> ExecutionRequest {
        ExecutionRequest {
            invocation_id: "inv-1".to_string(),
            function_id: "fn-1".to_string(),
            bundle: Bytes::from_static(b"module.exports = () => null;"),
            dependency_hash: None,
            context: InvocationContext {
                method: "POST".to_string(),
                body,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_mock_echoes_context() {
        let sandbox = MockSandbox::new();
        let result = sandbox.execute(&request(json!({"a": 1}))).await;

        assert!(result.success);
        assert_eq!(result.result.as_ref().unwrap()["body"]["a"], 1);
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.memory_used_mb(), 8);
        assert_eq!(sandbox.call_count(), 1);
        assert_eq!(
            sandbox.last_request().await.unwrap().invocation_id,
            "inv-1"
        );
    }

    #[tokio::test]
    async fn test_mock_failure_and_timeout() {
        let failed = MockSandbox::failing("boom").execute(&request(Value::Null)).await;
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("boom"));

        let timed_out = MockSandbox::timing_out().execute(&request(Value::Null)).await;
        assert!(timed_out.timed_out);
        assert_eq!(timed_out.status(), cirrus_core::InvocationStatus::Timeout);
    }
}
