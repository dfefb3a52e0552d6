// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gateway dispatcher.
//!
//! Public entry point for invocations:
//!
//! 1. API key check (401)
//! 2. Function lookup by owner and name (404), activation (503)
//! 3. Bundle integrity check, rebuilding from source on mismatch (503 while
//!    a deployment is in flight)
//! 4. Sandbox execution
//! 5. One log record, one usage record, stats and owner counters

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cirrus_core::{
    ArtifactStore, FunctionRecord, InvocationSample, LogRecord, Persistence, UsageRecord,
    UserRecord,
};
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::orchestrator::{DeploymentOrchestrator, sha256_hex};
use crate::sandbox::{ExecutionRequest, ExecutionResult, InvocationContext, Sandbox};

/// Status and JSON body returned to the caller.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl GatewayResponse {
    fn from_error(err: &Error) -> Self {
        Self {
            status: err.status_code(),
            body: json!({
                "success": false,
                "error": err.to_string(),
            }),
        }
    }
}

/// Routes invocations to functions and accounts for them.
#[derive(Clone)]
pub struct GatewayDispatcher {
    persistence: Arc<dyn Persistence>,
    store: ArtifactStore,
    sandbox: Arc<dyn Sandbox>,
    orchestrator: DeploymentOrchestrator,
}

impl GatewayDispatcher {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        store: ArtifactStore,
        sandbox: Arc<dyn Sandbox>,
        orchestrator: DeploymentOrchestrator,
    ) -> Self {
        Self {
            persistence,
            store,
            sandbox,
            orchestrator,
        }
    }

    /// Invoke `{user_name}/{function_name}`. Never fails; errors become responses.
    pub async fn invoke(
        &self,
        user_name: &str,
        function_name: &str,
        api_key: Option<&str>,
        context: InvocationContext,
    ) -> GatewayResponse {
        match self
            .dispatch(user_name, function_name, api_key, context)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.status_code().is_server_error() {
                    tracing::error!(
                        user_name = %user_name,
                        function_name = %function_name,
                        error = %e,
                        "Invocation rejected"
                    );
                } else {
                    tracing::debug!(
                        user_name = %user_name,
                        function_name = %function_name,
                        error = %e,
                        "Invocation rejected"
                    );
                }
                GatewayResponse::from_error(&e)
            }
        }
    }

    async fn dispatch(
        &self,
        user_name: &str,
        function_name: &str,
        api_key: Option<&str>,
        context: InvocationContext,
    ) -> Result<GatewayResponse> {
        let owner = self.authenticate(user_name, api_key).await?;

        let function = self
            .persistence
            .get_function_by_name(&owner.user_id, function_name)
            .await?
            .ok_or_else(|| Error::NotFound("Function not found".to_string()))?;

        if !function.is_active {
            return Err(Error::FunctionInactive);
        }
        let Some(expected_hash) = function.bundle_hash.as_deref() else {
            return Err(Error::FunctionNotDeployed);
        };

        let expected_hash = expected_hash.to_string();
        let (bundle, function) = self.verified_bundle(function, &expected_hash).await?;

        let invocation_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();

        let result = self
            .sandbox
            .execute(&ExecutionRequest {
                invocation_id: invocation_id.clone(),
                function_id: function.function_id.clone(),
                bundle,
                dependency_hash: function.dependency_hash.clone(),
                context,
            })
            .await;

        let duration_ms = start.elapsed().as_millis() as i64;
        let ended_at = Utc::now();

        self.record(
            &owner,
            &function,
            &invocation_id,
            &result,
            started_at,
            ended_at,
            duration_ms,
        )
        .await;

        let status = if result.success {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Ok(GatewayResponse {
            status,
            body: serde_json::to_value(&result)?,
        })
    }

    /// Resolve the owner, requiring the key to belong to them.
    async fn authenticate(&self, user_name: &str, api_key: Option<&str>) -> Result<UserRecord> {
        let api_key = api_key.filter(|k| !k.is_empty()).ok_or(Error::Unauthorized)?;

        let user = self
            .persistence
            .get_user_by_api_key(api_key)
            .await?
            .ok_or(Error::Unauthorized)?;

        if user.user_name != user_name.to_lowercase() {
            return Err(Error::Unauthorized);
        }
        Ok(user)
    }

    /// Load the bundle, repairing it when its bytes do not match `expected_hash`.
    ///
    /// Returns the record the bundle belongs to, which differs from
    /// `function` when a deployment published in the meantime.
    async fn verified_bundle(
        &self,
        function: FunctionRecord,
        expected_hash: &str,
    ) -> Result<(Bytes, FunctionRecord)> {
        let stored = self.store.get(&function.bundle_path).await?;

        let actual_hash = stored.as_deref().map(sha256_hex);
        if let Some(bundle) = stored
            && actual_hash.as_deref() == Some(expected_hash)
        {
            return Ok((bundle, function));
        }

        tracing::warn!(
            function_id = %function.function_id,
            expected_hash = %expected_hash,
            actual_hash = ?actual_hash,
            "Bundle integrity check failed, rebuilding from source"
        );

        match self.orchestrator.heal_bundle(&function.function_id).await {
            Ok((bundle, healed)) => {
                tracing::info!(
                    function_id = %healed.function_id,
                    bundle_hash = ?healed.bundle_hash,
                    version = healed.version,
                    "Bundle self-healed"
                );
                Ok((bundle, healed))
            }
            Err(Error::FunctionDeploying) => Err(Error::FunctionDeploying),
            Err(e) => {
                tracing::error!(
                    function_id = %function.function_id,
                    error = %e,
                    "Bundle self-heal failed"
                );
                match e {
                    Error::Integrity(_) => Err(e),
                    other => Err(Error::Integrity(other.to_string())),
                }
            }
        }
    }

    /// Persist log, usage, stats and owner counters. Failures are logged only.
    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        owner: &UserRecord,
        function: &FunctionRecord,
        invocation_id: &str,
        result: &ExecutionResult,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        duration_ms: i64,
    ) {
        let status = result.status();
        let memory_used_mb = result.memory_used_mb();
        let function_id = function.function_id.as_str();

        let log = LogRecord {
            log_id: uuid::Uuid::new_v4().to_string(),
            function_id: function_id.to_string(),
            invocation_id: invocation_id.to_string(),
            lines: result.logs.clone(),
            status,
            start_time: started_at,
            end_time: ended_at,
            duration_ms,
            memory_used_mb,
            error: result.error.clone(),
            created_at: ended_at,
        };
        if let Err(e) = self.persistence.insert_log(&log).await {
            tracing::error!(function_id = %function_id, invocation_id = %invocation_id, error = %e, "Failed to write invocation log");
        }

        let usage = UsageRecord {
            usage_id: uuid::Uuid::new_v4().to_string(),
            function_id: function_id.to_string(),
            user_id: owner.user_id.clone(),
            invocation_id: invocation_id.to_string(),
            duration_ms,
            memory_used_mb,
            status,
            error: result.error.clone(),
            recorded_at: ended_at,
        };
        if let Err(e) = self.persistence.insert_usage(&usage).await {
            tracing::error!(function_id = %function_id, invocation_id = %invocation_id, error = %e, "Failed to write usage record");
        }

        let sample = InvocationSample {
            duration_ms,
            memory_used_mb,
            is_error: status.is_error(),
            at: ended_at,
        };
        if let Err(e) = self
            .persistence
            .record_invocation_stats(function_id, &sample)
            .await
        {
            tracing::error!(function_id = %function_id, error = %e, "Failed to update function stats");
        }

        if let Err(e) = self
            .persistence
            .record_user_invocation(&owner.user_id, ended_at)
            .await
        {
            tracing::error!(user_id = %owner.user_id, error = %e, "Failed to update user usage");
        }

        tracing::info!(
            function_id = %function_id,
            invocation_id = %invocation_id,
            status = %status,
            duration_ms,
            memory_used_mb,
            "Invocation recorded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_shape() {
        let response = GatewayResponse::from_error(&Error::FunctionInactive);
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body["success"], false);
        assert_eq!(response.body["error"], "Function is currently inactive");

        let response = GatewayResponse::from_error(&Error::Integrity("missing source".to_string()));
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(
            response.body["error"]
                .as_str()
                .unwrap()
                .starts_with("Integrity check failed and re-bundling failed")
        );
    }
}
