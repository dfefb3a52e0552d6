// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request handlers.
//!
//! Transport-agnostic operations behind the HTTP routes in [`crate::server`].
//! Management calls are scoped to the caller; functions of other owners are
//! reported as missing.

use std::sync::Arc;

use cirrus_core::{FunctionRecord, LogRecord, Persistence, UsageActivity, UsageRecord, UserRecord};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gateway::{GatewayDispatcher, GatewayResponse};
use crate::orchestrator::{DeploymentOrchestrator, FunctionUpdate, FunctionWithCode};
use crate::sandbox::InvocationContext;

/// Entries returned by the recent activity query.
pub const RECENT_USAGE_LIMIT: i64 = 20;

/// Shared state for handlers.
pub struct FaasHandlerState {
    /// Document store.
    pub persistence: Arc<dyn Persistence>,
    /// Deployment lifecycle.
    pub orchestrator: DeploymentOrchestrator,
    /// Invocation entry point.
    pub gateway: GatewayDispatcher,
    /// When the server started (for uptime calculation).
    pub start_time: std::time::Instant,
    /// Server version string.
    pub version: String,
}

impl FaasHandlerState {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        orchestrator: DeploymentOrchestrator,
        gateway: GatewayDispatcher,
    ) -> Self {
        Self {
            persistence,
            orchestrator,
            gateway,
            start_time: std::time::Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }
}

// ============================================================================
// Health Check
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResponse {
    /// Whether the database answers.
    pub healthy: bool,
    pub version: String,
    pub uptime_ms: i64,
}

pub async fn handle_health_check(state: &FaasHandlerState) -> Result<HealthCheckResponse> {
    let healthy = state.persistence.health_check_db().await.unwrap_or(false);

    Ok(HealthCheckResponse {
        healthy,
        version: state.version.clone(),
        uptime_ms: state.uptime_ms(),
    })
}

// ============================================================================
// Caller identity
// ============================================================================

/// Resolve the caller from an API key.
pub async fn authenticate(state: &FaasHandlerState, api_key: Option<&str>) -> Result<UserRecord> {
    let api_key = api_key.filter(|k| !k.is_empty()).ok_or(Error::Unauthorized)?;
    state
        .persistence
        .get_user_by_api_key(api_key)
        .await?
        .ok_or(Error::Unauthorized)
}

async fn owned_function(
    state: &FaasHandlerState,
    caller: &UserRecord,
    function_id: &str,
) -> Result<FunctionRecord> {
    let function = state.orchestrator.get(function_id).await?;
    if function.owner_id != caller.user_id {
        return Err(Error::NotFound("Function not found".to_string()));
    }
    Ok(function)
}

// ============================================================================
// Functions
// ============================================================================

/// Request to create a function.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateFunctionRequest {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub filename: Option<String>,
}

/// Count of removed records.
#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: u64,
}

pub async fn handle_create_function(
    state: &FaasHandlerState,
    caller: &UserRecord,
    request: CreateFunctionRequest,
) -> Result<FunctionRecord> {
    state
        .orchestrator
        .deploy(
            &caller.user_id,
            &request.name,
            &request.code,
            request.filename.as_deref(),
        )
        .await
}

pub async fn handle_list_functions(
    state: &FaasHandlerState,
    caller: &UserRecord,
) -> Result<Vec<FunctionRecord>> {
    state.orchestrator.list(&caller.user_id).await
}

pub async fn handle_get_function(
    state: &FaasHandlerState,
    caller: &UserRecord,
    function_id: &str,
) -> Result<FunctionWithCode> {
    owned_function(state, caller, function_id).await?;
    state.orchestrator.get_with_code(function_id).await
}

pub async fn handle_update_function(
    state: &FaasHandlerState,
    caller: &UserRecord,
    function_id: &str,
    patch: FunctionUpdate,
) -> Result<FunctionRecord> {
    owned_function(state, caller, function_id).await?;
    state.orchestrator.update(function_id, patch).await
}

pub async fn handle_redeploy_function(
    state: &FaasHandlerState,
    caller: &UserRecord,
    function_id: &str,
) -> Result<FunctionRecord> {
    owned_function(state, caller, function_id).await?;
    state.orchestrator.redeploy(function_id).await
}

pub async fn handle_delete_function(
    state: &FaasHandlerState,
    caller: &UserRecord,
    function_id: &str,
) -> Result<()> {
    owned_function(state, caller, function_id).await?;
    state.orchestrator.delete(function_id).await
}

// ============================================================================
// Logs
// ============================================================================

pub async fn handle_list_logs(
    state: &FaasHandlerState,
    caller: &UserRecord,
    function_id: &str,
) -> Result<Vec<LogRecord>> {
    owned_function(state, caller, function_id).await?;
    Ok(state.persistence.list_logs(function_id).await?)
}

pub async fn handle_get_log(
    state: &FaasHandlerState,
    caller: &UserRecord,
    function_id: &str,
    log_id: &str,
) -> Result<LogRecord> {
    owned_function(state, caller, function_id).await?;
    state
        .persistence
        .get_log(function_id, log_id)
        .await?
        .ok_or_else(|| Error::NotFound("Log not found".to_string()))
}

pub async fn handle_delete_log(
    state: &FaasHandlerState,
    caller: &UserRecord,
    function_id: &str,
    log_id: &str,
) -> Result<()> {
    owned_function(state, caller, function_id).await?;
    if state.persistence.delete_log(function_id, log_id).await? {
        Ok(())
    } else {
        Err(Error::NotFound("Log not found".to_string()))
    }
}

pub async fn handle_clear_logs(
    state: &FaasHandlerState,
    caller: &UserRecord,
    function_id: &str,
) -> Result<DeletedResponse> {
    owned_function(state, caller, function_id).await?;
    let deleted = state
        .persistence
        .delete_logs_for_function(function_id)
        .await?;
    tracing::info!(function_id = %function_id, deleted, "Logs cleared");
    Ok(DeletedResponse { deleted })
}

// ============================================================================
// Usage
// ============================================================================

pub async fn handle_list_usage(
    state: &FaasHandlerState,
    caller: &UserRecord,
    function_id: &str,
) -> Result<Vec<UsageRecord>> {
    owned_function(state, caller, function_id).await?;
    Ok(state
        .persistence
        .list_usage(function_id, &caller.user_id)
        .await?)
}

pub async fn handle_get_usage(
    state: &FaasHandlerState,
    caller: &UserRecord,
    function_id: &str,
    usage_id: &str,
) -> Result<UsageRecord> {
    owned_function(state, caller, function_id).await?;
    state
        .persistence
        .get_usage(function_id, &caller.user_id, usage_id)
        .await?
        .ok_or_else(|| Error::NotFound("Usage record not found".to_string()))
}

pub async fn handle_delete_usage(
    state: &FaasHandlerState,
    caller: &UserRecord,
    function_id: &str,
    usage_id: &str,
) -> Result<()> {
    owned_function(state, caller, function_id).await?;
    if state
        .persistence
        .delete_usage(function_id, &caller.user_id, usage_id)
        .await?
    {
        Ok(())
    } else {
        Err(Error::NotFound("Usage record not found".to_string()))
    }
}

pub async fn handle_clear_usage(
    state: &FaasHandlerState,
    caller: &UserRecord,
    function_id: &str,
) -> Result<DeletedResponse> {
    owned_function(state, caller, function_id).await?;
    let deleted = state
        .persistence
        .delete_usage_for_function(function_id, Some(&caller.user_id))
        .await?;
    tracing::info!(function_id = %function_id, deleted, "Usage cleared");
    Ok(DeletedResponse { deleted })
}

/// Newest usage across all of the caller's functions.
pub async fn handle_recent_usage(
    state: &FaasHandlerState,
    caller: &UserRecord,
) -> Result<Vec<UsageActivity>> {
    Ok(state
        .persistence
        .list_recent_usage(&caller.user_id, RECENT_USAGE_LIMIT)
        .await?)
}

// ============================================================================
// Invocation
// ============================================================================

pub async fn handle_invoke(
    state: &FaasHandlerState,
    user_name: &str,
    function_name: &str,
    api_key: Option<&str>,
    context: InvocationContext,
) -> GatewayResponse {
    state
        .gateway
        .invoke(user_name, function_name, api_key, context)
        .await
}
