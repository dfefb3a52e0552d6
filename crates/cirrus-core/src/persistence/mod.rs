// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document store interface and backends.
//!
//! The [`Persistence`] trait covers users, functions, invocation logs and usage
//! records. Statistics updates are single atomic statements so concurrent
//! invocations of one function never lose an increment.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::models::{
    FunctionRecord, FunctionSettings, FunctionStatus, InvocationSample, LogRecord,
    PublishedBundle, UsageActivity, UsageRecord, UserRecord,
};

/// Persistence backend for the document store.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    // ---- users ----

    /// Insert a user. Fails with `UserAlreadyExists` on name or key collision.
    async fn create_user(&self, user: &UserRecord) -> Result<(), CoreError>;

    /// Fetch a user by ID.
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, CoreError>;

    /// Fetch a user by (case-insensitive) name.
    async fn get_user_by_name(&self, user_name: &str) -> Result<Option<UserRecord>, CoreError>;

    /// Fetch the user owning an API key.
    async fn get_user_by_api_key(&self, api_key: &str) -> Result<Option<UserRecord>, CoreError>;

    /// Increment the user's executed counter and set the last execution time.
    async fn record_user_invocation(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    // ---- functions ----

    /// Insert a new function. Fails with `FunctionAlreadyExists` when the
    /// owner already has a function with that name.
    async fn insert_function(&self, function: &FunctionRecord) -> Result<(), CoreError>;

    /// Fetch a function by ID.
    async fn get_function(&self, function_id: &str) -> Result<Option<FunctionRecord>, CoreError>;

    /// Fetch a function by owner and name.
    async fn get_function_by_name(
        &self,
        owner_id: &str,
        name: &str,
    ) -> Result<Option<FunctionRecord>, CoreError>;

    /// List all functions of an owner, newest first.
    async fn list_functions(&self, owner_id: &str) -> Result<Vec<FunctionRecord>, CoreError>;

    /// Start a new deployment generation: bump `deploy_seq`, set `pending`
    /// and clear the error. Returns the new generation.
    async fn begin_deployment(&self, function_id: &str) -> Result<i64, CoreError>;

    /// Set the deployment status if `deploy_seq` is still current.
    /// `deploy_error` replaces the stored error.
    ///
    /// Returns false when a newer deployment superseded this one.
    async fn update_function_status(
        &self,
        function_id: &str,
        deploy_seq: i64,
        status: FunctionStatus,
        deploy_error: Option<&str>,
    ) -> Result<bool, CoreError>;

    /// Record where the current source lives and its hash, if `deploy_seq`
    /// is still current.
    async fn update_source(
        &self,
        function_id: &str,
        deploy_seq: i64,
        source_path: &str,
        source_hash: &str,
    ) -> Result<bool, CoreError>;

    /// Mark the function active with a freshly published bundle, if the
    /// bundle's generation is still current. `version` goes up by one when a
    /// previously published bundle hash is replaced by a different one.
    async fn publish_bundle(
        &self,
        function_id: &str,
        bundle: &PublishedBundle,
    ) -> Result<bool, CoreError>;

    /// Replace the bundle hash after a self-heal rebuild and bump the version.
    ///
    /// Applies only while the function is `active` and still records
    /// `expected_hash`.
    async fn repair_bundle(
        &self,
        function_id: &str,
        expected_hash: &str,
        bundle_hash: &str,
    ) -> Result<bool, CoreError>;

    /// Apply a settings patch. A name collision fails with `FunctionAlreadyExists`.
    async fn update_function_settings(
        &self,
        function_id: &str,
        settings: &FunctionSettings,
    ) -> Result<(), CoreError>;

    /// Fold one invocation into the function's statistics atomically.
    async fn record_invocation_stats(
        &self,
        function_id: &str,
        sample: &InvocationSample,
    ) -> Result<(), CoreError>;

    /// Delete a function record. Returns false if it did not exist.
    async fn delete_function(&self, function_id: &str) -> Result<bool, CoreError>;

    /// Distinct dependency hashes referenced by any function.
    async fn list_dependency_hashes(&self) -> Result<Vec<String>, CoreError>;

    // ---- invocation logs ----

    /// Insert a log record.
    async fn insert_log(&self, log: &LogRecord) -> Result<(), CoreError>;

    /// List logs of a function, newest first.
    async fn list_logs(&self, function_id: &str) -> Result<Vec<LogRecord>, CoreError>;

    /// Fetch one log of a function.
    async fn get_log(&self, function_id: &str, log_id: &str)
    -> Result<Option<LogRecord>, CoreError>;

    /// Delete one log of a function.
    async fn delete_log(&self, function_id: &str, log_id: &str) -> Result<bool, CoreError>;

    /// Delete all logs of a function, returning how many were removed.
    async fn delete_logs_for_function(&self, function_id: &str) -> Result<u64, CoreError>;

    // ---- usage records ----

    /// Insert a usage record.
    async fn insert_usage(&self, usage: &UsageRecord) -> Result<(), CoreError>;

    /// List usage of a function for a user, newest first.
    async fn list_usage(
        &self,
        function_id: &str,
        user_id: &str,
    ) -> Result<Vec<UsageRecord>, CoreError>;

    /// Most recent usage across all of a user's functions.
    async fn list_recent_usage(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<UsageActivity>, CoreError>;

    /// Fetch one usage record.
    async fn get_usage(
        &self,
        function_id: &str,
        user_id: &str,
        usage_id: &str,
    ) -> Result<Option<UsageRecord>, CoreError>;

    /// Delete one usage record.
    async fn delete_usage(
        &self,
        function_id: &str,
        user_id: &str,
        usage_id: &str,
    ) -> Result<bool, CoreError>;

    /// Delete usage of a function, optionally only one user's rows.
    async fn delete_usage_for_function(
        &self,
        function_id: &str,
        user_id: Option<&str>,
    ) -> Result<u64, CoreError>;

    /// Check that the database answers.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
