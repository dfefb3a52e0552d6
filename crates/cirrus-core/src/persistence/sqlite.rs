// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{CoreError, is_unique_violation};
use crate::models::{
    FunctionRecord, FunctionSettings, FunctionStats, FunctionStatus, InvocationSample, LogRecord,
    PublishedBundle, UsageActivity, UsageRecord, UserRecord, UserUsage,
};

use super::Persistence;

/// Embedded SQLite migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const FUNCTION_COLUMNS: &str = r#"
    function_id, owner_id, name, status, deploy_error, deployed_at,
    source_path, bundle_path, source_hash, bundle_hash, dependency_hash,
    endpoint, version, deploy_seq, is_active,
    stats_executed, stats_errors, stats_avg_latency_ms, stats_avg_memory_mb, stats_last_executed,
    created_at, updated_at
"#;

const LOG_COLUMNS: &str = r#"
    log_id, function_id, invocation_id, lines, status, start_time, end_time,
    duration_ms, memory_used_mb, error, created_at
"#;

const USAGE_COLUMNS: &str = r#"
    usage_id, function_id, user_id, invocation_id, duration_ms, memory_used_mb,
    status, error, recorded_at
"#;

const USER_COLUMNS: &str = r#"
    user_id, user_name, api_key, usage_executed, usage_last_executed, created_at, updated_at
"#;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// Migrations are not run; see [`SqlitePersistence::migrate`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite URL (e.g. `sqlite:.data/cirrus.db?mode=rwc`) and run migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        // Every connection to `:memory:` opens a separate database.
        let options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect(url).await?;

        let persistence = Self { pool };
        persistence.migrate().await?;
        Ok(persistence)
    }

    /// Private in-memory database, migrated.
    pub async fn in_memory() -> Result<Self, CoreError> {
        Self::connect("sqlite::memory:").await
    }

    /// Create and initialize a SQLite database at a file path.
    ///
    /// Parent directories and the database file are created when missing.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<(), CoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn owner_of(&self, function_id: &str) -> Result<String, CoreError> {
        let owner: Option<String> =
            sqlx::query_scalar("SELECT owner_id FROM functions WHERE function_id = ?")
                .bind(function_id)
                .fetch_optional(&self.pool)
                .await?;

        owner.ok_or_else(|| CoreError::FunctionNotFound {
            function_id: function_id.to_string(),
        })
    }

    /// Interpret a conditional write: no matching row means either the
    /// function is gone or the condition no longer holds.
    async fn applied(&self, function_id: &str, rows_affected: u64) -> Result<bool, CoreError> {
        if rows_affected > 0 {
            return Ok(true);
        }
        self.owner_of(function_id).await?;
        Ok(false)
    }
}

fn not_found(function_id: &str) -> CoreError {
    CoreError::FunctionNotFound {
        function_id: function_id.to_string(),
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_user(&self, user: &UserRecord) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (user_id, user_name, api_key, usage_executed, usage_last_executed,
                               created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.user_id)
        .bind(user.user_name.to_lowercase())
        .bind(&user.api_key)
        .bind(user.usage.executed)
        .bind(user.usage.last_executed)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(CoreError::UserAlreadyExists(user.user_name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, CoreError> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?"))
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Into::into))
    }

    async fn get_user_by_name(&self, user_name: &str) -> Result<Option<UserRecord>, CoreError> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE user_name = ?"
        ))
        .bind(user_name.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn get_user_by_api_key(&self, api_key: &str) -> Result<Option<UserRecord>, CoreError> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE api_key = ?"))
                .bind(api_key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Into::into))
    }

    async fn record_user_invocation(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET usage_executed = usage_executed + 1, usage_last_executed = ?
            WHERE user_id = ?
            "#,
        )
        .bind(at)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    async fn insert_function(&self, function: &FunctionRecord) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO functions (
                function_id, owner_id, name, status, deploy_error, deployed_at,
                source_path, bundle_path, source_hash, bundle_hash, dependency_hash,
                endpoint, version, deploy_seq, is_active, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&function.function_id)
        .bind(&function.owner_id)
        .bind(&function.name)
        .bind(function.status.to_string())
        .bind(&function.deploy_error)
        .bind(function.deployed_at)
        .bind(&function.source_path)
        .bind(&function.bundle_path)
        .bind(&function.source_hash)
        .bind(&function.bundle_hash)
        .bind(&function.dependency_hash)
        .bind(&function.endpoint)
        .bind(function.version)
        .bind(function.deploy_seq)
        .bind(function.is_active)
        .bind(function.created_at)
        .bind(function.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                tracing::debug!(
                    function_id = %function.function_id,
                    owner_id = %function.owner_id,
                    name = %function.name,
                    "Inserted function"
                );
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(CoreError::FunctionAlreadyExists {
                owner_id: function.owner_id.clone(),
                name: function.name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_function(&self, function_id: &str) -> Result<Option<FunctionRecord>, CoreError> {
        let row: Option<FunctionRow> = sqlx::query_as(&format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions WHERE function_id = ?"
        ))
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn get_function_by_name(
        &self,
        owner_id: &str,
        name: &str,
    ) -> Result<Option<FunctionRecord>, CoreError> {
        let row: Option<FunctionRow> = sqlx::query_as(&format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions WHERE owner_id = ? AND name = ?"
        ))
        .bind(owner_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list_functions(&self, owner_id: &str) -> Result<Vec<FunctionRecord>, CoreError> {
        let rows: Vec<FunctionRow> = sqlx::query_as(&format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions WHERE owner_id = ? \
             ORDER BY created_at DESC, rowid DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn begin_deployment(&self, function_id: &str) -> Result<i64, CoreError> {
        let seq: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE functions
            SET deploy_seq = deploy_seq + 1, status = 'pending', deploy_error = NULL,
                updated_at = ?
            WHERE function_id = ?
            RETURNING deploy_seq
            "#,
        )
        .bind(Utc::now())
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await?;

        let seq = seq.ok_or_else(|| not_found(function_id))?;
        tracing::debug!(function_id = %function_id, deploy_seq = seq, "Started deployment");
        Ok(seq)
    }

    async fn update_function_status(
        &self,
        function_id: &str,
        deploy_seq: i64,
        status: FunctionStatus,
        deploy_error: Option<&str>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET status = ?, deploy_error = ?, updated_at = ?
            WHERE function_id = ? AND deploy_seq = ?
            "#,
        )
        .bind(status.to_string())
        .bind(deploy_error)
        .bind(Utc::now())
        .bind(function_id)
        .bind(deploy_seq)
        .execute(&self.pool)
        .await?;

        self.applied(function_id, result.rows_affected()).await
    }

    async fn update_source(
        &self,
        function_id: &str,
        deploy_seq: i64,
        source_path: &str,
        source_hash: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET source_path = ?, source_hash = ?, updated_at = ?
            WHERE function_id = ? AND deploy_seq = ?
            "#,
        )
        .bind(source_path)
        .bind(source_hash)
        .bind(Utc::now())
        .bind(function_id)
        .bind(deploy_seq)
        .execute(&self.pool)
        .await?;

        self.applied(function_id, result.rows_affected()).await
    }

    async fn publish_bundle(
        &self,
        function_id: &str,
        bundle: &PublishedBundle,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET status = 'active', deploy_error = NULL, deployed_at = ?,
                version = version + CASE
                    WHEN bundle_hash IS NOT NULL AND bundle_hash <> ? THEN 1
                    ELSE 0
                END,
                bundle_path = ?, bundle_hash = ?, dependency_hash = ?, updated_at = ?
            WHERE function_id = ? AND deploy_seq = ?
            "#,
        )
        .bind(bundle.deployed_at)
        .bind(&bundle.bundle_hash)
        .bind(&bundle.bundle_path)
        .bind(&bundle.bundle_hash)
        .bind(&bundle.dependency_hash)
        .bind(Utc::now())
        .bind(function_id)
        .bind(bundle.deploy_seq)
        .execute(&self.pool)
        .await?;

        self.applied(function_id, result.rows_affected()).await
    }

    async fn repair_bundle(
        &self,
        function_id: &str,
        expected_hash: &str,
        bundle_hash: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET bundle_hash = ?, version = version + 1, updated_at = ?
            WHERE function_id = ? AND bundle_hash = ? AND status = 'active'
            "#,
        )
        .bind(bundle_hash)
        .bind(Utc::now())
        .bind(function_id)
        .bind(expected_hash)
        .execute(&self.pool)
        .await?;

        self.applied(function_id, result.rows_affected()).await
    }

    async fn update_function_settings(
        &self,
        function_id: &str,
        settings: &FunctionSettings,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET name = COALESCE(?, name),
                endpoint = COALESCE(?, endpoint),
                is_active = COALESCE(?, is_active),
                updated_at = ?
            WHERE function_id = ?
            "#,
        )
        .bind(settings.name.as_deref())
        .bind(settings.endpoint.as_deref())
        .bind(settings.is_active)
        .bind(Utc::now())
        .bind(function_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 0 => Err(not_found(function_id)),
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CoreError::FunctionAlreadyExists {
                owner_id: self.owner_of(function_id).await?,
                name: settings.name.clone().unwrap_or_default(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_invocation_stats(
        &self,
        function_id: &str,
        sample: &InvocationSample,
    ) -> Result<(), CoreError> {
        // All right-hand sides read the pre-update row.
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET stats_avg_latency_ms =
                    (stats_avg_latency_ms * stats_executed + ?) / (stats_executed + 1),
                stats_avg_memory_mb =
                    (stats_avg_memory_mb * stats_executed + ?) / (stats_executed + 1),
                stats_executed = stats_executed + 1,
                stats_errors = stats_errors + ?,
                stats_last_executed = ?
            WHERE function_id = ?
            "#,
        )
        .bind(sample.duration_ms as f64)
        .bind(sample.memory_used_mb as f64)
        .bind(if sample.is_error { 1_i64 } else { 0_i64 })
        .bind(sample.at)
        .bind(function_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(function_id));
        }
        Ok(())
    }

    async fn delete_function(&self, function_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM functions WHERE function_id = ?")
            .bind(function_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_dependency_hashes(&self) -> Result<Vec<String>, CoreError> {
        let hashes: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT dependency_hash FROM functions WHERE dependency_hash IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(hashes)
    }

    async fn insert_log(&self, log: &LogRecord) -> Result<(), CoreError> {
        let lines = serde_json::to_string(&log.lines)?;

        sqlx::query(
            r#"
            INSERT INTO invocation_logs (
                log_id, function_id, invocation_id, lines, status, start_time, end_time,
                duration_ms, memory_used_mb, error, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.log_id)
        .bind(&log.function_id)
        .bind(&log.invocation_id)
        .bind(lines)
        .bind(log.status.to_string())
        .bind(log.start_time)
        .bind(log.end_time)
        .bind(log.duration_ms)
        .bind(log.memory_used_mb)
        .bind(&log.error)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_logs(&self, function_id: &str) -> Result<Vec<LogRecord>, CoreError> {
        let rows: Vec<LogRow> = sqlx::query_as(&format!(
            "SELECT {LOG_COLUMNS} FROM invocation_logs WHERE function_id = ? \
             ORDER BY created_at DESC, rowid DESC"
        ))
        .bind(function_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_log(
        &self,
        function_id: &str,
        log_id: &str,
    ) -> Result<Option<LogRecord>, CoreError> {
        let row: Option<LogRow> = sqlx::query_as(&format!(
            "SELECT {LOG_COLUMNS} FROM invocation_logs WHERE function_id = ? AND log_id = ?"
        ))
        .bind(function_id)
        .bind(log_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn delete_log(&self, function_id: &str, log_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM invocation_logs WHERE function_id = ? AND log_id = ?")
            .bind(function_id)
            .bind(log_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_logs_for_function(&self, function_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM invocation_logs WHERE function_id = ?")
            .bind(function_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn insert_usage(&self, usage: &UsageRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO usage_records (
                usage_id, function_id, user_id, invocation_id, duration_ms, memory_used_mb,
                status, error, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&usage.usage_id)
        .bind(&usage.function_id)
        .bind(&usage.user_id)
        .bind(&usage.invocation_id)
        .bind(usage.duration_ms)
        .bind(usage.memory_used_mb)
        .bind(usage.status.to_string())
        .bind(&usage.error)
        .bind(usage.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_usage(
        &self,
        function_id: &str,
        user_id: &str,
    ) -> Result<Vec<UsageRecord>, CoreError> {
        let rows: Vec<UsageRow> = sqlx::query_as(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records WHERE function_id = ? AND user_id = ? \
             ORDER BY recorded_at DESC, rowid DESC"
        ))
        .bind(function_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_recent_usage(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<UsageActivity>, CoreError> {
        let rows: Vec<UsageActivityRow> = sqlx::query_as(
            r#"
            SELECT u.usage_id, u.function_id, u.user_id, u.invocation_id, u.duration_ms,
                   u.memory_used_mb, u.status, u.error, u.recorded_at,
                   f.name AS function_name
            FROM usage_records u
            LEFT JOIN functions f ON f.function_id = u.function_id
            WHERE u.user_id = ?
            ORDER BY u.recorded_at DESC, u.rowid DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_usage(
        &self,
        function_id: &str,
        user_id: &str,
        usage_id: &str,
    ) -> Result<Option<UsageRecord>, CoreError> {
        let row: Option<UsageRow> = sqlx::query_as(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records \
             WHERE function_id = ? AND user_id = ? AND usage_id = ?"
        ))
        .bind(function_id)
        .bind(user_id)
        .bind(usage_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn delete_usage(
        &self,
        function_id: &str,
        user_id: &str,
        usage_id: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "DELETE FROM usage_records WHERE function_id = ? AND user_id = ? AND usage_id = ?",
        )
        .bind(function_id)
        .bind(user_id)
        .bind(usage_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_usage_for_function(
        &self,
        function_id: &str,
        user_id: Option<&str>,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "DELETE FROM usage_records WHERE function_id = ? AND (? IS NULL OR user_id = ?)",
        )
        .bind(function_id)
        .bind(user_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}

/// Internal row type for function queries
#[derive(sqlx::FromRow)]
struct FunctionRow {
    function_id: String,
    owner_id: String,
    name: String,
    status: String,
    deploy_error: Option<String>,
    deployed_at: Option<DateTime<Utc>>,
    source_path: String,
    bundle_path: String,
    source_hash: String,
    bundle_hash: Option<String>,
    dependency_hash: Option<String>,
    endpoint: String,
    version: i64,
    deploy_seq: i64,
    is_active: bool,
    stats_executed: i64,
    stats_errors: i64,
    stats_avg_latency_ms: f64,
    stats_avg_memory_mb: f64,
    stats_last_executed: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<FunctionRow> for FunctionRecord {
    fn from(row: FunctionRow) -> Self {
        FunctionRecord {
            function_id: row.function_id,
            owner_id: row.owner_id,
            name: row.name,
            status: row.status.parse().unwrap_or_default(),
            deploy_error: row.deploy_error,
            deployed_at: row.deployed_at,
            source_path: row.source_path,
            bundle_path: row.bundle_path,
            source_hash: row.source_hash,
            bundle_hash: row.bundle_hash,
            dependency_hash: row.dependency_hash,
            endpoint: row.endpoint,
            version: row.version,
            deploy_seq: row.deploy_seq,
            is_active: row.is_active,
            stats: FunctionStats {
                executed: row.stats_executed,
                errors: row.stats_errors,
                avg_latency: row.stats_avg_latency_ms,
                avg_memory: row.stats_avg_memory_mb,
                last_executed: row.stats_last_executed,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    log_id: String,
    function_id: String,
    invocation_id: String,
    lines: String,
    status: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    duration_ms: i64,
    memory_used_mb: i64,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<LogRow> for LogRecord {
    fn from(row: LogRow) -> Self {
        LogRecord {
            log_id: row.log_id,
            function_id: row.function_id,
            invocation_id: row.invocation_id,
            lines: serde_json::from_str(&row.lines).unwrap_or_default(),
            status: row.status.parse().unwrap_or_default(),
            start_time: row.start_time,
            end_time: row.end_time,
            duration_ms: row.duration_ms,
            memory_used_mb: row.memory_used_mb,
            error: row.error,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UsageRow {
    usage_id: String,
    function_id: String,
    user_id: String,
    invocation_id: String,
    duration_ms: i64,
    memory_used_mb: i64,
    status: String,
    error: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl From<UsageRow> for UsageRecord {
    fn from(row: UsageRow) -> Self {
        UsageRecord {
            usage_id: row.usage_id,
            function_id: row.function_id,
            user_id: row.user_id,
            invocation_id: row.invocation_id,
            duration_ms: row.duration_ms,
            memory_used_mb: row.memory_used_mb,
            status: row.status.parse().unwrap_or_default(),
            error: row.error,
            recorded_at: row.recorded_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UsageActivityRow {
    #[sqlx(flatten)]
    usage: UsageRow,
    function_name: Option<String>,
}

impl From<UsageActivityRow> for UsageActivity {
    fn from(row: UsageActivityRow) -> Self {
        UsageActivity {
            usage: row.usage.into(),
            function_name: row.function_name,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    user_id: String,
    user_name: String,
    api_key: String,
    usage_executed: i64,
    usage_last_executed: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for UserRecord {
    fn from(row: UserRow) -> Self {
        UserRecord {
            user_id: row.user_id,
            user_name: row.user_name,
            api_key: row.api_key,
            usage: UserUsage {
                executed: row.usage_executed,
                last_executed: row.usage_last_executed,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
