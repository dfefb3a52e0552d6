// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cirrus-core.

use thiserror::Error;

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the document store and the artifact store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Function was not found.
    #[error("Function '{function_id}' not found")]
    FunctionNotFound {
        /// The function ID that was not found.
        function_id: String,
    },

    /// A function with the same name (or endpoint) already exists for the owner.
    #[error("Function '{name}' already exists for owner '{owner_id}'")]
    FunctionAlreadyExists {
        /// Owner of the conflicting function.
        owner_id: String,
        /// Conflicting function name.
        name: String,
    },

    /// User was not found.
    #[error("User '{0}' not found")]
    UserNotFound(String),

    /// User name or API key is already taken.
    #[error("User '{0}' already exists")]
    UserAlreadyExists(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Artifact store operation failed.
    #[error("Artifact store error: {0}")]
    Storage(#[from] object_store::Error),

    /// Artifact store URL could not be understood.
    #[error("Invalid artifact store URL: {0}")]
    InvalidStoreUrl(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::FunctionNotFound { .. } => "FUNCTION_NOT_FOUND",
            Self::FunctionAlreadyExists { .. } => "FUNCTION_ALREADY_EXISTS",
            Self::UserNotFound(_) => "USER_NOT_FOUND",
            Self::UserAlreadyExists(_) => "USER_ALREADY_EXISTS",
            Self::Database(_) | Self::Migration(_) => "DATABASE_ERROR",
            Self::Storage(_) | Self::InvalidStoreUrl(_) => "STORAGE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Whether this error means the requested record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::FunctionNotFound { .. } | Self::UserNotFound(_))
    }
}

/// Returns true when a sqlx error is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}
