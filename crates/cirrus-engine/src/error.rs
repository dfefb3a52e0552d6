// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cirrus-engine.

use axum::http::StatusCode;
use cirrus_core::CoreError;
use thiserror::Error;

use crate::bundler::BuildError;
use crate::dependencies::DependencyError;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Request rejected before any work started.
    #[error("{0}")]
    Validation(String),

    /// The owner already has a function with this name.
    #[error("Function name already exists: {0}")]
    FunctionAlreadyExists(String),

    /// Bundling failed.
    #[error("Build failed: {0}")]
    Build(#[from] BuildError),

    /// Installing or packaging dependencies failed.
    #[error("Dependency installation failed: {0}")]
    DependencyInstall(#[from] DependencyError),

    /// Stored bundle did not match its hash and could not be rebuilt.
    #[error("Integrity check failed and re-bundling failed: {0}")]
    Integrity(String),

    /// Invocation failed.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Owner, function, log or usage record does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Missing or mismatched API key.
    #[error("Unauthorized")]
    Unauthorized,

    /// Function is switched off.
    #[error("Function is currently inactive")]
    FunctionInactive,

    /// Function has no published bundle yet.
    #[error("Function has not been deployed yet")]
    FunctionNotDeployed,

    /// Bundle cannot be verified while a deployment is in flight.
    #[error("Function is being deployed, try again shortly")]
    FunctionDeploying,

    /// Store operation failed.
    #[error("Core error: {0}")]
    Core(CoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CoreError> for Error {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::FunctionAlreadyExists { name, .. } => Error::FunctionAlreadyExists(name),
            CoreError::FunctionNotFound { .. } => Error::NotFound("Function not found".to_string()),
            CoreError::UserNotFound(_) => Error::NotFound("User not found".to_string()),
            other => Error::Core(other),
        }
    }
}

impl Error {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::FunctionAlreadyExists(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::FunctionInactive | Error::FunctionNotDeployed | Error::FunctionDeploying => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::FunctionAlreadyExists(_) => "FUNCTION_ALREADY_EXISTS",
            Error::Build(_) => "BUILD_ERROR",
            Error::DependencyInstall(_) => "DEPENDENCY_INSTALL_ERROR",
            Error::Integrity(_) => "INTEGRITY_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Unauthorized => "UNAUTHORIZED",
            Error::FunctionInactive => "FUNCTION_INACTIVE",
            Error::FunctionNotDeployed => "FUNCTION_NOT_DEPLOYED",
            Error::FunctionDeploying => "FUNCTION_DEPLOYING",
            Error::Core(e) => e.error_code(),
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
        }
    }
}

/// Result type using engine Error.
pub type Result<T> = std::result::Result<T, Error>;
