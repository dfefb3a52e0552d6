// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for cirrus-engine.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::dependencies::RuntimeTarget;
use crate::dependency_cleanup_worker::DependencyCleanupWorkerConfig;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Document store URL
    pub database_url: String,
    /// Artifact store URL (`file://`, `memory://` or `s3://`)
    pub artifact_store_url: String,
    /// Local data directory
    pub data_dir: PathBuf,
    /// HTTP listen address for the gateway and management API
    pub http_addr: SocketAddr,
    /// Base URL used to build function endpoints
    pub public_url: String,
    /// esbuild executable
    pub esbuild_bin: PathBuf,
    /// node executable
    pub node_bin: PathBuf,
    /// npm executable
    pub npm_bin: PathBuf,
    /// Runtime identifiers folded into dependency hashes
    pub runtime_target: RuntimeTarget,
    /// Version constraint written for every discovered package
    pub dependency_version_policy: String,
    /// Package installation timeout
    pub dependency_install_timeout: Duration,
    /// Hard wall-clock budget of a sandbox worker, measured from spawn
    pub sandbox_timeout: Duration,
    /// Soft timeout enforced inside the worker
    pub worker_timeout: Duration,
    /// Worker heap limit in MB
    pub sandbox_memory_mb: u32,
    /// Run workers under the Node permission model
    pub sandbox_permissions: bool,
    /// Dependency cache eviction settings
    pub dependency_cleanup: DependencyCleanupWorkerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir =
            PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let database_url = std::env::var("CIRRUS_DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite:{}?mode=rwc", data_dir.join("cirrus.db").display())
        });

        let artifact_store_url = match std::env::var("CIRRUS_ARTIFACT_STORE_URL") {
            Ok(url) => url,
            Err(_) => {
                let root = std::path::absolute(data_dir.join("artifacts"))
                    .map_err(|_| ConfigError::InvalidValue("DATA_DIR", data_dir.display().to_string()))?;
                format!("file://{}", root.display())
            }
        };

        let port: u16 = std::env::var("CIRRUS_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let public_url = std::env::var("CIRRUS_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", port))
            .trim_end_matches('/')
            .to_string();

        let host = RuntimeTarget::host();
        let runtime_target = RuntimeTarget {
            node_major: parse_env("NODE_MAJOR", host.node_major)?,
            arch: std::env::var("ARCH").unwrap_or(host.arch),
            installer: std::env::var("INSTALLER_IDENT").unwrap_or(host.installer),
        };

        let sandbox_timeout = Duration::from_millis(parse_env("CIRRUS_SANDBOX_TIMEOUT_MS", 6000)?);
        let worker_timeout = Duration::from_millis(parse_env("CIRRUS_WORKER_TIMEOUT_MS", 5000)?);
        if worker_timeout >= sandbox_timeout {
            return Err(ConfigError::WorkerTimeoutTooLong {
                worker_ms: worker_timeout.as_millis() as u64,
                sandbox_ms: sandbox_timeout.as_millis() as u64,
            });
        }

        Ok(Self {
            database_url,
            artifact_store_url,
            data_dir,
            http_addr,
            public_url,
            esbuild_bin: PathBuf::from(
                std::env::var("ESBUILD_BIN").unwrap_or_else(|_| "esbuild".to_string()),
            ),
            node_bin: PathBuf::from(std::env::var("NODE_BIN").unwrap_or_else(|_| "node".to_string())),
            npm_bin: PathBuf::from(std::env::var("NPM_BIN").unwrap_or_else(|_| "npm".to_string())),
            runtime_target,
            dependency_version_policy: std::env::var("CIRRUS_DEP_VERSION_POLICY")
                .unwrap_or_else(|_| "latest".to_string()),
            dependency_install_timeout: Duration::from_secs(parse_env(
                "CIRRUS_DEP_INSTALL_TIMEOUT_SECS",
                300,
            )?),
            sandbox_timeout,
            worker_timeout,
            sandbox_memory_mb: parse_env("CIRRUS_SANDBOX_MEMORY_MB", 128)?,
            sandbox_permissions: std::env::var("CIRRUS_SANDBOX_PERMISSIONS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            dependency_cleanup: DependencyCleanupWorkerConfig::from_env(),
        })
    }
}

fn parse_env<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name, value)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// A variable could not be parsed.
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
    /// The soft worker timeout must leave room under the hard budget.
    #[error("CIRRUS_WORKER_TIMEOUT_MS ({worker_ms}) must be lower than CIRRUS_SANDBOX_TIMEOUT_MS ({sandbox_ms})")]
    WorkerTimeoutTooLong {
        /// Configured soft timeout.
        worker_ms: u64,
        /// Configured hard budget.
        sandbox_ms: u64,
    },
}
