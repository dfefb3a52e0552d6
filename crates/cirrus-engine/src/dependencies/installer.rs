// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Package installers.
//!
//! An installer takes a [`DependencyManifest`] and produces `node_modules/`
//! inside a scratch directory owned by the caller.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use super::{DependencyError, DependencyManifest};

/// Longest installer stderr excerpt kept in error messages.
const MAX_ERROR_OUTPUT: usize = 2000;

/// Trait for package installers.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Installer type identifier (e.g., "npm", "mock")
    fn installer_type(&self) -> &'static str;

    /// Install the manifest's dependencies into `{dir}/node_modules`.
    async fn install(
        &self,
        manifest: &DependencyManifest,
        dir: &Path,
    ) -> Result<(), DependencyError>;
}

/// Configuration for [`NpmInstaller`].
#[derive(Debug, Clone)]
pub struct NpmInstallerConfig {
    /// Path to the npm executable.
    pub binary: PathBuf,
    /// Upper bound for one installation.
    pub timeout: Duration,
}

impl Default for NpmInstallerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("npm"),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Installs production dependencies with npm, lifecycle scripts disabled.
pub struct NpmInstaller {
    config: NpmInstallerConfig,
}

impl NpmInstaller {
    pub fn new(config: NpmInstallerConfig) -> Self {
        Self { config }
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[async_trait]
impl PackageInstaller for NpmInstaller {
    fn installer_type(&self) -> &'static str {
        "npm"
    }

    async fn install(
        &self,
        manifest: &DependencyManifest,
        dir: &Path,
    ) -> Result<(), DependencyError> {
        tokio::fs::write(dir.join("package.json"), manifest.to_json()?).await?;

        let start = Instant::now();
        let mut cmd = Command::new(&self.config.binary);
        cmd.args([
            "install",
            "--omit=dev",
            "--ignore-scripts",
            "--no-audit",
            "--no-fund",
            "--no-package-lock",
            "--loglevel=error",
        ])
        .current_dir(dir)
        .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.timeout, cmd.output())
            .await
            .map_err(|_| DependencyError::Timeout(self.config.timeout.as_secs()))?
            .map_err(|e| {
                DependencyError::Spawn(format!(
                    "{}: {}. Make sure npm is installed or set NPM_BIN",
                    self.config.binary.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                manifest = %manifest.name,
                exit_code = ?output.status.code(),
                stderr = %stderr,
                "npm install failed"
            );
            return Err(DependencyError::Install(
                tail(stderr.trim(), MAX_ERROR_OUTPUT).to_string(),
            ));
        }

        tracing::info!(
            manifest = %manifest.name,
            packages = manifest.dependencies.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "npm install completed"
        );
        Ok(())
    }
}

/// Mock installer for testing.
///
/// Writes a stub `node_modules/{name}/` package for every dependency.
pub struct MockInstaller {
    fail_with: Option<String>,
    /// Optional delay to simulate installation time (in milliseconds)
    pub install_delay_ms: u64,
    installs: AtomicUsize,
}

impl Default for MockInstaller {
    fn default() -> Self {
        Self::new()
    }
}

impl MockInstaller {
    /// Create a new mock installer.
    pub fn new() -> Self {
        Self {
            fail_with: None,
            install_delay_ms: 0,
            installs: AtomicUsize::new(0),
        }
    }

    /// Create a mock installer whose installs always fail.
    pub fn failing() -> Self {
        Self {
            fail_with: Some("npm ERR! 404 Not Found - mock registry".to_string()),
            ..Self::new()
        }
    }

    /// Create a mock installer that takes `delay_ms` per install.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self {
            install_delay_ms: delay_ms,
            ..Self::new()
        }
    }

    /// Number of installations started.
    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageInstaller for MockInstaller {
    fn installer_type(&self) -> &'static str {
        "mock"
    }

    async fn install(
        &self,
        manifest: &DependencyManifest,
        dir: &Path,
    ) -> Result<(), DependencyError> {
        self.installs.fetch_add(1, Ordering::SeqCst);

        if self.install_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.install_delay_ms)).await;
        }

        if let Some(message) = &self.fail_with {
            return Err(DependencyError::Install(message.clone()));
        }

        for (name, version) in &manifest.dependencies {
            let pkg_dir = dir.join("node_modules").join(name);
            tokio::fs::create_dir_all(&pkg_dir).await?;
            let package_json = serde_json::json!({
                "name": name,
                "version": version,
                "main": "index.js",
            });
            tokio::fs::write(pkg_dir.join("package.json"), serde_json::to_vec(&package_json)?)
                .await?;
            tokio::fs::write(
                pkg_dir.join("index.js"),
                format!("module.exports = {{ name: {:?} }};\n", name),
            )
            .await?;
        }

        Ok(())
    }
}
