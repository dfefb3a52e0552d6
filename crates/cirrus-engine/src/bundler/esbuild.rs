// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! esbuild-backed bundler.
//!
//! Each build runs in a private temporary directory holding only the entry
//! file, so builds for different functions never see each other's files.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use super::{
    BuildError, BundleOutput, Bundler, SourceFile, packages_from_metafile, parse_build_error,
};

/// Configuration for [`EsbuildBundler`].
#[derive(Debug, Clone)]
pub struct EsbuildConfig {
    /// Path to the esbuild executable.
    pub binary: PathBuf,
    /// Node major version targeted by the output (`--target=node{N}`).
    pub node_major: u32,
    /// Upper bound for one esbuild run.
    pub timeout: Duration,
}

impl Default for EsbuildConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("esbuild"),
            node_major: 18,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Bundler that shells out to esbuild.
pub struct EsbuildBundler {
    config: EsbuildConfig,
}

impl EsbuildBundler {
    /// Create a new esbuild bundler.
    pub fn new(config: EsbuildConfig) -> Self {
        Self { config }
    }

    fn base_args(&self, entry: &Path) -> Vec<String> {
        vec![
            entry.to_string_lossy().into_owned(),
            "--bundle".to_string(),
            "--platform=node".to_string(),
            format!("--target=node{}", self.config.node_major),
            "--format=cjs".to_string(),
            "--log-level=error".to_string(),
            "--color=false".to_string(),
        ]
    }

    async fn write_entry(dir: &Path, source: &SourceFile) -> Result<PathBuf, BuildError> {
        let entry = dir.join(&source.filename);
        tokio::fs::write(&entry, &source.content).await?;
        Ok(entry)
    }

    async fn run(&self, args: Vec<String>, cwd: &Path, pass: &'static str) -> Result<(), BuildError> {
        let start = Instant::now();
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&args).current_dir(cwd).kill_on_drop(true);

        let output = tokio::time::timeout(self.config.timeout, cmd.output())
            .await
            .map_err(|_| BuildError::Timeout(self.config.timeout.as_secs()))?
            .map_err(|e| {
                BuildError::Spawn(format!(
                    "{}: {}. Make sure esbuild is installed or set ESBUILD_BIN",
                    self.config.binary.display(),
                    e
                ))
            })?;

        let duration_ms = start.elapsed().as_millis() as u64;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(
                pass = pass,
                duration_ms = duration_ms,
                stderr = %stderr,
                "esbuild failed"
            );
            return Err(BuildError::Compile(parse_build_error(&stderr)));
        }

        tracing::debug!(pass = pass, duration_ms = duration_ms, "esbuild completed");
        Ok(())
    }

    async fn scan_in(&self, dir: &Path, entry: &Path) -> Result<Vec<String>, BuildError> {
        let metafile = dir.join("meta.json");
        let mut args = self.base_args(entry);
        args.push("--packages=external".to_string());
        args.push(format!("--metafile={}", metafile.display()));
        args.push(format!("--outfile={}", dir.join("scan.js").display()));

        self.run(args, dir, "scan").await?;

        let json = tokio::fs::read_to_string(&metafile).await?;
        packages_from_metafile(&json)
    }
}

#[async_trait]
impl Bundler for EsbuildBundler {
    fn bundler_type(&self) -> &'static str {
        "esbuild"
    }

    async fn scan_dependencies(&self, source: &SourceFile) -> Result<Vec<String>, BuildError> {
        let dir = tempfile::Builder::new().prefix("cirrus-scan-").tempdir()?;
        let entry = Self::write_entry(dir.path(), source).await?;
        self.scan_in(dir.path(), &entry).await
    }

    async fn bundle(&self, source: &SourceFile) -> Result<BundleOutput, BuildError> {
        let dir = tempfile::Builder::new().prefix("cirrus-build-").tempdir()?;
        let entry = Self::write_entry(dir.path(), source).await?;

        let dependencies = self.scan_in(dir.path(), &entry).await?;

        let outfile = dir.path().join("bundle.js");
        let mut args = self.base_args(&entry);
        args.push("--minify".to_string());
        for dependency in &dependencies {
            args.push(format!("--external:{}", dependency));
            args.push(format!("--external:{}/*", dependency));
        }
        args.push(format!("--outfile={}", outfile.display()));

        self.run(args, dir.path(), "production").await?;

        let code = tokio::fs::read_to_string(&outfile).await?;
        tracing::debug!(
            filename = %source.filename,
            bundle_bytes = code.len(),
            dependencies = dependencies.len(),
            "Bundled source"
        );

        Ok(BundleOutput { code, dependencies })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let bundler = EsbuildBundler::new(EsbuildConfig {
            binary: PathBuf::from("/nonexistent/esbuild-binary"),
            ..Default::default()
        });

        let err = bundler
            .bundle(&SourceFile::new("index.js", "module.exports = 1;"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Spawn(_)));
    }

    #[test]
    fn test_base_args_target_node_version() {
        let bundler = EsbuildBundler::new(EsbuildConfig {
            node_major: 20,
            ..Default::default()
        });
        let args = bundler.base_args(Path::new("/tmp/x/index.js"));
        assert!(args.contains(&"--target=node20".to_string()));
        assert!(args.contains(&"--format=cjs".to_string()));
        assert!(args.contains(&"--platform=node".to_string()));
    }
}
