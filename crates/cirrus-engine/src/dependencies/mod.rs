// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Third-party dependencies of user functions.
//!
//! A dependency set is identified by a SHA-256 over a canonical string of the
//! sorted `name@constraint` pairs plus the runtime identifiers, so an installed
//! bundle is never reused across incompatible Node versions or architectures:
//!
//! ```text
//! NODE=18|ARCH=linux-x64|INSTALLER=npm@auto|DEPS=axios@latest|lodash@latest
//! ```
//!
//! The [`DependencyCache`] installs each distinct set once and stores the
//! packed `node_modules` under `deps/{hash}/` for every function to share.

pub mod archive;
pub mod cache;
pub mod installer;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use cache::{CacheOutcome, DependencyBundleMetadata, DependencyCache};
pub use installer::{MockInstaller, NpmInstaller, NpmInstallerConfig, PackageInstaller};

/// Upper bound on distinct packages per function.
pub const MAX_DEPENDENCIES: usize = 50;

/// Longest package name npm accepts.
const MAX_PACKAGE_NAME_LEN: usize = 214;

static PACKAGE_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(?:@[a-z0-9~-][a-z0-9._~-]*/)?[a-z0-9~-][a-z0-9._~-]*$").ok()
});

/// Errors from dependency validation, installation and caching.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DependencyError {
    /// A discovered package name is not a valid npm name.
    #[error("Invalid dependency name: \"{0}\"")]
    InvalidPackageName(String),

    /// More distinct packages than allowed.
    #[error("Too many dependencies: {count} (maximum is {max})")]
    TooManyDependencies {
        /// Discovered package count.
        count: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// The installer could not be started.
    #[error("Failed to run package installer: {0}")]
    Spawn(String),

    /// The installer exited unsuccessfully.
    #[error("Package installation failed: {0}")]
    Install(String),

    /// The installer did not finish in time.
    #[error("Package installation timed out after {0} seconds")]
    Timeout(u64),

    /// Packing or unpacking `node_modules` failed.
    #[error("Dependency archive error: {0}")]
    Archive(String),

    /// Artifact store operation failed.
    #[error("Artifact store error: {0}")]
    Store(#[from] cirrus_core::CoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DependencyError {
    /// Whether the error is a rejection of the submitted code rather than an infrastructure failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DependencyError::InvalidPackageName(_) | DependencyError::TooManyDependencies { .. }
        )
    }
}

/// Runtime identifiers folded into every dependency hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeTarget {
    /// Node major version, e.g. 18.
    pub node_major: u32,
    /// Platform/architecture, e.g. `linux-x64`.
    pub arch: String,
    /// Installer identifier, e.g. `npm@auto`.
    pub installer: String,
}

impl RuntimeTarget {
    /// Target for the machine this process runs on.
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            "windows" => "win32",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "x64",
            "aarch64" => "arm64",
            "x86" => "ia32",
            other => other,
        };
        Self {
            node_major: 18,
            arch: format!("{}-{}", os, arch),
            installer: "npm@auto".to_string(),
        }
    }
}

impl Default for RuntimeTarget {
    fn default() -> Self {
        Self::host()
    }
}

/// Check discovered package names before anything is persisted.
pub fn validate_dependencies(names: &[String]) -> Result<(), DependencyError> {
    if names.len() > MAX_DEPENDENCIES {
        return Err(DependencyError::TooManyDependencies {
            count: names.len(),
            max: MAX_DEPENDENCIES,
        });
    }

    for name in names {
        let valid = name.len() <= MAX_PACKAGE_NAME_LEN
            && PACKAGE_NAME.as_ref().is_some_and(|re| re.is_match(name));
        if !valid {
            return Err(DependencyError::InvalidPackageName(name.clone()));
        }
    }

    Ok(())
}

/// Map every package name to the configured version policy.
pub fn resolve_versions(names: &[String], policy: &str) -> BTreeMap<String, String> {
    names
        .iter()
        .map(|name| (name.clone(), policy.to_string()))
        .collect()
}

/// Stable hash of a dependency set for a runtime target.
pub fn compute_dependency_hash(
    dependencies: &BTreeMap<String, String>,
    target: &RuntimeTarget,
) -> String {
    let deps = dependencies
        .iter()
        .map(|(name, constraint)| format!("{}@{}", name, constraint))
        .collect::<Vec<_>>()
        .join("|");

    let canonical = format!(
        "NODE={}|ARCH={}|INSTALLER={}|DEPS={}",
        target.node_major, target.arch, target.installer, deps
    );

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `package.json` written for a function and handed to the installer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyManifest {
    pub name: String,
    pub version: String,
    pub private: bool,
    pub dependencies: BTreeMap<String, String>,
}

impl DependencyManifest {
    /// Manifest for one function.
    pub fn for_function(function_id: &str, dependencies: BTreeMap<String, String>) -> Self {
        Self {
            name: format!("fn-{}", function_id),
            version: "1.0.0".to_string(),
            private: true,
            dependencies,
        }
    }

    /// Manifest used when installing a shared bundle.
    pub fn for_bundle(dependency_hash: &str, dependencies: BTreeMap<String, String>) -> Self {
        let short = &dependency_hash[..dependency_hash.len().min(12)];
        Self {
            name: format!("deps-{}", short),
            version: "1.0.0".to_string(),
            private: true,
            dependencies,
        }
    }

    /// Pretty-printed JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> RuntimeTarget {
        RuntimeTarget {
            node_major: 18,
            arch: "linux-x64".to_string(),
            installer: "npm@auto".to_string(),
        }
    }

    fn deps(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_hash_matches_canonical_string() {
        let hash = compute_dependency_hash(
            &deps(&[("lodash", "latest"), ("axios", "latest")]),
            &target(),
        );

        let mut hasher = Sha256::new();
        hasher.update(b"NODE=18|ARCH=linux-x64|INSTALLER=npm@auto|DEPS=axios@latest|lodash@latest");
        assert_eq!(hash, format!("{:x}", hasher.finalize()));
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_hash_is_order_independent() {
        let a = compute_dependency_hash(&deps(&[("a", "latest"), ("b", "latest")]), &target());
        let b = compute_dependency_hash(&deps(&[("b", "latest"), ("a", "latest")]), &target());
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_changes_with_any_input() {
        let base = compute_dependency_hash(&deps(&[("lodash", "latest")]), &target());

        let renamed = compute_dependency_hash(&deps(&[("lodash-es", "latest")]), &target());
        let repinned = compute_dependency_hash(&deps(&[("lodash", "^4.17.0")]), &target());
        let other_node = compute_dependency_hash(
            &deps(&[("lodash", "latest")]),
            &RuntimeTarget {
                node_major: 20,
                ..target()
            },
        );
        let other_arch = compute_dependency_hash(
            &deps(&[("lodash", "latest")]),
            &RuntimeTarget {
                arch: "linux-arm64".to_string(),
                ..target()
            },
        );

        for other in [renamed, repinned, other_node, other_arch] {
            assert_ne!(base, other);
        }
    }

    #[test]
    fn test_validate_dependency_names() {
        let ok = vec![
            "lodash".to_string(),
            "@aws-sdk/client-s3".to_string(),
            "left-pad".to_string(),
            "socket.io".to_string(),
            "a~b".to_string(),
        ];
        assert!(validate_dependencies(&ok).is_ok());

        for bad in ["bad pkg", "UPPER", "../escape", "@scope/", "", "$money"] {
            let err = validate_dependencies(&[bad.to_string()]).unwrap_err();
            assert!(matches!(err, DependencyError::InvalidPackageName(ref n) if n == bad));
            assert!(err.is_validation());
        }
    }

    #[test]
    fn test_too_many_dependencies() {
        let names: Vec<String> = (0..=MAX_DEPENDENCIES).map(|i| format!("pkg-{}", i)).collect();
        let err = validate_dependencies(&names).unwrap_err();
        assert!(err.to_string().starts_with("Too many dependencies"));

        let names: Vec<String> = (0..MAX_DEPENDENCIES).map(|i| format!("pkg-{}", i)).collect();
        assert!(validate_dependencies(&names).is_ok());
    }

    #[test]
    fn test_manifest_shape() {
        let manifest =
            DependencyManifest::for_function("abc", resolve_versions(&["lodash".to_string()], "latest"));
        let json: serde_json::Value = serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(json["name"], "fn-abc");
        assert_eq!(json["version"], "1.0.0");
        assert_eq!(json["private"], true);
        assert_eq!(json["dependencies"]["lodash"], "latest");
    }
}
