// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bundler - turns one submitted source file into a runnable module.
//!
//! Bundling happens in two passes:
//!
//! 1. **Scan**: every bare (non-relative, non-builtin) import is marked
//!    external and the build metafile is inspected to learn which packages
//!    the transitive local-import graph actually references.
//! 2. **Production**: local imports are inlined and the discovered packages
//!    are left as run-time `require` calls, producing a single minified
//!    CommonJS file for the target Node version.

pub mod esbuild;
pub mod mock;

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

pub use esbuild::{EsbuildBundler, EsbuildConfig};
pub use mock::MockBundler;

/// Errors from bundling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The source does not compile (syntax error, unresolved local import).
    #[error("{0}")]
    Compile(String),

    /// The bundler executable could not be started.
    #[error("Failed to run bundler: {0}")]
    Spawn(String),

    /// The bundler did not finish in time.
    #[error("Bundler timed out after {0} seconds")]
    Timeout(u64),

    /// The build metafile could not be read.
    #[error("Invalid bundler metafile: {0}")]
    Metafile(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A submitted source file.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Entry filename, e.g. `index.js`.
    pub filename: String,
    /// Source text.
    pub content: String,
}

impl SourceFile {
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }
}

/// Output of a production bundle.
#[derive(Debug, Clone)]
pub struct BundleOutput {
    /// Bundled CommonJS code.
    pub code: String,
    /// Distinct third-party package names, sorted.
    pub dependencies: Vec<String>,
}

/// Trait for bundlers.
#[async_trait]
pub trait Bundler: Send + Sync {
    /// Bundler type identifier (e.g., "esbuild", "mock")
    fn bundler_type(&self) -> &'static str;

    /// Discover the third-party packages referenced by the source.
    async fn scan_dependencies(&self, source: &SourceFile) -> Result<Vec<String>, BuildError>;

    /// Produce the production bundle and its dependency list.
    async fn bundle(&self, source: &SourceFile) -> Result<BundleOutput, BuildError>;
}

/// Node built-in modules as of Node 18.
pub const NODE_BUILTINS: &[&str] = &[
    "assert",
    "async_hooks",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "diagnostics_channel",
    "dns",
    "domain",
    "events",
    "fs",
    "http",
    "http2",
    "https",
    "inspector",
    "module",
    "net",
    "os",
    "path",
    "perf_hooks",
    "process",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "string_decoder",
    "sys",
    "timers",
    "tls",
    "trace_events",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "wasi",
    "worker_threads",
    "zlib",
];

/// Whether an import specifier names a Node built-in (`fs`, `fs/promises`, `node:path`).
pub fn is_builtin(specifier: &str) -> bool {
    if specifier.starts_with("node:") {
        return true;
    }
    let head = specifier.split('/').next().unwrap_or(specifier);
    NODE_BUILTINS.contains(&head)
}

/// Whether an import specifier is a path rather than a package.
pub fn is_local(specifier: &str) -> bool {
    specifier.starts_with('.') || specifier.starts_with('/')
}

/// Package name of a bare import: `lodash/fp` -> `lodash`, `@a/b/c` -> `@a/b`.
pub fn package_name_of(specifier: &str) -> String {
    let mut parts = specifier.split('/');
    match parts.next() {
        Some(scope) if scope.starts_with('@') => match parts.next() {
            Some(name) => format!("{}/{}", scope, name),
            None => scope.to_string(),
        },
        Some(name) => name.to_string(),
        None => specifier.to_string(),
    }
}

/// Reduce import specifiers to the sorted set of third-party package names.
pub fn collect_packages<'a>(specifiers: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    specifiers
        .into_iter()
        .filter(|s| !s.is_empty() && !is_local(s) && !is_builtin(s))
        .filter(|s| !s.starts_with("data:") && !s.starts_with("http:") && !s.starts_with("https:"))
        .map(package_name_of)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Deserialize)]
struct Metafile {
    #[serde(default)]
    inputs: HashMap<String, MetafileInput>,
}

#[derive(Debug, Deserialize)]
struct MetafileInput {
    #[serde(default)]
    imports: Vec<MetafileImport>,
}

#[derive(Debug, Deserialize)]
struct MetafileImport {
    path: String,
    #[serde(default)]
    external: bool,
}

/// Extract third-party package names from an esbuild metafile.
pub fn packages_from_metafile(json: &str) -> Result<Vec<String>, BuildError> {
    let metafile: Metafile =
        serde_json::from_str(json).map_err(|e| BuildError::Metafile(e.to_string()))?;

    Ok(collect_packages(
        metafile
            .inputs
            .values()
            .flat_map(|input| input.imports.iter())
            .filter(|import| import.external)
            .map(|import| import.path.as_str()),
    ))
}

static ERROR_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[ERROR\]\s*(.+)").ok());

static LOCATION_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*([^\s:]+):(\d+):(\d+):\s*$").ok());

fn captures<'t>(re: &LazyLock<Option<Regex>>, text: &'t str) -> Option<regex::Captures<'t>> {
    re.as_ref()?.captures(text)
}

/// Parse bundler stderr into a user-facing build error message.
pub fn parse_build_error(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        if let Some(caps) = captures(&ERROR_LINE, line) {
            let message = caps[1].trim().to_string();
            let location = lines[i + 1..]
                .iter()
                .filter(|l| !l.trim().is_empty())
                .take(1)
                .find_map(|l| captures(&LOCATION_LINE, l))
                .map(|c| format!(" ({}:{}:{})", &c[1], &c[2], &c[3]));

            return format!("Build failed: {}{}", message, location.unwrap_or_default());
        }
    }

    match stderr.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(first) => format!("Build failed: {}", first),
        None => "Build failed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_name_of() {
        assert_eq!(package_name_of("lodash"), "lodash");
        assert_eq!(package_name_of("lodash/fp"), "lodash");
        assert_eq!(package_name_of("@aws-sdk/client-s3"), "@aws-sdk/client-s3");
        assert_eq!(package_name_of("@aws-sdk/client-s3/dist/x"), "@aws-sdk/client-s3");
    }

    #[test]
    fn test_builtins_and_locals_excluded() {
        let packages = collect_packages([
            "fs",
            "fs/promises",
            "node:path",
            "./util",
            "../lib/x",
            "lodash",
            "lodash/fp",
            "axios",
        ]);
        assert_eq!(packages, vec!["axios".to_string(), "lodash".to_string()]);
    }

    #[test]
    fn test_packages_from_metafile() {
        let metafile = r#"{
            "inputs": {
                "index.js": {
                    "bytes": 120,
                    "imports": [
                        {"path": "lodash", "kind": "require-call", "external": true},
                        {"path": "fs", "kind": "require-call", "external": true},
                        {"path": "util.js", "kind": "require-call", "original": "./util"}
                    ]
                },
                "util.js": {
                    "bytes": 40,
                    "imports": [
                        {"path": "dayjs/plugin/utc", "kind": "import-statement", "external": true}
                    ]
                }
            },
            "outputs": {}
        }"#;

        let packages = packages_from_metafile(metafile).unwrap();
        assert_eq!(packages, vec!["dayjs".to_string(), "lodash".to_string()]);
    }

    #[test]
    fn test_metafile_without_imports_has_no_dependencies() {
        let packages =
            packages_from_metafile(r#"{"inputs":{"index.js":{"bytes":10,"imports":[]}}}"#)
                .unwrap();
        assert!(packages.is_empty());
    }

    #[test]
    fn test_parse_build_error_with_location() {
        let stderr = "✘ [ERROR] Expected \";\" but found \"y\"\n\n    index.js:1:8:\n      1 │ const x y = 1\n        ╵         ^\n\n1 error\n";
        assert_eq!(
            parse_build_error(stderr),
            "Build failed: Expected \";\" but found \"y\" (index.js:1:8)"
        );
    }

    #[test]
    fn test_parse_build_error_fallbacks() {
        assert_eq!(
            parse_build_error("something odd happened\nmore"),
            "Build failed: something odd happened"
        );
        assert_eq!(parse_build_error(""), "Build failed");
    }
}
