// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock bundler for testing.
//!
//! Returns the source unchanged as the bundle and discovers dependencies with
//! a regex over `require(...)` / `import ... from` specifiers, so pipelines can
//! be exercised without esbuild installed.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use regex::Regex;

use super::{BuildError, BundleOutput, Bundler, SourceFile, collect_packages};

static IMPORT_SPECIFIER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?:require\(\s*|from\s+|import\s+)["']([^"']+)["']"#).ok()
});

/// Mock bundler for testing.
pub struct MockBundler {
    /// Fail every build with this message.
    fail_with: Option<String>,
    /// Fail builds whose source contains this marker.
    fail_marker: Option<String>,
    scan_calls: AtomicUsize,
    bundle_calls: AtomicUsize,
}

impl Default for MockBundler {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBundler {
    /// Create a new mock bundler.
    pub fn new() -> Self {
        Self {
            fail_with: None,
            fail_marker: None,
            scan_calls: AtomicUsize::new(0),
            bundle_calls: AtomicUsize::new(0),
        }
    }

    /// Create a mock bundler whose builds always fail.
    pub fn failing() -> Self {
        Self {
            fail_with: Some("Build failed: Mock build failure".to_string()),
            ..Self::new()
        }
    }

    /// Fail any build whose source contains `marker`.
    pub fn failing_on(marker: impl Into<String>) -> Self {
        Self {
            fail_marker: Some(marker.into()),
            ..Self::new()
        }
    }

    /// Number of dependency scans performed.
    pub fn scan_count(&self) -> usize {
        self.scan_calls.load(Ordering::SeqCst)
    }

    /// Number of production bundles produced.
    pub fn bundle_count(&self) -> usize {
        self.bundle_calls.load(Ordering::SeqCst)
    }

    fn check(&self, source: &SourceFile) -> Result<(), BuildError> {
        if let Some(message) = &self.fail_with {
            return Err(BuildError::Compile(message.clone()));
        }
        if let Some(marker) = &self.fail_marker
            && source.content.contains(marker.as_str())
        {
            return Err(BuildError::Compile(format!(
                "Build failed: Unexpected \"{}\" ({}:1:1)",
                marker, source.filename
            )));
        }
        Ok(())
    }

    fn imports(source: &SourceFile) -> Vec<String> {
        let Some(re) = IMPORT_SPECIFIER.as_ref() else {
            return Vec::new();
        };
        collect_packages(
            re.captures_iter(&source.content)
                .filter_map(|caps| caps.get(1))
                .map(|m| m.as_str()),
        )
    }
}

#[async_trait]
impl Bundler for MockBundler {
    fn bundler_type(&self) -> &'static str {
        "mock"
    }

    async fn scan_dependencies(&self, source: &SourceFile) -> Result<Vec<String>, BuildError> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        self.check(source)?;
        Ok(Self::imports(source))
    }

    async fn bundle(&self, source: &SourceFile) -> Result<BundleOutput, BuildError> {
        self.bundle_calls.fetch_add(1, Ordering::SeqCst);
        self.check(source)?;
        Ok(BundleOutput {
            code: source.content.clone(),
            dependencies: Self::imports(source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_discovers_bare_imports() {
        let bundler = MockBundler::new();
        let source = SourceFile::new(
            "index.js",
            r#"
            const _ = require('lodash');
            const fs = require("fs");
            const util = require('./util');
            import dayjs from "dayjs/plugin/utc";
            module.exports = () => _.identity(1);
            "#,
        );

        let output = bundler.bundle(&source).await.unwrap();
        assert_eq!(output.dependencies, vec!["dayjs".to_string(), "lodash".to_string()]);
        assert_eq!(output.code, source.content);
        assert_eq!(bundler.bundle_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_without_imports_has_no_dependencies() {
        let bundler = MockBundler::new();
        let deps = bundler
            .scan_dependencies(&SourceFile::new("index.js", "module.exports = 42;"))
            .await
            .unwrap();
        assert!(deps.is_empty());
    }

    #[tokio::test]
    async fn test_mock_failure_modes() {
        let err = MockBundler::failing()
            .bundle(&SourceFile::new("index.js", "ok"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Mock build failure"));

        let bundler = MockBundler::failing_on("@@syntax");
        assert!(
            bundler
                .bundle(&SourceFile::new("index.js", "fine"))
                .await
                .is_ok()
        );
        assert!(
            bundler
                .bundle(&SourceFile::new("index.js", "const @@syntax"))
                .await
                .is_err()
        );
    }
}
