// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cirrus Core - data model and storage for the Cirrus function platform
//!
//! This crate holds everything the dispatch engine persists:
//!
//! - **Document store** ([`persistence`]): users, functions with their
//!   deployment state and statistics, per-invocation logs and usage records.
//!   SQLite is the bundled backend.
//! - **Artifact store** ([`artifact_store`]): blobs for sources, bundles,
//!   manifests and dependency archives, on top of `object_store`.
//!
//! ```text
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │      cirrus-engine       │      │      cirrus-engine       │
//! │ (orchestrator, gateway)  │      │  (bundler, dep cache)    │
//! └────────────┬─────────────┘      └────────────┬─────────────┘
//!              │                                 │
//!              ▼                                 ▼
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │   Persistence (SQLite)   │      │      ArtifactStore       │
//! │ users/functions/logs/... │      │  file:// memory:// s3:// │
//! └──────────────────────────┘      └──────────────────────────┘
//! ```

pub mod artifact_store;
pub mod error;
pub mod models;
pub mod persistence;

pub use artifact_store::{ArtifactMeta, ArtifactStore, layout};
pub use error::{CoreError, Result};
pub use models::{
    FunctionBuilder, FunctionRecord, FunctionSettings, FunctionStats, FunctionStatus,
    InvocationSample, InvocationStatus, LogLevel, LogLine, LogRecord, PublishedBundle,
    UsageActivity, UsageRecord, UserRecord, UserUsage,
};
pub use persistence::{Persistence, SqlitePersistence};
