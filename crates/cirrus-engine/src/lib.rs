// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cirrus Engine - compute dispatch for user-submitted JavaScript functions
//!
//! This crate takes a single source file from a tenant, turns it into a
//! runnable bundle with its npm dependencies cached by content, and runs it
//! in an isolated Node.js worker behind an authenticated HTTP gateway.
//!
//! # Architecture
//!
//! ```text
//!   POST /api/functions                         ANY /run/{user}/{function}
//!           │                                              │
//!           ▼                                              ▼
//! ┌───────────────────────┐                  ┌───────────────────────────┐
//! │ DeploymentOrchestrator│◄── self-heal ────│     GatewayDispatcher     │
//! │ pending → deploying → │                  │ auth → lookup → integrity │
//! │   active | failed     │                  │ → sandbox → log + usage   │
//! └───┬──────────────┬────┘                  └─────────────┬─────────────┘
//!     │              │                                     │
//!     ▼              ▼                                     ▼
//! ┌─────────┐  ┌─────────────────┐             ┌───────────────────────┐
//! │ Bundler │  │ DependencyCache │             │  Sandbox (node child) │
//! │(esbuild)│  │ deps/{hash}/... │◄────────────│ hard deadline, killpg │
//! └─────────┘  └─────────────────┘             └───────────────────────┘
//!                        │                                 │
//!                        ▼                                 ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │            cirrus-core: ArtifactStore + Persistence (SQLite)          │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Function Status State Machine
//!
//! ```text
//! ┌─────────┐  pipeline   ┌───────────┐   published   ┌────────┐
//! │ PENDING │────────────►│ DEPLOYING │──────────────►│ ACTIVE │
//! └─────────┘             └─────┬─────┘               └────────┘
//!      ▲                        │ build/install error
//!      │ update/redeploy        ▼
//!      └──────────────────┌────────┐
//!                         │ FAILED │
//!                         └────────┘
//! ```
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CIRRUS_DATABASE_URL` | `sqlite:$DATA_DIR/cirrus.db` | Document store |
//! | `CIRRUS_ARTIFACT_STORE_URL` | `file://$DATA_DIR/artifacts` | Artifact store |
//! | `CIRRUS_HTTP_PORT` | `8080` | HTTP port |
//! | `CIRRUS_PUBLIC_URL` | `http://localhost:$PORT` | Endpoint base URL |
//! | `CIRRUS_SANDBOX_TIMEOUT_MS` | `6000` | Hard worker deadline |
//! | `CIRRUS_WORKER_TIMEOUT_MS` | `5000` | Soft in-worker deadline |
//! | `CIRRUS_SANDBOX_MEMORY_MB` | `128` | Worker heap limit |
//! | `NODE_MAJOR`, `ARCH`, `INSTALLER_IDENT` | host | Dependency hash inputs |
//!
//! # Modules
//!
//! - [`bundler`]: Two-pass bundling and package discovery
//! - [`dependencies`]: Content-addressed dependency bundles
//! - [`orchestrator`]: Deployment lifecycle
//! - [`sandbox`]: Isolated execution of bundles
//! - [`gateway`]: Invocation dispatch and accounting
//! - [`handlers`] / [`server`]: HTTP surface
//! - [`runtime`]: Embeddable runtime

pub mod bundler;
pub mod config;
pub mod dependencies;
pub mod dependency_cleanup_worker;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod orchestrator;
pub mod runtime;
pub mod sandbox;
pub mod server;

pub use bundler::{Bundler, EsbuildBundler, MockBundler};
pub use config::Config;
pub use dependencies::{DependencyCache, MockInstaller, NpmInstaller, PackageInstaller};
pub use error::{Error, Result};
pub use gateway::{GatewayDispatcher, GatewayResponse};
pub use orchestrator::DeploymentOrchestrator;
pub use runtime::FaasRuntime;
pub use sandbox::{MockSandbox, NodeSandbox, Sandbox};
