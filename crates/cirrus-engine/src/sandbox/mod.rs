// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution sandboxes.

pub mod mock;
pub mod node;
pub mod traits;

pub use mock::MockSandbox;
pub use node::{NodeSandbox, NodeSandboxConfig};
pub use traits::*;
