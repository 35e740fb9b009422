// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker lifecycle backends.
//!
//! - [`daemon::DaemonBackend`] - containers managed by a container daemon
//! - [`supervisor::SupervisorBackend`] - supervisor containers with CNI networking
//! - [`MockBackend`] - in-memory, for tests

pub mod daemon;
pub mod mock;
pub mod supervisor;
mod traits;

pub use mock::{MockBackend, MockWorker};
pub use traits::*;
