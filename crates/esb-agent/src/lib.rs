// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! esb agent - per-host worker lifecycle
//!
//! The agent runs on every edge host and owns the function workers placed
//! there by the gateway. It creates workers on demand, wires their network,
//! reports their state and resource usage, and reaps the ones nobody uses.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Gateway                                │
//! │                  (esb-protocol AgentClient)                       │
//! └──────────────────────────────────────────────────────────────────┘
//!                                 │ QUIC, port 50051
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       esb-agent (This Crate)                      │
//! │  ┌────────────┐   ┌────────────┐   ┌────────────┐                 │
//! │  │  Handlers  │──▶│  Backend   │◀──│  Janitor   │                 │
//! │  └────────────┘   └─────┬──────┘   └────────────┘                 │
//! │                         │                                         │
//! │          ┌──────────────┴───────────────┐                         │
//! │          ▼                              ▼                         │
//! │  ┌──────────────┐              ┌──────────────────┐               │
//! │  │    Daemon    │              │    Supervisor    │──▶ Network    │
//! │  │   (docker)   │              │   (containerd)   │    Fabric     │
//! │  └──────────────┘              └──────────────────┘    (CNI)      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `EnsureContainer` | Create a fresh worker for a function and return its address |
//! | `DestroyContainer` | Tear a worker down; unknown workers count as destroyed |
//! | `PauseContainer` | Freeze a worker (supervisor only) |
//! | `ResumeContainer` | Thaw a worker and mark it used |
//! | `ListContainers` | Managed workers, optionally for one owner |
//! | `GetContainerMetrics` | Memory, OOM and CPU counters of one worker |
//! | `HealthCheck` | Liveness, version, backend kind, brand |
//! | `DescribeService` | Method table (when reflection is enabled) |
//!
//! # Worker Status
//!
//! ```text
//!   CREATING ──▶ RUNNING ◀──▶ PAUSED
//!                   │            │
//!                   ▼            ▼
//!                STOPPED ◀───────┘
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PORT` | `50051` | QUIC listen port |
//! | `AGENT_RUNTIME` | `docker` | `containerd` selects the supervisor backend |
//! | `ESB_BRAND_SLUG` | - | Brand identity; derived from `PROJECT_NAME`/`ENV`, then `CONTAINERS_NETWORK`/`ENV` otherwise |
//! | `CONTAINER_REGISTRY` | - | Registry prefix for worker images |
//! | `CNI_CONF_FILE` | `/etc/cni/net.d/10-esb.conflist` | Base CNI config |
//! | `AGENT_IDLE_TIMEOUT_SECS` | `300` | Idle workers are reaped after this |
//! | `AGENT_REQUEST_TIMEOUT_SECS` | `120` | Per-request deadline |
//! | `AGENT_LOG_LEVEL` | `info` | Log level (`LOG_LEVEL` fallback) |
//!
//! See [`config`] for the full list.
//!
//! # Modules
//!
//! - [`identity`]: Brand identity and the names derived from it
//! - [`ports`]: Host port pool
//! - [`cni`]: CNI config shaping, generation and result parsing
//! - [`network`]: CNI attach/detach with port mappings
//! - [`backend`]: Worker lifecycle backends
//! - [`access`]: Last-use timestamps
//! - [`janitor`]: Idle and orphan reaping
//! - [`metrics`]: Cgroup counters and task state mapping
//! - [`image`]: Worker image names and runtime mode checks
//! - [`handlers`]: RPC handlers
//! - [`server`]: QUIC server
//! - [`runtime`]: Programmatic startup and shutdown

#![warn(missing_docs)]

/// Last-use timestamps for workers.
pub mod access;

/// Worker lifecycle backends (daemon, supervisor, mock).
pub mod backend;

/// Process wiring used by the binary.
pub mod bootstrap;

/// CNI configuration shaping, generation and result parsing.
pub mod cni;

/// Configuration loaded from environment variables.
pub mod config;

/// Cancellation and deadlines for backend operations.
pub mod context;

/// Error types for agent operations.
pub mod error;

/// Agent RPC request handlers.
pub mod handlers;

/// Brand identity resolution.
pub mod identity;

/// Worker image resolution.
pub mod image;

/// Background reaper for idle and orphaned workers.
pub mod janitor;

/// Logging setup.
pub mod logging;

/// Resource usage collection.
pub mod metrics;

/// CNI attach/detach for supervisor workers.
pub mod network;

/// Host port allocation.
pub mod ports;

/// Programmatic agent startup and shutdown.
pub mod runtime;

/// QUIC server for the agent protocol.
pub mod server;

pub use backend::{Backend, MockBackend, Worker, WorkerState, WorkerStatus};
pub use config::Config;
pub use context::OpContext;
pub use error::{Error, ErrorKind, Result};
pub use identity::Identity;
pub use runtime::{AgentRuntime, AgentRuntimeBuilder, AgentRuntimeConfig};
