// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ESB Protocol - QUIC + Protobuf communication layer for the worker agent
//!
//! This crate carries the RPC surface between the gateway and the per-host
//! worker agent.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       esb-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: one request/response pair per QUIC stream       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn), TLS or mutual TLS (rustls)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use esb_protocol::AgentClient;
//!
//! let client = AgentClient::localhost("127.0.0.1:50051".parse()?)?;
//! let worker = client
//!     .ensure_container("lambda-echo", None, Default::default(), "gw-1")
//!     .await?;
//! println!("{} at {}:{}", worker.id, worker.ip_address, worker.port);
//! client.destroy_container(&worker.id, "gw-1").await?;
//! ```

pub mod agent_proto;
pub mod client;
pub mod frame;
pub mod server;

pub use client::{AgentClient, AgentClientConfig, ClientError};
pub use frame::{Frame, FrameError, MessageType};
pub use server::{ConnectionHandler, RpcServer, RpcServerConfig, ServerError, StreamHandler};
