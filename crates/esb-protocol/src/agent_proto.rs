// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages for the agent RPC surface.
//!
//! Messages are declared with `prost` derives directly; field tags are part of
//! the wire contract and must never be reused.

use std::collections::HashMap;

/// Create a new worker for a function.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnsureContainerRequest {
    #[prost(string, tag = "1")]
    pub function_name: String,
    /// Full image reference; resolved from the function name when absent.
    #[prost(string, optional, tag = "2")]
    pub image: Option<String>,
    #[prost(map = "string, string", tag = "3")]
    pub env: HashMap<String, String>,
    #[prost(string, tag = "4")]
    pub owner_id: String,
}

/// A freshly created worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerInfo {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub ip_address: String,
    #[prost(uint32, tag = "4")]
    pub port: u32,
    #[prost(string, tag = "5")]
    pub owner_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DestroyContainerRequest {
    #[prost(string, tag = "1")]
    pub container_id: String,
    /// When set, the worker must belong to this owner.
    #[prost(string, tag = "2")]
    pub owner_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DestroyContainerResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PauseContainerRequest {
    #[prost(string, tag = "1")]
    pub container_id: String,
    #[prost(string, tag = "2")]
    pub owner_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PauseContainerResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResumeContainerRequest {
    #[prost(string, tag = "1")]
    pub container_id: String,
    #[prost(string, tag = "2")]
    pub owner_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResumeContainerResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListContainersRequest {
    /// Only workers of this owner are returned when set.
    #[prost(string, tag = "1")]
    pub owner_id: String,
}

/// One worker as reported by `ListContainers`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerState {
    #[prost(string, tag = "1")]
    pub container_id: String,
    #[prost(string, tag = "2")]
    pub function_name: String,
    #[prost(string, tag = "3")]
    pub owner_id: String,
    /// One of `creating`, `running`, `paused`, `stopped`, `unknown`.
    #[prost(string, tag = "4")]
    pub status: String,
    /// Unix seconds.
    #[prost(int64, tag = "5")]
    pub created_at: i64,
    /// Unix seconds.
    #[prost(int64, tag = "6")]
    pub last_used_at: i64,
    #[prost(string, tag = "7")]
    pub ip_address: String,
    #[prost(uint32, tag = "8")]
    pub port: u32,
    #[prost(string, tag = "9")]
    pub container_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListContainersResponse {
    #[prost(message, repeated, tag = "1")]
    pub containers: Vec<WorkerState>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetContainerMetricsRequest {
    #[prost(string, tag = "1")]
    pub container_id: String,
    #[prost(string, tag = "2")]
    pub owner_id: String,
}

/// Resource counters for one worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerMetrics {
    #[prost(string, tag = "1")]
    pub container_id: String,
    #[prost(string, tag = "2")]
    pub function_name: String,
    #[prost(string, tag = "3")]
    pub container_name: String,
    /// One of `RUNNING`, `PAUSED`, `STOPPED`, `UNKNOWN`.
    #[prost(string, tag = "4")]
    pub state: String,
    #[prost(uint64, tag = "5")]
    pub memory_current: u64,
    #[prost(uint64, tag = "6")]
    pub memory_max: u64,
    #[prost(uint64, tag = "7")]
    pub oom_events: u64,
    #[prost(uint64, tag = "8")]
    pub cpu_usage_ns: u64,
    #[prost(uint32, tag = "9")]
    pub exit_code: u32,
    #[prost(uint32, tag = "10")]
    pub restart_count: u32,
    /// Unix seconds, 0 while the task is alive.
    #[prost(int64, tag = "11")]
    pub exit_time: i64,
    /// Unix seconds.
    #[prost(int64, tag = "12")]
    pub collected_at: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckResponse {
    #[prost(bool, tag = "1")]
    pub healthy: bool,
    #[prost(string, tag = "2")]
    pub version: String,
    #[prost(int64, tag = "3")]
    pub uptime_ms: i64,
    /// `daemon` or `supervisor`.
    #[prost(string, tag = "4")]
    pub backend: String,
    #[prost(string, tag = "5")]
    pub brand: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DescribeServiceRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MethodDescriptor {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub request_type: String,
    #[prost(string, tag = "3")]
    pub response_type: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DescribeServiceResponse {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(message, repeated, tag = "2")]
    pub methods: Vec<MethodDescriptor>,
}

/// Error returned in place of a response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
    /// Canonical code such as `INVALID_ARGUMENT` or `NOT_FOUND`.
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Envelope for every request sent to the agent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
    #[prost(oneof = "rpc_request::Request", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
    pub request: Option<rpc_request::Request>,
}

pub mod rpc_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        EnsureContainer(super::EnsureContainerRequest),
        #[prost(message, tag = "2")]
        DestroyContainer(super::DestroyContainerRequest),
        #[prost(message, tag = "3")]
        PauseContainer(super::PauseContainerRequest),
        #[prost(message, tag = "4")]
        ResumeContainer(super::ResumeContainerRequest),
        #[prost(message, tag = "5")]
        ListContainers(super::ListContainersRequest),
        #[prost(message, tag = "6")]
        GetContainerMetrics(super::GetContainerMetricsRequest),
        #[prost(message, tag = "7")]
        HealthCheck(super::HealthCheckRequest),
        #[prost(message, tag = "8")]
        DescribeService(super::DescribeServiceRequest),
    }
}

/// Envelope for every response sent by the agent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponse {
    #[prost(oneof = "rpc_response::Response", tags = "1, 2, 3, 4, 5, 6, 7, 8, 15")]
    pub response: Option<rpc_response::Response>,
}

pub mod rpc_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        EnsureContainer(super::WorkerInfo),
        #[prost(message, tag = "2")]
        DestroyContainer(super::DestroyContainerResponse),
        #[prost(message, tag = "3")]
        PauseContainer(super::PauseContainerResponse),
        #[prost(message, tag = "4")]
        ResumeContainer(super::ResumeContainerResponse),
        #[prost(message, tag = "5")]
        ListContainers(super::ListContainersResponse),
        #[prost(message, tag = "6")]
        GetContainerMetrics(super::ContainerMetrics),
        #[prost(message, tag = "7")]
        HealthCheck(super::HealthCheckResponse),
        #[prost(message, tag = "8")]
        DescribeService(super::DescribeServiceResponse),
        #[prost(message, tag = "15")]
        Error(super::RpcError),
    }
}

/// Canonical RPC error codes.
pub mod codes {
    pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const ALREADY_EXISTS: &str = "ALREADY_EXISTS";
    pub const RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const UNIMPLEMENTED: &str = "UNIMPLEMENTED";
    pub const CANCELLED: &str = "CANCELLED";
    pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";
    pub const INTERNAL: &str = "INTERNAL";
    pub const EMPTY_REQUEST: &str = "EMPTY_REQUEST";
}
