// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request handlers for the agent RPC surface.
//!
//! Handlers validate input, enforce worker ownership and translate between
//! wire messages and [`Backend`] calls. They are transport-agnostic; the
//! QUIC server in [`crate::server`] only decodes frames and dispatches here.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use esb_protocol::agent_proto;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{Backend, EnsureRequest, WorkerState};
use crate::context::OpContext;
use crate::error::{Error, Result};

/// Service name reported by `DescribeService`.
pub const SERVICE_NAME: &str = "esb.agent.v1.AgentService";

/// Shared state for all handlers.
pub struct AgentHandlerState {
    /// Worker lifecycle backend.
    pub backend: Arc<dyn Backend>,
    /// Brand slug, reported by health checks.
    pub brand: String,
    /// When the server started (for uptime calculation).
    pub start_time: Instant,
    /// Server version string.
    pub version: String,
    /// Deadline applied to every request.
    pub request_timeout: Duration,
    /// Answer `DescribeService`.
    pub reflection: bool,
    /// Cancelled on shutdown; parent of every request context.
    pub shutdown: CancellationToken,
    owners: RwLock<HashMap<String, String>>,
}

/// Default request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

impl AgentHandlerState {
    /// Create handler state over `backend`.
    pub fn new(backend: Arc<dyn Backend>, brand: impl Into<String>) -> Self {
        Self {
            backend,
            brand: brand.into(),
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reflection: false,
            shutdown: CancellationToken::new(),
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// Set the per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable `DescribeService`.
    pub fn with_reflection(mut self, enabled: bool) -> Self {
        self.reflection = enabled;
        self
    }

    /// Parent request contexts on `token`.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Get uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }

    /// A fresh context for one request.
    pub fn request_context(&self) -> OpContext {
        OpContext::with_token(self.shutdown.child_token()).child(Some(self.request_timeout))
    }

    fn cached_owner(&self, id: &str) -> Option<String> {
        self.owners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn remember(&self, id: &str, owner: &str) {
        self.owners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), owner.to_string());
    }

    fn forget(&self, id: &str) {
        self.owners.write().unwrap_or_else(|e| e.into_inner()).remove(id);
    }

    fn refresh(&self, workers: &[WorkerState]) {
        let fresh = workers
            .iter()
            .map(|w| (w.id.clone(), w.owner_id.clone()))
            .collect();
        *self.owners.write().unwrap_or_else(|e| e.into_inner()) = fresh;
    }

    /// Check that `id` belongs to `owner`.
    async fn authorize(&self, ctx: &OpContext, id: &str, owner: &str) -> Result<()> {
        require(owner, "owner_id")?;
        let owner = owner.trim();
        let known = match self.cached_owner(id) {
            Some(known) => Some(known),
            None => {
                let workers = self.backend.list(ctx).await?;
                self.refresh(&workers);
                self.cached_owner(id)
            }
        };
        match known {
            Some(known) if known == owner => Ok(()),
            Some(_) => Err(Error::PermissionDenied(format!(
                "worker {} does not belong to owner {}",
                id, owner
            ))),
            None => Err(Error::worker_not_found(id)),
        }
    }
}

fn require(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid_argument(format!("{} is required", field)));
    }
    Ok(())
}

fn unix_seconds(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

fn to_proto_state(w: WorkerState) -> agent_proto::WorkerState {
    agent_proto::WorkerState {
        container_id: w.id,
        function_name: w.function_name,
        owner_id: w.owner_id,
        status: w.status.as_str().to_string(),
        created_at: unix_seconds(w.created_at),
        last_used_at: unix_seconds(w.last_used_at),
        ip_address: w.ip_address.unwrap_or_default(),
        port: u32::from(w.port),
        container_name: w.container_name,
    }
}

// ============================================================================
// Worker lifecycle
// ============================================================================

/// Create a worker.
pub async fn handle_ensure_container(
    state: &AgentHandlerState,
    req: agent_proto::EnsureContainerRequest,
) -> Result<agent_proto::WorkerInfo> {
    require(&req.function_name, "function_name")?;
    require(&req.owner_id, "owner_id")?;

    let ctx = state.request_context();
    let worker = state
        .backend
        .ensure(
            &ctx,
            EnsureRequest {
                function_name: req.function_name,
                image: req.image.filter(|i| !i.trim().is_empty()),
                env: req.env,
                owner_id: req.owner_id,
            },
        )
        .await?;
    state.remember(&worker.id, &worker.owner_id);

    Ok(agent_proto::WorkerInfo {
        id: worker.id,
        name: worker.name,
        ip_address: worker.ip_address,
        port: u32::from(worker.port),
        owner_id: worker.owner_id,
    })
}

/// Destroy a worker. Unknown workers count as destroyed.
pub async fn handle_destroy_container(
    state: &AgentHandlerState,
    req: agent_proto::DestroyContainerRequest,
) -> Result<agent_proto::DestroyContainerResponse> {
    require(&req.container_id, "container_id")?;
    require(&req.owner_id, "owner_id")?;
    let ctx = state.request_context();

    let outcome = match state.authorize(&ctx, &req.container_id, &req.owner_id).await {
        Ok(()) => state.backend.destroy(&ctx, &req.container_id).await,
        Err(e) => Err(e),
    };
    match outcome {
        Ok(()) => info!(container_id = %req.container_id, "Destroyed worker"),
        Err(e) if e.is_not_found() => {
            debug!(container_id = %req.container_id, "Destroy of unknown worker");
        }
        Err(e) => return Err(e),
    }
    state.forget(&req.container_id);
    Ok(agent_proto::DestroyContainerResponse { success: true })
}

/// Freeze a worker.
pub async fn handle_pause_container(
    state: &AgentHandlerState,
    req: agent_proto::PauseContainerRequest,
) -> Result<agent_proto::PauseContainerResponse> {
    require(&req.container_id, "container_id")?;
    require(&req.owner_id, "owner_id")?;
    let ctx = state.request_context();
    state.authorize(&ctx, &req.container_id, &req.owner_id).await?;
    state.backend.pause(&ctx, &req.container_id).await?;
    Ok(agent_proto::PauseContainerResponse { success: true })
}

/// Thaw a worker.
pub async fn handle_resume_container(
    state: &AgentHandlerState,
    req: agent_proto::ResumeContainerRequest,
) -> Result<agent_proto::ResumeContainerResponse> {
    require(&req.container_id, "container_id")?;
    require(&req.owner_id, "owner_id")?;
    let ctx = state.request_context();
    state.authorize(&ctx, &req.container_id, &req.owner_id).await?;
    state.backend.resume(&ctx, &req.container_id).await?;
    Ok(agent_proto::ResumeContainerResponse { success: true })
}

/// List one owner's workers.
pub async fn handle_list_containers(
    state: &AgentHandlerState,
    req: agent_proto::ListContainersRequest,
) -> Result<agent_proto::ListContainersResponse> {
    require(&req.owner_id, "owner_id")?;
    let ctx = state.request_context();
    let workers = state.backend.list(&ctx).await?;
    state.refresh(&workers);

    let owner = req.owner_id.trim();
    let containers = workers
        .into_iter()
        .filter(|w| w.owner_id == owner)
        .map(to_proto_state)
        .collect();
    Ok(agent_proto::ListContainersResponse { containers })
}

/// Resource usage of one worker.
pub async fn handle_get_container_metrics(
    state: &AgentHandlerState,
    req: agent_proto::GetContainerMetricsRequest,
) -> Result<agent_proto::ContainerMetrics> {
    require(&req.container_id, "container_id")?;
    require(&req.owner_id, "owner_id")?;
    let ctx = state.request_context();
    state.authorize(&ctx, &req.container_id, &req.owner_id).await?;
    let m = state.backend.metrics(&ctx, &req.container_id).await?;
    Ok(agent_proto::ContainerMetrics {
        container_id: m.container_id,
        function_name: m.function_name,
        container_name: m.container_name,
        state: m.state,
        memory_current: m.memory_current,
        memory_max: m.memory_max,
        oom_events: m.oom_events,
        cpu_usage_ns: m.cpu_usage_ns,
        exit_code: m.exit_code,
        restart_count: 0,
        exit_time: m.exit_time.map(unix_seconds).unwrap_or(0),
        collected_at: unix_seconds(m.collected_at),
    })
}

// ============================================================================
// Service
// ============================================================================

/// Health check.
pub async fn handle_health_check(state: &AgentHandlerState) -> Result<agent_proto::HealthCheckResponse> {
    Ok(agent_proto::HealthCheckResponse {
        healthy: true,
        version: state.version.clone(),
        uptime_ms: state.uptime_ms(),
        backend: state.backend.kind().as_str().to_string(),
        brand: state.brand.clone(),
    })
}

/// Method table, when reflection is enabled.
pub async fn handle_describe_service(state: &AgentHandlerState) -> Result<agent_proto::DescribeServiceResponse> {
    if !state.reflection {
        return Err(Error::Unsupported("reflection is disabled".to_string()));
    }
    let method = |name: &str, request: &str, response: &str| agent_proto::MethodDescriptor {
        name: name.to_string(),
        request_type: request.to_string(),
        response_type: response.to_string(),
    };
    Ok(agent_proto::DescribeServiceResponse {
        service: SERVICE_NAME.to_string(),
        methods: vec![
            method("EnsureContainer", "EnsureContainerRequest", "WorkerInfo"),
            method("DestroyContainer", "DestroyContainerRequest", "DestroyContainerResponse"),
            method("PauseContainer", "PauseContainerRequest", "PauseContainerResponse"),
            method("ResumeContainer", "ResumeContainerRequest", "ResumeContainerResponse"),
            method("ListContainers", "ListContainersRequest", "ListContainersResponse"),
            method("GetContainerMetrics", "GetContainerMetricsRequest", "ContainerMetrics"),
            method("HealthCheck", "HealthCheckRequest", "HealthCheckResponse"),
            method("DescribeService", "DescribeServiceRequest", "DescribeServiceResponse"),
        ],
    })
}
