// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Daemon backend.
//!
//! Workers are plain daemon containers attached to the configured network at
//! creation. The daemon assigns the IP; this backend only reads it back.
//! Pause and resume are not offered.

pub mod client;
pub mod mock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::access::AccessTracker;
use crate::config::RuntimeKind;
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::image::ImageResolver;
use crate::metrics::{CgroupRoots, TaskCounters, collect_from_pid, extract};
use crate::network::WORKER_PORT;

pub use client::{CreateSpec, DaemonClient, DaemonContainer, DockerCli};
pub use mock::{DaemonFailure, MockDaemon};

/// Inspect attempts while waiting for the daemon to assign an IP.
const IP_ATTEMPTS: u32 = 5;

/// Map a daemon container state to a worker status.
pub fn normalize_status(state: &str) -> WorkerStatus {
    match state {
        "running" => WorkerStatus::Running,
        "paused" => WorkerStatus::Paused,
        "exited" | "dead" => WorkerStatus::Stopped,
        "created" | "restarting" => WorkerStatus::Creating,
        _ => WorkerStatus::Unknown,
    }
}

fn metrics_state(state: &str) -> &'static str {
    match normalize_status(state) {
        WorkerStatus::Running => "RUNNING",
        WorkerStatus::Paused => "PAUSED",
        WorkerStatus::Stopped => "STOPPED",
        _ => "UNKNOWN",
    }
}

/// [`Backend`] over a container daemon.
pub struct DaemonBackend {
    client: Arc<dyn DaemonClient>,
    labels: Labels,
    identity: Identity,
    env_name: String,
    network: String,
    resolver: ImageResolver,
    access: Arc<AccessTracker>,
    cgroups: CgroupRoots,
    cleanup_timeout: Duration,
    ip_backoff: Duration,
}

impl DaemonBackend {
    /// Backend attaching workers to `network`.
    pub fn new(
        client: Arc<dyn DaemonClient>,
        identity: Identity,
        env_name: impl Into<String>,
        network: impl Into<String>,
        resolver: ImageResolver,
    ) -> Self {
        let env_name = env_name.into();
        Self {
            client,
            labels: Labels::new(&identity, &env_name),
            identity,
            env_name,
            network: network.into(),
            resolver,
            access: Arc::new(AccessTracker::new()),
            cgroups: CgroupRoots::default(),
            cleanup_timeout: Duration::from_secs(10),
            ip_backoff: Duration::from_millis(100),
        }
    }

    /// Hard deadline for rollback work. Default: 10s.
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// First backoff between IP inspects; doubles each attempt. Default: 100ms.
    pub fn with_ip_backoff(mut self, backoff: Duration) -> Self {
        self.ip_backoff = backoff;
        self
    }

    /// Where cgroup files are read from.
    pub fn with_cgroup_roots(mut self, roots: CgroupRoots) -> Self {
        self.cgroups = roots;
        self
    }

    /// The access tracker.
    pub fn access(&self) -> &Arc<AccessTracker> {
        &self.access
    }

    fn list_filter(&self) -> Vec<(String, String)> {
        vec![
            (self.labels.created_by.clone(), self.labels.created_by_value.clone()),
            (self.labels.env.clone(), self.labels.env_value.clone()),
            (self.labels.kind.clone(), KIND_FUNCTION.to_string()),
        ]
    }

    async fn resolve_ip(&self, ctx: &OpContext, name: &str) -> Result<String> {
        for attempt in 0..IP_ATTEMPTS {
            let info = ctx.run(self.client.inspect(name)).await?;
            if let Some(ip) = info.ip_on(&self.network) {
                return Ok(ip);
            }
            if attempt + 1 < IP_ATTEMPTS {
                ctx.sleep(self.ip_backoff * 2u32.pow(attempt)).await?;
            }
        }
        Err(Error::runtime(format!(
            "container {} started but IP address not available after {} retries",
            name, IP_ATTEMPTS
        )))
    }

    async fn start_and_resolve(&self, ctx: &OpContext, spec: &CreateSpec) -> Result<String> {
        info!(container = %spec.name, image = %spec.image, "Creating container");
        ctx.run(self.client.create(spec)).await?;
        ctx.run(self.client.start(&spec.name)).await?;
        let ip = self.resolve_ip(ctx, &spec.name).await?;
        // The caller may have gone away while we waited on the daemon.
        ctx.check()?;
        Ok(ip)
    }

    async fn rollback(&self, name: &str) {
        let cleanup = OpContext::detached(self.cleanup_timeout);
        match cleanup.run(self.client.remove(name, true)).await {
            Ok(()) => debug!(container = %name, "Rolled back container"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(container = %name, error = %e, "Failed to roll back container"),
        }
        self.access.forget(name);
    }

    /// Inspect a container this agent manages; foreign ones read as not found.
    async fn managed_container(&self, ctx: &OpContext, id: &str) -> Result<DaemonContainer> {
        match ctx.run(self.client.inspect(id)).await {
            Ok(info) if self.labels.is_managed(&info.labels) => Ok(info),
            Ok(_) => {
                debug!(container = %id, "Container is not managed by this agent");
                Err(Error::worker_not_found(id))
            }
            Err(e) if e.is_not_found() => {
                self.access.forget(id);
                Err(Error::worker_not_found(id))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Backend for DaemonBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Daemon
    }

    async fn ensure(&self, ctx: &OpContext, req: EnsureRequest) -> Result<Worker> {
        let owner = validate_ensure(&req)?;
        let image = self.resolver.resolve(&req.function_name, req.image.as_deref())?;
        let id = new_worker_id(&self.identity, &self.env_name, &req.function_name)?;

        if self.resolver.registry().is_some() {
            info!(image = %image, "Pulling image");
            ctx.run(self.client.pull(&image))
                .await
                .map_err(|e| match e {
                    Error::Runtime(msg) => Error::runtime(format!("failed to pull image {}: {}", image, msg)),
                    other => other,
                })?;
        } else {
            debug!(image = %image, "Skipping pull for local image (no registry configured)");
        }

        let spec = CreateSpec {
            name: id.clone(),
            image,
            env: req.env,
            labels: self.labels.for_worker(&req.function_name, &owner),
            network: self.network.clone(),
            exposed_port: WORKER_PORT,
        };

        let ip = match self.start_and_resolve(ctx, &spec).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!(container = %id, error = %e, "Ensure failed, removing container");
                self.rollback(&id).await;
                return Err(e);
            }
        };

        self.access.touch(&id);
        info!(container = %id, function = %req.function_name, ip = %ip, "Worker ready");
        Ok(Worker {
            name: id.clone(),
            id,
            ip_address: ip,
            port: WORKER_PORT,
            owner_id: owner,
        })
    }

    async fn destroy(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.managed_container(ctx, id).await?;
        let result = ctx.run(self.client.remove(id, true)).await;
        self.access.forget(id);
        match result {
            Ok(()) => {
                info!(container = %id, "Container removed");
                Ok(())
            }
            Err(e) if e.is_not_found() => Err(Error::worker_not_found(id)),
            Err(e) => Err(e),
        }
    }

    async fn pause(&self, _ctx: &OpContext, _id: &str) -> Result<()> {
        Err(Error::Unsupported("pause not implemented for daemon runtime".to_string()))
    }

    async fn resume(&self, _ctx: &OpContext, _id: &str) -> Result<()> {
        Err(Error::Unsupported("resume not implemented for daemon runtime".to_string()))
    }

    async fn list(&self, ctx: &OpContext) -> Result<Vec<WorkerState>> {
        let containers = ctx.run(self.client.list(&self.list_filter())).await?;
        let states = containers
            .into_iter()
            .filter(|c| self.labels.is_managed(&c.labels))
            .map(|c| {
                let last = self.access.get(&c.name);
                WorkerState {
                    function_name: self.labels.function_of(&c.labels),
                    owner_id: self.labels.owner_of(&c.labels),
                    status: normalize_status(&c.state),
                    created_at: c.created_at,
                    last_used_at: last.unwrap_or(c.created_at),
                    has_access_record: last.is_some(),
                    ip_address: c.ip_on(&self.network),
                    port: WORKER_PORT,
                    id: c.name.clone(),
                    container_name: c.name,
                }
            })
            .collect();
        Ok(states)
    }

    async fn metrics(&self, ctx: &OpContext, id: &str) -> Result<ContainerMetrics> {
        let info = self.managed_container(ctx, id).await?;
        let function = self.labels.function_of(&info.labels);
        if function.is_empty() {
            return Err(Error::runtime(format!("container {} has no function label", id)));
        }

        let status = normalize_status(&info.state);
        let counters = if status.is_live() && info.pid > 0 {
            match collect_from_pid(&self.cgroups, info.pid).await {
                Some(envelope) => extract(Some(&envelope))?,
                None => TaskCounters::default(),
            }
        } else {
            TaskCounters::default()
        };

        let mut metrics = ContainerMetrics::empty(id, &function, metrics_state(&info.state));
        metrics.container_name = info.name;
        metrics.memory_current = counters.memory_current;
        metrics.memory_max = counters.memory_max;
        metrics.oom_events = counters.oom_events;
        metrics.cpu_usage_ns = counters.cpu_usage_ns;
        if status == WorkerStatus::Stopped {
            metrics.exit_code = u32::try_from(info.exit_code).unwrap_or(0);
            metrics.exit_time = info.finished_at;
        }
        metrics.collected_at = Utc::now();
        Ok(metrics)
    }

    async fn gc(&self, ctx: &OpContext) -> Result<()> {
        let containers = ctx.run(self.client.list(&self.list_filter())).await?;
        let mut removed = 0usize;
        for c in containers.into_iter().filter(|c| self.labels.is_managed(&c.labels)) {
            match ctx.run(self.client.remove(&c.name, true)).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(container = %c.name, error = %e, "GC failed to remove container"),
            }
            self.access.forget(&c.name);
        }
        info!(removed, "Daemon GC complete");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn touch(&self, id: &str) {
        self.access.touch(id);
    }
}
