// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor backend.
//!
//! Workers are supervisor containers whose task runs in its own network
//! namespace, attached through the [`NetworkFabric`]. Ensure is a ladder of
//! steps; whatever step fails, everything below it is torn down again under
//! a detached context:
//!
//! ```text
//! image -> container -> task -> start -> network -> ip -> return
//! ```
//!
//! Cancellation observed after the network is attached rolls the worker back
//! in full and surfaces as `Cancelled`.

pub mod client;
pub mod mock;
pub mod oci;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::access::AccessTracker;
use crate::cni::extract_ipv4;
use crate::config::RuntimeKind;
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::image::ImageResolver;
use crate::metrics::{TaskCounters, TaskState, extract, map_task_state};
use crate::network::{NetworkFabric, WORKER_PORT};

pub use client::{ContainerRecord, CtrClient, PullOptions, SupervisorClient, TaskInfo};
pub use mock::{MockSupervisor, SupervisorStage};
pub use oci::{MountSpec, ResolvConf, WorkerSpec, select_snapshotter};

/// Network namespace of a task's init process.
pub fn netns_path(pid: u32) -> String {
    format!("/proc/{}/ns/net", pid)
}

/// Worker status for a task state.
pub fn worker_status(state: TaskState) -> WorkerStatus {
    match state {
        TaskState::Running => WorkerStatus::Running,
        TaskState::Paused => WorkerStatus::Paused,
        TaskState::Stopped => WorkerStatus::Stopped,
        TaskState::Created => WorkerStatus::Creating,
        TaskState::Unknown => WorkerStatus::Unknown,
    }
}

/// How far an ensure got; decides what rollback undoes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Progress {
    Container,
    Task,
    Network(String),
}

/// [`Backend`] over a container supervisor.
pub struct SupervisorBackend {
    client: Arc<dyn SupervisorClient>,
    fabric: Arc<NetworkFabric>,
    labels: Labels,
    identity: Identity,
    env_name: String,
    resolver: ImageResolver,
    resolv_conf: ResolvConf,
    access: Arc<AccessTracker>,
    snapshotter: String,
    runtime: Option<String>,
    plain_http: bool,
    cleanup_timeout: Duration,
    kill_wait_timeout: Duration,
}

impl SupervisorBackend {
    /// Create a backend. Snapshotter defaults to `overlayfs`.
    pub fn new(
        client: Arc<dyn SupervisorClient>,
        fabric: Arc<NetworkFabric>,
        identity: Identity,
        env_name: impl Into<String>,
        resolver: ImageResolver,
        resolv_conf: ResolvConf,
    ) -> Self {
        let env_name = env_name.into();
        Self {
            client,
            fabric,
            labels: Labels::new(&identity, &env_name),
            identity,
            env_name,
            resolver,
            resolv_conf,
            access: Arc::new(AccessTracker::new()),
            snapshotter: select_snapshotter(None, None),
            runtime: None,
            plain_http: false,
            cleanup_timeout: Duration::from_secs(10),
            kill_wait_timeout: Duration::from_secs(5),
        }
    }

    /// Runtime name and snapshotter override.
    pub fn with_runtime(mut self, runtime: Option<String>, snapshotter: Option<String>) -> Self {
        self.snapshotter = select_snapshotter(snapshotter.as_deref(), runtime.as_deref());
        self.runtime = runtime.filter(|r| !r.trim().is_empty());
        self
    }

    /// Pull over plain HTTP.
    pub fn with_plain_http(mut self, plain_http: bool) -> Self {
        self.plain_http = plain_http;
        self
    }

    /// Hard deadline for rollback work. Default: 10s.
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// How long GC waits for a killed task to exit. Default: 5s.
    pub fn with_kill_wait_timeout(mut self, timeout: Duration) -> Self {
        self.kill_wait_timeout = timeout;
        self
    }

    /// Selected snapshotter.
    pub fn snapshotter(&self) -> &str {
        &self.snapshotter
    }

    /// The access tracker.
    pub fn access(&self) -> &Arc<AccessTracker> {
        &self.access
    }

    /// The network fabric.
    pub fn fabric(&self) -> &Arc<NetworkFabric> {
        &self.fabric
    }

    async fn ensure_image(&self, ctx: &OpContext, image: &str) -> Result<()> {
        if ctx.run(self.client.image_exists(image)).await? {
            debug!(image = %image, "Image present");
            return Ok(());
        }
        info!(image = %image, snapshotter = %self.snapshotter, "Pulling image");
        let options = PullOptions {
            snapshotter: self.snapshotter.clone(),
            plain_http: self.plain_http,
        };
        ctx.run(self.client.pull(image, &options))
            .await
            .map_err(|e| match e {
                Error::Runtime(msg) => Error::runtime(format!("failed to pull image {}: {}", image, msg)),
                other => other,
            })
    }

    async fn build_spec(&self, id: &str, image: String, req: &EnsureRequest, owner: &str) -> WorkerSpec {
        let mounts = self.resolv_conf.mount().await.into_iter().collect();
        WorkerSpec {
            id: id.to_string(),
            image,
            snapshotter: self.snapshotter.clone(),
            runtime: self.runtime.clone(),
            labels: self.labels.for_worker(&req.function_name, owner),
            env: req.env.clone(),
            mounts,
            memory_limit: memory_limit_bytes(&req.env),
        }
    }

    /// Run the ladder from container creation to IP extraction, recording
    /// progress for rollback.
    async fn bring_up(&self, ctx: &OpContext, spec: &WorkerSpec, progress: &mut Progress) -> Result<String> {
        let id = spec.id.as_str();
        ctx.run(self.client.create_container(spec))
            .await
            .map_err(|e| wrap(e, "failed to create container"))?;

        // The task may exist even when create reports failure.
        *progress = Progress::Task;
        ctx.run(self.client.create_task(id))
            .await
            .map_err(|e| wrap(e, "failed to create task"))?;

        let pid = ctx
            .run(self.client.start_task(id))
            .await
            .map_err(|e| wrap(e, "failed to start task"))?;

        let netns = netns_path(pid);
        *progress = Progress::Network(netns.clone());
        let result = self.fabric.setup(ctx, id, &netns).await?;
        let ip = extract_ipv4(&result)?;

        // The caller may have gone away while the network was attached.
        ctx.check()?;
        Ok(ip.to_string())
    }

    async fn rollback(&self, id: &str, progress: Progress) {
        let ctx = OpContext::detached(self.cleanup_timeout);
        if let Progress::Network(netns) = &progress
            && let Err(e) = self.fabric.remove(&ctx, id, Some(netns)).await
        {
            warn!(worker_id = %id, error = %e, "Rollback failed to remove network");
        }
        if progress != Progress::Container {
            match ctx.run(self.client.delete_task(id, true)).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => warn!(worker_id = %id, error = %e, "Rollback failed to delete task"),
            }
        }
        match ctx.run(self.client.delete_container(id)).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => warn!(worker_id = %id, error = %e, "Rollback failed to delete container"),
        }
        self.access.forget(id);
    }

    /// Record of a worker this agent manages. Anything else in the
    /// namespace reads as not found.
    async fn managed_record(&self, ctx: &OpContext, id: &str) -> Result<ContainerRecord> {
        match ctx.run(self.client.container(id)).await {
            Ok(record) if self.labels.is_managed(&record.labels) => Ok(record),
            Ok(_) => {
                debug!(worker_id = %id, "Container is not managed by this agent");
                Err(Error::worker_not_found(id))
            }
            Err(e) if e.is_not_found() => {
                self.access.forget(id);
                Err(Error::worker_not_found(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Detach, kill and delete one worker. Step failures before the
    /// container delete are logged; the container delete result is returned.
    async fn teardown(&self, ctx: &OpContext, id: &str) -> Result<()> {
        match ctx.run(self.client.task(id)).await {
            Ok(Some(task)) => {
                let netns = (task.pid > 0).then(|| netns_path(task.pid));
                if let Err(e) = self.fabric.remove(ctx, id, netns.as_deref()).await {
                    warn!(worker_id = %id, error = %e, "Failed to remove worker network");
                }
                if matches!(task.status, TaskState::Running | TaskState::Paused) {
                    if let Err(e) = ctx.run(self.client.kill_task(id, Signal::SIGKILL)).await {
                        warn!(worker_id = %id, error = %e, "Failed to kill task");
                    }
                    let wait = ctx.child(Some(self.kill_wait_timeout));
                    if let Err(e) = wait.run(self.client.wait_task(id)).await {
                        warn!(worker_id = %id, error = %e, "Task did not exit after SIGKILL");
                    }
                }
                match ctx.run(self.client.delete_task(id, false)).await {
                    Ok(()) | Err(Error::NotFound(_)) => {}
                    Err(e) => {
                        debug!(worker_id = %id, error = %e, "Task delete failed, forcing");
                        if let Err(e) = ctx.run(self.client.delete_task(id, true)).await {
                            warn!(worker_id = %id, error = %e, "Failed to delete task");
                        }
                    }
                }
            }
            Ok(None) => {
                // No task: release any port and IP file left behind.
                let _ = self.fabric.remove(ctx, id, None).await;
            }
            Err(e) => warn!(worker_id = %id, error = %e, "Failed to load task"),
        }

        let deleted = ctx.run(self.client.delete_container(id)).await;
        self.access.forget(id);
        deleted
    }
}

fn wrap(err: Error, what: &str) -> Error {
    match err {
        Error::Runtime(msg) => Error::runtime(format!("{}: {}", what, msg)),
        other => other,
    }
}

#[async_trait]
impl Backend for SupervisorBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Supervisor
    }

    async fn ensure(&self, ctx: &OpContext, req: EnsureRequest) -> Result<Worker> {
        let owner = validate_ensure(&req)?;
        let image = self.resolver.resolve(&req.function_name, req.image.as_deref())?;
        let id = new_worker_id(&self.identity, &self.env_name, &req.function_name)?;

        self.ensure_image(ctx, &image).await?;
        let spec = self.build_spec(&id, image, &req, &owner).await;
        info!(worker_id = %id, image = %spec.image, snapshotter = %spec.snapshotter, "Creating worker");

        let mut progress = Progress::Container;
        let ip = match self.bring_up(ctx, &spec, &mut progress).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!(worker_id = %id, error = %e, "Ensure failed, rolling back");
                self.rollback(&id, progress).await;
                return Err(e);
            }
        };

        self.access.touch(&id);
        info!(worker_id = %id, function = %req.function_name, ip = %ip, "Worker ready");
        Ok(Worker {
            name: id.clone(),
            id,
            ip_address: ip,
            port: WORKER_PORT,
            owner_id: owner,
        })
    }

    async fn destroy(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.managed_record(ctx, id).await?;
        match self.teardown(ctx, id).await {
            Ok(()) => {
                info!(worker_id = %id, "Worker destroyed");
                Ok(())
            }
            Err(e) if e.is_not_found() => Err(Error::worker_not_found(id)),
            Err(e) => Err(e),
        }
    }

    async fn pause(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.managed_record(ctx, id).await?;
        ctx.run(self.client.pause_task(id)).await?;
        debug!(worker_id = %id, "Worker paused");
        Ok(())
    }

    async fn resume(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.managed_record(ctx, id).await?;
        ctx.run(self.client.resume_task(id)).await?;
        self.access.touch(id);
        debug!(worker_id = %id, "Worker resumed");
        Ok(())
    }

    async fn list(&self, ctx: &OpContext) -> Result<Vec<WorkerState>> {
        let records = ctx.run(self.client.list_containers()).await?;
        let mut states = Vec::new();
        for record in records.into_iter().filter(|r| self.labels.is_managed(&r.labels)) {
            let status = match ctx.run(self.client.task(&record.id)).await {
                Ok(Some(task)) => worker_status(task.status),
                Ok(None) => WorkerStatus::Stopped,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(Error::DeadlineExceeded) => return Err(Error::DeadlineExceeded),
                Err(e) => {
                    debug!(worker_id = %record.id, error = %e, "Task status unavailable");
                    WorkerStatus::Unknown
                }
            };
            let created_at = record.created_at.unwrap_or_else(Utc::now);
            let last = self.access.get(&record.id);
            states.push(WorkerState {
                function_name: self.labels.function_of(&record.labels),
                owner_id: self.labels.owner_of(&record.labels),
                status,
                created_at,
                last_used_at: last.unwrap_or(created_at),
                has_access_record: last.is_some(),
                ip_address: self.fabric.lookup_ip(&record.id).map(|ip| ip.to_string()),
                port: WORKER_PORT,
                container_name: record.id.clone(),
                id: record.id,
            });
        }
        Ok(states)
    }

    async fn metrics(&self, ctx: &OpContext, id: &str) -> Result<ContainerMetrics> {
        let record = self.managed_record(ctx, id).await?;
        let function = self.labels.function_of(&record.labels);
        if function.is_empty() {
            return Err(Error::runtime(format!("container {} has no function label", id)));
        }

        let Some(task) = ctx.run(self.client.task(id)).await? else {
            return Ok(ContainerMetrics::empty(id, &function, "STOPPED"));
        };

        let counters = if matches!(task.status, TaskState::Running | TaskState::Paused) {
            let envelope = ctx.run(self.client.task_metrics(id)).await?;
            extract(envelope.as_ref())?
        } else {
            TaskCounters::default()
        };

        let mut metrics = ContainerMetrics::empty(id, &function, map_task_state(task.status));
        metrics.memory_current = counters.memory_current;
        metrics.memory_max = counters.memory_max;
        metrics.oom_events = counters.oom_events;
        metrics.cpu_usage_ns = counters.cpu_usage_ns;
        if task.status == TaskState::Stopped {
            metrics.exit_code = task.exit_status.unwrap_or(0);
            metrics.exit_time = task.exited_at;
        }
        Ok(metrics)
    }

    async fn gc(&self, ctx: &OpContext) -> Result<()> {
        let records = ctx.run(self.client.list_containers()).await?;
        let mut removed = 0usize;
        for record in records.into_iter().filter(|r| self.labels.is_managed(&r.labels)) {
            match self.teardown(ctx, &record.id).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(worker_id = %record.id, error = %e, "GC failed to delete container"),
            }
        }
        info!(removed, "Supervisor GC complete");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.client.close().await
    }

    fn touch(&self, id: &str) {
        self.access.touch(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_status_mapping() {
        assert_eq!(worker_status(TaskState::Running), WorkerStatus::Running);
        assert_eq!(worker_status(TaskState::Paused), WorkerStatus::Paused);
        assert_eq!(worker_status(TaskState::Stopped), WorkerStatus::Stopped);
        assert_eq!(worker_status(TaskState::Created), WorkerStatus::Creating);
        assert_eq!(worker_status(TaskState::Unknown), WorkerStatus::Unknown);
    }

    #[test]
    fn test_netns_path() {
        assert_eq!(netns_path(4242), "/proc/4242/ns/net");
    }
}
