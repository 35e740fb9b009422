// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container supervisor client.
//!
//! [`SupervisorClient`] exposes containers and their tasks by id inside one
//! namespace. [`CtrClient`] drives the `ctr` CLI. The CLI fuses task creation
//! and start, so `create_task` launches the task detached and `start_task`
//! waits for it to report `RUNNING`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::oci::WorkerSpec;
use crate::error::{Error, Result};
use crate::metrics::{CgroupRoots, MetricsEnvelope, TaskState, collect_from_pid};

/// Container metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    /// Container id.
    pub id: String,
    /// Labels.
    pub labels: HashMap<String, String>,
    /// Creation time; `None` when the supervisor did not report one.
    pub created_at: Option<DateTime<Utc>>,
    /// Image reference.
    pub image: String,
}

/// Task state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Init process pid; zero once reaped.
    pub pid: u32,
    /// Lifecycle state.
    pub status: TaskState,
    /// Exit status of a stopped task.
    pub exit_status: Option<u32>,
    /// When the task stopped.
    pub exited_at: Option<DateTime<Utc>>,
}

/// Image pull settings.
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Snapshotter to unpack into.
    pub snapshotter: String,
    /// Use plain HTTP.
    pub plain_http: bool,
}

/// Supervisor operations used by the backend. Unknown containers and tasks
/// yield `NotFound` unless noted.
#[async_trait]
pub trait SupervisorClient: Send + Sync {
    /// Whether `image` is present in the namespace.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull and unpack `image`.
    async fn pull(&self, image: &str, options: &PullOptions) -> Result<()>;

    /// Create a container with a new snapshot keyed by its id.
    async fn create_container(&self, spec: &WorkerSpec) -> Result<()>;

    /// Delete a container and its snapshot.
    async fn delete_container(&self, id: &str) -> Result<()>;

    /// Every container in the namespace.
    async fn list_containers(&self) -> Result<Vec<ContainerRecord>>;

    /// One container.
    async fn container(&self, id: &str) -> Result<ContainerRecord>;

    /// Create the task of a container.
    async fn create_task(&self, id: &str) -> Result<()>;

    /// Start the task and return its pid.
    async fn start_task(&self, id: &str) -> Result<u32>;

    /// Task of a container; `None` when it has no task.
    async fn task(&self, id: &str) -> Result<Option<TaskInfo>>;

    /// Signal the task's init process.
    async fn kill_task(&self, id: &str, signal: Signal) -> Result<()>;

    /// Wait until the task stops.
    async fn wait_task(&self, id: &str) -> Result<()>;

    /// Delete the task, killing it first when `kill` is set.
    async fn delete_task(&self, id: &str, kill: bool) -> Result<()>;

    /// Freeze the task.
    async fn pause_task(&self, id: &str) -> Result<()>;

    /// Thaw the task.
    async fn resume_task(&self, id: &str) -> Result<()>;

    /// Current task metrics; `None` when none could be collected.
    async fn task_metrics(&self, id: &str) -> Result<Option<MetricsEnvelope>>;

    /// Release the connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInfoDoc {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl From<ContainerInfoDoc> for ContainerRecord {
    fn from(doc: ContainerInfoDoc) -> Self {
        Self {
            id: doc.id,
            labels: doc.labels.unwrap_or_default(),
            image: doc.image,
            // Unset timestamps come back as the zero time.
            created_at: doc.created_at.filter(|t| t.timestamp() > 0),
        }
    }
}

/// Parse `ctr containers info` output.
pub fn parse_container_info(output: &str) -> Result<ContainerRecord> {
    let doc: ContainerInfoDoc = serde_json::from_str(output)?;
    Ok(doc.into())
}

/// Parse the `TASK PID STATUS` table printed by `ctr tasks ls`.
pub fn parse_task_list(output: &str) -> HashMap<String, TaskInfo> {
    output
        .lines()
        .skip_while(|l| l.trim_start().starts_with("TASK"))
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let id = cols.next()?;
            let pid = cols.next()?.parse::<u32>().ok()?;
            let status = TaskState::parse(cols.next().unwrap_or_default());
            Some((
                id.to_string(),
                TaskInfo {
                    pid,
                    status,
                    exit_status: None,
                    exited_at: None,
                },
            ))
        })
        .collect()
}

fn is_not_found(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("not found")
}

/// [`SupervisorClient`] backed by the `ctr` CLI.
#[derive(Debug, Clone)]
pub struct CtrClient {
    binary: PathBuf,
    address: PathBuf,
    namespace: String,
    cgroups: CgroupRoots,
    poll_interval: Duration,
}

impl CtrClient {
    /// Client for the supervisor at `address`, scoped to `namespace`.
    pub fn new(address: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            binary: PathBuf::from("ctr"),
            address: address.into(),
            namespace: namespace.into(),
            cgroups: CgroupRoots::default(),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Use a different `ctr` binary.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        debug!(namespace = %self.namespace, args = ?args.iter().take(2).collect::<Vec<_>>(), "Invoking supervisor CLI");
        let output = Command::new(&self.binary)
            .arg("--address")
            .arg(&self.address)
            .arg("--namespace")
            .arg(&self.namespace)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_not_found(&stderr) {
            return Err(Error::NotFound(stderr));
        }
        Err(Error::runtime(format!(
            "ctr {} failed ({}): {}",
            args.iter().take(2).cloned().collect::<Vec<_>>().join(" "),
            output.status,
            stderr
        )))
    }

    async fn tasks(&self) -> Result<HashMap<String, TaskInfo>> {
        let out = self.run(&args(&["tasks", "ls"])).await?;
        Ok(parse_task_list(&out))
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl SupervisorClient for CtrClient {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let out = self.run(&args(&["images", "ls", "-q"])).await?;
        Ok(out.lines().any(|l| l.trim() == image))
    }

    async fn pull(&self, image: &str, options: &PullOptions) -> Result<()> {
        let mut cmd = args(&["images", "pull"]);
        if options.plain_http {
            cmd.push("--plain-http".to_string());
        }
        if !options.snapshotter.is_empty() {
            cmd.push("--snapshotter".to_string());
            cmd.push(options.snapshotter.clone());
        }
        cmd.push(image.to_string());
        self.run(&cmd).await.map(|_| ())
    }

    async fn create_container(&self, spec: &WorkerSpec) -> Result<()> {
        let mut cmd = args(&["containers", "create"]);
        cmd.push("--snapshotter".to_string());
        cmd.push(spec.snapshotter.clone());
        if let Some(runtime) = &spec.runtime {
            cmd.push("--runtime".to_string());
            cmd.push(runtime.clone());
        }
        let mut labels: Vec<_> = spec.labels.iter().collect();
        labels.sort();
        for (k, v) in labels {
            cmd.push("--label".to_string());
            cmd.push(format!("{}={}", k, v));
        }
        let mut env: Vec<_> = spec.env.iter().collect();
        env.sort();
        for (k, v) in env {
            cmd.push("--env".to_string());
            cmd.push(format!("{}={}", k, v));
        }
        for mount in &spec.mounts {
            cmd.push("--mount".to_string());
            cmd.push(mount.to_ctr_arg());
        }
        if let Some(limit) = spec.memory_limit {
            cmd.push("--memory-limit".to_string());
            cmd.push(limit.to_string());
        }
        cmd.push(spec.image.clone());
        cmd.push(spec.id.clone());
        self.run(&cmd).await.map(|_| ())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        self.run(&args(&["containers", "delete", id])).await.map(|_| ())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let out = self.run(&args(&["containers", "ls", "-q"])).await?;
        let mut records = Vec::new();
        for id in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match self.container(id).await {
                Ok(record) => records.push(record),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn container(&self, id: &str) -> Result<ContainerRecord> {
        let out = self.run(&args(&["containers", "info", id])).await?;
        parse_container_info(&out)
    }

    async fn create_task(&self, id: &str) -> Result<()> {
        self.run(&args(&["tasks", "start", "--detach", id])).await.map(|_| ())
    }

    async fn start_task(&self, id: &str) -> Result<u32> {
        for _ in 0..50 {
            match self.tasks().await?.remove(id) {
                Some(task) if task.status == TaskState::Running && task.pid > 0 => return Ok(task.pid),
                Some(task) if task.status == TaskState::Stopped => {
                    return Err(Error::runtime(format!("task {} exited during start", id)));
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
        Err(Error::runtime(format!("task {} did not reach RUNNING", id)))
    }

    async fn task(&self, id: &str) -> Result<Option<TaskInfo>> {
        Ok(self.tasks().await?.remove(id))
    }

    async fn kill_task(&self, id: &str, signal: Signal) -> Result<()> {
        self.run(&args(&["tasks", "kill", "--signal", signal.as_str(), id]))
            .await
            .map(|_| ())
    }

    async fn wait_task(&self, id: &str) -> Result<()> {
        loop {
            match self.tasks().await?.get(id) {
                None => return Ok(()),
                Some(task) if task.status == TaskState::Stopped => return Ok(()),
                Some(_) => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    async fn delete_task(&self, id: &str, kill: bool) -> Result<()> {
        let mut cmd = args(&["tasks", "delete"]);
        if kill {
            cmd.push("--force".to_string());
        }
        cmd.push(id.to_string());
        self.run(&cmd).await.map(|_| ())
    }

    async fn pause_task(&self, id: &str) -> Result<()> {
        self.run(&args(&["tasks", "pause", id])).await.map(|_| ())
    }

    async fn resume_task(&self, id: &str) -> Result<()> {
        self.run(&args(&["tasks", "resume", id])).await.map(|_| ())
    }

    async fn task_metrics(&self, id: &str) -> Result<Option<MetricsEnvelope>> {
        let task = self
            .task(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {} not found", id)))?;
        if task.pid == 0 {
            return Ok(None);
        }
        Ok(collect_from_pid(&self.cgroups, task.pid).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_list() {
        let out = "TASK                       PID     STATUS\n\
                   acme-prod-echo-0a1b2c3d    4242    RUNNING\n\
                   acme-prod-echo-ffff0000    0       STOPPED\n\
                   acme-prod-cat-12345678     77      PAUSED\n";
        let tasks = parse_task_list(out);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks["acme-prod-echo-0a1b2c3d"].pid, 4242);
        assert_eq!(tasks["acme-prod-echo-0a1b2c3d"].status, TaskState::Running);
        assert_eq!(tasks["acme-prod-echo-ffff0000"].status, TaskState::Stopped);
        assert_eq!(tasks["acme-prod-cat-12345678"].status, TaskState::Paused);
    }

    #[test]
    fn test_parse_container_info() {
        let out = r#"{
            "ID": "acme-prod-echo-0a1b2c3d",
            "Labels": {"acme_function": "echo", "created_by": "acme-agent"},
            "Image": "registry:5000/acme-echo:latest",
            "Runtime": {"Name": "io.containerd.runc.v2"},
            "SnapshotKey": "acme-prod-echo-0a1b2c3d",
            "Snapshotter": "overlayfs",
            "CreatedAt": "2025-03-04T05:06:07.89Z"
        }"#;
        let record = parse_container_info(out).unwrap();
        assert_eq!(record.id, "acme-prod-echo-0a1b2c3d");
        assert_eq!(record.labels.get("acme_function").map(String::as_str), Some("echo"));
        assert!(record.created_at.is_some());

        let zero = r#"{"ID": "x", "Labels": null, "CreatedAt": "0001-01-01T00:00:00Z"}"#;
        let record = parse_container_info(zero).unwrap();
        assert!(record.labels.is_empty());
        assert!(record.created_at.is_none());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found("ctr: container \"x\" in namespace \"acme\": not found"));
        assert!(is_not_found("ctr: no running task found: task x not found: not found"));
        assert!(!is_not_found("ctr: permission denied"));
    }
}
