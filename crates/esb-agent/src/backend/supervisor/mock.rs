// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory supervisor for backend tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::Signal;

use super::client::{ContainerRecord, PullOptions, SupervisorClient, TaskInfo};
use super::oci::WorkerSpec;
use crate::error::{Error, Result};
use crate::metrics::{MetricsEnvelope, TaskState};

/// Operation a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorStage {
    /// Image pull.
    Pull,
    /// Container creation.
    CreateContainer,
    /// Task creation.
    CreateTask,
    /// Task creation that reports failure after the task exists.
    CreateTaskLate,
    /// Task start.
    StartTask,
    /// Task status lookup.
    TaskStatus,
    /// Container deletion.
    DeleteContainer,
}

#[derive(Debug, Default)]
struct State {
    images: HashSet<String>,
    containers: HashMap<String, (ContainerRecord, WorkerSpec)>,
    tasks: HashMap<String, TaskInfo>,
    failures: HashSet<SupervisorStage>,
    metrics: HashMap<String, MetricsEnvelope>,
    pulls: Vec<(String, PullOptions)>,
    calls: Vec<String>,
    next_pid: u32,
}

/// In-memory [`SupervisorClient`].
#[derive(Debug, Clone, Default)]
pub struct MockSupervisor {
    state: Arc<Mutex<State>>,
}

impl MockSupervisor {
    /// Empty supervisor with no images.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `stage` fail until cleared.
    pub fn fail_at(&self, stage: SupervisorStage) {
        self.lock().failures.insert(stage);
    }

    /// Clear every injected failure.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Mark `image` as already present.
    pub fn add_image(&self, image: &str) {
        self.lock().images.insert(image.to_string());
    }

    /// Insert a container with `labels` and optionally a task in `status`.
    pub fn insert_container(&self, id: &str, labels: HashMap<String, String>, task: Option<TaskState>) {
        let mut state = self.lock();
        let record = ContainerRecord {
            id: id.to_string(),
            labels: labels.clone(),
            created_at: Some(Utc::now()),
            image: String::new(),
        };
        let spec = WorkerSpec {
            id: id.to_string(),
            labels,
            ..Default::default()
        };
        state.containers.insert(id.to_string(), (record, spec));
        if let Some(status) = task {
            state.next_pid += 1;
            let pid = 4000 + state.next_pid;
            state.tasks.insert(
                id.to_string(),
                TaskInfo {
                    pid,
                    status,
                    exit_status: None,
                    exited_at: None,
                },
            );
        }
    }

    /// Overwrite the task of `id`.
    pub fn set_task(&self, id: &str, task: TaskInfo) {
        self.lock().tasks.insert(id.to_string(), task);
    }

    /// Metrics returned for `id`.
    pub fn set_metrics(&self, id: &str, envelope: MetricsEnvelope) {
        self.lock().metrics.insert(id.to_string(), envelope);
    }

    /// Container ids, sorted.
    pub fn containers(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids that have a task, sorted.
    pub fn tasks(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Spec a container was created with.
    pub fn spec_of(&self, id: &str) -> Option<WorkerSpec> {
        self.lock().containers.get(id).map(|(_, spec)| spec.clone())
    }

    /// Pulled images with their options.
    pub fn pulls(&self) -> Vec<(String, PullOptions)> {
        self.lock().pulls.clone()
    }

    /// Every call as `op:id`, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }
}

fn injected(stage: SupervisorStage) -> Error {
    Error::runtime(format!("injected {:?} failure", stage))
}

fn missing(kind: &str, id: &str) -> Error {
    Error::NotFound(format!("{} {} not found", kind, id))
}

impl State {
    fn record(&mut self, op: &str, id: &str) {
        self.calls.push(format!("{}:{}", op, id));
    }

    fn check(&self, stage: SupervisorStage) -> Result<()> {
        if self.failures.contains(&stage) {
            return Err(injected(stage));
        }
        Ok(())
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut TaskInfo> {
        self.tasks.get_mut(id).ok_or_else(|| missing("task", id))
    }
}

#[async_trait]
impl SupervisorClient for MockSupervisor {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.lock().images.contains(image))
    }

    async fn pull(&self, image: &str, options: &PullOptions) -> Result<()> {
        let mut state = self.lock();
        state.record("pull", image);
        state.check(SupervisorStage::Pull)?;
        state.pulls.push((image.to_string(), options.clone()));
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &WorkerSpec) -> Result<()> {
        let mut state = self.lock();
        state.record("create_container", &spec.id);
        state.check(SupervisorStage::CreateContainer)?;
        if state.containers.contains_key(&spec.id) {
            return Err(Error::Conflict(format!("container {} already exists", spec.id)));
        }
        let record = ContainerRecord {
            id: spec.id.clone(),
            labels: spec.labels.clone(),
            created_at: Some(Utc::now()),
            image: spec.image.clone(),
        };
        state.containers.insert(spec.id.clone(), (record, spec.clone()));
        Ok(())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("delete_container", id);
        state.check(SupervisorStage::DeleteContainer)?;
        if state.tasks.contains_key(id) {
            return Err(Error::runtime(format!("container {} still has a task", id)));
        }
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| missing("container", id))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let state = self.lock();
        let mut records: Vec<_> = state.containers.values().map(|(r, _)| r.clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn container(&self, id: &str) -> Result<ContainerRecord> {
        self.lock()
            .containers
            .get(id)
            .map(|(r, _)| r.clone())
            .ok_or_else(|| missing("container", id))
    }

    async fn create_task(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("create_task", id);
        state.check(SupervisorStage::CreateTask)?;
        if !state.containers.contains_key(id) {
            return Err(missing("container", id));
        }
        state.next_pid += 1;
        let pid = 4000 + state.next_pid;
        state.tasks.insert(
            id.to_string(),
            TaskInfo {
                pid,
                status: TaskState::Created,
                exit_status: None,
                exited_at: None,
            },
        );
        state.check(SupervisorStage::CreateTaskLate)
    }

    async fn start_task(&self, id: &str) -> Result<u32> {
        let mut state = self.lock();
        state.record("start_task", id);
        state.check(SupervisorStage::StartTask)?;
        let task = state.task_mut(id)?;
        task.status = TaskState::Running;
        Ok(task.pid)
    }

    async fn task(&self, id: &str) -> Result<Option<TaskInfo>> {
        let state = self.lock();
        state.check(SupervisorStage::TaskStatus)?;
        Ok(state.tasks.get(id).cloned())
    }

    async fn kill_task(&self, id: &str, signal: Signal) -> Result<()> {
        let mut state = self.lock();
        state.record(&format!("kill_task[{}]", signal.as_str()), id);
        let task = state.task_mut(id)?;
        if signal == Signal::SIGKILL {
            task.status = TaskState::Stopped;
            task.exit_status = Some(137);
            task.exited_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn wait_task(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("wait_task", id);
        let task = state.task_mut(id)?;
        if task.status != TaskState::Stopped {
            return Err(Error::runtime(format!("task {} would block", id)));
        }
        Ok(())
    }

    async fn delete_task(&self, id: &str, kill: bool) -> Result<()> {
        let mut state = self.lock();
        state.record(if kill { "delete_task[kill]" } else { "delete_task" }, id);
        let task = state.tasks.get(id).ok_or_else(|| missing("task", id))?;
        if !kill && task.status == TaskState::Running {
            return Err(Error::runtime(format!("task {} is running", id)));
        }
        state.tasks.remove(id);
        Ok(())
    }

    async fn pause_task(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("pause_task", id);
        state.task_mut(id)?.status = TaskState::Paused;
        Ok(())
    }

    async fn resume_task(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("resume_task", id);
        state.task_mut(id)?.status = TaskState::Running;
        Ok(())
    }

    async fn task_metrics(&self, id: &str) -> Result<Option<MetricsEnvelope>> {
        let state = self.lock();
        if !state.tasks.contains_key(id) {
            return Err(missing("task", id));
        }
        Ok(state.metrics.get(id).cloned())
    }
}
