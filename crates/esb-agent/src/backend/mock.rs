// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock backend for testing.
//!
//! Keeps workers in memory and hands out sequential IPs. Used by the janitor
//! and RPC server tests where no real runtime is available.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::traits::*;
use crate::access::AccessTracker;
use crate::config::RuntimeKind;
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::network::WORKER_PORT;

/// In-memory worker.
#[derive(Debug, Clone)]
pub struct MockWorker {
    /// Function label. Empty simulates a worker missing the label.
    pub function_name: String,
    /// Owner label.
    pub owner_id: String,
    /// Current status.
    pub status: WorkerStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Assigned IP.
    pub ip_address: String,
}

impl MockWorker {
    /// A running worker created now.
    pub fn running(function_name: &str, owner_id: &str) -> Self {
        Self {
            function_name: function_name.to_string(),
            owner_id: owner_id.to_string(),
            status: WorkerStatus::Running,
            created_at: Utc::now(),
            ip_address: "10.88.0.250".to_string(),
        }
    }

    /// Same worker, created `age` ago.
    pub fn aged(mut self, age: chrono::Duration) -> Self {
        self.created_at = Utc::now() - age;
        self
    }

    /// Same worker, with `status`.
    pub fn with_status(mut self, status: WorkerStatus) -> Self {
        self.status = status;
        self
    }
}

/// Mock backend for testing.
pub struct MockBackend {
    workers: Arc<Mutex<HashMap<String, MockWorker>>>,
    access: Arc<AccessTracker>,
    next_ip: AtomicU32,
    destroyed: Arc<Mutex<Vec<String>>>,
    /// If true, `ensure` fails with a runtime error.
    pub fail_ensure: bool,
    /// Kind reported by [`Backend::kind`].
    pub kind: RuntimeKind,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            access: Arc::new(AccessTracker::new()),
            next_ip: AtomicU32::new(2),
            destroyed: Arc::new(Mutex::new(Vec::new())),
            fail_ensure: false,
            kind: RuntimeKind::Supervisor,
        }
    }

    /// Create a mock backend whose `ensure` always fails.
    pub fn failing() -> Self {
        Self {
            fail_ensure: true,
            ..Self::new()
        }
    }

    /// The access tracker behind `touch`.
    pub fn access(&self) -> &Arc<AccessTracker> {
        &self.access
    }

    /// Insert a worker directly, bypassing `ensure`.
    pub async fn insert(&self, id: &str, worker: MockWorker) {
        self.workers.lock().await.insert(id.to_string(), worker);
    }

    /// Ids passed to a successful `destroy`, in order.
    pub async fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().await.clone()
    }

    /// Number of live workers.
    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Status of a worker, if present.
    pub async fn status_of(&self, id: &str) -> Option<WorkerStatus> {
        self.workers.lock().await.get(id).map(|w| w.status)
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    async fn ensure(&self, ctx: &OpContext, req: EnsureRequest) -> Result<Worker> {
        let owner = validate_ensure(&req)?;
        ctx.check()?;
        if self.fail_ensure {
            return Err(Error::runtime("mock ensure failure"));
        }

        let n = self.next_ip.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-{}-{:08x}", req.function_name, n);
        let ip = format!("10.88.{}.{}", n / 256, n % 256);
        self.workers.lock().await.insert(
            id.clone(),
            MockWorker {
                function_name: req.function_name.clone(),
                owner_id: owner.clone(),
                status: WorkerStatus::Running,
                created_at: Utc::now(),
                ip_address: ip.clone(),
            },
        );
        self.access.touch(&id);

        Ok(Worker {
            name: id.clone(),
            id,
            ip_address: ip,
            port: WORKER_PORT,
            owner_id: owner,
        })
    }

    async fn destroy(&self, _ctx: &OpContext, id: &str) -> Result<()> {
        let removed = self.workers.lock().await.remove(id);
        self.access.forget(id);
        match removed {
            Some(_) => {
                self.destroyed.lock().await.push(id.to_string());
                Ok(())
            }
            None => Err(Error::worker_not_found(id)),
        }
    }

    async fn pause(&self, _ctx: &OpContext, id: &str) -> Result<()> {
        let mut workers = self.workers.lock().await;
        let worker = workers.get_mut(id).ok_or_else(|| Error::worker_not_found(id))?;
        worker.status = WorkerStatus::Paused;
        Ok(())
    }

    async fn resume(&self, _ctx: &OpContext, id: &str) -> Result<()> {
        let mut workers = self.workers.lock().await;
        let worker = workers.get_mut(id).ok_or_else(|| Error::worker_not_found(id))?;
        worker.status = WorkerStatus::Running;
        self.access.touch(id);
        Ok(())
    }

    async fn list(&self, _ctx: &OpContext) -> Result<Vec<WorkerState>> {
        let workers = self.workers.lock().await;
        let mut states: Vec<WorkerState> = workers
            .iter()
            .map(|(id, w)| {
                let last = self.access.get(id);
                WorkerState {
                    id: id.clone(),
                    function_name: w.function_name.clone(),
                    owner_id: w.owner_id.clone(),
                    status: w.status,
                    created_at: w.created_at,
                    last_used_at: last.unwrap_or(w.created_at),
                    has_access_record: last.is_some(),
                    ip_address: Some(w.ip_address.clone()),
                    port: WORKER_PORT,
                    container_name: id.clone(),
                }
            })
            .collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(states)
    }

    async fn metrics(&self, _ctx: &OpContext, id: &str) -> Result<ContainerMetrics> {
        let workers = self.workers.lock().await;
        let worker = workers.get(id).ok_or_else(|| Error::worker_not_found(id))?;
        let state = match worker.status {
            WorkerStatus::Running => "RUNNING",
            WorkerStatus::Paused => "PAUSED",
            WorkerStatus::Stopped => "STOPPED",
            _ => "UNKNOWN",
        };
        Ok(ContainerMetrics::empty(id, &worker.function_name, state))
    }

    async fn gc(&self, _ctx: &OpContext) -> Result<()> {
        let ids: Vec<String> = self.workers.lock().await.drain().map(|(id, _)| id).collect();
        for id in ids {
            self.access.forget(&id);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn touch(&self, id: &str) {
        self.access.touch(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(function: &str, owner: &str) -> EnsureRequest {
        EnsureRequest {
            function_name: function.to_string(),
            owner_id: owner.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let backend = MockBackend::new();
        let ctx = OpContext::background();

        let worker = backend.ensure(&ctx, request("echo", "t1")).await.unwrap();
        assert_eq!(worker.port, 8080);
        assert_eq!(worker.owner_id, "t1");

        backend.pause(&ctx, &worker.id).await.unwrap();
        assert_eq!(backend.status_of(&worker.id).await, Some(WorkerStatus::Paused));
        backend.resume(&ctx, &worker.id).await.unwrap();

        let list = backend.list(&ctx).await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].has_access_record);

        backend.destroy(&ctx, &worker.id).await.unwrap();
        assert!(backend.destroy(&ctx, &worker.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_mock_requires_owner() {
        let backend = MockBackend::new();
        let err = backend
            .ensure(&OpContext::background(), request("echo", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(backend.len().await, 0);
    }
}
