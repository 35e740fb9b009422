// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Janitor sweeps over the mock and supervisor backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::{TestContext, ensure_request};
use esb_agent::backend::mock::MockWorker;
use esb_agent::backend::{Backend, WorkerStatus};
use esb_agent::context::OpContext;
use esb_agent::janitor::{Janitor, JanitorConfig};
use esb_agent::MockBackend;

fn config() -> JanitorConfig {
    JanitorConfig {
        interval: Duration::from_millis(20),
        idle_timeout: Duration::from_secs(300),
        orphan_grace: Duration::from_secs(60),
        operation_timeout: Duration::from_secs(5),
    }
}

// ============================================================================
// Sweep Tests
// ============================================================================

#[tokio::test]
async fn test_sweep_reaps_idle_and_keeps_fresh() {
    let backend = Arc::new(MockBackend::new());
    backend.insert("idle", MockWorker::running("echo", "t").aged(chrono::Duration::minutes(20))).await;
    backend.insert("fresh", MockWorker::running("echo", "t").aged(chrono::Duration::minutes(20))).await;
    backend.access().touch_at("idle", Utc::now() - chrono::Duration::minutes(10));
    backend.access().touch("fresh");

    let janitor = Janitor::new(backend.clone(), config());
    let report = janitor.sweep().await.unwrap();

    assert_eq!(report.scanned, 2);
    assert_eq!(report.reaped, vec!["idle".to_string()]);
    assert_eq!(report.errors, 0);
    assert_eq!(backend.destroyed().await, vec!["idle".to_string()]);
    assert!(backend.access().get("idle").is_none());
}

#[tokio::test]
async fn test_sweep_reaps_untracked_after_grace() {
    let backend = Arc::new(MockBackend::new());
    backend.insert("orphan", MockWorker::running("echo", "t").aged(chrono::Duration::minutes(2))).await;
    backend.insert("young", MockWorker::running("echo", "t").aged(chrono::Duration::seconds(10))).await;

    let report = Janitor::new(backend.clone(), config()).sweep().await.unwrap();

    assert_eq!(report.reaped, vec!["orphan".to_string()]);
    assert_eq!(backend.len().await, 1);
    assert!(backend.status_of("young").await.is_some());
}

#[tokio::test]
async fn test_sweep_reaps_unlabeled_immediately() {
    let backend = Arc::new(MockBackend::new());
    backend.insert("nolabel", MockWorker::running("", "t")).await;
    backend.access().touch("nolabel");

    let report = Janitor::new(backend.clone(), config()).sweep().await.unwrap();
    assert_eq!(report.reaped, vec!["nolabel".to_string()]);
}

#[tokio::test]
async fn test_sweep_leaves_stopped_tracked_workers() {
    let backend = Arc::new(MockBackend::new());
    backend
        .insert(
            "stopped",
            MockWorker::running("echo", "t")
                .aged(chrono::Duration::hours(1))
                .with_status(WorkerStatus::Stopped),
        )
        .await;
    backend.access().touch_at("stopped", Utc::now() - chrono::Duration::minutes(30));

    let report = Janitor::new(backend.clone(), config()).sweep().await.unwrap();
    assert!(report.reaped.is_empty());
    assert_eq!(backend.len().await, 1);
}

#[tokio::test]
async fn test_sweep_reaps_idle_paused_worker() {
    let backend = Arc::new(MockBackend::new());
    backend
        .insert(
            "paused",
            MockWorker::running("echo", "t")
                .aged(chrono::Duration::hours(1))
                .with_status(WorkerStatus::Paused),
        )
        .await;
    backend.access().touch_at("paused", Utc::now() - chrono::Duration::minutes(6));

    let report = Janitor::new(backend.clone(), config()).sweep().await.unwrap();
    assert_eq!(report.reaped, vec!["paused".to_string()]);
}

// ============================================================================
// Run Loop Tests
// ============================================================================

#[tokio::test]
async fn test_run_sweeps_until_shutdown() {
    let backend = Arc::new(MockBackend::new());
    backend.insert("orphan", MockWorker::running("echo", "t").aged(chrono::Duration::hours(1))).await;

    let janitor = Arc::new(Janitor::new(backend.clone(), config()));
    let shutdown = janitor.shutdown_handle();
    let handle = tokio::spawn({
        let janitor = janitor.clone();
        async move { janitor.run().await }
    });

    for _ in 0..100 {
        if backend.len().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(backend.len().await, 0);

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("janitor stops after shutdown")
        .unwrap();
}

// ============================================================================
// Supervisor Backend Tests
// ============================================================================

#[tokio::test]
async fn test_reaping_supervisor_worker_releases_resources() {
    let ctx = TestContext::new();
    let op = OpContext::background();
    let worker = ctx.backend.ensure(&op, ensure_request("echo", "tenant-a")).await.unwrap();
    assert_eq!(ctx.ports.reserved_count(), 1);

    ctx.backend
        .access()
        .touch_at(&worker.id, Utc::now() - chrono::Duration::minutes(10));

    let report = Janitor::new(ctx.backend.clone(), config()).sweep().await.unwrap();

    assert_eq!(report.reaped, vec![worker.id.clone()]);
    assert!(ctx.supervisor.containers().is_empty());
    assert_eq!(ctx.ports.reserved_count(), 0);
    assert!(!ctx.ip_file(&worker.id).exists());
    assert!(ctx.backend.list(&op).await.unwrap().is_empty());
}
