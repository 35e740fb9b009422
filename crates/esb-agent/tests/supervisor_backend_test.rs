// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the supervisor backend over an in-memory supervisor and CNI plugin.

mod common;

use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{BRAND, ENV, TestContext, ensure_request};
use esb_agent::backend::supervisor::{SupervisorStage, TaskInfo};
use esb_agent::backend::{Backend, Labels, WorkerStatus};
use esb_agent::context::OpContext;
use esb_agent::error::Error;
use esb_agent::identity::Identity;
use esb_agent::metrics::{CGROUP_V2_TYPE_URL, MetricsEnvelope, TaskState};
use esb_agent::network::MockAddOutcome;

/// Assert that nothing from a failed ensure is left behind.
fn assert_clean(ctx: &TestContext) {
    assert!(ctx.supervisor.containers().is_empty(), "containers left: {:?}", ctx.supervisor.containers());
    assert!(ctx.supervisor.tasks().is_empty(), "tasks left: {:?}", ctx.supervisor.tasks());
    assert!(ctx.plugin.attached().is_empty(), "attachments left: {:?}", ctx.plugin.attached());
    assert_eq!(ctx.ports.reserved_count(), 0);
    assert!(ctx.backend.access().is_empty());
}

// ============================================================================
// Ensure Tests
// ============================================================================

#[tokio::test]
async fn test_ensure_creates_networked_worker() {
    let ctx = TestContext::new();
    let op = OpContext::background();

    let worker = ctx.backend.ensure(&op, ensure_request("echo", "tenant-a")).await.unwrap();

    assert!(worker.id.starts_with(&format!("{}-{}-echo-", BRAND, ENV)));
    assert_eq!(worker.name, worker.id);
    assert_eq!(worker.port, 8080);
    assert_eq!(worker.owner_id, "tenant-a");
    assert_eq!(worker.ip_address, "10.88.0.2");

    assert_eq!(ctx.supervisor.containers(), vec![worker.id.clone()]);
    assert_eq!(ctx.supervisor.tasks(), vec![worker.id.clone()]);
    assert_eq!(ctx.plugin.attached(), vec![worker.id.clone()]);
    assert_eq!(ctx.fabric.host_port(&worker.id), Some(41000));
    assert!(ctx.backend.access().get(&worker.id).is_some());

    // Image pulled once under the brand name, with the default snapshotter.
    let pulls = ctx.supervisor.pulls();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].0, "acme-echo:latest");
    assert_eq!(pulls[0].1.snapshotter, "overlayfs");

    // IP side file for the gateway.
    let ip = std::fs::read_to_string(ctx.ip_file(&worker.id)).unwrap();
    assert_eq!(ip.trim(), "10.88.0.2");

    // Port mapping passed to CNI.
    let req = ctx.plugin.request_for(&worker.id).unwrap();
    assert_eq!(req.port_mappings.len(), 1);
    assert_eq!(req.port_mappings[0].host_port, 41000);
    assert_eq!(req.port_mappings[0].container_port, 8080);
}

#[tokio::test]
async fn test_ensure_spec_carries_labels_mounts_and_memory() {
    let ctx = TestContext::new();
    let mut req = ensure_request("echo", "tenant-a");
    req.env = HashMap::from([
        ("AWS_LAMBDA_FUNCTION_MEMORY_SIZE".to_string(), "128".to_string()),
        ("GREETING".to_string(), "hi".to_string()),
    ]);

    let worker = ctx.backend.ensure(&OpContext::background(), req).await.unwrap();
    let spec = ctx.supervisor.spec_of(&worker.id).unwrap();

    assert_eq!(spec.labels, ctx.worker_labels("echo", "tenant-a"));
    assert_eq!(spec.env.get("GREETING").map(String::as_str), Some("hi"));
    assert_eq!(spec.memory_limit, Some(128 * 1024 * 1024));

    // resolv.conf written once and bind-mounted read-only.
    assert_eq!(spec.mounts.len(), 1);
    assert_eq!(spec.mounts[0].destination, "/etc/resolv.conf");
    assert!(spec.mounts[0].options.iter().any(|o| o == "ro"));
    let resolv = std::fs::read_to_string(ctx.temp_dir.path().join("resolv.conf")).unwrap();
    assert!(resolv.contains("nameserver 10.88.0.1"));
}

#[tokio::test]
async fn test_ensure_skips_pull_for_present_image() {
    let ctx = TestContext::new();
    ctx.supervisor.add_image("acme-echo:latest");

    ctx.backend
        .ensure(&OpContext::background(), ensure_request("echo", "tenant-a"))
        .await
        .unwrap();
    assert!(ctx.supervisor.pulls().is_empty());
}

#[tokio::test]
async fn test_ensure_rejects_missing_owner() {
    let ctx = TestContext::new();
    let err = ctx
        .backend
        .ensure(&OpContext::background(), ensure_request("echo", "  "))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(ctx.supervisor.calls().is_empty());
}

#[tokio::test]
async fn test_concurrent_ensures_create_distinct_workers() {
    let ctx = TestContext::new();
    let op = OpContext::background();

    let (a, b) = tokio::join!(
        ctx.backend.ensure(&op, ensure_request("echo", "tenant-a")),
        ctx.backend.ensure(&op, ensure_request("echo", "tenant-a")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.id, b.id);
    assert_ne!(a.ip_address, b.ip_address);
    assert_eq!(ctx.ports.reserved_count(), 2);
}

#[tokio::test]
async fn test_port_pool_exhaustion_rolls_back_extra_workers() {
    let ctx = TestContext::new();
    let op = OpContext::background();

    let results = futures::future::join_all(
        (0..12).map(|_| ctx.backend.ensure(&op, ensure_request("echo", "tenant-a"))),
    )
    .await;

    let (ok, failed): (Vec<_>, Vec<_>) = results.into_iter().partition(|r| r.is_ok());
    assert_eq!(ok.len(), 10);
    assert_eq!(failed.len(), 2);
    for err in failed.into_iter().filter_map(Result::err) {
        assert_eq!(err.rpc_code(), "RESOURCE_EXHAUSTED");
    }
    assert_eq!(ctx.ports.reserved_count(), 10);
    assert_eq!(ctx.supervisor.containers().len(), 10);
}

// ============================================================================
// Rollback Tests
// ============================================================================

#[tokio::test]
async fn test_rollback_on_pull_failure() {
    let ctx = TestContext::new();
    ctx.supervisor.fail_at(SupervisorStage::Pull);

    let err = ctx
        .backend
        .ensure(&OpContext::background(), ensure_request("echo", "tenant-a"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to pull image acme-echo:latest"));
    assert_clean(&ctx);
}

#[tokio::test]
async fn test_rollback_on_create_container_failure() {
    let ctx = TestContext::new();
    ctx.supervisor.fail_at(SupervisorStage::CreateContainer);

    let err = ctx
        .backend
        .ensure(&OpContext::background(), ensure_request("echo", "tenant-a"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to create container"));
    assert_clean(&ctx);
}

#[tokio::test]
async fn test_rollback_on_create_task_failure() {
    let ctx = TestContext::new();
    ctx.supervisor.fail_at(SupervisorStage::CreateTask);

    let err = ctx
        .backend
        .ensure(&OpContext::background(), ensure_request("echo", "tenant-a"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to create task"));
    assert_clean(&ctx);
    assert!(ctx.supervisor.calls().iter().any(|c| c.starts_with("delete_container:")));
}

#[tokio::test]
async fn test_rollback_when_task_exists_despite_create_failure() {
    let ctx = TestContext::new();
    ctx.supervisor.fail_at(SupervisorStage::CreateTaskLate);

    let err = ctx
        .backend
        .ensure(&OpContext::background(), ensure_request("echo", "tenant-a"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to create task"));
    assert_clean(&ctx);

    let calls = ctx.supervisor.calls();
    let delete_task = calls.iter().position(|c| c.starts_with("delete_task[kill]:")).unwrap();
    let delete_container = calls.iter().position(|c| c.starts_with("delete_container:")).unwrap();
    assert!(delete_task < delete_container);
}

#[tokio::test]
async fn test_rollback_on_start_task_failure() {
    let ctx = TestContext::new();
    ctx.supervisor.fail_at(SupervisorStage::StartTask);

    let err = ctx
        .backend
        .ensure(&OpContext::background(), ensure_request("echo", "tenant-a"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to start task"));
    assert_clean(&ctx);

    let calls = ctx.supervisor.calls();
    let delete_task = calls.iter().position(|c| c.starts_with("delete_task[kill]:")).unwrap();
    let delete_container = calls.iter().position(|c| c.starts_with("delete_container:")).unwrap();
    assert!(delete_task < delete_container);
}

#[tokio::test]
async fn test_rollback_on_network_failure() {
    let ctx = TestContext::new();
    ctx.plugin.script([MockAddOutcome::Fail("bridge exploded".to_string())]);

    let err = ctx
        .backend
        .ensure(&OpContext::background(), ensure_request("echo", "tenant-a"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bridge exploded"));
    assert_eq!(ctx.plugin.add_calls(), 1);
    assert_clean(&ctx);
}

#[tokio::test]
async fn test_rollback_when_result_has_no_worker_ip() {
    let ctx = TestContext::new();
    ctx.plugin.script([MockAddOutcome::HostSideOnly]);

    let err = ctx
        .backend
        .ensure(&OpContext::background(), ensure_request("echo", "tenant-a"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no worker IPv4"));
    assert_eq!(ctx.plugin.del_calls().len(), 1);
    assert_clean(&ctx);
}

#[tokio::test]
async fn test_link_not_found_is_retried() {
    let ctx = TestContext::new();
    ctx.plugin
        .script([MockAddOutcome::LinkNotFound, MockAddOutcome::LinkNotFound]);

    let worker = ctx
        .backend
        .ensure(&OpContext::background(), ensure_request("echo", "tenant-a"))
        .await
        .unwrap();
    assert_eq!(ctx.plugin.add_calls(), 3);
    assert_eq!(ctx.plugin.attached(), vec![worker.id]);
    assert_eq!(ctx.ports.reserved_count(), 1);
}

#[tokio::test]
async fn test_link_not_found_gives_up_after_five_attempts() {
    let ctx = TestContext::new();
    ctx.plugin.script(std::iter::repeat_n(MockAddOutcome::LinkNotFound, 6));

    let err = ctx
        .backend
        .ensure(&OpContext::background(), ensure_request("echo", "tenant-a"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cni(_)));
    assert_eq!(ctx.plugin.add_calls(), 5);
    assert_clean(&ctx);
}

#[tokio::test]
async fn test_cancel_after_network_attach_rolls_back() {
    let ctx = TestContext::new();
    let token = CancellationToken::new();
    ctx.plugin.cancel_after_add(token.clone());

    let op = OpContext::with_token(token);
    let err = ctx
        .backend
        .ensure(&op, ensure_request("echo", "tenant-a"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(ctx.plugin.del_calls().len(), 1);
    assert_clean(&ctx);
}

#[tokio::test]
async fn test_cancelled_before_start_creates_nothing() {
    let ctx = TestContext::new();
    let op = OpContext::background();
    op.cancel();

    let err = ctx
        .backend
        .ensure(&op, ensure_request("echo", "tenant-a"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_clean(&ctx);
}

// ============================================================================
// Destroy / Pause / Resume Tests
// ============================================================================

#[tokio::test]
async fn test_destroy_tears_down_everything() {
    let ctx = TestContext::new();
    let op = OpContext::background();
    let worker = ctx.backend.ensure(&op, ensure_request("echo", "tenant-a")).await.unwrap();

    ctx.backend.destroy(&op, &worker.id).await.unwrap();

    assert_clean(&ctx);
    assert!(!ctx.ip_file(&worker.id).exists());
    let calls = ctx.supervisor.calls();
    assert!(calls.contains(&format!("kill_task[SIGKILL]:{}", worker.id)));
    assert!(calls.contains(&format!("wait_task:{}", worker.id)));
}

#[tokio::test]
async fn test_destroy_unknown_is_not_found() {
    let ctx = TestContext::new();
    let err = ctx
        .backend
        .destroy(&OpContext::background(), "acme-test-ghost-00000000")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_destroy_twice() {
    let ctx = TestContext::new();
    let op = OpContext::background();
    let worker = ctx.backend.ensure(&op, ensure_request("echo", "tenant-a")).await.unwrap();

    ctx.backend.destroy(&op, &worker.id).await.unwrap();
    assert!(ctx.backend.destroy(&op, &worker.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_pause_and_resume() {
    let ctx = TestContext::new();
    let op = OpContext::background();
    let worker = ctx.backend.ensure(&op, ensure_request("echo", "tenant-a")).await.unwrap();

    ctx.backend.pause(&op, &worker.id).await.unwrap();
    let list = ctx.backend.list(&op).await.unwrap();
    assert_eq!(list[0].status, WorkerStatus::Paused);

    let before = ctx.backend.access().get(&worker.id).unwrap();
    ctx.backend.resume(&op, &worker.id).await.unwrap();
    let list = ctx.backend.list(&op).await.unwrap();
    assert_eq!(list[0].status, WorkerStatus::Running);
    assert!(ctx.backend.access().get(&worker.id).unwrap() >= before);

    // A paused worker is still torn down completely.
    ctx.backend.pause(&op, &worker.id).await.unwrap();
    ctx.backend.destroy(&op, &worker.id).await.unwrap();
    assert_clean(&ctx);
}

// ============================================================================
// List Tests
// ============================================================================

#[tokio::test]
async fn test_list_reports_managed_workers_only() {
    let ctx = TestContext::new();
    let op = OpContext::background();
    let worker = ctx.backend.ensure(&op, ensure_request("echo", "tenant-a")).await.unwrap();

    // Another brand's worker and a stopped one of ours.
    let other = Labels::new(&Identity::from_slug("other").unwrap(), ENV);
    ctx.supervisor
        .insert_container("other-test-echo-1", other.for_worker("echo", "t"), Some(TaskState::Running));
    ctx.supervisor
        .insert_container("acme-test-old-1", ctx.worker_labels("old", "tenant-b"), None);
    // Another environment of the same brand.
    let staging = Labels::new(&ctx.identity, "staging");
    ctx.supervisor
        .insert_container("acme-staging-echo-1", staging.for_worker("echo", "t"), Some(TaskState::Running));

    let list = ctx.backend.list(&op).await.unwrap();
    let ids: Vec<&str> = list.iter().map(|w| w.id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&worker.id.as_str()));
    assert!(ids.contains(&"acme-test-old-1"));

    let live = list.iter().find(|w| w.id == worker.id).unwrap();
    assert_eq!(live.status, WorkerStatus::Running);
    assert_eq!(live.function_name, "echo");
    assert_eq!(live.owner_id, "tenant-a");
    assert_eq!(live.ip_address.as_deref(), Some("10.88.0.2"));
    assert_eq!(live.port, 8080);
    assert!(live.has_access_record);

    let stopped = list.iter().find(|w| w.id == "acme-test-old-1").unwrap();
    assert_eq!(stopped.status, WorkerStatus::Stopped);
    assert_eq!(stopped.ip_address, None);
    assert!(!stopped.has_access_record);
}

#[tokio::test]
async fn test_list_includes_unlabeled_workers() {
    let ctx = TestContext::new();
    let mut labels = ctx.worker_labels("echo", "tenant-a");
    labels.retain(|k, _| k == ctx.labels.created_by.as_str() || k == ctx.labels.env.as_str());
    ctx.supervisor.insert_container("acme-test-bare-1", labels, Some(TaskState::Running));

    let list = ctx.backend.list(&OpContext::background()).await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].function_name, "");
}

#[tokio::test]
async fn test_list_task_errors_become_unknown() {
    let ctx = TestContext::new();
    ctx.supervisor
        .insert_container("acme-test-echo-1", ctx.worker_labels("echo", "t"), Some(TaskState::Running));
    ctx.supervisor.fail_at(SupervisorStage::TaskStatus);

    let list = ctx.backend.list(&OpContext::background()).await.unwrap();
    assert_eq!(list[0].status, WorkerStatus::Unknown);
}

// ============================================================================
// Metrics Tests
// ============================================================================

#[tokio::test]
async fn test_metrics_for_running_worker() {
    let ctx = TestContext::new();
    let op = OpContext::background();
    let worker = ctx.backend.ensure(&op, ensure_request("echo", "tenant-a")).await.unwrap();
    ctx.supervisor.set_metrics(
        &worker.id,
        MetricsEnvelope {
            type_url: CGROUP_V2_TYPE_URL.to_string(),
            body: json!({
                "memory": {"usage": 1024, "usage_limit": 4096},
                "memory_events": {"oom": 0, "oom_kill": 1},
                "cpu": {"usage_usec": 20}
            }),
        },
    );

    let m = ctx.backend.metrics(&op, &worker.id).await.unwrap();
    assert_eq!(m.container_id, worker.id);
    assert_eq!(m.function_name, "echo");
    assert_eq!(m.state, "RUNNING");
    assert_eq!(m.memory_current, 1024);
    assert_eq!(m.memory_max, 4096);
    assert_eq!(m.oom_events, 1);
    assert_eq!(m.cpu_usage_ns, 20_000);
    assert_eq!(m.exit_code, 0);
}

#[tokio::test]
async fn test_metrics_for_stopped_worker() {
    let ctx = TestContext::new();
    let exited = Utc::now();
    ctx.supervisor
        .insert_container("acme-test-echo-1", ctx.worker_labels("echo", "t"), Some(TaskState::Stopped));
    ctx.supervisor.set_task(
        "acme-test-echo-1",
        TaskInfo {
            pid: 0,
            status: TaskState::Stopped,
            exit_status: Some(3),
            exited_at: Some(exited),
        },
    );

    let m = ctx
        .backend
        .metrics(&OpContext::background(), "acme-test-echo-1")
        .await
        .unwrap();
    assert_eq!(m.state, "STOPPED");
    assert_eq!(m.exit_code, 3);
    assert_eq!(m.exit_time, Some(exited));
    assert_eq!(m.memory_current, 0);
}

#[tokio::test]
async fn test_metrics_without_task() {
    let ctx = TestContext::new();
    ctx.supervisor
        .insert_container("acme-test-echo-1", ctx.worker_labels("echo", "t"), None);

    let m = ctx
        .backend
        .metrics(&OpContext::background(), "acme-test-echo-1")
        .await
        .unwrap();
    assert_eq!(m.state, "STOPPED");
}

#[tokio::test]
async fn test_metrics_errors() {
    let ctx = TestContext::new();
    let op = OpContext::background();
    assert!(ctx.backend.metrics(&op, "missing").await.unwrap_err().is_not_found());

    let mut labels = ctx.worker_labels("echo", "tenant-a");
    labels.retain(|k, _| k == ctx.labels.created_by.as_str() || k == ctx.labels.env.as_str());
    ctx.supervisor.insert_container("acme-test-bare-1", labels, Some(TaskState::Running));
    let err = ctx.backend.metrics(&op, "acme-test-bare-1").await.unwrap_err();
    assert!(err.to_string().contains("no function label"));
}

#[tokio::test]
async fn test_foreign_container_is_untouchable() {
    let ctx = TestContext::new();
    let op = OpContext::background();
    let foreign = HashMap::from([("app".to_string(), "db".to_string())]);
    ctx.supervisor.insert_container("postgres", foreign, Some(TaskState::Running));

    assert!(ctx.backend.list(&op).await.unwrap().is_empty());
    assert!(ctx.backend.destroy(&op, "postgres").await.unwrap_err().is_not_found());
    assert!(ctx.backend.pause(&op, "postgres").await.unwrap_err().is_not_found());
    assert!(ctx.backend.resume(&op, "postgres").await.unwrap_err().is_not_found());
    assert!(ctx.backend.metrics(&op, "postgres").await.unwrap_err().is_not_found());

    assert_eq!(ctx.supervisor.containers(), vec!["postgres".to_string()]);
    assert_eq!(ctx.supervisor.tasks(), vec!["postgres".to_string()]);
    assert!(ctx.supervisor.calls().is_empty(), "calls: {:?}", ctx.supervisor.calls());
}

#[tokio::test]
async fn test_other_environment_is_untouchable() {
    let ctx = TestContext::new();
    let op = OpContext::background();
    let staging = Labels::new(&ctx.identity, "staging");
    ctx.supervisor
        .insert_container("acme-staging-echo-1", staging.for_worker("echo", "t"), Some(TaskState::Running));

    assert!(ctx.backend.destroy(&op, "acme-staging-echo-1").await.unwrap_err().is_not_found());
    assert!(ctx.backend.pause(&op, "acme-staging-echo-1").await.unwrap_err().is_not_found());
    assert!(ctx.supervisor.containers().contains(&"acme-staging-echo-1".to_string()));
}

// ============================================================================
// GC Tests
// ============================================================================

#[tokio::test]
async fn test_gc_removes_managed_workers_only() {
    let ctx = TestContext::new();
    let op = OpContext::background();
    ctx.backend.ensure(&op, ensure_request("echo", "tenant-a")).await.unwrap();
    ctx.backend.ensure(&op, ensure_request("hello", "tenant-b")).await.unwrap();
    ctx.supervisor
        .insert_container("acme-test-old-1", ctx.worker_labels("old", "t"), Some(TaskState::Stopped));

    let other = Labels::new(&Identity::from_slug("other").unwrap(), ENV);
    ctx.supervisor
        .insert_container("other-test-echo-1", other.for_worker("echo", "t"), Some(TaskState::Running));

    ctx.backend.gc(&OpContext::detached(std::time::Duration::from_secs(5))).await.unwrap();

    assert_eq!(ctx.supervisor.containers(), vec!["other-test-echo-1".to_string()]);
    assert_eq!(ctx.ports.reserved_count(), 0);
    assert!(ctx.plugin.attached().is_empty());
}
