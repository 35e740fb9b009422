// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end scenarios across identity, backend, janitor and metrics.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use common::{TestContext, ensure_request};
use esb_agent::backend::Backend;
use esb_agent::context::OpContext;
use esb_agent::handlers::AgentHandlerState;
use esb_agent::identity::Identity;
use esb_agent::janitor::{Janitor, JanitorConfig};
use esb_agent::metrics::{CGROUP_V2_TYPE_URL, MetricsEnvelope, TaskState, extract};
use esb_agent::network::MockAddOutcome;
use esb_agent::server::dispatch;
use esb_protocol::agent_proto::{
    DestroyContainerRequest, PauseContainerRequest, rpc_request::Request, rpc_response::Response,
};

fn prod_context() -> TestContext {
    let env = HashMap::from([
        ("CONTAINERS_NETWORK", "acme-prod-external"),
        ("ENV", "prod"),
    ]);
    let identity = Identity::resolve(|name| env.get(name).map(|v| v.to_string())).unwrap();
    assert_eq!(identity.slug(), "acme");
    TestContext::with_identity(identity, "prod")
}

#[tokio::test]
async fn test_happy_path_supervisor() {
    let ctx = prod_context();

    let worker = ctx
        .backend
        .ensure(&OpContext::background(), ensure_request("lambda-echo", "gw-1"))
        .await
        .unwrap();

    assert!(worker.id.starts_with("acme-prod-lambda-echo-"));
    assert_eq!(worker.port, 8080);
    assert_eq!(worker.owner_id, "gw-1");

    let spec = ctx.supervisor.spec_of(&worker.id).unwrap();
    assert_eq!(spec.labels.get("com.acme.owner").map(String::as_str), Some("gw-1"));
    assert_eq!(spec.labels.get("acme_env").map(String::as_str), Some("prod"));

    let req = ctx.plugin.request_for(&worker.id).unwrap();
    assert!(req.netns.starts_with("/proc/") && req.netns.ends_with("/ns/net"));

    assert!(ctx.backend.access().get(&worker.id).is_some());
    let side = std::fs::read_to_string(ctx.ip_file(&worker.id)).unwrap();
    assert_eq!(side.trim(), worker.ip_address);
}

#[tokio::test]
async fn test_network_failure_rolls_back() {
    let ctx = prod_context();
    ctx.plugin.script([MockAddOutcome::Fail("permission denied".to_string())]);

    let err = ctx
        .backend
        .ensure(&OpContext::background(), ensure_request("lambda-echo", "gw-1"))
        .await
        .unwrap_err();

    assert_eq!(err.rpc_code(), "INTERNAL");
    assert!(ctx.supervisor.containers().is_empty());
    assert!(ctx.supervisor.tasks().is_empty());
    assert!(ctx.backend.access().is_empty());
    assert_eq!(ctx.ports.reserved_count(), 0);
}

#[tokio::test]
async fn test_owner_required() {
    let ctx = prod_context();
    let err = ctx
        .backend
        .ensure(&OpContext::background(), ensure_request("lambda-echo", ""))
        .await
        .unwrap_err();

    assert_eq!(err.rpc_code(), "INVALID_ARGUMENT");
    assert!(ctx.supervisor.calls().is_empty());
    assert_eq!(ctx.plugin.add_calls(), 0);
}

#[tokio::test]
async fn test_foreign_container_survives_rpc() {
    let ctx = prod_context();
    let foreign = HashMap::from([("app".to_string(), "db".to_string())]);
    ctx.supervisor.insert_container("postgres", foreign, Some(TaskState::Running));
    let state = AgentHandlerState::new(ctx.backend.clone(), "acme");

    let destroy = |owner: &str| {
        Request::DestroyContainer(DestroyContainerRequest {
            container_id: "postgres".to_string(),
            owner_id: owner.to_string(),
        })
    };
    let response = dispatch(&state, destroy("")).await;
    assert!(matches!(response, Response::Error(ref e) if e.code == "INVALID_ARGUMENT"));
    // Not ours, so it reads as already gone.
    let response = dispatch(&state, destroy("gw-1")).await;
    assert!(matches!(response, Response::DestroyContainer(_)));

    let response = dispatch(
        &state,
        Request::PauseContainer(PauseContainerRequest {
            container_id: "postgres".to_string(),
            owner_id: "gw-1".to_string(),
        }),
    )
    .await;
    assert!(matches!(response, Response::Error(ref e) if e.code == "NOT_FOUND"));

    assert_eq!(ctx.supervisor.containers(), vec!["postgres".to_string()]);
    assert_eq!(ctx.supervisor.tasks(), vec!["postgres".to_string()]);
    assert!(ctx.supervisor.calls().is_empty(), "calls: {:?}", ctx.supervisor.calls());
}

#[tokio::test]
async fn test_idle_reap() {
    let ctx = prod_context();
    let op = OpContext::background();
    let two_hours_ago = Utc::now() - chrono::Duration::hours(2);
    for _ in 0..2 {
        let worker = ctx.backend.ensure(&op, ensure_request("lambda-echo", "gw-1")).await.unwrap();
        ctx.backend.access().touch_at(&worker.id, two_hours_ago);
    }

    let janitor = Janitor::new(
        ctx.backend.clone(),
        JanitorConfig {
            interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30 * 60),
            orphan_grace: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(5),
        },
    );
    let report = janitor.sweep().await.unwrap();

    assert_eq!(report.reaped.len(), 2);
    assert!(ctx.backend.list(&op).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_gc_twice_is_a_no_op() {
    let ctx = prod_context();
    let op = OpContext::background();
    ctx.backend.ensure(&op, ensure_request("lambda-echo", "gw-1")).await.unwrap();
    ctx.backend.ensure(&op, ensure_request("lambda-echo", "gw-2")).await.unwrap();

    ctx.backend.gc(&op).await.unwrap();
    assert!(ctx.backend.list(&op).await.unwrap().is_empty());

    ctx.backend.gc(&op).await.unwrap();
    assert!(ctx.supervisor.containers().is_empty());
    assert_eq!(ctx.ports.reserved_count(), 0);
}

#[test]
fn test_metrics_unification() {
    let envelope = MetricsEnvelope {
        type_url: CGROUP_V2_TYPE_URL.to_string(),
        body: json!({
            "memory": {"usage": 512u64 << 20, "usage_limit": 1024u64 << 20},
            "memory_events": {"oom_kill": 2},
            "cpu": {"usage_usec": 1_500_000},
        }),
    };

    let counters = extract(Some(&envelope)).unwrap();
    assert_eq!(counters.memory_current, 536_870_912);
    assert_eq!(counters.memory_max, 1_073_741_824);
    assert_eq!(counters.oom_events, 2);
    assert_eq!(counters.cpu_usage_ns, 1_500_000_000);
}
