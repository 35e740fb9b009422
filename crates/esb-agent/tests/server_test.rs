// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests: a running agent over QUIC, driven by the protocol client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use esb_agent::{AgentRuntime, MockBackend};
use esb_protocol::AgentClient;

async fn start_agent(backend: Arc<MockBackend>, reflection: bool) -> AgentRuntime {
    AgentRuntime::builder()
        .backend(backend)
        .brand("acme")
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .janitor_enabled(false)
        .reflection(reflection)
        .shutdown_gc_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_worker_lifecycle_over_quic() {
    let backend = Arc::new(MockBackend::new());
    let runtime = start_agent(backend.clone(), false).await;
    let client = AgentClient::localhost(runtime.bind_addr()).unwrap();

    let health = client.health_check().await.unwrap();
    assert!(health.healthy);
    assert_eq!(health.backend, "supervisor");
    assert_eq!(health.brand, "acme");

    let env = HashMap::from([("GREETING".to_string(), "hi".to_string())]);
    let worker = client
        .ensure_container("echo", None, env, "tenant-a")
        .await
        .unwrap();
    assert_eq!(worker.owner_id, "tenant-a");
    assert_eq!(worker.port, 8080);

    let listed = client.list_containers("tenant-a").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].container_id, worker.id);
    assert!(client.list_containers("tenant-b").await.unwrap().is_empty());

    assert!(client.pause_container(&worker.id, "tenant-a").await.unwrap());
    let metrics = client.get_container_metrics(&worker.id, "tenant-a").await.unwrap();
    assert_eq!(metrics.state, "PAUSED");
    assert!(client.resume_container(&worker.id, "tenant-a").await.unwrap());

    let err = client.destroy_container(&worker.id, "tenant-b").await.unwrap_err();
    assert_eq!(err.server_code(), Some("PERMISSION_DENIED"));

    assert!(client.destroy_container(&worker.id, "tenant-a").await.unwrap());
    assert!(client.destroy_container(&worker.id, "tenant-a").await.unwrap());
    assert_eq!(backend.len().await, 0);

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_errors_carry_codes() {
    let runtime = start_agent(Arc::new(MockBackend::new()), false).await;
    let client = AgentClient::localhost(runtime.bind_addr()).unwrap();

    let err = client
        .ensure_container("", None, HashMap::new(), "tenant-a")
        .await
        .unwrap_err();
    assert_eq!(err.server_code(), Some("INVALID_ARGUMENT"));

    let err = client.describe().await.unwrap_err();
    assert_eq!(err.server_code(), Some("UNIMPLEMENTED"));

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_describe_with_reflection() {
    let runtime = start_agent(Arc::new(MockBackend::new()), true).await;
    let client = AgentClient::localhost(runtime.bind_addr()).unwrap();

    let desc = client.describe().await.unwrap();
    assert_eq!(desc.service, "esb.agent.v1.AgentService");
    assert_eq!(desc.methods.len(), 8);

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_collects_live_workers() {
    let backend = Arc::new(MockBackend::new());
    let runtime = start_agent(backend.clone(), false).await;
    let client = AgentClient::localhost(runtime.bind_addr()).unwrap();

    client.ensure_container("echo", None, HashMap::new(), "t").await.unwrap();
    client.ensure_container("hello", None, HashMap::new(), "t").await.unwrap();
    assert_eq!(backend.len().await, 2);
    client.close().await;

    let token = runtime.shutdown_token();
    runtime.shutdown().await.unwrap();
    assert!(token.is_cancelled());
    assert_eq!(backend.len().await, 0);
}
