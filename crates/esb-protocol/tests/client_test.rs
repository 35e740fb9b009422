// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client/server round trips over a real QUIC endpoint.

use std::sync::Arc;

use esb_protocol::agent_proto::{
    HealthCheckResponse, RpcError, RpcRequest, RpcResponse, rpc_request::Request,
    rpc_response::Response,
};
use esb_protocol::{AgentClient, ConnectionHandler, Frame, RpcServer, StreamHandler};

async fn answer(mut stream: StreamHandler) {
    let frame = stream.read_frame().await.unwrap();
    let rpc: RpcRequest = frame.decode().unwrap();
    let response = match rpc.request {
        Some(Request::HealthCheck(_)) => Response::HealthCheck(HealthCheckResponse {
            healthy: true,
            version: "test".to_string(),
            uptime_ms: 1,
            backend: "daemon".to_string(),
            brand: "acme".to_string(),
        }),
        _ => Response::Error(RpcError {
            code: "UNIMPLEMENTED".to_string(),
            message: "not served by this test server".to_string(),
        }),
    };
    let rpc = RpcResponse {
        response: Some(response),
    };
    stream
        .write_frame(&Frame::response(&rpc).unwrap())
        .await
        .unwrap();
    stream.finish().unwrap();
}

async fn start_server() -> (Arc<RpcServer>, std::net::SocketAddr) {
    let server = Arc::new(RpcServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap());
    let addr = server.local_addr().unwrap();
    let running = server.clone();
    tokio::spawn(async move {
        running
            .run(|conn: ConnectionHandler| async move {
                conn.run(|stream: StreamHandler| answer(stream)).await;
            })
            .await
            .unwrap();
    });
    (server, addr)
}

#[tokio::test]
async fn test_health_check_round_trip() {
    let (server, addr) = start_server().await;
    let client = AgentClient::localhost(addr).unwrap();

    let health = client.health_check().await.unwrap();
    assert!(health.healthy);
    assert_eq!(health.brand, "acme");
    assert!(client.is_connected().await);

    client.close().await;
    server.close();
}

#[tokio::test]
async fn test_server_error_surfaces_as_client_error() {
    let (server, addr) = start_server().await;
    let client = AgentClient::localhost(addr).unwrap();

    let err = client.list_containers("").await.unwrap_err();
    assert_eq!(err.server_code(), Some("UNIMPLEMENTED"));

    server.close();
}
