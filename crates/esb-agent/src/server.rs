// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent QUIC server.
//!
//! Handles worker lifecycle requests from the gateway. One request and one
//! response per bidirectional stream.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use esb_protocol::agent_proto::{RpcError, RpcRequest, RpcResponse, codes, rpc_request::Request, rpc_response::Response};
use esb_protocol::frame::Frame;
use esb_protocol::server::{ConnectionHandler, RpcServer, RpcServerConfig, StreamHandler};

use crate::config::Config;
use crate::error::Error;
use crate::handlers::{
    AgentHandlerState, handle_describe_service, handle_destroy_container, handle_ensure_container,
    handle_get_container_metrics, handle_health_check, handle_list_containers, handle_pause_container,
    handle_resume_container,
};

/// Build the QUIC endpoint: PEM files when TLS is configured, otherwise a
/// self-signed certificate.
pub fn build_server(config: &Config) -> Result<RpcServer> {
    let quic = RpcServerConfig::from_env();
    let server = match &config.tls {
        Some(tls) => {
            info!(
                cert = %tls.cert_path.display(),
                mutual_tls = tls.ca_path.is_some(),
                "Loading TLS material"
            );
            RpcServer::with_pem_files(
                config.bind_addr,
                &tls.cert_path,
                &tls.key_path,
                tls.ca_path.as_deref(),
                quic,
            )?
        }
        None => RpcServer::localhost_with_config(config.bind_addr, quic)?,
    };
    Ok(server)
}

/// Run the agent QUIC server until the endpoint is closed.
pub async fn run_agent_server(server: Arc<RpcServer>, state: Arc<AgentHandlerState>) -> Result<()> {
    info!(addr = %server.local_addr()?, "Agent QUIC server starting");

    server
        .run(move |conn: ConnectionHandler| {
            let state = state.clone();
            async move {
                handle_connection(conn, state).await;
            }
        })
        .await?;

    Ok(())
}

/// Handle a single connection.
pub async fn handle_connection(conn: ConnectionHandler, state: Arc<AgentHandlerState>) {
    debug!(remote = %conn.remote_address(), "New agent connection accepted");

    conn.run(move |stream: StreamHandler| {
        let state = state.clone();
        async move {
            if let Err(e) = handle_stream(stream, state).await {
                error!("Stream error: {}", e);
            }
        }
    })
    .await;

    debug!("Agent connection closed");
}

fn error_response(err: &Error) -> Response {
    Response::Error(RpcError {
        code: err.rpc_code().to_string(),
        message: err.to_string(),
    })
}

fn respond<T>(result: crate::error::Result<T>, wrap: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => wrap(value),
        Err(e) => {
            debug!(code = e.rpc_code(), error = %e, "Request failed");
            error_response(&e)
        }
    }
}

/// Route one decoded request.
pub async fn dispatch(state: &AgentHandlerState, request: Request) -> Response {
    match request {
        Request::EnsureContainer(req) => {
            respond(handle_ensure_container(state, req).await, Response::EnsureContainer)
        }
        Request::DestroyContainer(req) => {
            respond(handle_destroy_container(state, req).await, Response::DestroyContainer)
        }
        Request::PauseContainer(req) => {
            respond(handle_pause_container(state, req).await, Response::PauseContainer)
        }
        Request::ResumeContainer(req) => {
            respond(handle_resume_container(state, req).await, Response::ResumeContainer)
        }
        Request::ListContainers(req) => {
            respond(handle_list_containers(state, req).await, Response::ListContainers)
        }
        Request::GetContainerMetrics(req) => {
            respond(handle_get_container_metrics(state, req).await, Response::GetContainerMetrics)
        }
        Request::HealthCheck(_) => respond(handle_health_check(state).await, Response::HealthCheck),
        Request::DescribeService(_) => {
            respond(handle_describe_service(state).await, Response::DescribeService)
        }
    }
}

/// Handle a single stream (request/response).
async fn handle_stream(mut stream: StreamHandler, state: Arc<AgentHandlerState>) -> Result<()> {
    let request_frame = stream.read_frame().await?;
    let rpc_request: RpcRequest = request_frame.decode()?;

    let response = match rpc_request.request {
        Some(request) => {
            debug!("Received agent request: {:?}", std::mem::discriminant(&request));
            dispatch(&state, request).await
        }
        None => {
            warn!("Received empty RpcRequest");
            Response::Error(RpcError {
                code: codes::EMPTY_REQUEST.to_string(),
                message: "RpcRequest contained no request".to_string(),
            })
        }
    };

    let rpc_response = RpcResponse {
        response: Some(response),
    };
    stream.write_frame(&Frame::response(&rpc_response)?).await?;
    stream.finish()?;
    Ok(())
}
