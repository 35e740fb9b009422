// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client for the agent RPC endpoint.
//!
//! [`AgentClient`] keeps one QUIC connection and opens a fresh bidirectional
//! stream per call. Typed helpers wrap every RPC and turn `RpcError`
//! responses into [`ClientError::Server`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::agent_proto::{
    ContainerMetrics, DescribeServiceRequest, DescribeServiceResponse, DestroyContainerRequest,
    EnsureContainerRequest, GetContainerMetricsRequest, HealthCheckRequest, HealthCheckResponse,
    ListContainersRequest, PauseContainerRequest, ResumeContainerRequest, RpcRequest, RpcResponse,
    WorkerInfo, WorkerState, rpc_request::Request, rpc_response::Response,
};
use crate::frame::{Frame, FrameError, MessageType};

/// Errors that can occur in the QUIC client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("write error: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("no connection established")]
    NotConnected,

    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    #[error("server error [{code}]: {message}")]
    Server { code: String, message: String },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// The server-side error code, when the server answered with an error.
    pub fn server_code(&self) -> Option<&str> {
        match self {
            ClientError::Server { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Configuration for the QUIC client
#[derive(Debug, Clone)]
pub struct AgentClientConfig {
    /// Agent address to connect to
    pub server_addr: SocketAddr,
    /// Server name for TLS verification
    pub server_name: String,
    /// Skip certificate verification (for development only!)
    pub dangerous_skip_cert_verification: bool,
    /// Extra CA bundle (PEM) trusted in addition to the web PKI roots
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Client certificate chain and key (PEM) for mutual TLS
    pub client_identity_pem: Option<(Vec<u8>, Vec<u8>)>,
    /// Keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            server_name: "localhost".to_string(),
            dangerous_skip_cert_verification: false,
            ca_cert_pem: None,
            client_identity_pem: None,
            keep_alive_interval_ms: 10_000,
            idle_timeout_ms: 120_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// QUIC client for the agent
pub struct AgentClient {
    endpoint: Endpoint,
    connection: Mutex<Option<Connection>>,
    config: AgentClientConfig,
}

impl AgentClient {
    /// Create a new client with the given configuration
    pub fn new(config: AgentClientConfig) -> Result<Self, ClientError> {
        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))?;

        let client_config = Self::build_client_config(&config)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            connection: Mutex::new(None),
            config,
        })
    }

    /// Create a client for a local agent with a self-signed certificate
    pub fn localhost(server_addr: SocketAddr) -> Result<Self, ClientError> {
        Self::new(AgentClientConfig {
            server_addr,
            dangerous_skip_cert_verification: true,
            ..Default::default()
        })
    }

    fn build_client_config(config: &AgentClientConfig) -> Result<ClientConfig, ClientError> {
        let builder = if config.dangerous_skip_cert_verification {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            if let Some(ca_pem) = &config.ca_cert_pem {
                for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
                    let cert =
                        cert.map_err(|e| ClientError::Tls(format!("failed to parse CA: {}", e)))?;
                    roots
                        .add(cert)
                        .map_err(|e| ClientError::Tls(format!("invalid CA certificate: {}", e)))?;
                }
            }
            rustls::ClientConfig::builder().with_root_certificates(roots)
        };

        let crypto = match &config.client_identity_pem {
            Some((cert_pem, key_pem)) => {
                let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| ClientError::Tls(format!("failed to parse certificate: {}", e)))?;
                let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                    .map_err(|e| ClientError::Tls(format!("failed to parse private key: {}", e)))?
                    .ok_or_else(|| ClientError::Tls("no private key found".to_string()))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| ClientError::Tls(e.to_string()))?
            }
            None => builder.with_no_client_auth(),
        };

        let mut transport = TransportConfig::default();
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }
        let idle_timeout =
            quinn::IdleTimeout::try_from(Duration::from_millis(config.idle_timeout_ms))
                .map_err(|e| ClientError::Tls(format!("idle timeout: {}", e)))?;
        transport.max_idle_timeout(Some(idle_timeout));

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| ClientError::Tls(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    /// Connect to the agent, reusing a live connection
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut conn_guard = self.connection.lock().await;

        if let Some(ref conn) = *conn_guard
            && conn.close_reason().is_none()
        {
            debug!("reusing existing connection");
            return Ok(());
        }

        info!(addr = %self.config.server_addr, "connecting to agent");

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connecting = self
            .endpoint
            .connect(self.config.server_addr, &self.config.server_name)?;

        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        *conn_guard = Some(connection);
        Ok(())
    }

    async fn get_connection(&self) -> Result<Connection, ClientError> {
        self.connect().await?;
        let conn_guard = self.connection.lock().await;
        conn_guard.clone().ok_or(ClientError::NotConnected)
    }

    /// Send a request and receive a response on a new stream
    pub async fn request<Req: prost::Message, Resp: prost::Message + Default>(
        &self,
        request: &Req,
    ) -> Result<Resp, ClientError> {
        let conn = self.get_connection().await?;
        let (mut send, mut recv) = conn.open_bi().await?;

        let frame = Frame::request(request)?;
        crate::frame::write_frame(&mut send, &frame).await?;
        send.finish()?;

        let response_frame = crate::frame::read_frame(&mut recv).await?;
        match response_frame.message_type {
            MessageType::Response => Ok(response_frame.decode()?),
            MessageType::Error => Err(FrameError::ErrorFrame.into()),
            other => Err(FrameError::UnexpectedMessageType(other).into()),
        }
    }

    async fn send_request(&self, request: Request) -> Result<Response, ClientError> {
        let rpc_request = RpcRequest {
            request: Some(request),
        };

        let rpc_response: RpcResponse = self.request(&rpc_request).await?;

        match rpc_response.response {
            Some(Response::Error(err)) => Err(ClientError::Server {
                code: err.code,
                message: err.message,
            }),
            Some(response) => Ok(response),
            None => Err(ClientError::UnexpectedResponse(
                "empty response from agent".to_string(),
            )),
        }
    }

    /// Create a worker for `function_name` owned by `owner_id`.
    #[instrument(skip(self, env))]
    pub async fn ensure_container(
        &self,
        function_name: &str,
        image: Option<&str>,
        env: HashMap<String, String>,
        owner_id: &str,
    ) -> Result<WorkerInfo, ClientError> {
        let response = self
            .send_request(Request::EnsureContainer(EnsureContainerRequest {
                function_name: function_name.to_string(),
                image: image.map(str::to_string),
                env,
                owner_id: owner_id.to_string(),
            }))
            .await?;
        match response {
            Response::EnsureContainer(info) => Ok(info),
            _ => Err(ClientError::UnexpectedResponse(
                "expected WorkerInfo".to_string(),
            )),
        }
    }

    /// Destroy a worker. Unknown ids succeed.
    #[instrument(skip(self))]
    pub async fn destroy_container(
        &self,
        container_id: &str,
        owner_id: &str,
    ) -> Result<bool, ClientError> {
        let response = self
            .send_request(Request::DestroyContainer(DestroyContainerRequest {
                container_id: container_id.to_string(),
                owner_id: owner_id.to_string(),
            }))
            .await?;
        match response {
            Response::DestroyContainer(resp) => Ok(resp.success),
            _ => Err(ClientError::UnexpectedResponse(
                "expected DestroyContainerResponse".to_string(),
            )),
        }
    }

    /// Freeze a worker.
    #[instrument(skip(self))]
    pub async fn pause_container(
        &self,
        container_id: &str,
        owner_id: &str,
    ) -> Result<bool, ClientError> {
        let response = self
            .send_request(Request::PauseContainer(PauseContainerRequest {
                container_id: container_id.to_string(),
                owner_id: owner_id.to_string(),
            }))
            .await?;
        match response {
            Response::PauseContainer(resp) => Ok(resp.success),
            _ => Err(ClientError::UnexpectedResponse(
                "expected PauseContainerResponse".to_string(),
            )),
        }
    }

    /// Thaw a worker.
    #[instrument(skip(self))]
    pub async fn resume_container(
        &self,
        container_id: &str,
        owner_id: &str,
    ) -> Result<bool, ClientError> {
        let response = self
            .send_request(Request::ResumeContainer(ResumeContainerRequest {
                container_id: container_id.to_string(),
                owner_id: owner_id.to_string(),
            }))
            .await?;
        match response {
            Response::ResumeContainer(resp) => Ok(resp.success),
            _ => Err(ClientError::UnexpectedResponse(
                "expected ResumeContainerResponse".to_string(),
            )),
        }
    }

    /// List workers, optionally restricted to one owner (empty = all).
    #[instrument(skip(self))]
    pub async fn list_containers(&self, owner_id: &str) -> Result<Vec<WorkerState>, ClientError> {
        let response = self
            .send_request(Request::ListContainers(ListContainersRequest {
                owner_id: owner_id.to_string(),
            }))
            .await?;
        match response {
            Response::ListContainers(resp) => Ok(resp.containers),
            _ => Err(ClientError::UnexpectedResponse(
                "expected ListContainersResponse".to_string(),
            )),
        }
    }

    /// Fetch resource counters for a worker.
    #[instrument(skip(self))]
    pub async fn get_container_metrics(
        &self,
        container_id: &str,
        owner_id: &str,
    ) -> Result<ContainerMetrics, ClientError> {
        let response = self
            .send_request(Request::GetContainerMetrics(GetContainerMetricsRequest {
                container_id: container_id.to_string(),
                owner_id: owner_id.to_string(),
            }))
            .await?;
        match response {
            Response::GetContainerMetrics(metrics) => Ok(metrics),
            _ => Err(ClientError::UnexpectedResponse(
                "expected ContainerMetrics".to_string(),
            )),
        }
    }

    /// Check agent health.
    pub async fn health_check(&self) -> Result<HealthCheckResponse, ClientError> {
        let response = self
            .send_request(Request::HealthCheck(HealthCheckRequest {}))
            .await?;
        match response {
            Response::HealthCheck(resp) => Ok(resp),
            _ => Err(ClientError::UnexpectedResponse(
                "expected HealthCheckResponse".to_string(),
            )),
        }
    }

    /// Describe the RPC surface (only answered when reflection is enabled).
    pub async fn describe(&self) -> Result<DescribeServiceResponse, ClientError> {
        let response = self
            .send_request(Request::DescribeService(DescribeServiceRequest {}))
            .await?;
        match response {
            Response::DescribeService(resp) => Ok(resp),
            _ => Err(ClientError::UnexpectedResponse(
                "expected DescribeServiceResponse".to_string(),
            )),
        }
    }

    /// Close the connection gracefully
    pub async fn close(&self) {
        let mut conn_guard = self.connection.lock().await;
        if let Some(conn) = conn_guard.take() {
            conn.close(0u32.into(), b"client closing");
        }
    }

    /// Check if the client is currently connected
    pub async fn is_connected(&self) -> bool {
        let conn_guard = self.connection.lock().await;
        conn_guard
            .as_ref()
            .is_some_and(|conn| conn.close_reason().is_none())
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.connection.try_lock()
            && let Some(conn) = guard.take()
        {
            conn.close(0u32.into(), b"client dropped");
        }
    }
}

/// Certificate verifier that skips all verification (for development only!)
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
