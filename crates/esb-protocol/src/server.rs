// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC server helpers for the agent RPC endpoint.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ConnectionError, Endpoint, Incoming, RecvStream, SendStream, ServerConfig, TransportConfig};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::frame::{Frame, FrameError, read_frame, write_frame};

/// QUIC server failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid server configuration: {0}")]
    Config(String),
}

/// Configuration for the QUIC server
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// TLS certificate chain (PEM format)
    pub cert_pem: Vec<u8>,
    /// TLS private key (PEM format)
    pub key_pem: Vec<u8>,
    /// CA bundle (PEM) used to verify client certificates. When set, clients
    /// must present a certificate signed by it.
    pub client_ca_pem: Option<Vec<u8>>,
    /// Maximum pending incoming connections (handshakes in progress)
    pub max_incoming: u32,
    /// Maximum concurrent bidirectional streams per connection
    pub max_bi_streams: u32,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Server-side keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// UDP receive buffer size in bytes (0 for OS default)
    pub udp_receive_buffer_size: usize,
    /// UDP send buffer size in bytes (0 for OS default)
    pub udp_send_buffer_size: usize,
    /// Maximum concurrent connection handlers (0 for unlimited)
    pub max_concurrent_handlers: u32,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 50051)),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            client_ca_pem: None,
            max_incoming: 1_000,
            max_bi_streams: 256,
            idle_timeout_ms: 120_000,
            keep_alive_interval_ms: 15_000,
            udp_receive_buffer_size: 2 * 1024 * 1024, // 2MB
            udp_send_buffer_size: 2 * 1024 * 1024,    // 2MB
            max_concurrent_handlers: 0,               // unlimited by default
        }
    }
}

fn env_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl RpcServerConfig {
    /// Create a configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - `AGENT_QUIC_MAX_INCOMING`: Max pending handshakes (default: 1000)
    /// - `AGENT_QUIC_MAX_BI_STREAMS`: Max bidirectional streams per connection (default: 256)
    /// - `AGENT_QUIC_IDLE_TIMEOUT_MS`: Idle timeout in ms (default: 120000)
    /// - `AGENT_QUIC_KEEP_ALIVE_MS`: Keep-alive interval in ms, 0 to disable (default: 15000)
    /// - `AGENT_QUIC_UDP_RECV_BUFFER`: UDP receive buffer size in bytes (default: 2097152)
    /// - `AGENT_QUIC_UDP_SEND_BUFFER`: UDP send buffer size in bytes (default: 2097152)
    /// - `AGENT_QUIC_MAX_HANDLERS`: Max concurrent connection handlers, 0 for unlimited (default: 0)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_incoming: env_or("AGENT_QUIC_MAX_INCOMING", default.max_incoming),
            max_bi_streams: env_or("AGENT_QUIC_MAX_BI_STREAMS", default.max_bi_streams),
            idle_timeout_ms: env_or("AGENT_QUIC_IDLE_TIMEOUT_MS", default.idle_timeout_ms),
            keep_alive_interval_ms: env_or(
                "AGENT_QUIC_KEEP_ALIVE_MS",
                default.keep_alive_interval_ms,
            ),
            udp_receive_buffer_size: env_or(
                "AGENT_QUIC_UDP_RECV_BUFFER",
                default.udp_receive_buffer_size,
            ),
            udp_send_buffer_size: env_or(
                "AGENT_QUIC_UDP_SEND_BUFFER",
                default.udp_send_buffer_size,
            ),
            max_concurrent_handlers: env_or(
                "AGENT_QUIC_MAX_HANDLERS",
                default.max_concurrent_handlers,
            ),
            ..default
        }
    }
}

/// QUIC server for the agent RPC surface
pub struct RpcServer {
    endpoint: Endpoint,
    config: RpcServerConfig,
}

impl RpcServer {
    /// Create a new server with the given configuration
    pub fn new(config: RpcServerConfig) -> Result<Self, ServerError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let server_config = Self::build_server_config(&config)?;

        let domain = if config.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if config.udp_receive_buffer_size > 0
            && let Err(e) = socket.set_recv_buffer_size(config.udp_receive_buffer_size)
        {
            warn!(
                size = config.udp_receive_buffer_size,
                error = %e,
                "Failed to set UDP receive buffer size"
            );
        }
        if config.udp_send_buffer_size > 0
            && let Err(e) = socket.set_send_buffer_size(config.udp_send_buffer_size)
        {
            warn!(
                size = config.udp_send_buffer_size,
                error = %e,
                "Failed to set UDP send buffer size"
            );
        }

        socket.bind(&config.bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();

        let runtime = quinn::default_runtime()
            .ok_or_else(|| ServerError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            runtime.wrap_udp_socket(std_socket)?,
            runtime,
        )?;

        info!(
            addr = %config.bind_addr,
            mtls = config.client_ca_pem.is_some(),
            max_incoming = config.max_incoming,
            max_bi_streams = config.max_bi_streams,
            idle_timeout_ms = config.idle_timeout_ms,
            max_handlers = config.max_concurrent_handlers,
            "QUIC server bound"
        );

        Ok(Self { endpoint, config })
    }

    /// Create a server with a self-signed certificate for local development
    pub fn localhost(bind_addr: SocketAddr) -> Result<Self, ServerError> {
        Self::localhost_with_config(bind_addr, RpcServerConfig::from_env())
    }

    /// Create a server with a self-signed certificate and custom config
    pub fn localhost_with_config(
        bind_addr: SocketAddr,
        mut config: RpcServerConfig,
    ) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        config.bind_addr = bind_addr;
        config.cert_pem = cert.cert.pem().into_bytes();
        config.key_pem = cert.key_pair.serialize_pem().into_bytes();
        config.client_ca_pem = None;

        Self::new(config)
    }

    /// Create a server from PEM files on disk.
    ///
    /// When `client_ca_path` is given, client certificates are required and
    /// verified against it.
    pub fn with_pem_files(
        bind_addr: SocketAddr,
        cert_path: &Path,
        key_path: &Path,
        client_ca_path: Option<&Path>,
        mut config: RpcServerConfig,
    ) -> Result<Self, ServerError> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                ServerError::Tls(format!("failed to read {}: {}", path.display(), e))
            })
        };

        config.bind_addr = bind_addr;
        config.cert_pem = read(cert_path)?;
        config.key_pem = read(key_path)?;
        config.client_ca_pem = client_ca_path.map(read).transpose()?;

        Self::new(config)
    }

    fn build_server_config(config: &RpcServerConfig) -> Result<ServerConfig, ServerError> {
        let certs = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {}", e)))?;
        if certs.is_empty() {
            return Err(ServerError::Tls("no certificate found".to_string()));
        }

        let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
            .map_err(|e| ServerError::Tls(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

        let builder = rustls::ServerConfig::builder();
        let builder = match &config.client_ca_pem {
            Some(ca_pem) => {
                let mut roots = rustls::RootCertStore::empty();
                for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
                    let cert = cert
                        .map_err(|e| ServerError::Tls(format!("failed to parse CA: {}", e)))?;
                    roots
                        .add(cert)
                        .map_err(|e| ServerError::Tls(format!("invalid CA certificate: {}", e)))?;
                }
                let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| ServerError::Tls(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };
        let crypto = builder
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        let idle_timeout = quinn::IdleTimeout::try_from(Duration::from_millis(
            config.idle_timeout_ms,
        ))
        .map_err(|e| ServerError::Config(format!("idle timeout: {}", e)))?;

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(idle_timeout));
        transport.max_concurrent_bidi_streams(config.max_bi_streams.into());
        transport.max_concurrent_uni_streams(0u32.into());

        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
                .map_err(|e| ServerError::Tls(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(transport));
        server_config.max_incoming(config.max_incoming as usize);

        Ok(server_config)
    }

    async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Address the endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Stop accepting connections and close open ones
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }

    /// Hand every accepted connection to `handler` on its own task until the
    /// endpoint is closed. `max_concurrent_handlers` bounds live handlers.
    #[instrument(skip(self, handler))]
    pub async fn run<H, Fut>(&self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(ConnectionHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let limit = self.config.max_concurrent_handlers as usize;
        let permits = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));
        info!(max_handlers = limit, "QUIC server running");

        while let Some(incoming) = self.accept().await {
            let handler = handler.clone();
            let permits = permits.clone();
            tokio::spawn(async move {
                let _permit = match permits {
                    Some(permits) => match permits.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                    None => None,
                };
                match incoming.await {
                    Ok(connection) => handler(ConnectionHandler { connection }).await,
                    Err(e) => warn!(error = %e, "Handshake failed"),
                }
            });
        }

        info!("QUIC server stopped accepting connections");
        Ok(())
    }
}

/// One accepted QUIC connection.
pub struct ConnectionHandler {
    connection: quinn::Connection,
}

impl ConnectionHandler {
    /// Peer address.
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Serve each bidirectional stream on its own task until the peer goes away.
    #[instrument(skip(self, handler), fields(remote = %self.remote_address()))]
    pub async fn run<H, Fut>(&self, handler: H)
    where
        H: Fn(StreamHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            let (send, recv) = match self.connection.accept_bi().await {
                Ok(pair) => pair,
                Err(ConnectionError::ApplicationClosed(_) | ConnectionError::LocallyClosed) => {
                    debug!("Connection closed");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept stream");
                    return;
                }
            };
            let handler = handler.clone();
            tokio::spawn(async move { handler(StreamHandler { send, recv }).await });
        }
    }
}

/// One request/response stream.
pub struct StreamHandler {
    send: SendStream,
    recv: RecvStream,
}

impl StreamHandler {
    /// Read the request frame.
    pub async fn read_frame(&mut self) -> Result<Frame, ServerError> {
        Ok(read_frame(&mut self.recv).await?)
    }

    /// Write the response frame.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ServerError> {
        Ok(write_frame(&mut self.send, frame).await?)
    }

    /// Close the send side.
    pub fn finish(&mut self) -> Result<(), ServerError> {
        self.send
            .finish()
            .map_err(|e| ServerError::Frame(FrameError::Io(std::io::Error::other(e))))
    }
}
