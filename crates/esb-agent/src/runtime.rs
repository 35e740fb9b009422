// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent runtime for programmatic startup and shutdown.
//!
//! Wires a [`Backend`] to the QUIC server and the janitor, and owns the
//! shutdown order: stop reaping, collect every managed worker, close the
//! endpoint, release the backend.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use esb_agent::{AgentRuntime, MockBackend};
//!
//! let runtime = AgentRuntime::builder()
//!     .backend(Arc::new(MockBackend::new()))
//!     .bind_addr("127.0.0.1:50051".parse()?)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use esb_protocol::server::{RpcServer, RpcServerConfig};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::Backend;
use crate::config::{Config, DEFAULT_PORT};
use crate::context::OpContext;
use crate::handlers::AgentHandlerState;
use crate::janitor::{Janitor, JanitorConfig};

/// Default deadline for the final GC pass.
const DEFAULT_SHUTDOWN_GC_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-request deadline.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Builder for [`AgentRuntime`].
pub struct AgentRuntimeBuilder {
    backend: Option<Arc<dyn Backend>>,
    brand: String,
    bind_addr: SocketAddr,
    server: Option<RpcServer>,
    quic: Option<RpcServerConfig>,
    request_timeout: Duration,
    reflection: bool,
    janitor: JanitorConfig,
    janitor_enabled: bool,
    shutdown_gc_timeout: Duration,
}

impl Default for AgentRuntimeBuilder {
    fn default() -> Self {
        Self {
            backend: None,
            brand: String::new(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            server: None,
            quic: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reflection: false,
            janitor: JanitorConfig::default(),
            janitor_enabled: true,
            shutdown_gc_timeout: DEFAULT_SHUTDOWN_GC_TIMEOUT,
        }
    }
}

impl AgentRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed timeouts, janitor thresholds and the bind address from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.bind_addr,
            request_timeout: config.request_timeout,
            reflection: config.reflection,
            janitor: JanitorConfig::from_settings(&config.janitor, config.request_timeout),
            janitor_enabled: config.janitor.enabled,
            shutdown_gc_timeout: config.shutdown_gc_timeout,
            ..Self::default()
        }
    }

    /// Set the worker backend (required).
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the brand slug reported by health checks.
    pub fn brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = brand.into();
        self
    }

    /// Set the QUIC bind address. Ignored when a prebuilt server is supplied.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Use a prebuilt endpoint, e.g. one loaded with TLS material.
    pub fn server(mut self, server: RpcServer) -> Self {
        self.server = Some(server);
        self
    }

    /// Transport settings for the self-signed endpoint.
    pub fn quic_config(mut self, config: RpcServerConfig) -> Self {
        self.quic = Some(config);
        self
    }

    /// Set the per-request deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Answer `DescribeService`.
    pub fn reflection(mut self, enabled: bool) -> Self {
        self.reflection = enabled;
        self
    }

    /// Set janitor thresholds.
    pub fn janitor(mut self, config: JanitorConfig) -> Self {
        self.janitor = config;
        self
    }

    /// Enable or disable the janitor.
    pub fn janitor_enabled(mut self, enabled: bool) -> Self {
        self.janitor_enabled = enabled;
        self
    }

    /// Deadline for the GC pass on shutdown.
    pub fn shutdown_gc_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_gc_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<AgentRuntimeConfig> {
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("backend is required"))?;

        Ok(AgentRuntimeConfig {
            backend,
            brand: self.brand,
            bind_addr: self.bind_addr,
            server: self.server,
            quic: self.quic,
            request_timeout: self.request_timeout,
            reflection: self.reflection,
            janitor: self.janitor,
            janitor_enabled: self.janitor_enabled,
            shutdown_gc_timeout: self.shutdown_gc_timeout,
        })
    }
}

/// Configuration for [`AgentRuntime`].
pub struct AgentRuntimeConfig {
    backend: Arc<dyn Backend>,
    brand: String,
    bind_addr: SocketAddr,
    server: Option<RpcServer>,
    quic: Option<RpcServerConfig>,
    request_timeout: Duration,
    reflection: bool,
    janitor: JanitorConfig,
    janitor_enabled: bool,
    shutdown_gc_timeout: Duration,
}

impl AgentRuntimeConfig {
    /// Start the runtime.
    pub async fn start(self) -> Result<AgentRuntime> {
        let server = match self.server {
            Some(server) => server,
            None => RpcServer::localhost_with_config(self.bind_addr, self.quic.unwrap_or_default())?,
        };
        let bind_addr = server.local_addr()?;
        let server = Arc::new(server);

        info!(
            bind_addr = %bind_addr,
            backend = self.backend.kind().as_str(),
            brand = %self.brand,
            "Starting esb agent"
        );

        let shutdown = CancellationToken::new();
        let state = Arc::new(
            AgentHandlerState::new(self.backend.clone(), self.brand)
                .with_request_timeout(self.request_timeout)
                .with_reflection(self.reflection)
                .with_shutdown(shutdown.clone()),
        );

        let (janitor_handle, janitor_shutdown) = if self.janitor_enabled {
            let janitor = Janitor::new(self.backend.clone(), self.janitor);
            let notify = janitor.shutdown_handle();
            let handle = tokio::spawn(async move { janitor.run().await });
            (Some(handle), Some(notify))
        } else {
            info!("Janitor disabled");
            (None, None)
        };

        let server_handle = {
            let server = server.clone();
            let state = state.clone();
            tokio::spawn(async move { crate::server::run_agent_server(server, state).await })
        };

        Ok(AgentRuntime {
            server_handle,
            janitor_handle,
            janitor_shutdown,
            server,
            state,
            shutdown,
            shutdown_gc_timeout: self.shutdown_gc_timeout,
            bind_addr,
        })
    }
}

/// A running agent.
pub struct AgentRuntime {
    server_handle: JoinHandle<Result<()>>,
    janitor_handle: Option<JoinHandle<()>>,
    janitor_shutdown: Option<Arc<Notify>>,
    server: Arc<RpcServer>,
    state: Arc<AgentHandlerState>,
    shutdown: CancellationToken,
    shutdown_gc_timeout: Duration,
    bind_addr: SocketAddr,
}

impl AgentRuntime {
    /// Create a new builder.
    pub fn builder() -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new()
    }

    /// Shared handler state.
    pub fn state(&self) -> &Arc<AgentHandlerState> {
        &self.state
    }

    /// The address the server is bound to.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Check whether the server task is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
            && self.janitor_handle.as_ref().is_none_or(|h| !h.is_finished())
    }

    /// Stop the janitor, destroy every managed worker, close the endpoint
    /// and release the backend.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down esb agent");

        if let Some(notify) = &self.janitor_shutdown {
            notify.notify_one();
        }
        if let Some(handle) = self.janitor_handle
            && let Err(e) = handle.await
        {
            error!("Janitor task panicked: {}", e);
        }

        let backend = self.state.backend.clone();
        let gc_ctx = OpContext::detached(self.shutdown_gc_timeout);
        match backend.gc(&gc_ctx).await {
            Ok(()) => info!("Shutdown GC complete"),
            Err(e) => warn!(error = %e, "Shutdown GC failed"),
        }

        self.shutdown.cancel();
        self.server.close();

        let server_result = match self.server_handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Agent server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("Agent server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        };

        if let Err(e) = backend.close().await {
            warn!(error = %e, "Backend close failed");
        }

        if server_result.is_ok() {
            info!("Agent shutdown complete");
        }
        server_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    #[test]
    fn test_build_requires_backend() {
        let err = AgentRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("backend is required"));
    }

    #[test]
    fn test_builder_defaults() {
        let config = AgentRuntime::builder()
            .backend(Arc::new(MockBackend::new()))
            .build()
            .unwrap();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(config.janitor_enabled);
        assert!(!config.reflection);
    }

    #[tokio::test]
    async fn test_shutdown_collects_workers() {
        let backend = Arc::new(MockBackend::new());
        backend
            .insert("w1", crate::backend::MockWorker::running("echo", "tenant-a"))
            .await;

        let runtime = AgentRuntime::builder()
            .backend(backend.clone())
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .janitor_enabled(false)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.bind_addr().port() > 0);
        assert!(runtime.is_running());
        let token = runtime.shutdown_token();

        runtime.shutdown().await.unwrap();
        assert!(token.is_cancelled());
        assert_eq!(backend.len().await, 0);
    }
}
