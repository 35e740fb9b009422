// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker network attachment.
//!
//! [`NetworkFabric`] owns the host port pool and serializes every CNI ADD and
//! DEL behind one async mutex. A successful setup leaves three things behind,
//! all undone by [`NetworkFabric::remove`]:
//!
//! - the CNI attachment itself
//! - a host port reservation mapped to sandbox port 8080
//! - a side file `<net_dir>/<network>/<worker_id>` holding the worker IPv4

pub mod mock;
pub mod plugin;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cni::{CniResult, extract_ipv4};
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::ports::PortAllocator;

pub use mock::{MockAddOutcome, MockCniPlugin};
pub use plugin::{CniPlugin, CniRequest, ConflistPlugin, PortMapping};

/// Port every worker listens on inside its sandbox.
pub const WORKER_PORT: u16 = 8080;

/// Retry policy for transient CNI ADD failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub attempts: u32,
    /// First backoff.
    pub initial_backoff: Duration,
    /// Backoff stops doubling once it reaches this value.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
        }
    }
}

/// CNI attach/detach plus host port bookkeeping.
pub struct NetworkFabric {
    plugin: Arc<dyn CniPlugin>,
    ports: Arc<PortAllocator>,
    cni_lock: tokio::sync::Mutex<()>,
    reservations: Mutex<HashMap<String, u16>>,
    net_dir: PathBuf,
    retry: RetryPolicy,
}

impl std::fmt::Debug for NetworkFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkFabric")
            .field("network", &self.plugin.network_name())
            .field("net_dir", &self.net_dir)
            .finish()
    }
}

impl NetworkFabric {
    /// Create a fabric over a loaded plugin.
    pub fn new(plugin: Arc<dyn CniPlugin>, ports: Arc<PortAllocator>, net_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin,
            ports,
            cni_lock: tokio::sync::Mutex::new(()),
            reservations: Mutex::new(HashMap::new()),
            net_dir: net_dir.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Network name from the loaded config.
    pub fn network_name(&self) -> &str {
        self.plugin.network_name()
    }

    /// The host port pool.
    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Host port reserved for `worker_id`, if attached.
    pub fn host_port(&self, worker_id: &str) -> Option<u16> {
        self.reservations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker_id)
            .copied()
    }

    fn ip_file(&self, worker_id: &str) -> PathBuf {
        self.net_dir.join(self.network_name()).join(worker_id)
    }

    /// Attach `worker_id` through its netns.
    pub async fn setup(&self, ctx: &OpContext, worker_id: &str, netns: &str) -> Result<CniResult> {
        let host_port = self.ports.allocate()?;
        let req = CniRequest::new(worker_id, netns)
            .with_port_mappings(vec![PortMapping::tcp(host_port, WORKER_PORT)]);

        let result = match self.add_with_retry(ctx, &req).await {
            Ok(result) => result,
            Err(e) => {
                self.ports.release(host_port);
                return Err(e);
            }
        };

        self.reservations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(worker_id.to_string(), host_port);

        if let Ok(ip) = extract_ipv4(&result) {
            self.write_ip_file(worker_id, ip);
        }
        info!(worker_id, host_port, network = self.network_name(), "Worker network attached");
        Ok(result)
    }

    async fn add_with_retry(&self, ctx: &OpContext, req: &CniRequest) -> Result<CniResult> {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = ctx
                .run(async {
                    let _guard = self.cni_lock.lock().await;
                    self.plugin.add(req).await.map_err(Error::from)
                })
                .await;

            match outcome {
                Ok(result) => return Ok(result),
                Err(Error::Cni(e)) if e.is_link_not_found() && attempt < self.retry.attempts => {
                    warn!(
                        worker_id = %req.container_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient CNI failure, retrying"
                    );
                    ctx.sleep(backoff).await?;
                    if backoff < self.retry.max_backoff {
                        backoff *= 2;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Detach `worker_id`, release its port and delete its side file.
    ///
    /// With no netns the DEL is best effort.
    pub async fn remove(&self, ctx: &OpContext, worker_id: &str, netns: Option<&str>) -> Result<()> {
        let req = CniRequest::new(worker_id, netns.unwrap_or_default());
        let outcome = ctx
            .run(async {
                let _guard = self.cni_lock.lock().await;
                self.plugin.del(&req).await.map_err(Error::from)
            })
            .await;

        let port = self
            .reservations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(worker_id);
        if let Some(port) = port {
            self.ports.release(port);
        }
        self.remove_ip_file(worker_id);

        match outcome {
            Ok(()) => {
                debug!(worker_id, "Worker network removed");
                Ok(())
            }
            Err(e) if netns.is_none() => {
                debug!(worker_id, error = %e, "Best-effort CNI DEL failed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Worker IPv4 from its side file.
    pub fn lookup_ip(&self, worker_id: &str) -> Option<Ipv4Addr> {
        read_ip_file(&self.ip_file(worker_id))
    }

    fn write_ip_file(&self, worker_id: &str, ip: Ipv4Addr) {
        let path = self.ip_file(worker_id);
        let written = path
            .parent()
            .map(std::fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| std::fs::write(&path, format!("{ip}\n")));
        if let Err(e) = written {
            warn!(worker_id, path = %path.display(), error = %e, "Failed to write worker IP file");
        }
    }

    fn remove_ip_file(&self, worker_id: &str) {
        let path = self.ip_file(worker_id);
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(worker_id, path = %path.display(), error = %e, "Failed to remove worker IP file");
        }
    }
}

fn read_ip_file(path: &Path) -> Option<Ipv4Addr> {
    let text = std::fs::read_to_string(path).ok()?;
    text.split_whitespace().next()?.parse().ok()
}
