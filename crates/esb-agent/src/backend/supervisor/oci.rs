// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container spec assembly for the supervisor backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::cni::{CniError, write_atomic};

/// Snapshotter used with the firecracker runtime.
const FIRECRACKER_SNAPSHOTTER: &str = "devmapper";
const FIRECRACKER_RUNTIME: &str = "aws.firecracker";
const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

/// Where the per-process resolv.conf is mounted inside workers.
pub const RESOLV_CONF_TARGET: &str = "/etc/resolv.conf";

/// OCI mount entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Path inside the container.
    pub destination: String,
    /// Mount type.
    #[serde(rename = "type")]
    pub mount_type: String,
    /// Host path.
    pub source: String,
    /// Mount options.
    #[serde(default)]
    pub options: Vec<String>,
}

impl MountSpec {
    /// Read-only recursive bind of `source` at `destination`.
    pub fn bind_ro(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            mount_type: "bind".to_string(),
            source: source.into(),
            options: vec!["rbind".to_string(), "ro".to_string()],
        }
    }

    /// `type=bind,src=..,dst=..,options=rbind:ro` as accepted by `ctr --mount`.
    pub fn to_ctr_arg(&self) -> String {
        format!(
            "type={},src={},dst={},options={}",
            self.mount_type,
            self.source,
            self.destination,
            self.options.join(":")
        )
    }
}

/// A worker container to create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Container id; also the snapshot key.
    pub id: String,
    /// Image reference.
    pub image: String,
    /// Snapshotter for the new snapshot.
    pub snapshotter: String,
    /// Runtime name; the supervisor default when `None`.
    pub runtime: Option<String>,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Process environment.
    pub env: HashMap<String, String>,
    /// Extra mounts.
    pub mounts: Vec<MountSpec>,
    /// Memory limit in bytes.
    pub memory_limit: Option<u64>,
}

/// `override` > `devmapper` for firecracker > `overlayfs`.
pub fn select_snapshotter(override_name: Option<&str>, runtime: Option<&str>) -> String {
    if let Some(name) = override_name.map(str::trim).filter(|s| !s.is_empty()) {
        return name.to_string();
    }
    if runtime.map(str::trim) == Some(FIRECRACKER_RUNTIME) {
        return FIRECRACKER_SNAPSHOTTER.to_string();
    }
    DEFAULT_SNAPSHOTTER.to_string()
}

/// Write `nameserver <dns>` to `path` with mode 0644.
pub fn write_resolv_conf(path: &Path, dns_server: &str) -> Result<(), CniError> {
    if dns_server.trim().is_empty() {
        return Err(CniError::MissingInput("dns server"));
    }
    let payload = format!("nameserver {}\n", dns_server.trim());
    write_atomic(path, payload.as_bytes(), 0o644)
}

/// The worker resolv.conf, written at most once per process.
#[derive(Debug)]
pub struct ResolvConf {
    path: PathBuf,
    dns_server: String,
    written: OnceCell<Option<PathBuf>>,
}

impl ResolvConf {
    /// Resolv.conf at `path` pointing at `dns_server`.
    pub fn new(path: impl Into<PathBuf>, dns_server: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            dns_server: dns_server.into(),
            written: OnceCell::new(),
        }
    }

    /// The bind mount for workers, or `None` if the file could not be written.
    pub async fn mount(&self) -> Option<MountSpec> {
        let written = self
            .written
            .get_or_init(|| async {
                match write_resolv_conf(&self.path, &self.dns_server) {
                    Ok(()) => {
                        info!(path = %self.path.display(), dns = %self.dns_server, "Wrote worker resolv.conf");
                        Some(self.path.clone())
                    }
                    Err(e) => {
                        warn!(path = %self.path.display(), error = %e, "Failed to prepare resolv.conf");
                        None
                    }
                }
            })
            .await;
        written
            .as_ref()
            .map(|p| MountSpec::bind_ro(p.display().to_string(), RESOLV_CONF_TARGET))
    }
}
