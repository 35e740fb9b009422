// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CNI configuration handling.
//!
//! - [`shaper`] narrows an existing bridge conflist to a per-node range
//! - [`generator`] writes a brand-scoped conflist from scratch
//! - [`result`] parses plugin results and picks the worker address

pub mod generator;
pub mod result;
pub mod shaper;

use std::io::Write;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::identity::Subnet;

pub use generator::{collect_subnet_claims, generate_config, pick_free_subnet, write_identity_file};
pub use result::{CniInterface, CniIpConfig, CniResult, extract_ipv4};
pub use shaper::{apply_subnet, shape_config};

/// Nameserver used when nothing else is configured.
pub const DEFAULT_DNS_SERVER: &str = "10.88.0.1";

const LINK_NOT_FOUND: &str = "link not found";

/// CNI errors.
#[derive(Debug, Error)]
pub enum CniError {
    /// Reading or writing a CNI file failed.
    #[error("{action} {path}: {source}")]
    Io {
        /// What was being done.
        action: &'static str,
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON.
    #[error("parse CNI config JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A subnet string is not an IPv4 CIDR.
    #[error("invalid subnet {0:?}: IPv4 CIDR required")]
    InvalidSubnet(String),

    /// The subnet has no usable host range.
    #[error("CIDR {0} has no usable host range")]
    NoHostRange(String),

    /// The narrowed subnet is not strictly inside the base subnet.
    #[error("CNI_SUBNET {subnet} is outside base subnet {base}")]
    OutsideBase {
        /// Requested subnet.
        subnet: String,
        /// Base bridge subnet.
        base: String,
    },

    /// The conflist has a structural problem.
    #[error("{0}")]
    Malformed(&'static str),

    /// A required input was empty.
    #[error("{0} is required")]
    MissingInput(&'static str),

    /// A plugin binary reported an error.
    #[error("plugin {plugin} failed: {msg}")]
    Plugin {
        /// Plugin type.
        plugin: String,
        /// CNI error code.
        code: u32,
        /// Error message.
        msg: String,
        /// Error details.
        details: String,
    },

    /// A plugin binary could not be run.
    #[error("plugin {plugin} could not run: {message}")]
    PluginExec {
        /// Plugin type.
        plugin: String,
        /// Failure description.
        message: String,
    },

    /// The result contained no IPv4 on a sandbox-side interface.
    #[error("no worker IPv4 address in CNI result")]
    NoWorkerIp,
}

impl CniError {
    /// Whether this is the transient "Link not found" race.
    pub fn is_link_not_found(&self) -> bool {
        let text = match self {
            CniError::Plugin { msg, details, .. } => format!("{msg} {details}"),
            CniError::PluginExec { message, .. } => message.clone(),
            _ => return false,
        };
        text.to_ascii_lowercase().contains(LINK_NOT_FOUND)
    }

    pub(crate) fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        CniError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Nameserver for workers: explicit DNS server, then gateway IP, then the
/// first host of the worker subnet, then [`DEFAULT_DNS_SERVER`].
pub fn resolve_dns_server(
    dns_server: Option<&str>,
    gateway_ip: Option<&str>,
    subnet: Option<&str>,
) -> String {
    let non_empty = |v: Option<&str>| v.map(str::trim).filter(|s| !s.is_empty()).map(String::from);
    if let Some(dns) = non_empty(dns_server) {
        return dns;
    }
    if let Some(gw) = non_empty(gateway_ip) {
        return gw;
    }
    if let Some(subnet) = subnet.and_then(Subnet::parse)
        && subnet.prefix < 31
    {
        return subnet.first_host().to_string();
    }
    DEFAULT_DNS_SERVER.to_string()
}

/// Parse a strict IPv4 CIDR.
pub(crate) fn parse_ipv4_cidr(value: &str) -> Result<Subnet, CniError> {
    Subnet::parse(value).ok_or_else(|| CniError::InvalidSubnet(value.trim().to_string()))
}

/// First and last usable host of `subnet`.
pub(crate) fn host_range(subnet: &Subnet) -> Result<(Ipv4Addr, Ipv4Addr), CniError> {
    if subnet.prefix >= 31 {
        return Err(CniError::NoHostRange(subnet.to_string()));
    }
    Ok((subnet.first_host(), subnet.last_host()))
}

/// Write `data` to `path` through a temp file and rename, with the given mode.
pub(crate) fn write_atomic(path: &Path, data: &[u8], mode: u32) -> Result<(), CniError> {
    let dir = path
        .parent()
        .ok_or(CniError::Malformed("output path has no parent directory"))?;
    std::fs::create_dir_all(dir).map_err(|e| CniError::io("create directory", dir, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(CniError::Malformed("output path has no file name"))?;
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode))?;
        std::fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(CniError::io("write", path, e));
    }
    Ok(())
}
