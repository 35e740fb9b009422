// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Brand-scoped conflist generation and subnet claim discovery.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{CniError, host_range, parse_ipv4_cidr, write_atomic};
use crate::identity::{Identity, Subnet};

const CNI_VERSION: &str = "1.0.0";

/// Generated network config list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfList {
    /// CNI spec version.
    pub cni_version: String,
    /// Network name.
    pub name: String,
    /// Plugin chain.
    pub plugins: Vec<PluginConf>,
}

/// One plugin entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConf {
    /// Plugin binary name.
    #[serde(rename = "type")]
    pub plugin_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Bridge device name.
    pub bridge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Assign the gateway address to the bridge.
    pub is_gateway: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Masquerade outbound traffic.
    pub ip_masq: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Address management.
    pub ipam: Option<IpamConf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// DNS settings passed to the runtime.
    pub dns: Option<DnsConf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Runtime capabilities the plugin accepts.
    pub capabilities: Option<BTreeMap<String, bool>>,
}

/// host-local IPAM block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConf {
    #[serde(rename = "type")]
    /// IPAM plugin name.
    pub ipam_type: String,
    /// Subnet to allocate from.
    pub subnet: String,
    /// First allocatable address.
    pub range_start: String,
    /// Last allocatable address.
    pub range_end: String,
    /// Routes installed in the sandbox.
    pub routes: Vec<RouteConf>,
}

/// IPAM route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConf {
    /// Destination CIDR.
    pub dst: String,
}

/// DNS block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConf {
    /// Nameserver addresses.
    pub nameservers: Vec<String>,
}

/// Path of the generated conflist for `network_name`.
pub fn config_path(dir: &Path, network_name: &str) -> PathBuf {
    dir.join(format!("10-{network_name}.conflist"))
}

/// Write `<dir>/10-<network>.conflist` with bridge, portmap and firewall plugins.
pub fn generate_config(
    dir: &Path,
    subnet: &str,
    network_name: &str,
    bridge: &str,
    dns_server: &str,
) -> Result<PathBuf, CniError> {
    if subnet.trim().is_empty() {
        return Err(CniError::MissingInput("CNI subnet"));
    }
    if network_name.trim().is_empty() {
        return Err(CniError::MissingInput("CNI network name"));
    }
    if bridge.trim().is_empty() {
        return Err(CniError::MissingInput("CNI bridge name"));
    }

    let parsed = parse_ipv4_cidr(subnet)?;
    let (start, end) = host_range(&parsed)?;

    let conf = ConfList {
        cni_version: CNI_VERSION.to_string(),
        name: network_name.to_string(),
        plugins: vec![
            PluginConf {
                plugin_type: "bridge".to_string(),
                bridge: Some(bridge.to_string()),
                is_gateway: Some(true),
                ip_masq: Some(true),
                ipam: Some(IpamConf {
                    ipam_type: "host-local".to_string(),
                    subnet: parsed.to_string(),
                    range_start: start.to_string(),
                    range_end: end.to_string(),
                    routes: vec![RouteConf {
                        dst: "0.0.0.0/0".to_string(),
                    }],
                }),
                dns: Some(DnsConf {
                    nameservers: vec![dns_server.to_string()],
                }),
                ..Default::default()
            },
            PluginConf {
                plugin_type: "portmap".to_string(),
                capabilities: Some(BTreeMap::from([("portMappings".to_string(), true)])),
                ..Default::default()
            },
            PluginConf {
                plugin_type: "firewall".to_string(),
                ..Default::default()
            },
        ],
    };

    let mut data = serde_json::to_vec_pretty(&conf)?;
    data.push(b'\n');
    let path = config_path(dir, network_name);
    write_atomic(&path, &data, 0o644)?;
    info!(path = %path.display(), subnet = %parsed, bridge, "Generated CNI config");
    Ok(path)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Write a shell-sourceable env file describing the network.
pub fn write_identity_file(
    path: &Path,
    network_name: &str,
    bridge: &str,
    subnet: &str,
) -> Result<(), CniError> {
    let parsed = parse_ipv4_cidr(subnet)?;
    let (gateway, _) = host_range(&parsed)?;
    let body = format!(
        "CNI_NETWORK={}\nCNI_BRIDGE={}\nCNI_SUBNET={}\nCNI_GW_IP={}\n",
        shell_quote(network_name),
        shell_quote(bridge),
        shell_quote(subnet.trim()),
        shell_quote(&gateway.to_string()),
    );
    write_atomic(path, body.as_bytes(), 0o644)
}

fn subnets_in(doc: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let mut visit_ipam = |ipam: &Value| {
        if let Some(s) = ipam.get("subnet").and_then(Value::as_str) {
            out.push(s.to_string());
        }
        if let Some(ranges) = ipam.get("ranges").and_then(Value::as_array) {
            for set in ranges.iter().filter_map(Value::as_array) {
                for r in set {
                    if let Some(s) = r.get("subnet").and_then(Value::as_str) {
                        out.push(s.to_string());
                    }
                }
            }
        }
    };
    if let Some(plugins) = doc.get("plugins").and_then(Value::as_array) {
        for p in plugins {
            if let Some(ipam) = p.get("ipam") {
                visit_ipam(ipam);
            }
        }
    } else if let Some(ipam) = doc.get("ipam") {
        visit_ipam(ipam);
    }
    out
}

/// Map of subnet to network name for every CNI network in `dir` except
/// `self_network`. A missing directory yields an empty map.
pub fn collect_subnet_claims(
    dir: &Path,
    self_network: &str,
) -> Result<BTreeMap<String, String>, CniError> {
    let mut claims = BTreeMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(claims),
        Err(e) => return Err(CniError::io("read CNI config dir", dir, e)),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_conf = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("conflist") | Some("conf")
        );
        if !is_conf {
            continue;
        }
        let Ok(data) = std::fs::read(&path) else {
            continue;
        };
        let Ok(doc) = serde_json::from_slice::<Value>(&data) else {
            debug!(path = %path.display(), "Skipping unparsable CNI config");
            continue;
        };
        let name = doc.get("name").and_then(Value::as_str).unwrap_or_default();
        if name.is_empty() || name == self_network {
            continue;
        }
        for subnet in subnets_in(&doc) {
            claims.insert(subnet, name.to_string());
        }
    }
    Ok(claims)
}

/// First subnet in the identity's chain that overlaps no foreign claim.
pub fn pick_free_subnet(identity: &Identity, claims: &BTreeMap<String, String>) -> Option<Subnet> {
    let claimed: Vec<Subnet> = claims.keys().filter_map(|s| Subnet::parse(s)).collect();
    (0..i64::from(crate::identity::SUBNET_POOL_SIZE))
        .map(|n| identity.cni_subnet_at(n))
        .find(|candidate| !claimed.iter().any(|c| c.overlaps(candidate)))
}
