// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plugin result parsing.
//!
//! The wire result lists interfaces and IPs separately, with each IP pointing
//! at an interface by index. [`CniResult`] regroups them per interface so the
//! worker side (the one with a sandbox path) can be picked out.

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CniError;

/// Result of a network ADD, grouped by interface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CniResult {
    /// Interfaces in the order the plugins reported them.
    pub interfaces: Vec<CniInterface>,
    /// The raw result of the last plugin, kept for `prevResult` chaining.
    pub raw: Value,
}

/// One interface and its addresses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CniInterface {
    /// Interface name.
    pub name: String,
    /// MAC address.
    pub mac: String,
    /// Netns path. Empty for host-side interfaces.
    pub sandbox: String,
    /// Addresses assigned to this interface.
    pub ip_configs: Vec<CniIpConfig>,
}

/// One assigned address.
#[derive(Debug, Clone, PartialEq)]
pub struct CniIpConfig {
    /// Address without prefix.
    pub ip: IpAddr,
    /// Gateway, when reported.
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawResult {
    #[serde(default)]
    interfaces: Vec<RawInterface>,
    #[serde(default)]
    ips: Vec<RawIp>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawInterface {
    #[serde(default)]
    name: String,
    #[serde(default)]
    mac: String,
    #[serde(default)]
    sandbox: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawIp {
    address: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    interface: Option<usize>,
}

impl CniResult {
    /// Parse a plugin's stdout.
    pub fn from_json(value: Value) -> Result<Self, CniError> {
        let raw: RawResult = serde_json::from_value(value.clone())?;
        let mut interfaces: Vec<CniInterface> = raw
            .interfaces
            .into_iter()
            .map(|i| CniInterface {
                name: i.name,
                mac: i.mac,
                sandbox: i.sandbox,
                ip_configs: Vec::new(),
            })
            .collect();

        for ip in raw.ips {
            let addr = ip.address.split('/').next().unwrap_or_default();
            let Ok(addr) = addr.parse::<IpAddr>() else {
                continue;
            };
            let config = CniIpConfig {
                ip: addr,
                gateway: ip.gateway.and_then(|g| g.parse().ok()),
            };
            match ip.interface.and_then(|idx| interfaces.get_mut(idx)) {
                Some(iface) => iface.ip_configs.push(config),
                // An IP without an interface index belongs to no sandbox.
                None => interfaces.push(CniInterface {
                    ip_configs: vec![config],
                    ..Default::default()
                }),
            }
        }

        Ok(Self { interfaces, raw: value })
    }
}

/// The worker's IPv4: the first IPv4 config of the first interface with a
/// non-empty sandbox.
pub fn extract_ipv4(result: &CniResult) -> Result<Ipv4Addr, CniError> {
    result
        .interfaces
        .iter()
        .filter(|iface| !iface.sandbox.is_empty())
        .find_map(|iface| {
            iface.ip_configs.iter().find_map(|c| match c.ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
        })
        .ok_or(CniError::NoWorkerIp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn iface(name: &str, sandbox: &str, ips: &[&str]) -> CniInterface {
        CniInterface {
            name: name.to_string(),
            mac: String::new(),
            sandbox: sandbox.to_string(),
            ip_configs: ips
                .iter()
                .map(|ip| CniIpConfig {
                    ip: ip.parse().unwrap(),
                    gateway: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_sandbox_interface_wins_over_bridge() {
        let result = CniResult {
            interfaces: vec![
                iface("esb0", "", &["10.88.0.1"]),
                iface("eth0", "/proc/42/ns/net", &["10.88.0.7"]),
            ],
            raw: Value::Null,
        };
        assert_eq!(extract_ipv4(&result).unwrap(), Ipv4Addr::new(10, 88, 0, 7));
    }

    #[test]
    fn test_ipv6_skipped_within_interface() {
        let result = CniResult {
            interfaces: vec![iface("eth0", "/proc/1/ns/net", &["fd00::7", "10.88.0.9"])],
            raw: Value::Null,
        };
        assert_eq!(extract_ipv4(&result).unwrap(), Ipv4Addr::new(10, 88, 0, 9));
    }

    #[test]
    fn test_no_worker_ip_cases() {
        let empty = CniResult::default();
        assert!(matches!(extract_ipv4(&empty), Err(CniError::NoWorkerIp)));

        let v6_only = CniResult {
            interfaces: vec![iface("eth0", "/proc/1/ns/net", &["fd00::7"])],
            raw: Value::Null,
        };
        assert!(matches!(extract_ipv4(&v6_only), Err(CniError::NoWorkerIp)));

        let host_only = CniResult {
            interfaces: vec![iface("esb0", "", &["10.88.0.1"])],
            raw: Value::Null,
        };
        assert!(matches!(extract_ipv4(&host_only), Err(CniError::NoWorkerIp)));
    }

    #[test]
    fn test_from_json_groups_ips() {
        let raw = json!({
            "cniVersion": "1.0.0",
            "interfaces": [
                {"name": "esb0", "mac": "aa:bb"},
                {"name": "veth1", "mac": "cc:dd"},
                {"name": "eth0", "mac": "ee:ff", "sandbox": "/proc/9/ns/net"}
            ],
            "ips": [
                {"address": "10.88.0.23/16", "gateway": "10.88.0.1", "interface": 2}
            ]
        });
        let result = CniResult::from_json(raw).unwrap();
        assert_eq!(result.interfaces.len(), 3);
        assert_eq!(result.interfaces[2].ip_configs.len(), 1);
        assert_eq!(extract_ipv4(&result).unwrap(), Ipv4Addr::new(10, 88, 0, 23));
    }
}
