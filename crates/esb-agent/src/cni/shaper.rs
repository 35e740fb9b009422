// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Narrow a bridge conflist to a per-node address range.
//!
//! The base subnet and gateway stay as they are. Only the host-local
//! allocation range moves, so workers on this node draw addresses from the
//! node's slice of the shared bridge subnet.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tracing::info;

use super::{CniError, host_range, parse_ipv4_cidr, write_atomic};

/// Rewrite `base_file` for `subnet` and write it under `out_dir`.
///
/// Returns the path of the written file, named after the base file.
pub fn shape_config(
    base_file: &Path,
    subnet: &str,
    dns_server: &str,
    out_dir: &Path,
) -> Result<PathBuf, CniError> {
    let base = std::fs::read(base_file).map_err(|e| CniError::io("read CNI config", base_file, e))?;
    let mut shaped = apply_subnet(&base, subnet, dns_server)?;
    shaped.push(b'\n');

    let file_name = base_file
        .file_name()
        .ok_or(CniError::Malformed("CNI config path has no file name"))?;
    let out = out_dir.join(file_name);
    write_atomic(&out, &shaped, 0o644)?;

    info!(
        base = %base_file.display(),
        output = %out.display(),
        subnet = %subnet,
        "CNI subnet override applied"
    );
    Ok(out)
}

/// Rewrite the first bridge plugin's IPAM block in `config`.
pub fn apply_subnet(config: &[u8], subnet: &str, dns_server: &str) -> Result<Vec<u8>, CniError> {
    let narrowed = parse_ipv4_cidr(subnet)?;
    let mut root: Value = serde_json::from_slice(config)?;

    let plugins = root
        .get_mut("plugins")
        .and_then(Value::as_array_mut)
        .filter(|p| !p.is_empty())
        .ok_or(CniError::Malformed("CNI config missing plugins"))?;

    let bridge = plugins
        .iter_mut()
        .find(|p| p.get("type").and_then(Value::as_str) == Some("bridge"))
        .ok_or(CniError::Malformed("bridge plugin not found for CNI config"))?;

    let ipam = bridge
        .get_mut("ipam")
        .and_then(Value::as_object_mut)
        .ok_or(CniError::Malformed("bridge plugin missing ipam config"))?;

    let base_raw = ipam
        .get("subnet")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(CniError::Malformed("bridge ipam subnet is missing"))?
        .to_string();
    let base = parse_ipv4_cidr(&base_raw)?;

    let (start, end) = host_range(&narrowed)?;
    if narrowed.prefix <= base.prefix || !base.contains(start) || !base.contains(end) {
        return Err(CniError::OutsideBase {
            subnet: subnet.trim().to_string(),
            base: base_raw,
        });
    }

    ipam.remove("subnet");
    ipam.remove("rangeStart");
    ipam.remove("rangeEnd");
    ipam.insert(
        "ranges".to_string(),
        json!([[{
            "subnet": base_raw,
            "rangeStart": start.to_string(),
            "rangeEnd": end.to_string(),
        }]]),
    );

    if let Some(obj) = bridge.as_object_mut() {
        obj.insert("dns".to_string(), json!({ "nameservers": [dns_server] }));
    }

    Ok(serde_json::to_vec_pretty(&root)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"{
  "cniVersion": "1.0.0",
  "name": "acme-net",
  "plugins": [
    {"type": "loopback"},
    {
      "type": "bridge",
      "bridge": "esb0",
      "ipam": {
        "type": "host-local",
        "subnet": "10.88.0.0/16",
        "rangeStart": "10.88.0.10",
        "rangeEnd": "10.88.0.200"
      }
    },
    {"type": "portmap", "capabilities": {"portMappings": true}}
  ]
}"#;

    fn shaped(subnet: &str) -> Value {
        let out = apply_subnet(BASE.as_bytes(), subnet, "10.88.0.1").unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    #[test]
    fn test_rewrites_ranges() {
        let doc = shaped("10.88.4.0/24");
        let ipam = &doc["plugins"][1]["ipam"];
        assert!(ipam.get("subnet").is_none());
        assert!(ipam.get("rangeStart").is_none());
        let range = &ipam["ranges"][0][0];
        assert_eq!(range["subnet"], "10.88.0.0/16");
        assert_eq!(range["rangeStart"], "10.88.4.1");
        assert_eq!(range["rangeEnd"], "10.88.4.254");
        assert_eq!(doc["plugins"][1]["dns"]["nameservers"][0], "10.88.0.1");
        assert_eq!(doc["plugins"][2]["type"], "portmap");
    }

    #[test]
    fn test_rejects_outside_base() {
        let err = apply_subnet(BASE.as_bytes(), "10.99.0.0/24", "10.88.0.1").unwrap_err();
        assert!(matches!(err, CniError::OutsideBase { .. }));
        let err = apply_subnet(BASE.as_bytes(), "10.88.0.0/16", "10.88.0.1").unwrap_err();
        assert!(matches!(err, CniError::OutsideBase { .. }));
    }

    #[test]
    fn test_rejects_tiny_and_ipv6() {
        assert!(matches!(
            apply_subnet(BASE.as_bytes(), "10.88.4.0/31", "10.88.0.1").unwrap_err(),
            CniError::NoHostRange(_)
        ));
        assert!(matches!(
            apply_subnet(BASE.as_bytes(), "fd00::/64", "10.88.0.1").unwrap_err(),
            CniError::InvalidSubnet(_)
        ));
    }

    #[test]
    fn test_structural_errors() {
        let no_plugins = br#"{"name": "x", "plugins": []}"#;
        assert!(apply_subnet(no_plugins, "10.88.4.0/24", "1.1.1.1").is_err());
        let no_bridge = br#"{"plugins": [{"type": "loopback"}]}"#;
        assert!(apply_subnet(no_bridge, "10.88.4.0/24", "1.1.1.1").is_err());
        let no_ipam = br#"{"plugins": [{"type": "bridge"}]}"#;
        assert!(apply_subnet(no_ipam, "10.88.4.0/24", "1.1.1.1").is_err());
        let no_subnet = br#"{"plugins": [{"type": "bridge", "ipam": {}}]}"#;
        assert!(apply_subnet(no_subnet, "10.88.4.0/24", "1.1.1.1").is_err());
    }

    #[test]
    fn test_shape_config_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("10-acme.conflist");
        std::fs::write(&base, BASE).unwrap();
        let out_dir = dir.path().join("run/acme/cni");
        let out = shape_config(&base, "10.88.4.0/24", "10.88.0.1", &out_dir).unwrap();
        assert_eq!(out, out_dir.join("10-acme.conflist"));
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains("10.88.4.254"));
    }
}
