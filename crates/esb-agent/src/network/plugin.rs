// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CNI plugin execution.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cni::{CniError, CniResult};

/// Interface name inside the sandbox.
pub const SANDBOX_IFNAME: &str = "eth0";

/// `portMappings` capability entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    /// Host side port.
    pub host_port: u16,
    /// Port inside the sandbox.
    pub container_port: u16,
    /// `tcp` or `udp`.
    pub protocol: String,
}

impl PortMapping {
    /// TCP mapping from `host_port` to `container_port`.
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: "tcp".to_string(),
        }
    }
}

/// Arguments for one ADD or DEL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniRequest {
    /// Container id (`CNI_CONTAINERID`).
    pub container_id: String,
    /// Netns path (`CNI_NETNS`). May be empty on DEL.
    pub netns: String,
    /// Interface name (`CNI_IFNAME`).
    pub ifname: String,
    /// Port mappings passed as a runtime capability.
    pub port_mappings: Vec<PortMapping>,
}

impl CniRequest {
    /// Request for the default sandbox interface.
    pub fn new(container_id: impl Into<String>, netns: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            netns: netns.into(),
            ifname: SANDBOX_IFNAME.to_string(),
            port_mappings: Vec::new(),
        }
    }

    /// Attach port mappings.
    pub fn with_port_mappings(mut self, mappings: Vec<PortMapping>) -> Self {
        self.port_mappings = mappings;
        self
    }
}

/// A loaded CNI network.
#[async_trait]
pub trait CniPlugin: Send + Sync {
    /// Network name from the conflist.
    fn network_name(&self) -> &str;

    /// Attach a sandbox.
    async fn add(&self, req: &CniRequest) -> Result<CniResult, CniError>;

    /// Detach a sandbox.
    async fn del(&self, req: &CniRequest) -> Result<(), CniError>;
}

#[derive(Debug, Deserialize)]
struct PluginErrorBody {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

/// Executes the plugin chain of a conflist from `CNI_BIN_DIR`.
#[derive(Debug, Clone)]
pub struct ConflistPlugin {
    name: String,
    cni_version: String,
    plugins: Vec<Map<String, Value>>,
    bin_dirs: Vec<PathBuf>,
}

impl ConflistPlugin {
    /// Load a conflist file.
    pub fn load(conf_file: &Path, bin_dir: &Path) -> Result<Self, CniError> {
        let data =
            std::fs::read(conf_file).map_err(|e| CniError::io("read CNI config", conf_file, e))?;
        let doc: Value = serde_json::from_slice(&data)?;
        Self::from_value(doc, vec![bin_dir.to_path_buf()])
    }

    /// Build from a parsed conflist.
    pub fn from_value(doc: Value, bin_dirs: Vec<PathBuf>) -> Result<Self, CniError> {
        let name = doc
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or(CniError::Malformed("CNI config missing network name"))?
            .to_string();
        let cni_version = doc
            .get("cniVersion")
            .and_then(Value::as_str)
            .unwrap_or("1.0.0")
            .to_string();
        let plugins: Vec<Map<String, Value>> = doc
            .get("plugins")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|p| p.as_object().cloned()).collect())
            .unwrap_or_default();
        if plugins.is_empty() {
            return Err(CniError::Malformed("CNI config missing plugins"));
        }
        Ok(Self {
            name,
            cni_version,
            plugins,
            bin_dirs,
        })
    }

    fn plugin_type(plugin: &Map<String, Value>) -> &str {
        plugin.get("type").and_then(Value::as_str).unwrap_or_default()
    }

    fn net_conf(
        &self,
        plugin: &Map<String, Value>,
        req: &CniRequest,
        prev_result: Option<&Value>,
    ) -> Value {
        let mut conf = plugin.clone();
        conf.insert("name".to_string(), json!(self.name));
        conf.insert("cniVersion".to_string(), json!(self.cni_version));

        let wants_ports = plugin
            .get("capabilities")
            .and_then(|c| c.get("portMappings"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        conf.remove("capabilities");
        if wants_ports && !req.port_mappings.is_empty() {
            conf.insert(
                "runtimeConfig".to_string(),
                json!({ "portMappings": req.port_mappings }),
            );
        }
        if let Some(prev) = prev_result {
            conf.insert("prevResult".to_string(), prev.clone());
        }
        Value::Object(conf)
    }

    fn find_binary(&self, plugin_type: &str) -> Option<PathBuf> {
        self.bin_dirs
            .iter()
            .map(|d| d.join(plugin_type))
            .find(|p| p.is_file())
    }

    async fn exec(
        &self,
        command: &str,
        plugin_type: &str,
        req: &CniRequest,
        conf: &Value,
    ) -> Result<Option<Value>, CniError> {
        let binary = self.find_binary(plugin_type).ok_or_else(|| CniError::PluginExec {
            plugin: plugin_type.to_string(),
            message: "binary not found in CNI_BIN_DIR".to_string(),
        })?;
        let cni_path = std::env::join_paths(&self.bin_dirs)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stdin_bytes = serde_json::to_vec(conf)?;

        let exec_err = |message: String| CniError::PluginExec {
            plugin: plugin_type.to_string(),
            message,
        };

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &req.container_id)
            .env("CNI_NETNS", &req.netns)
            .env("CNI_IFNAME", &req.ifname)
            .env("CNI_PATH", cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| exec_err(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&stdin_bytes)
                .await
                .map_err(|e| exec_err(e.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| exec_err(e.to_string()))?;

        if !output.status.success() {
            if let Ok(body) = serde_json::from_slice::<PluginErrorBody>(&output.stdout) {
                return Err(CniError::Plugin {
                    plugin: plugin_type.to_string(),
                    code: body.code,
                    msg: body.msg,
                    details: body.details,
                });
            }
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(exec_err(format!("exit {}: {}", output.status, stderr)));
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let value: Value = serde_json::from_slice(&output.stdout)?;
        Ok(Some(value))
    }
}

#[async_trait]
impl CniPlugin for ConflistPlugin {
    fn network_name(&self) -> &str {
        &self.name
    }

    async fn add(&self, req: &CniRequest) -> Result<CniResult, CniError> {
        let mut prev: Option<Value> = None;
        for plugin in &self.plugins {
            let plugin_type = Self::plugin_type(plugin);
            let conf = self.net_conf(plugin, req, prev.as_ref());
            debug!(plugin = plugin_type, container_id = %req.container_id, "CNI ADD");
            if let Some(result) = self.exec("ADD", plugin_type, req, &conf).await? {
                prev = Some(result);
            }
        }
        CniResult::from_json(prev.unwrap_or(Value::Null))
    }

    async fn del(&self, req: &CniRequest) -> Result<(), CniError> {
        let mut first_err = None;
        for plugin in self.plugins.iter().rev() {
            let plugin_type = Self::plugin_type(plugin);
            let conf = self.net_conf(plugin, req, None);
            debug!(plugin = plugin_type, container_id = %req.container_id, "CNI DEL");
            if let Err(e) = self.exec("DEL", plugin_type, req, &conf).await {
                warn!(plugin = plugin_type, container_id = %req.container_id, error = %e, "CNI DEL failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
