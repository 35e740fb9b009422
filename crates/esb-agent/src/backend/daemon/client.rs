// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container daemon client.
//!
//! [`DaemonClient`] is the subset of daemon operations the backend needs.
//! [`DockerCli`] implements it by driving the `docker` binary and parsing
//! `docker inspect` JSON.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Process environment.
    pub env: HashMap<String, String>,
    /// Labels.
    pub labels: HashMap<String, String>,
    /// Network to attach at creation.
    pub network: String,
    /// Exposed TCP port.
    pub exposed_port: u16,
}

/// Container as seen by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonContainer {
    /// Daemon-assigned id.
    pub id: String,
    /// Name without the leading `/`.
    pub name: String,
    /// `created`, `running`, `paused`, `restarting`, `exited`, `dead`...
    pub state: String,
    /// Main process pid; zero when not running.
    pub pid: u32,
    /// Exit code of a stopped container.
    pub exit_code: i64,
    /// When the container stopped.
    pub finished_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Labels.
    pub labels: HashMap<String, String>,
    /// Network name to IPv4. Empty strings are kept.
    pub networks: BTreeMap<String, String>,
}

impl DaemonContainer {
    /// IPv4 on `network`, falling back to the first non-empty one.
    pub fn ip_on(&self, network: &str) -> Option<String> {
        if let Some(ip) = self.networks.get(network).filter(|ip| !ip.is_empty()) {
            return Some(ip.clone());
        }
        self.networks.values().find(|ip| !ip.is_empty()).cloned()
    }
}

/// Daemon operations used by the backend.
#[async_trait]
pub trait DaemonClient: Send + Sync {
    /// All containers (running or not) carrying every `key=value` label.
    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<DaemonContainer>>;

    /// Create a container and return its id.
    async fn create(&self, spec: &CreateSpec) -> Result<String>;

    /// Start a created container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Inspect one container. Unknown ids yield `NotFound`.
    async fn inspect(&self, id: &str) -> Result<DaemonContainer>;

    /// Remove a container. Unknown ids yield `NotFound`.
    async fn remove(&self, id: &str, force: bool) -> Result<()>;

    /// Pull an image and wait for completion.
    async fn pull(&self, image: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDoc {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created: Option<DateTime<Utc>>,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    pid: i64,
    #[serde(default)]
    exit_code: i64,
    #[serde(default)]
    finished_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: Option<BTreeMap<String, InspectEndpoint>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// The daemon reports never-stopped containers with a zero timestamp.
fn parse_finished_at(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if raw.starts_with("0001-") {
        return None;
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

impl From<InspectDoc> for DaemonContainer {
    fn from(doc: InspectDoc) -> Self {
        Self {
            id: doc.id,
            name: doc.name.trim_start_matches('/').to_string(),
            state: doc.state.status,
            pid: u32::try_from(doc.state.pid).unwrap_or(0),
            exit_code: doc.state.exit_code,
            finished_at: parse_finished_at(doc.state.finished_at.as_deref()),
            created_at: doc.created.unwrap_or_else(Utc::now),
            labels: doc.config.labels.unwrap_or_default(),
            networks: doc
                .network_settings
                .networks
                .unwrap_or_default()
                .into_iter()
                .map(|(name, ep)| (name, ep.ip_address))
                .collect(),
        }
    }
}

/// Parse the JSON array printed by `docker inspect`.
pub fn parse_inspect(output: &str) -> Result<Vec<DaemonContainer>> {
    let docs: Vec<InspectDoc> = serde_json::from_str(output)?;
    Ok(docs.into_iter().map(DaemonContainer::from).collect())
}

fn is_no_such_container(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// [`DaemonClient`] backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    /// Client invoking `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        debug!(binary = %self.binary.display(), command = %args.first().map(String::as_str).unwrap_or(""), "Invoking daemon CLI");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_no_such_container(&stderr) {
            return Err(Error::NotFound(stderr));
        }
        Err(Error::runtime(format!(
            "docker {} failed ({}): {}",
            args.first().map(String::as_str).unwrap_or(""),
            output.status,
            stderr
        )))
    }

    async fn inspect_many(&self, ids: &[String]) -> Result<Vec<DaemonContainer>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect".to_string(), "--type".to_string(), "container".to_string()];
        args.extend(ids.iter().cloned());
        let out = self.run(&args).await?;
        parse_inspect(&out)
    }
}

#[async_trait]
impl DaemonClient for DockerCli {
    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<DaemonContainer>> {
        let mut args = vec![
            "ps".to_string(),
            "--all".to_string(),
            "--quiet".to_string(),
            "--no-trunc".to_string(),
        ];
        for (k, v) in labels {
            args.push("--filter".to_string());
            args.push(format!("label={}={}", k, v));
        }
        let out = self.run(&args).await?;
        let ids: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();

        match self.inspect_many(&ids).await {
            Ok(containers) => Ok(containers),
            // One container vanished between ps and inspect; inspect the rest one by one.
            Err(e) if e.is_not_found() => {
                let mut containers = Vec::with_capacity(ids.len());
                for id in &ids {
                    match self.inspect(id).await {
                        Ok(c) => containers.push(c),
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(containers)
            }
            Err(e) => Err(e),
        }
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--restart".to_string(),
            "no".to_string(),
            "--expose".to_string(),
            format!("{}/tcp", spec.exposed_port),
        ];
        if !spec.network.is_empty() {
            args.push("--network".to_string());
            args.push(spec.network.clone());
        }
        let mut labels: Vec<_> = spec.labels.iter().collect();
        labels.sort();
        for (k, v) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", k, v));
        }
        let mut env: Vec<_> = spec.env.iter().collect();
        env.sort();
        for (k, v) in env {
            args.push("--env".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push(spec.image.clone());

        let out = self.run(&args).await?;
        let id = out.trim().to_string();
        if id.is_empty() {
            return Err(Error::runtime(format!("docker create returned no id for {}", spec.name)));
        }
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run(&["start".to_string(), id.to_string()]).await.map(|_| ())
    }

    async fn inspect(&self, id: &str) -> Result<DaemonContainer> {
        self.inspect_many(&[id.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::worker_not_found(id))
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(id.to_string());
        self.run(&args).await.map(|_| ())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.run(&["pull".to_string(), "--quiet".to_string(), image.to_string()])
            .await
            .map(|_| ())
    }
}
