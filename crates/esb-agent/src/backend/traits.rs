// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend trait definitions.
//!
//! Defines the runtime-agnostic worker lifecycle interface and the types that
//! cross it.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RuntimeKind;
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::image;

/// Value of the kind label on function workers.
pub const KIND_FUNCTION: &str = "function";

/// Input to [`Backend::ensure`].
#[derive(Debug, Clone, Default)]
pub struct EnsureRequest {
    /// Function to run.
    pub function_name: String,
    /// Image override; resolved from the function name when absent.
    pub image: Option<String>,
    /// Environment for the worker process.
    pub env: HashMap<String, String>,
    /// Gateway tenancy token. Required.
    pub owner_id: String,
}

/// A ready worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    /// Agent-assigned id.
    pub id: String,
    /// Container name. Same as the id.
    pub name: String,
    /// Worker IPv4.
    pub ip_address: String,
    /// Port inside the sandbox.
    pub port: u16,
    /// Owner id label.
    pub owner_id: String,
}

/// Worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Created, not yet serving.
    Creating,
    /// Serving.
    Running,
    /// Frozen.
    Paused,
    /// Exited or no task.
    Stopped,
    /// Could not be determined.
    Unknown,
}

impl WorkerStatus {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }

    /// Running or paused.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of [`Backend::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerState {
    /// Worker id.
    pub id: String,
    /// Function label. Empty when the label is missing.
    pub function_name: String,
    /// Owner label.
    pub owner_id: String,
    /// Current status.
    pub status: WorkerStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last access, or `created_at` when never accessed.
    pub last_used_at: DateTime<Utc>,
    /// Whether the access tracker knows this worker.
    pub has_access_record: bool,
    /// Worker IPv4, when known.
    pub ip_address: Option<String>,
    /// Port inside the sandbox.
    pub port: u16,
    /// Container name.
    pub container_name: String,
}

/// Resource usage of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetrics {
    /// Worker id.
    pub container_id: String,
    /// Function label.
    pub function_name: String,
    /// Container name.
    pub container_name: String,
    /// `RUNNING`, `PAUSED`, `STOPPED` or `UNKNOWN`.
    pub state: String,
    /// Current memory use in bytes.
    pub memory_current: u64,
    /// Memory limit in bytes.
    pub memory_max: u64,
    /// OOM kills.
    pub oom_events: u64,
    /// CPU time in nanoseconds.
    pub cpu_usage_ns: u64,
    /// Exit status of a stopped task.
    pub exit_code: u32,
    /// Exit time of a stopped task.
    pub exit_time: Option<DateTime<Utc>>,
    /// When the sample was taken.
    pub collected_at: DateTime<Utc>,
}

impl ContainerMetrics {
    /// Zeroed sample for `id` in `state`.
    pub fn empty(id: &str, function_name: &str, state: &str) -> Self {
        Self {
            container_id: id.to_string(),
            function_name: function_name.to_string(),
            container_name: id.to_string(),
            state: state.to_string(),
            memory_current: 0,
            memory_max: 0,
            oom_events: 0,
            cpu_usage_ns: 0,
            exit_code: 0,
            exit_time: None,
            collected_at: Utc::now(),
        }
    }
}

/// Label keys and values derived from the brand identity.
#[derive(Debug, Clone)]
pub struct Labels {
    /// `<slug>_function`
    pub function: String,
    /// `<slug>_env`
    pub env: String,
    /// `created_by`
    pub created_by: String,
    /// `<slug>-agent`
    pub created_by_value: String,
    /// `com.<slug>.kind`
    pub kind: String,
    /// `com.<slug>.owner`
    pub owner: String,
    /// Worker environment label value.
    pub env_value: String,
}

impl Labels {
    /// Labels for `identity` in environment `env_name`.
    pub fn new(identity: &Identity, env_name: &str) -> Self {
        Self {
            function: identity.label_function(),
            env: identity.label_env(),
            created_by: identity.label_created_by().to_string(),
            created_by_value: identity.created_by_value(),
            kind: identity.label_kind(),
            owner: identity.label_owner(),
            env_value: env_name.to_string(),
        }
    }

    /// The full label set for a new worker.
    pub fn for_worker(&self, function: &str, owner: &str) -> HashMap<String, String> {
        HashMap::from([
            (self.function.clone(), function.to_string()),
            (self.created_by.clone(), self.created_by_value.clone()),
            (self.env.clone(), self.env_value.clone()),
            (self.kind.clone(), KIND_FUNCTION.to_string()),
            (self.owner.clone(), owner.to_string()),
        ])
    }

    /// Created by this agent (creator label only).
    pub fn is_ours(&self, labels: &HashMap<String, String>) -> bool {
        labels.get(&self.created_by) == Some(&self.created_by_value)
    }

    /// Created by this agent for this environment. Objects without a function
    /// label still match so the janitor can reap them.
    pub fn is_managed(&self, labels: &HashMap<String, String>) -> bool {
        if !self.is_ours(labels) || labels.get(&self.env) != Some(&self.env_value) {
            return false;
        }
        match labels.get(&self.kind) {
            Some(kind) => kind == KIND_FUNCTION,
            None => !labels.contains_key(&self.function),
        }
    }

    /// Function label value; empty when missing.
    pub fn function_of(&self, labels: &HashMap<String, String>) -> String {
        labels.get(&self.function).cloned().unwrap_or_default()
    }

    /// Owner label value; empty when missing.
    pub fn owner_of(&self, labels: &HashMap<String, String>) -> String {
        labels.get(&self.owner).cloned().unwrap_or_default()
    }
}

/// Validate an ensure request and return the trimmed owner id.
pub fn validate_ensure(req: &EnsureRequest) -> Result<String> {
    if req.function_name.trim().is_empty() {
        return Err(Error::invalid_argument("function_name is required"));
    }
    let owner = req.owner_id.trim();
    if owner.is_empty() {
        return Err(Error::invalid_argument("owner_id is required"));
    }
    Ok(owner.to_string())
}

/// `<slug>-<env>-<function>-<8 hex>`
pub fn new_worker_id(identity: &Identity, env_name: &str, function: &str) -> Result<String> {
    let safe = image::sanitize(function)?;
    let random = uuid::Uuid::new_v4();
    let suffix: String = random.as_bytes()[..4]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    Ok(format!(
        "{}-{}-{}-{}",
        identity.container_prefix(),
        env_name,
        safe,
        suffix
    ))
}

/// Parse the `AWS_LAMBDA_FUNCTION_MEMORY_SIZE` env entry (MiB) into bytes.
///
/// Returns `None` when absent, zero, unparsable or overflowing.
pub fn memory_limit_bytes(env: &HashMap<String, String>) -> Option<u64> {
    const BYTES_PER_MIB: u64 = 1024 * 1024;
    let raw = env.get("AWS_LAMBDA_FUNCTION_MEMORY_SIZE")?;
    if raw.is_empty() {
        return None;
    }
    match raw.trim().parse::<u64>() {
        Ok(mb) if mb > 0 => match mb.checked_mul(BYTES_PER_MIB) {
            Some(bytes) => Some(bytes),
            None => {
                tracing::warn!(value = %raw, "AWS_LAMBDA_FUNCTION_MEMORY_SIZE too large");
                None
            }
        },
        _ => {
            tracing::warn!(value = %raw, "Invalid AWS_LAMBDA_FUNCTION_MEMORY_SIZE");
            None
        }
    }
}

/// Worker lifecycle backend.
///
/// Every operation takes an [`OpContext`]. Implementations observe it at each
/// suspension point and roll back partial work under a detached context.
#[async_trait]
pub trait Backend: Send + Sync {
    /// `daemon` or `supervisor`.
    fn kind(&self) -> RuntimeKind;

    /// Create, start and network a new worker.
    ///
    /// On failure nothing is left behind: no container, task, network
    /// attachment or port reservation.
    async fn ensure(&self, ctx: &OpContext, req: EnsureRequest) -> Result<Worker>;

    /// Stop and remove a worker. Unknown ids yield `NotFound`.
    async fn destroy(&self, ctx: &OpContext, id: &str) -> Result<()>;

    /// Freeze a worker.
    async fn pause(&self, ctx: &OpContext, id: &str) -> Result<()>;

    /// Thaw a worker and record an access.
    async fn resume(&self, ctx: &OpContext, id: &str) -> Result<()>;

    /// Every worker this agent created in its environment.
    async fn list(&self, ctx: &OpContext) -> Result<Vec<WorkerState>>;

    /// Resource usage of one worker.
    async fn metrics(&self, ctx: &OpContext, id: &str) -> Result<ContainerMetrics>;

    /// Remove every worker this backend owns. Individual failures are logged.
    async fn gc(&self, ctx: &OpContext) -> Result<()>;

    /// Release client handles.
    async fn close(&self) -> Result<()>;

    /// Record an access without other effect.
    fn touch(&self, id: &str);
}
