// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! cgroup metrics extraction.
//!
//! Task metrics arrive as a typed envelope: a type URL naming the cgroup
//! version and a body in that version's shape. [`extract`] reduces both shapes
//! to the same four counters. [`collect_from_pid`] builds an envelope by
//! reading the cgroup files of a live process.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Type URL of cgroup v1 metrics.
pub const CGROUP_V1_TYPE_URL: &str = "io.containerd.cgroups.v1.Metrics";
/// Type URL of cgroup v2 metrics.
pub const CGROUP_V2_TYPE_URL: &str = "io.containerd.cgroups.v2.Metrics";

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// No payload.
    #[error("metrics data is empty")]
    Empty,

    /// The body does not match its type.
    #[error("failed to decode metrics: {0}")]
    Decode(#[from] serde_json::Error),

    /// The type URL is neither cgroup v1 nor v2.
    #[error("unsupported metrics type {0}")]
    UnsupportedType(String),
}

/// Task lifecycle state as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Created, not started.
    Created,
    /// Running.
    Running,
    /// Frozen.
    Paused,
    /// Exited.
    Stopped,
    /// Anything else.
    Unknown,
}

impl TaskState {
    /// Parse a supervisor status string, case-insensitively.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" | "pausing" => Self::Paused,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

/// Metrics state label for a task state.
pub fn map_task_state(state: TaskState) -> &'static str {
    match state {
        TaskState::Running => "RUNNING",
        TaskState::Paused => "PAUSED",
        TaskState::Stopped => "STOPPED",
        TaskState::Created | TaskState::Unknown => "UNKNOWN",
    }
}

/// Typed metrics payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEnvelope {
    /// Payload type.
    pub type_url: String,
    /// Payload body.
    pub body: Value,
}

/// The counters every backend reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounters {
    /// Current memory use in bytes.
    pub memory_current: u64,
    /// Memory limit in bytes; zero when unlimited.
    pub memory_max: u64,
    /// OOM kill count.
    pub oom_events: u64,
    /// CPU time in nanoseconds.
    pub cpu_usage_ns: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct V1Metrics {
    #[serde(default)]
    memory: Option<V1Memory>,
    #[serde(default)]
    memory_oom_control: Option<V1OomControl>,
    #[serde(default)]
    cpu: Option<V1Cpu>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct V1Memory {
    #[serde(default)]
    rss: u64,
    #[serde(default)]
    usage: Option<V1MemoryEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct V1MemoryEntry {
    #[serde(default)]
    limit: u64,
    #[serde(default)]
    usage: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct V1OomControl {
    #[serde(default)]
    oom_kill: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct V1Cpu {
    #[serde(default)]
    usage: Option<V1CpuUsage>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct V1CpuUsage {
    #[serde(default)]
    total: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct V2Metrics {
    #[serde(default)]
    memory: Option<V2Memory>,
    #[serde(default)]
    memory_events: Option<V2MemoryEvents>,
    #[serde(default)]
    cpu: Option<V2Cpu>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct V2Memory {
    #[serde(default)]
    usage: u64,
    #[serde(default)]
    usage_limit: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct V2MemoryEvents {
    #[serde(default)]
    oom: u64,
    #[serde(default)]
    oom_kill: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct V2Cpu {
    #[serde(default)]
    usage_usec: u64,
}

/// Reduce an envelope to counters.
pub fn extract(envelope: Option<&MetricsEnvelope>) -> Result<TaskCounters, MetricsError> {
    let envelope = envelope.ok_or(MetricsError::Empty)?;
    if envelope.body.is_null() {
        return Err(MetricsError::Empty);
    }
    match envelope.type_url.trim_start_matches('/') {
        CGROUP_V1_TYPE_URL => {
            let m: V1Metrics = serde_json::from_value(envelope.body.clone())?;
            let (memory_current, memory_max) = m
                .memory
                .map(|mem| (mem.rss, mem.usage.map(|u| u.limit).unwrap_or(0)))
                .unwrap_or((0, 0));
            Ok(TaskCounters {
                memory_current,
                memory_max,
                oom_events: m.memory_oom_control.map(|o| o.oom_kill).unwrap_or(0),
                cpu_usage_ns: m.cpu.and_then(|c| c.usage).map(|u| u.total).unwrap_or(0),
            })
        }
        CGROUP_V2_TYPE_URL => {
            let m: V2Metrics = serde_json::from_value(envelope.body.clone())?;
            let (memory_current, memory_max) = m
                .memory
                .map(|mem| (mem.usage, mem.usage_limit))
                .unwrap_or((0, 0));
            let oom_events = m
                .memory_events
                .map(|e| if e.oom_kill > 0 { e.oom_kill } else { e.oom })
                .unwrap_or(0);
            Ok(TaskCounters {
                memory_current,
                memory_max,
                oom_events,
                cpu_usage_ns: m.cpu.map(|c| c.usage_usec.saturating_mul(1000)).unwrap_or(0),
            })
        }
        other => Err(MetricsError::UnsupportedType(other.to_string())),
    }
}

/// Where the proc and cgroup filesystems are mounted.
#[derive(Debug, Clone)]
pub struct CgroupRoots {
    /// `/proc`
    pub proc_root: PathBuf,
    /// `/sys/fs/cgroup`
    pub cgroup_root: PathBuf,
}

impl Default for CgroupRoots {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CgroupLocation {
    V2 {
        unified_path: PathBuf,
    },
    V1 {
        memory_path: Option<PathBuf>,
        cpu_path: Option<PathBuf>,
    },
}

async fn read_cgroup_value(path: &Path) -> Option<u64> {
    tokio::fs::read_to_string(path)
        .await
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

async fn read_keyed(path: &Path, key: &str) -> Option<u64> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? == key {
            parts.next()?.parse().ok()
        } else {
            None
        }
    })
}

fn parse_cgroup_file(content: &str, cgroup_root: &Path) -> Option<CgroupLocation> {
    // cgroups v2 format: "0::/path/to/cgroup"
    for line in content.lines() {
        if let Some(path) = line.strip_prefix("0::") {
            return Some(CgroupLocation::V2 {
                unified_path: cgroup_root.join(path.trim_start_matches('/')),
            });
        }
    }

    let mut memory_path = None;
    let mut cpu_path = None;
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let _hierarchy = parts.next();
        let Some(controllers) = parts.next() else {
            continue;
        };
        let path = parts.next().unwrap_or_default().trim_start_matches('/');
        for controller in controllers.split(',') {
            match controller {
                "memory" => memory_path = Some(cgroup_root.join(controllers).join(path)),
                "cpu" | "cpuacct" if cpu_path.is_none() => {
                    cpu_path = Some(cgroup_root.join(controllers).join(path));
                }
                _ => {}
            }
        }
    }
    if memory_path.is_some() || cpu_path.is_some() {
        Some(CgroupLocation::V1 {
            memory_path,
            cpu_path,
        })
    } else {
        None
    }
}

/// Build a metrics envelope from the cgroup of `pid`.
pub async fn collect_from_pid(roots: &CgroupRoots, pid: u32) -> Option<MetricsEnvelope> {
    let cgroup_file = roots.proc_root.join(pid.to_string()).join("cgroup");
    let content = tokio::fs::read_to_string(&cgroup_file).await.ok()?;
    let Some(location) = parse_cgroup_file(&content, &roots.cgroup_root) else {
        debug!(pid, "Could not determine cgroup path for metrics");
        return None;
    };

    let envelope = match location {
        CgroupLocation::V2 { unified_path } => {
            let usage = read_cgroup_value(&unified_path.join("memory.current")).await.unwrap_or(0);
            // "max" means unlimited and fails to parse.
            let usage_limit = read_cgroup_value(&unified_path.join("memory.max")).await.unwrap_or(0);
            let events = unified_path.join("memory.events");
            let oom = read_keyed(&events, "oom").await.unwrap_or(0);
            let oom_kill = read_keyed(&events, "oom_kill").await.unwrap_or(0);
            let usage_usec = read_keyed(&unified_path.join("cpu.stat"), "usage_usec")
                .await
                .unwrap_or(0);
            MetricsEnvelope {
                type_url: CGROUP_V2_TYPE_URL.to_string(),
                body: serde_json::to_value(V2Metrics {
                    memory: Some(V2Memory { usage, usage_limit }),
                    memory_events: Some(V2MemoryEvents { oom, oom_kill }),
                    cpu: Some(V2Cpu { usage_usec }),
                })
                .ok()?,
            }
        }
        CgroupLocation::V1 {
            memory_path,
            cpu_path,
        } => {
            let mut metrics = V1Metrics::default();
            if let Some(path) = memory_path {
                let rss = match read_keyed(&path.join("memory.stat"), "total_rss").await {
                    Some(v) => v,
                    None => read_keyed(&path.join("memory.stat"), "rss").await.unwrap_or(0),
                };
                metrics.memory = Some(V1Memory {
                    rss,
                    usage: Some(V1MemoryEntry {
                        limit: read_cgroup_value(&path.join("memory.limit_in_bytes"))
                            .await
                            .unwrap_or(0),
                        usage: read_cgroup_value(&path.join("memory.usage_in_bytes"))
                            .await
                            .unwrap_or(0),
                    }),
                });
                metrics.memory_oom_control = Some(V1OomControl {
                    oom_kill: read_keyed(&path.join("memory.oom_control"), "oom_kill")
                        .await
                        .unwrap_or(0),
                });
            }
            if let Some(path) = cpu_path
                && let Some(total) = read_cgroup_value(&path.join("cpuacct.usage")).await
            {
                metrics.cpu = Some(V1Cpu {
                    usage: Some(V1CpuUsage { total }),
                });
            }
            MetricsEnvelope {
                type_url: CGROUP_V1_TYPE_URL.to_string(),
                body: serde_json::to_value(metrics).ok()?,
            }
        }
    };
    Some(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_task_state() {
        assert_eq!(map_task_state(TaskState::Running), "RUNNING");
        assert_eq!(map_task_state(TaskState::Paused), "PAUSED");
        assert_eq!(map_task_state(TaskState::Stopped), "STOPPED");
        assert_eq!(map_task_state(TaskState::Created), "UNKNOWN");
        assert_eq!(TaskState::parse("RUNNING"), TaskState::Running);
        assert_eq!(TaskState::parse("weird"), TaskState::Unknown);
    }

    #[test]
    fn test_extract_v1() {
        let env = MetricsEnvelope {
            type_url: CGROUP_V1_TYPE_URL.into(),
            body: json!({
                "memory": {"rss": 1024, "usage": {"limit": 4096, "usage": 2048}},
                "memory_oom_control": {"oom_kill": 2},
                "cpu": {"usage": {"total": 5000}}
            }),
        };
        let c = extract(Some(&env)).unwrap();
        assert_eq!(
            c,
            TaskCounters {
                memory_current: 1024,
                memory_max: 4096,
                oom_events: 2,
                cpu_usage_ns: 5000
            }
        );
    }

    #[test]
    fn test_extract_v2_oom_fallback() {
        let env = MetricsEnvelope {
            type_url: CGROUP_V2_TYPE_URL.into(),
            body: json!({
                "memory": {"usage": 300, "usage_limit": 900},
                "memory_events": {"oom": 3, "oom_kill": 0},
                "cpu": {"usage_usec": 7}
            }),
        };
        let c = extract(Some(&env)).unwrap();
        assert_eq!(c.memory_current, 300);
        assert_eq!(c.memory_max, 900);
        assert_eq!(c.oom_events, 3);
        assert_eq!(c.cpu_usage_ns, 7000);

        let env = MetricsEnvelope {
            type_url: CGROUP_V2_TYPE_URL.into(),
            body: json!({"memory_events": {"oom": 3, "oom_kill": 1}}),
        };
        assert_eq!(extract(Some(&env)).unwrap().oom_events, 1);
    }

    #[test]
    fn test_extract_errors() {
        assert!(matches!(extract(None), Err(MetricsError::Empty)));
        let env = MetricsEnvelope {
            type_url: "io.containerd.other.Metrics".into(),
            body: json!({}),
        };
        assert!(matches!(extract(Some(&env)), Err(MetricsError::UnsupportedType(_))));
    }

    #[test]
    fn test_parse_cgroup_file() {
        let root = Path::new("/sys/fs/cgroup");
        let v2 = parse_cgroup_file("0::/system.slice/acme-echo.scope\n", root).unwrap();
        assert_eq!(
            v2,
            CgroupLocation::V2 {
                unified_path: PathBuf::from("/sys/fs/cgroup/system.slice/acme-echo.scope")
            }
        );

        let v1 = parse_cgroup_file(
            "12:memory:/acme/w1\n4:cpu,cpuacct:/acme/w1\n1:name=systemd:/x\n",
            root,
        )
        .unwrap();
        assert_eq!(
            v1,
            CgroupLocation::V1 {
                memory_path: Some(PathBuf::from("/sys/fs/cgroup/memory/acme/w1")),
                cpu_path: Some(PathBuf::from("/sys/fs/cgroup/cpu,cpuacct/acme/w1")),
            }
        );
        assert!(parse_cgroup_file("", root).is_none());
    }

    #[tokio::test]
    async fn test_collect_from_pid_v2() {
        let dir = tempfile::tempdir().unwrap();
        let proc_root = dir.path().join("proc");
        let cgroup_root = dir.path().join("cgroup");
        std::fs::create_dir_all(proc_root.join("42")).unwrap();
        std::fs::write(proc_root.join("42/cgroup"), "0::/acme/w1\n").unwrap();
        let cg = cgroup_root.join("acme/w1");
        std::fs::create_dir_all(&cg).unwrap();
        std::fs::write(cg.join("memory.current"), "1000\n").unwrap();
        std::fs::write(cg.join("memory.max"), "max\n").unwrap();
        std::fs::write(cg.join("memory.events"), "low 0\nhigh 0\nmax 1\noom 1\noom_kill 1\n").unwrap();
        std::fs::write(cg.join("cpu.stat"), "usage_usec 25\nuser_usec 20\n").unwrap();

        let roots = CgroupRoots {
            proc_root,
            cgroup_root,
        };
        let env = collect_from_pid(&roots, 42).await.unwrap();
        assert_eq!(env.type_url, CGROUP_V2_TYPE_URL);
        let c = extract(Some(&env)).unwrap();
        assert_eq!(c.memory_current, 1000);
        assert_eq!(c.memory_max, 0);
        assert_eq!(c.oom_events, 1);
        assert_eq!(c.cpu_usage_ns, 25_000);

        assert!(collect_from_pid(&roots, 7).await.is_none());
    }
}
