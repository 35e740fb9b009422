// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the esb agent.
//!
//! Everything is read through a lookup function so tests can feed a plain map
//! instead of mutating the process environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Which runtime backend drives the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// User-space container daemon (Docker-compatible).
    Daemon,
    /// Low-level supervisor with snapshots, tasks, and CNI (containerd-compatible).
    Supervisor,
}

impl RuntimeKind {
    /// Parse `AGENT_RUNTIME`. Anything other than the supervisor names selects the daemon.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "containerd" | "supervisor" => RuntimeKind::Supervisor,
            _ => RuntimeKind::Daemon,
        }
    }

    /// Stable name used in logs, health checks, and runtime observations.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Daemon => "daemon",
            RuntimeKind::Supervisor => "supervisor",
        }
    }
}

/// CNI wiring for the supervisor backend.
#[derive(Debug, Clone)]
pub struct CniSettings {
    /// Directory holding network configuration lists.
    pub conf_dir: PathBuf,
    /// Base configuration list to shape.
    pub conf_file: PathBuf,
    /// Directory holding plugin binaries.
    pub bin_dir: PathBuf,
    /// IPAM state root; worker IP files live under `<net_dir>/<network>/<worker_id>`.
    pub net_dir: PathBuf,
    /// Explicit per-node subnet used to narrow the base configuration.
    pub subnet: Option<String>,
    /// Explicit DNS server for workers.
    pub dns_server: Option<String>,
    /// Explicit gateway IP, used as DNS fallback.
    pub gateway_ip: Option<String>,
    /// Generate a brand-scoped configuration instead of shaping the base file.
    pub generate: bool,
}

/// Janitor thresholds.
#[derive(Debug, Clone)]
pub struct JanitorSettings {
    /// Whether the janitor runs at all.
    pub enabled: bool,
    /// Time between scans.
    pub interval: Duration,
    /// Workers unused for this long are destroyed.
    pub idle_timeout: Duration,
    /// Untracked workers older than this are destroyed.
    pub orphan_grace: Duration,
}

impl Default for JanitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            orphan_grace: Duration::from_secs(60),
        }
    }
}

/// TLS material for the RPC endpoint.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Server certificate chain (PEM).
    pub cert_path: PathBuf,
    /// Server private key (PEM).
    pub key_path: PathBuf,
    /// Client CA bundle (PEM); enables mutual TLS when set.
    pub ca_path: Option<PathBuf>,
}

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// RPC listen address.
    pub bind_addr: SocketAddr,
    /// Selected runtime backend.
    pub runtime: RuntimeKind,
    /// Worker environment label value.
    pub env_name: String,
    /// Container network the daemon backend attaches workers to.
    pub containers_network: String,
    /// Registry prefix for resolved images.
    pub registry: Option<String>,
    /// Pull over plain HTTP.
    pub registry_insecure: bool,
    /// Overrides the `<slug>` prefix of resolved image names.
    pub image_prefix: Option<String>,
    /// Supervisor socket.
    pub containerd_address: PathBuf,
    /// Snapshotter override.
    pub snapshotter: Option<String>,
    /// Supervisor runtime name (e.g. `aws.firecracker`).
    pub containerd_runtime: Option<String>,
    /// CNI wiring.
    pub cni: CniSettings,
    /// Inclusive host port pool.
    pub port_range: (u16, u16),
    /// Janitor thresholds.
    pub janitor: JanitorSettings,
    /// Deadline applied to every RPC.
    pub request_timeout: Duration,
    /// Hard deadline for rollback after partial failures.
    pub cleanup_timeout: Duration,
    /// Hard deadline for the final GC pass on shutdown.
    pub shutdown_gc_timeout: Duration,
    /// Answer `DescribeService`.
    pub reflection: bool,
    /// TLS material; a self-signed certificate is used when absent.
    pub tls: Option<TlsSettings>,
    /// Runtime mode the deployment declares (`docker` or `containerd`).
    pub runtime_mode_required: Option<String>,
    /// Fail startup when the observed runtime mode contradicts the declared one.
    pub runtime_mode_strict: bool,
}

/// Default port for the RPC endpoint.
pub const DEFAULT_PORT: u16 = 50051;

/// Read a process environment variable, treating blank values as unset.
pub fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a boolean flag: `1`, `true`, `yes`, `on` (any case) are true.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    /// Load configuration from an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |name: &str, default: bool| get(name).map(|v| parse_bool(&v)).unwrap_or(default);
        let secs = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            match get(name) {
                Some(v) => v
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidValue { var: name, value: v }),
                None => Ok(Duration::from_secs(default)),
            }
        };
        let port_var = |name: &'static str, default: u16| -> Result<u16, ConfigError> {
            match get(name) {
                Some(v) => v.parse::<u16>().map_err(|_| ConfigError::InvalidPort(name)),
                None => Ok(default),
            }
        };

        let port = port_var("PORT", DEFAULT_PORT)?;
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let runtime = get("AGENT_RUNTIME")
            .map(|v| RuntimeKind::parse(&v))
            .unwrap_or(RuntimeKind::Daemon);

        let env_name = get("ESB_ENV")
            .or_else(|| get("ENV"))
            .unwrap_or_else(|| "default".to_string());

        let containers_network = get("CONTAINERS_NETWORK").unwrap_or_else(|| "bridge".to_string());

        let conf_dir = PathBuf::from(get("CNI_CONF_DIR").unwrap_or_else(|| "/etc/cni/net.d".to_string()));
        let conf_file = get("CNI_CONF_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| conf_dir.join("10-esb.conflist"));
        let cni = CniSettings {
            conf_file,
            conf_dir,
            bin_dir: PathBuf::from(get("CNI_BIN_DIR").unwrap_or_else(|| "/opt/cni/bin".to_string())),
            net_dir: PathBuf::from(
                get("CNI_NET_DIR").unwrap_or_else(|| "/var/lib/cni/networks".to_string()),
            ),
            subnet: get("CNI_SUBNET"),
            dns_server: get("CNI_DNS_SERVER"),
            gateway_ip: get("CNI_GW_IP"),
            generate: flag("CNI_GENERATE", false),
        };

        let port_min = port_var("AGENT_PORT_RANGE_MIN", 20000)?;
        let port_max = port_var("AGENT_PORT_RANGE_MAX", 20999)?;
        if port_min == 0 || port_min > port_max {
            return Err(ConfigError::InvalidPortRange {
                min: port_min,
                max: port_max,
            });
        }

        let janitor = JanitorSettings {
            enabled: flag("AGENT_JANITOR_ENABLED", true),
            interval: secs("AGENT_JANITOR_INTERVAL_SECS", 30)?,
            idle_timeout: secs("AGENT_IDLE_TIMEOUT_SECS", 300)?,
            orphan_grace: secs("AGENT_ORPHAN_GRACE_SECS", 60)?,
        };
        if janitor.interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                var: "AGENT_JANITOR_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        let tls = if flag("AGENT_GRPC_TLS_ENABLED", false) {
            Some(TlsSettings {
                cert_path: get("AGENT_GRPC_CERT_PATH")
                    .map(PathBuf::from)
                    .ok_or(ConfigError::MissingEnvVar("AGENT_GRPC_CERT_PATH"))?,
                key_path: get("AGENT_GRPC_KEY_PATH")
                    .map(PathBuf::from)
                    .ok_or(ConfigError::MissingEnvVar("AGENT_GRPC_KEY_PATH"))?,
                ca_path: get("AGENT_GRPC_CA_CERT_PATH").map(PathBuf::from),
            })
        } else {
            None
        };

        Ok(Self {
            bind_addr,
            runtime,
            env_name,
            containers_network,
            registry: get("CONTAINER_REGISTRY").map(|r| r.trim_end_matches('/').to_string()),
            registry_insecure: flag("CONTAINER_REGISTRY_INSECURE", false),
            image_prefix: get("IMAGE_PREFIX"),
            containerd_address: PathBuf::from(
                get("CONTAINERD_ADDRESS")
                    .unwrap_or_else(|| "/run/containerd/containerd.sock".to_string()),
            ),
            snapshotter: get("CONTAINERD_SNAPSHOTTER"),
            containerd_runtime: get("CONTAINERD_RUNTIME"),
            cni,
            port_range: (port_min, port_max),
            janitor,
            request_timeout: secs("AGENT_REQUEST_TIMEOUT_SECS", 120)?,
            cleanup_timeout: secs("AGENT_CLEANUP_TIMEOUT_SECS", 10)?,
            shutdown_gc_timeout: secs("AGENT_SHUTDOWN_GC_TIMEOUT_SECS", 30)?,
            reflection: flag("AGENT_GRPC_REFLECTION", false),
            tls,
            runtime_mode_required: get("ESB_RUNTIME_MODE"),
            runtime_mode_strict: flag("AGENT_RUNTIME_MODE_STRICT", false),
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A port variable is not a valid port number.
    #[error("Invalid port number in {0}")]
    InvalidPort(&'static str),
    /// The host port pool is empty or starts at zero.
    #[error("Invalid port range {min}-{max}")]
    InvalidPortRange {
        /// Lower bound.
        min: u16,
        /// Upper bound.
        max: u16,
    },
    /// A variable holds a value that cannot be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}
