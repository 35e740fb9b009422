// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process wiring: CNI preparation, image resolution and backend construction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::backend::Backend;
use crate::backend::daemon::{DaemonBackend, DockerCli};
use crate::backend::supervisor::{CtrClient, ResolvConf, SupervisorBackend};
use crate::cni::{self, CniError};
use crate::config::{CniSettings, Config, RuntimeKind};
use crate::identity::Identity;
use crate::image::{ImageResolver, RuntimeMode, RuntimeObservation, RuntimeRequirement};
use crate::network::{ConflistPlugin, NetworkFabric};
use crate::ports::PortAllocator;

/// File name of the shell-sourceable network identity written next to the
/// runtime CNI configs.
pub const IDENTITY_FILE: &str = "identity.env";

/// Subnet for this node: the explicit one, else the first slot in the brand's
/// probe chain that no other network in `conf_dir` claims.
pub fn select_subnet(settings: &CniSettings, identity: &Identity) -> Result<String, CniError> {
    if let Some(subnet) = &settings.subnet {
        return Ok(subnet.clone());
    }
    let claims = cni::collect_subnet_claims(&settings.conf_dir, &identity.cni_network())?;
    let subnet = cni::pick_free_subnet(identity, &claims)
        .ok_or(CniError::Malformed("no free CNI subnet left in the pool"))?;
    if !claims.is_empty() {
        info!(claims = claims.len(), subnet = %subnet, "Derived non-conflicting CNI subnet");
    }
    Ok(subnet.to_string())
}

/// Generate a brand-scoped conflist under `conf_dir` and record the network
/// identity under `runtime_dir`.
fn generate(settings: &CniSettings, identity: &Identity, runtime_dir: &Path) -> Result<PathBuf, CniError> {
    let subnet = select_subnet(settings, identity)?;
    let dns = cni::resolve_dns_server(
        settings.dns_server.as_deref(),
        settings.gateway_ip.as_deref(),
        Some(&subnet),
    );
    let network = identity.cni_network();
    let bridge = identity.cni_bridge();
    let path = cni::generate_config(&settings.conf_dir, &subnet, &network, &bridge, &dns)?;
    cni::write_identity_file(&runtime_dir.join(IDENTITY_FILE), &network, &bridge, &subnet)?;
    Ok(path)
}

/// Narrow the base conflist to this node's subnet.
fn shape(settings: &CniSettings, identity: &Identity, runtime_dir: &Path) -> Result<PathBuf, CniError> {
    let subnet = select_subnet(settings, identity)?;
    let dns = cni::resolve_dns_server(
        settings.dns_server.as_deref(),
        settings.gateway_ip.as_deref(),
        None,
    );
    cni::shape_config(&settings.conf_file, &subnet, &dns, runtime_dir)
}

/// Pick the conflist the fabric loads. Generation errors are fatal; shaping
/// errors fall back to the unmodified base file.
pub fn prepare_cni(settings: &CniSettings, identity: &Identity, runtime_dir: &Path) -> Result<PathBuf> {
    if settings.generate {
        return generate(settings, identity, runtime_dir).context("generate CNI config");
    }
    match shape(settings, identity, runtime_dir) {
        Ok(path) => Ok(path),
        Err(e) => {
            warn!(
                base = %settings.conf_file.display(),
                error = %e,
                "CNI subnet shaping failed; using base config"
            );
            Ok(settings.conf_file.clone())
        }
    }
}

/// Mode observed for a backend kind.
pub fn observed_mode(kind: RuntimeKind) -> RuntimeMode {
    match kind {
        RuntimeKind::Daemon => RuntimeMode::Daemon,
        RuntimeKind::Supervisor => RuntimeMode::Supervisor,
    }
}

/// Build the image resolver and check the declared runtime mode against the
/// selected backend. A strict mismatch aborts startup.
pub fn image_resolver<F>(config: &Config, identity: &Identity, lookup: F) -> Result<ImageResolver>
where
    F: Fn(&str) -> Option<String>,
{
    let tag = crate::image::resolve_tag(identity, lookup);
    let observation = RuntimeObservation {
        mode: Some(observed_mode(config.runtime)),
        version_tag: tag.clone(),
        source: "agent".to_string(),
    };

    let requirement = RuntimeRequirement {
        mode: config.runtime_mode_required.as_deref().and_then(RuntimeMode::parse),
        version_tag: None,
        strict: config.runtime_mode_strict,
    };
    for warning in crate::image::check_requirement(&requirement, Some(&observation))? {
        warn!("{}", warning);
    }

    info!(
        registry = config.registry.as_deref().unwrap_or("<none>"),
        tag = %tag,
        "Image resolver ready"
    );
    Ok(ImageResolver::new(
        identity,
        config.registry.clone(),
        config.image_prefix.clone(),
        tag,
    )
    .with_observation(observation))
}

/// Build the backend selected by `config`.
pub fn build_backend(config: &Config, identity: &Identity, resolver: ImageResolver) -> Result<Arc<dyn Backend>> {
    match config.runtime {
        RuntimeKind::Daemon => {
            info!(network = %config.containers_network, "Using daemon backend");
            let backend = DaemonBackend::new(
                Arc::new(DockerCli::default()),
                identity.clone(),
                &config.env_name,
                &config.containers_network,
                resolver,
            )
            .with_cleanup_timeout(config.cleanup_timeout);
            Ok(Arc::new(backend))
        }
        RuntimeKind::Supervisor => {
            let runtime_dir = PathBuf::from(identity.cni_runtime_dir());
            let conf_file = prepare_cni(&config.cni, identity, &runtime_dir)?;
            let plugin = ConflistPlugin::load(&conf_file, &config.cni.bin_dir)
                .with_context(|| format!("load CNI config {}", conf_file.display()))?;
            let (min, max) = config.port_range;
            let ports = Arc::new(PortAllocator::new(min, max)?);
            let fabric = Arc::new(NetworkFabric::new(Arc::new(plugin), ports, &config.cni.net_dir));

            let dns = cni::resolve_dns_server(
                config.cni.dns_server.as_deref(),
                config.cni.gateway_ip.as_deref(),
                config.cni.subnet.as_deref(),
            );
            let resolv_conf = ResolvConf::new(identity.resolv_conf_path(), dns);
            let client = CtrClient::new(&config.containerd_address, identity.namespace());

            info!(
                network = %fabric.network_name(),
                conf = %conf_file.display(),
                namespace = %identity.namespace(),
                "Using supervisor backend"
            );
            let backend = SupervisorBackend::new(
                Arc::new(client),
                fabric,
                identity.clone(),
                &config.env_name,
                resolver,
                resolv_conf,
            )
            .with_runtime(config.containerd_runtime.clone(), config.snapshotter.clone())
            .with_plain_http(config.registry_insecure)
            .with_cleanup_timeout(config.cleanup_timeout);
            Ok(Arc::new(backend))
        }
    }
}
