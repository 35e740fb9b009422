// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for esb-agent integration tests.
//!
//! Provides a TestContext wiring a supervisor backend to an in-memory
//! supervisor and a mock CNI plugin over a temporary state directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use esb_agent::backend::supervisor::{MockSupervisor, ResolvConf, SupervisorBackend};
use esb_agent::backend::{EnsureRequest, Labels};
use esb_agent::identity::Identity;
use esb_agent::image::ImageResolver;
use esb_agent::network::{MockCniPlugin, NetworkFabric, RetryPolicy};
use esb_agent::ports::PortAllocator;

pub const BRAND: &str = "acme";
pub const ENV: &str = "test";

/// Supervisor backend over mocks.
pub struct TestContext {
    pub backend: Arc<SupervisorBackend>,
    pub supervisor: MockSupervisor,
    pub plugin: MockCniPlugin,
    pub ports: Arc<PortAllocator>,
    pub fabric: Arc<NetworkFabric>,
    pub identity: Identity,
    pub labels: Labels,
    pub temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Create a new test context with a 10-port pool.
    pub fn new() -> Self {
        Self::with_identity(Identity::from_slug(BRAND).expect("identity"), ENV)
    }

    /// Same, for a given identity and worker environment.
    pub fn with_identity(identity: Identity, env_name: &str) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");

        let supervisor = MockSupervisor::new();
        let plugin = MockCniPlugin::new();
        let ports = Arc::new(PortAllocator::new(41000, 41009).expect("port range"));
        let fabric = Arc::new(
            NetworkFabric::new(
                Arc::new(plugin.clone()),
                ports.clone(),
                temp_dir.path().join("networks"),
            )
            .with_retry(RetryPolicy {
                attempts: 5,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(8),
            }),
        );

        let resolver = ImageResolver::new(&identity, None, None, "latest".to_string());
        let resolv_conf = ResolvConf::new(temp_dir.path().join("resolv.conf"), "10.88.0.1");

        let backend = Arc::new(
            SupervisorBackend::new(
                Arc::new(supervisor.clone()),
                fabric.clone(),
                identity.clone(),
                env_name,
                resolver,
                resolv_conf,
            )
            .with_cleanup_timeout(Duration::from_secs(2))
            .with_kill_wait_timeout(Duration::from_millis(200)),
        );

        Self {
            labels: Labels::new(&identity, env_name),
            backend,
            supervisor,
            plugin,
            ports,
            fabric,
            identity,
            temp_dir,
        }
    }

    /// Labels of a managed worker.
    pub fn worker_labels(&self, function: &str, owner: &str) -> HashMap<String, String> {
        self.labels.for_worker(function, owner)
    }

    /// Path of a worker's IP side file.
    pub fn ip_file(&self, worker_id: &str) -> std::path::PathBuf {
        self.temp_dir
            .path()
            .join("networks")
            .join(self.fabric.network_name())
            .join(worker_id)
    }
}

/// An ensure request for `function` owned by `owner`.
pub fn ensure_request(function: &str, owner: &str) -> EnsureRequest {
    EnsureRequest {
        function_name: function.to_string(),
        owner_id: owner.to_string(),
        ..Default::default()
    }
}
