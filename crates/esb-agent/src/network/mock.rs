// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock CNI plugin for testing.
//!
//! Hands out sequential addresses and can be told to fail upcoming ADDs.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::plugin::{CniPlugin, CniRequest};
use crate::cni::{CniError, CniInterface, CniIpConfig, CniResult};

/// Scripted ADD outcome.
#[derive(Debug, Clone)]
pub enum MockAddOutcome {
    /// Transient "Link not found" failure.
    LinkNotFound,
    /// Permanent plugin failure.
    Fail(String),
    /// Succeed but only report the host-side bridge interface.
    HostSideOnly,
}

#[derive(Debug, Default)]
struct MockState {
    next_host: u8,
    attached: HashMap<String, CniRequest>,
    script: VecDeque<MockAddOutcome>,
    add_calls: usize,
    del_calls: Vec<String>,
    cancel_on_add: Option<CancellationToken>,
}

/// Mock CNI plugin.
#[derive(Debug, Clone, Default)]
pub struct MockCniPlugin {
    state: Arc<Mutex<MockState>>,
}

impl MockCniPlugin {
    /// Create a mock that succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue outcomes for the next ADD calls, in order.
    pub fn script(&self, outcomes: impl IntoIterator<Item = MockAddOutcome>) {
        self.lock().script.extend(outcomes);
    }

    /// Cancel `token` after the next successful ADD, simulating a caller that
    /// goes away once the network is attached.
    pub fn cancel_after_add(&self, token: CancellationToken) {
        self.lock().cancel_on_add = Some(token);
    }

    /// Number of ADD calls, failed ones included.
    pub fn add_calls(&self) -> usize {
        self.lock().add_calls
    }

    /// Container ids DEL was called for.
    pub fn del_calls(&self) -> Vec<String> {
        self.lock().del_calls.clone()
    }

    /// Ids currently attached.
    pub fn attached(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().attached.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The last ADD request for `id`.
    pub fn request_for(&self, id: &str) -> Option<CniRequest> {
        self.lock().attached.get(id).cloned()
    }
}

fn bridge_side() -> CniInterface {
    CniInterface {
        name: "esb0".to_string(),
        mac: "02:00:00:00:00:01".to_string(),
        sandbox: String::new(),
        ip_configs: vec![CniIpConfig {
            ip: IpAddr::V4(Ipv4Addr::new(10, 88, 0, 1)),
            gateway: None,
        }],
    }
}

#[async_trait]
impl CniPlugin for MockCniPlugin {
    fn network_name(&self) -> &str {
        "mock-net"
    }

    async fn add(&self, req: &CniRequest) -> Result<CniResult, CniError> {
        let mut state = self.lock();
        state.add_calls += 1;
        match state.script.pop_front() {
            Some(MockAddOutcome::LinkNotFound) => {
                return Err(CniError::Plugin {
                    plugin: "bridge".to_string(),
                    code: 11,
                    msg: "failed to set bridge addr".to_string(),
                    details: "Link not found".to_string(),
                });
            }
            Some(MockAddOutcome::Fail(msg)) => {
                return Err(CniError::Plugin {
                    plugin: "bridge".to_string(),
                    code: 999,
                    msg,
                    details: String::new(),
                });
            }
            Some(MockAddOutcome::HostSideOnly) => {
                state.attached.insert(req.container_id.clone(), req.clone());
                return Ok(CniResult {
                    interfaces: vec![bridge_side()],
                    raw: Value::Null,
                });
            }
            None => {}
        }

        state.next_host = state.next_host.wrapping_add(1).max(2);
        let host = state.next_host;
        state.attached.insert(req.container_id.clone(), req.clone());
        if let Some(token) = state.cancel_on_add.take() {
            token.cancel();
        }
        Ok(CniResult {
            interfaces: vec![
                bridge_side(),
                CniInterface {
                    name: req.ifname.clone(),
                    mac: "02:00:00:00:00:02".to_string(),
                    sandbox: req.netns.clone(),
                    ip_configs: vec![CniIpConfig {
                        ip: IpAddr::V4(Ipv4Addr::new(10, 88, 0, host)),
                        gateway: Some(IpAddr::V4(Ipv4Addr::new(10, 88, 0, 1))),
                    }],
                },
            ],
            raw: Value::Null,
        })
    }

    async fn del(&self, req: &CniRequest) -> Result<(), CniError> {
        let mut state = self.lock();
        state.del_calls.push(req.container_id.clone());
        state.attached.remove(&req.container_id);
        Ok(())
    }
}
