// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory daemon for backend tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::client::{CreateSpec, DaemonClient, DaemonContainer};
use crate::error::{Error, Result};

/// Where [`MockDaemon`] injects a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonFailure {
    /// `pull` fails.
    Pull,
    /// `create` fails.
    Create,
    /// `start` fails.
    Start,
    /// `inspect` fails.
    Inspect,
}

#[derive(Debug, Default)]
struct State {
    containers: HashMap<String, DaemonContainer>,
    failure: Option<DaemonFailure>,
    ip_after_inspects: u32,
    inspects: HashMap<String, u32>,
    pulls: Vec<String>,
    removes: Vec<String>,
    created_env: HashMap<String, HashMap<String, String>>,
    next: u32,
}

/// In-memory [`DaemonClient`]. Containers are keyed by name; ids and names
/// both resolve.
#[derive(Debug, Clone, Default)]
pub struct MockDaemon {
    state: Arc<Mutex<State>>,
}

impl MockDaemon {
    /// Empty daemon.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inject a failure.
    pub fn fail_at(&self, failure: DaemonFailure) {
        self.lock().failure = Some(failure);
    }

    /// Report no IP for the first `n` inspects of each container.
    pub fn ip_after_inspects(&self, n: u32) {
        self.lock().ip_after_inspects = n;
    }

    /// Add a container directly.
    pub fn insert(&self, container: DaemonContainer) {
        self.lock().containers.insert(container.name.clone(), container);
    }

    /// Names of existing containers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().containers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Images pulled so far.
    pub fn pulls(&self) -> Vec<String> {
        self.lock().pulls.clone()
    }

    /// Names passed to `remove`, including failed ones.
    pub fn removes(&self) -> Vec<String> {
        self.lock().removes.clone()
    }

    /// Environment a container was created with.
    pub fn env_of(&self, name: &str) -> Option<HashMap<String, String>> {
        self.lock().created_env.get(name).cloned()
    }

    /// Set the state of a container.
    pub fn set_state(&self, name: &str, state: &str, pid: u32) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.state = state.to_string();
            c.pid = pid;
        }
    }
}

fn key_of(state: &State, id: &str) -> Option<String> {
    if state.containers.contains_key(id) {
        return Some(id.to_string());
    }
    state
        .containers
        .values()
        .find(|c| c.id == id)
        .map(|c| c.name.clone())
}

fn no_such(id: &str) -> Error {
    Error::NotFound(format!("No such container: {}", id))
}

#[async_trait]
impl DaemonClient for MockDaemon {
    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<DaemonContainer>> {
        let state = self.lock();
        let mut out: Vec<_> = state
            .containers
            .values()
            .filter(|c| labels.iter().all(|(k, v)| c.labels.get(k) == Some(v)))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        let mut state = self.lock();
        if state.failure == Some(DaemonFailure::Create) {
            return Err(Error::runtime("create refused"));
        }
        if state.containers.contains_key(&spec.name) {
            return Err(Error::runtime(format!("name {} already in use", spec.name)));
        }
        state.next += 1;
        let id = format!("{:064x}", state.next);
        let ip = format!("172.20.0.{}", state.next + 1);
        state.containers.insert(
            spec.name.clone(),
            DaemonContainer {
                id: id.clone(),
                name: spec.name.clone(),
                state: "created".to_string(),
                pid: 0,
                exit_code: 0,
                finished_at: None,
                created_at: Utc::now(),
                labels: spec.labels.clone(),
                networks: BTreeMap::from([(spec.network.clone(), ip)]),
            },
        );
        state.created_env.insert(spec.name.clone(), spec.env.clone());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.failure == Some(DaemonFailure::Start) {
            return Err(Error::runtime("start refused"));
        }
        let key = key_of(&state, id).ok_or_else(|| no_such(id))?;
        let pid = 1000 + state.next;
        if let Some(c) = state.containers.get_mut(&key) {
            c.state = "running".to_string();
            c.pid = pid;
        }
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<DaemonContainer> {
        let mut state = self.lock();
        if state.failure == Some(DaemonFailure::Inspect) {
            return Err(Error::runtime("inspect refused"));
        }
        let key = key_of(&state, id).ok_or_else(|| no_such(id))?;
        let threshold = state.ip_after_inspects;
        let seen = state.inspects.entry(key.clone()).or_insert(0);
        *seen += 1;
        let hide_ip = *seen <= threshold;
        let mut container = state.containers.get(&key).cloned().ok_or_else(|| no_such(id))?;
        if hide_ip {
            for ip in container.networks.values_mut() {
                ip.clear();
            }
        }
        Ok(container)
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<()> {
        let mut state = self.lock();
        state.removes.push(id.to_string());
        let key = key_of(&state, id).ok_or_else(|| no_such(id))?;
        state.containers.remove(&key);
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        let mut state = self.lock();
        if state.failure == Some(DaemonFailure::Pull) {
            return Err(Error::runtime(format!("pull access denied for {}", image)));
        }
        state.pulls.push(image.to_string());
        Ok(())
    }
}
