// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background reaper for idle and orphaned workers.
//!
//! Each tick lists the backend and destroys:
//! - idle workers: running or paused, unused for at least the idle timeout
//! - orphans: no function label, or never accessed and older than the grace period
//!
//! Workers the gateway still uses are touched on every Ensure and Resume, so
//! the access tracker is the only liveness signal the janitor needs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, WorkerState};
use crate::config::JanitorSettings;
use crate::context::OpContext;
use crate::error::Result;

/// Configuration for the janitor.
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// How often to scan.
    pub interval: Duration,
    /// Workers unused this long are destroyed.
    pub idle_timeout: Duration,
    /// Untracked workers older than this are destroyed.
    pub orphan_grace: Duration,
    /// Deadline for each list or destroy call.
    pub operation_timeout: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self::from_settings(&JanitorSettings::default(), Duration::from_secs(120))
    }
}

impl JanitorConfig {
    /// Build from the agent settings.
    pub fn from_settings(settings: &JanitorSettings, operation_timeout: Duration) -> Self {
        Self {
            interval: settings.interval,
            idle_timeout: settings.idle_timeout,
            orphan_grace: settings.orphan_grace,
            operation_timeout,
        }
    }
}

/// Why a worker is reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    /// Unused past the idle timeout.
    Idle,
    /// Missing its function label.
    Unlabeled,
    /// Never accessed and past the grace period.
    Untracked,
}

impl ReapReason {
    /// Short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Unlabeled => "unlabeled",
            Self::Untracked => "untracked",
        }
    }
}

fn elapsed_at_least(now: DateTime<Utc>, since: DateTime<Utc>, threshold: Duration) -> bool {
    (now - since).to_std().is_ok_and(|elapsed| elapsed >= threshold)
}

/// Decide whether `worker` should be reaped at `now`.
pub fn classify(worker: &WorkerState, now: DateTime<Utc>, config: &JanitorConfig) -> Option<ReapReason> {
    if worker.function_name.is_empty() {
        return Some(ReapReason::Unlabeled);
    }
    if !worker.has_access_record && elapsed_at_least(now, worker.created_at, config.orphan_grace) {
        return Some(ReapReason::Untracked);
    }
    if worker.status.is_live() && elapsed_at_least(now, worker.last_used_at, config.idle_timeout) {
        return Some(ReapReason::Idle);
    }
    None
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Workers listed.
    pub scanned: usize,
    /// Workers destroyed, including ones already gone.
    pub reaped: Vec<String>,
    /// Destroy failures.
    pub errors: usize,
}

/// Background worker that reaps idle and orphaned workers.
pub struct Janitor {
    backend: Arc<dyn Backend>,
    config: JanitorConfig,
    shutdown: Arc<Notify>,
}

impl Janitor {
    /// Create a janitor over `backend`.
    pub fn new(backend: Arc<dyn Backend>, config: JanitorConfig) -> Self {
        Self {
            backend,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            orphan_grace_secs = self.config.orphan_grace.as_secs(),
            "Janitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Janitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    match self.sweep().await {
                        Ok(report) if !report.reaped.is_empty() || report.errors > 0 => info!(
                            scanned = report.scanned,
                            reaped = report.reaped.len(),
                            errors = report.errors,
                            "Janitor sweep complete"
                        ),
                        Ok(report) => debug!(scanned = report.scanned, "Janitor sweep complete"),
                        Err(e) => error!(error = %e, "Janitor failed to list workers"),
                    }
                }
            }
        }

        info!("Janitor stopped");
    }

    /// One pass over the backend.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let ctx = OpContext::with_timeout(self.config.operation_timeout);
        let workers = self.backend.list(&ctx).await?;
        let now = Utc::now();
        let mut report = SweepReport {
            scanned: workers.len(),
            ..Default::default()
        };

        for worker in &workers {
            let Some(reason) = classify(worker, now, &self.config) else {
                continue;
            };
            let ctx = OpContext::with_timeout(self.config.operation_timeout);
            match self.backend.destroy(&ctx, &worker.id).await {
                Ok(()) => {
                    info!(worker_id = %worker.id, function = %worker.function_name, reason = reason.as_str(), "Reaped worker");
                    report.reaped.push(worker.id.clone());
                }
                Err(e) if e.is_not_found() => {
                    debug!(worker_id = %worker.id, "Worker already gone");
                    report.reaped.push(worker.id.clone());
                }
                Err(e) => {
                    warn!(worker_id = %worker.id, reason = reason.as_str(), error = %e, "Failed to reap worker");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::WorkerStatus;

    fn worker(status: WorkerStatus, age_secs: i64, idle_secs: Option<i64>) -> WorkerState {
        let now = Utc::now();
        let created_at = now - chrono::Duration::seconds(age_secs);
        WorkerState {
            id: "w".into(),
            function_name: "echo".into(),
            owner_id: "t".into(),
            status,
            created_at,
            last_used_at: idle_secs
                .map(|s| now - chrono::Duration::seconds(s))
                .unwrap_or(created_at),
            has_access_record: idle_secs.is_some(),
            ip_address: None,
            port: 8080,
            container_name: "w".into(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = JanitorConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.orphan_grace, Duration::from_secs(60));
    }

    #[test]
    fn test_classify() {
        let config = JanitorConfig::default();
        let now = Utc::now();

        // Fresh and recently used.
        assert_eq!(classify(&worker(WorkerStatus::Running, 10, Some(5)), now, &config), None);
        // Idle running and paused.
        assert_eq!(
            classify(&worker(WorkerStatus::Running, 1000, Some(400)), now, &config),
            Some(ReapReason::Idle)
        );
        assert_eq!(
            classify(&worker(WorkerStatus::Paused, 1000, Some(400)), now, &config),
            Some(ReapReason::Idle)
        );
        // Idle but stopped: not an idle reap.
        assert_eq!(classify(&worker(WorkerStatus::Stopped, 1000, Some(400)), now, &config), None);
        // Never accessed, inside and past the grace period.
        assert_eq!(classify(&worker(WorkerStatus::Running, 30, None), now, &config), None);
        assert_eq!(
            classify(&worker(WorkerStatus::Running, 120, None), now, &config),
            Some(ReapReason::Untracked)
        );
        // Missing function label.
        let mut unlabeled = worker(WorkerStatus::Running, 1, Some(1));
        unlabeled.function_name.clear();
        assert_eq!(classify(&unlabeled, now, &config), Some(ReapReason::Unlabeled));
    }

    #[test]
    fn test_future_timestamps_are_not_elapsed() {
        let now = Utc::now();
        assert!(!elapsed_at_least(now, now + chrono::Duration::seconds(5), Duration::ZERO));
        assert!(elapsed_at_least(now, now, Duration::ZERO));
    }
}
