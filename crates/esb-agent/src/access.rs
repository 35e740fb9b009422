// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Last-used timestamps per worker. In memory only.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

/// Concurrent map of worker id to last access time.
#[derive(Debug, Default)]
pub struct AccessTracker {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl AccessTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access now.
    pub fn touch(&self, worker_id: &str) {
        self.touch_at(worker_id, Utc::now());
    }

    /// Record an access at `at`. Last writer wins.
    pub fn touch_at(&self, worker_id: &str, at: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(worker_id.to_string(), at);
    }

    /// Last access, if any.
    pub fn get(&self, worker_id: &str) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(worker_id).copied()
    }

    /// Drop the record for `worker_id`.
    pub fn forget(&self, worker_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(worker_id);
    }

    /// Copy of all records.
    pub fn snapshot(&self) -> HashMap<String, DateTime<Utc>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of tracked workers.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
