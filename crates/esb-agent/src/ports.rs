// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host port pool.
//!
//! Each worker gets one host port mapped to its in-sandbox port 8080. The
//! allocator hands out the lowest port that is neither reserved nor bound by
//! another process.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use crate::error::ErrorKind;

/// Port pool errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// No free port left in the range.
    #[error("no free host port in range {min}-{max}")]
    PoolExhausted {
        /// Lower bound.
        min: u16,
        /// Upper bound.
        max: u16,
    },

    /// Range is empty or starts at zero.
    #[error("invalid port range {min}-{max}")]
    InvalidRange {
        /// Lower bound.
        min: u16,
        /// Upper bound.
        max: u16,
    },
}

impl PortError {
    /// Error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PortError::PoolExhausted { .. } => ErrorKind::ResourceExhausted,
            PortError::InvalidRange { .. } => ErrorKind::InvalidArgument,
        }
    }
}

/// Bounded pool of host TCP ports.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    used: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Create a pool over `min..=max`.
    pub fn new(min: u16, max: u16) -> Result<Self, PortError> {
        if min == 0 || min > max {
            return Err(PortError::InvalidRange { min, max });
        }
        Ok(Self {
            min,
            max,
            used: Mutex::new(HashSet::new()),
        })
    }

    /// The configured range.
    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// Reserve the lowest free port.
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        for port in self.min..=self.max {
            if used.contains(&port) {
                continue;
            }
            if !is_bindable(port) {
                debug!(port, "Host port busy, skipping");
                continue;
            }
            used.insert(port);
            return Ok(port);
        }
        Err(PortError::PoolExhausted {
            min: self.min,
            max: self.max,
        })
    }

    /// Return a port to the pool. Unknown and out-of-range ports are ignored.
    pub fn release(&self, port: u16) {
        if port < self.min || port > self.max {
            return;
        }
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        used.remove(&port);
    }

    /// Whether `port` is currently reserved.
    pub fn is_reserved(&self, port: u16) -> bool {
        let used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        used.contains(&port)
    }

    /// Number of reserved ports.
    pub fn reserved_count(&self) -> usize {
        let used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        used.len()
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).is_ok()
}
