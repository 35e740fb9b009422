// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation context: cancellation plus an optional deadline.
//!
//! Every backend operation receives an [`OpContext`]. Long waits go through
//! [`OpContext::run`] or [`OpContext::sleep`] so they stop as soon as the
//! caller cancels or the deadline passes.
//!
//! Rollback after a partial failure must not inherit the caller's
//! cancellation. [`OpContext::detached`] creates a context with a fresh token
//! and a short hard deadline for that purpose.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Cancellation token and deadline for one logical operation.
#[derive(Debug, Clone)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    detached: bool,
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

impl OpContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            detached: false,
        }
    }

    /// A context bound to an existing token, e.g. the process shutdown token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
            detached: false,
        }
    }

    /// A context with a deadline `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
            detached: false,
        }
    }

    /// A cleanup context: unrelated to any caller token, bounded by `timeout`.
    pub fn detached(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
            detached: true,
        }
    }

    /// A child that is cancelled with this context and may have a tighter deadline.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout) {
            (Some(d), Some(t)) => Some(d.min(Instant::now() + t)),
            (None, Some(t)) => Some(Instant::now() + t),
            (d, None) => d,
        };
        Self {
            token: self.token.child_token(),
            deadline,
            detached: self.detached,
        }
    }

    /// Whether this context was created by [`OpContext::detached`].
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this context and all children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail fast when the context is already done.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the context is cancelled, or the deadline passes.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = deadline => Err(Error::DeadlineExceeded),
            out = fut => out,
        }
    }

    /// Sleep for `duration` unless the context ends first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}
