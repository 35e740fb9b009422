// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the esb agent.

use esb_protocol::agent_proto::codes;
use thiserror::Error;

/// Coarse classification used for rollback decisions and RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-fixable input problem.
    InvalidArgument,
    /// Worker id unknown to the backend.
    NotFound,
    /// Worker belongs to a different owner.
    PermissionDenied,
    /// Reserved for admission logic.
    Conflict,
    /// Port pool empty or a kernel limit was hit.
    ResourceExhausted,
    /// Retryable condition that outlived its retry window.
    Transient,
    /// Operation not available on this backend or payload type.
    Unsupported,
    /// Caller cancelled or its deadline passed.
    Cancelled,
    /// Everything else.
    Internal,
}

/// Agent errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Brand identity could not be resolved.
    #[error("Identity error: {0}")]
    Identity(#[from] crate::identity::IdentityError),

    /// Host port pool error.
    #[error("Port allocation error: {0}")]
    Ports(#[from] crate::ports::PortError),

    /// CNI configuration or plugin error.
    #[error("CNI error: {0}")]
    Cni(#[from] crate::cni::CniError),

    /// Image reference could not be resolved.
    #[error("Image error: {0}")]
    Image(#[from] crate::image::ImageError),

    /// Metrics payload could not be interpreted.
    #[error("Metrics error: {0}")]
    Metrics(#[from] crate::metrics::MetricsError),

    /// Request validation failed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Worker not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Worker belongs to another owner.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Conflicting state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation not supported by this backend.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation deadline passed.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The runtime (daemon or supervisor) reported a failure.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::Image(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Ports(e) => e.kind(),
            Error::Cni(e) if e.is_link_not_found() => ErrorKind::Transient,
            Error::Metrics(crate::metrics::MetricsError::UnsupportedType(_))
            | Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Cancelled | Error::DeadlineExceeded => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Canonical RPC code for this error.
    pub fn rpc_code(&self) -> &'static str {
        match self {
            Error::DeadlineExceeded => codes::DEADLINE_EXCEEDED,
            _ => match self.kind() {
                ErrorKind::InvalidArgument => codes::INVALID_ARGUMENT,
                ErrorKind::NotFound => codes::NOT_FOUND,
                ErrorKind::PermissionDenied => codes::PERMISSION_DENIED,
                ErrorKind::Conflict => codes::ALREADY_EXISTS,
                ErrorKind::ResourceExhausted => codes::RESOURCE_EXHAUSTED,
                ErrorKind::Transient => codes::UNAVAILABLE,
                ErrorKind::Unsupported => codes::UNIMPLEMENTED,
                ErrorKind::Cancelled => codes::CANCELLED,
                ErrorKind::Internal => codes::INTERNAL,
            },
        }
    }

    /// Shorthand for an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Shorthand for a worker-not-found error.
    pub fn worker_not_found(id: &str) -> Self {
        Error::NotFound(format!("worker {} not found", id))
    }

    /// Shorthand for a runtime failure.
    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime(msg.into())
    }
}

/// Result type using the agent Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortError;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::invalid_argument("owner_id is required").kind(),
            ErrorKind::InvalidArgument
        );
        assert!(Error::worker_not_found("acme-prod-echo-1").is_not_found());
        assert_eq!(
            Error::from(PortError::PoolExhausted { min: 1, max: 2 }).kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(Error::runtime("boom").kind(), ErrorKind::Internal);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_rpc_codes() {
        assert_eq!(Error::Unsupported("pause".into()).rpc_code(), "UNIMPLEMENTED");
        assert_eq!(Error::DeadlineExceeded.rpc_code(), "DEADLINE_EXCEEDED");
        assert_eq!(Error::Cancelled.rpc_code(), "CANCELLED");
        assert_eq!(
            Error::PermissionDenied("owner mismatch".into()).rpc_code(),
            "PERMISSION_DENIED"
        );
        assert_eq!(Error::runtime("exit 1").rpc_code(), "INTERNAL");
    }
}
