//! Error types for the reconciler crate.

use std::time::Duration;

use thiserror::Error;

use crate::types::{ObjectKey, ResourceKind};

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for object store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned by an object store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{kind} '{key}' not found")]
    NotFound { kind: ResourceKind, key: ObjectKey },

    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: ResourceKind, key: ObjectKey },

    #[error("conflict writing {kind} '{key}': the object has been modified")]
    Conflict { kind: ResourceKind, key: ObjectKey },

    #[error("deadline of {timeout:?} exceeded")]
    DeadlineExceeded { timeout: Duration },

    #[error("store request failed: {reason}")]
    Api { reason: String },
}

impl StoreError {
    /// Create a not found error.
    pub const fn not_found(kind: ResourceKind, key: ObjectKey) -> Self {
        Self::NotFound { kind, key }
    }

    /// Create an already exists error.
    pub const fn already_exists(kind: ResourceKind, key: ObjectKey) -> Self {
        Self::AlreadyExists { kind, key }
    }

    /// Create a write conflict error.
    pub const fn conflict(kind: ResourceKind, key: ObjectKey) -> Self {
        Self::Conflict { kind, key }
    }

    /// Create a deadline exceeded error.
    pub const fn deadline_exceeded(timeout: Duration) -> Self {
        Self::DeadlineExceeded { timeout }
    }

    /// Create a generic API error.
    pub fn api(reason: impl Into<String>) -> Self {
        Self::Api {
            reason: reason.into(),
        }
    }

    /// Whether the object was absent.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether an optimistic-concurrency write lost the race.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Reconciler errors. Every variant is transient and is retried by the
/// scheduler with backoff.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("failed to get versions config map: {source}")]
    VersionsRecordRead {
        #[source]
        source: StoreError,
    },

    #[error("failed to get control plane token secret: {source}")]
    TokenSecretRead {
        #[source]
        source: StoreError,
    },

    #[error("failed to delete agent deployment: {source}")]
    WorkloadDelete {
        #[source]
        source: StoreError,
    },

    #[error("failed to sync agent deployment: {source}")]
    WorkloadSync {
        #[source]
        source: StoreError,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Wrap a versions ConfigMap read failure.
    pub const fn versions_record_read(source: StoreError) -> Self {
        Self::VersionsRecordRead { source }
    }

    /// Wrap a token Secret read failure.
    pub const fn token_secret_read(source: StoreError) -> Self {
        Self::TokenSecretRead { source }
    }

    /// Wrap an agent Deployment delete failure.
    pub const fn workload_delete(source: StoreError) -> Self {
        Self::WorkloadDelete { source }
    }

    /// Wrap an agent Deployment upsert failure.
    pub const fn workload_sync(source: StoreError) -> Self {
        Self::WorkloadSync { source }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AGENT_DEPLOYMENT;

    #[test]
    fn test_error_display_wraps_cause() {
        let err = Error::workload_sync(StoreError::conflict(
            ResourceKind::Deployment,
            ObjectKey::new("upbound-system", AGENT_DEPLOYMENT),
        ));
        let msg = err.to_string();
        assert!(msg.starts_with("failed to sync agent deployment"));
        assert!(msg.contains("upbound-system/upbound-agent"));
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        let err = StoreError::not_found(ResourceKind::Secret, ObjectKey::new("ns", "token"));
        assert!(err.is_not_found());
        assert!(!StoreError::api("connection reset").is_not_found());
    }
}
