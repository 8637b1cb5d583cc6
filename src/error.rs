// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the synchronization engine.
//!
//! The remote store reports failures as [`StoreError`] with an explicit
//! [`FailureKind`] classification; that classification is the contract the
//! retry controller depends on. Everything else is a [`SyncError`].
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` (transient) | Yes | Network timeouts, 5xx, quota exceeded |
//! | `Store` (permanent) | No | Auth rejected, malformed request, sheet not found |
//! | `RetriesExhausted` | No | Transient failures past the retry budget |
//! | `Contended` | No | Lease unavailable within the timeout |
//! | `LeaseExpired` | No | A held lease lapsed and was lost |
//! | `InvalidRecord` | No | Record fails schema validation |
//! | `Config` | No | Configuration invalid |
//! | `Snapshot` | No | Local SQLite errors (needs operator attention) |
//! | `InvalidState` | No | Engine lifecycle violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`SyncError::is_retryable()`] to determine if an operation should be
//! retried with backoff. Only transient store failures qualify;
//! `RetriesExhausted` is terminal but kept distinct from permanent failures
//! for diagnostics.

use thiserror::Error;

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Classification of a remote store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network timeout, 5xx, quota exceeded. Retryable with backoff.
    Transient,
    /// Auth rejected, malformed request, sheet not found. Never retried.
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// A failure reported by the remote store client.
///
/// Every remote operation fails with one of these; `operation` names the
/// store call (`read_all`, `append_row`, ...) for logs and metrics.
#[derive(Error, Debug, Clone)]
#[error("{operation} failed ({kind}): {message}")]
pub struct StoreError {
    /// Transient vs permanent, per the client contract.
    pub kind: FailureKind,
    /// The store operation that failed.
    pub operation: String,
    /// Human-readable failure detail.
    pub message: String,
}

impl StoreError {
    /// Create a transient (retryable) store error.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a permanent (never retried) store error.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this failure is transient.
    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

/// Errors surfaced by the synchronization engine.
///
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried; only the retry controller does so internally.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Remote store failure, classified by the client.
    #[error("Remote store error: {0}")]
    Store(#[from] StoreError),

    /// Transient failures persisted past the retry budget.
    ///
    /// Terminal for the sync call, but distinct from a permanent store
    /// failure so operators can tell an outage from a misconfiguration.
    #[error("Retries exhausted for {operation} after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: StoreError,
    },

    /// Lease unavailable within the caller's timeout.
    ///
    /// The caller decides whether to re-attempt; the engine does not loop.
    #[error("Lease contended: {key}")]
    Contended { key: String },

    /// A held lease expired (and may have been taken over) before the
    /// operation completed.
    #[error("Lease expired: {key}")]
    LeaseExpired { key: String },

    /// Record failed schema validation (empty uid, unknown column,
    /// confidence out of range).
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQLite error in the index snapshot store.
    ///
    /// Not retryable. The snapshot is disposable; delete it and restart.
    #[error("Snapshot store error: {0}")]
    Snapshot(#[from] sqlx::Error),

    /// Engine lifecycle violation (e.g. `sync()` before `start()`).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::RetriesExhausted { .. } => false,
            Self::Contended { .. } => false,
            Self::LeaseExpired { .. } => false,
            Self::InvalidRecord(_) => false,
            Self::Config(_) => false,
            Self::Snapshot(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_store_error_retryable() {
        let err = SyncError::from(StoreError::transient("append_row", "quota exceeded"));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("append_row"));
    }

    #[test]
    fn test_permanent_store_error_not_retryable() {
        let err = SyncError::from(StoreError::permanent("read_all", "401 unauthorized"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retries_exhausted_not_retryable() {
        let err = SyncError::RetriesExhausted {
            operation: "update_row".to_string(),
            attempts: 5,
            last: StoreError::transient("update_row", "timeout"),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("5 attempts"));
    }

    #[test]
    fn test_contended_not_retryable() {
        let err = SyncError::Contended {
            key: "INV-001".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("INV-001"));
    }

    #[test]
    fn test_lease_expired_not_retryable() {
        let err = SyncError::LeaseExpired {
            key: "INV-002".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_record_not_retryable() {
        let err = SyncError::InvalidRecord("empty uid".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_state_formatting() {
        let err = SyncError::InvalidState {
            expected: "Running".to_string(),
            actual: "Created".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Running"));
        assert!(err.to_string().contains("Created"));
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::Transient.to_string(), "transient");
        assert_eq!(FailureKind::Permanent.to_string(), "permanent");
    }

    #[test]
    fn test_store_error_formatting() {
        let err = StoreError::transient("batch_read", "connection reset");
        let msg = err.to_string();
        assert!(msg.contains("batch_read"));
        assert!(msg.contains("transient"));
        assert!(msg.contains("connection reset"));
    }
}
