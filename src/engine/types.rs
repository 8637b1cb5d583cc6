//! Engine state and outcome types.
//!
//! Defines the lifecycle state machine for the engine and the per-call
//! sync outcomes.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                             │
//!    │ (never started)             │ (index ready)
//!    ↓                             ↓
//! Stopped ←──── ShuttingDown ← Running
//!                    ↑             │
//!          shutdown()└─────────────┘
//!                                  │ (unrecoverable start error)
//!                                  ↓
//!                               Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `SyncEngine::new()`. No remote I/O yet.
//! - **Starting**: `start()` called; loading the snapshot or rebuilding the index.
//! - **Running**: Normal operation; `sync()` calls accepted.
//! - **ShuttingDown**: `shutdown()` called; flushing the snapshot.
//! - **Stopped**: Graceful shutdown complete. Safe to drop.
//! - **Failed**: Unrecoverable startup error. Check logs.

/// State of the synchronization engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    Created,
    /// Loading the snapshot or rebuilding the index.
    Starting,
    /// Running; `sync()` calls accepted.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
    /// Stopped. Safe to drop or recreate.
    Stopped,
    /// Failed to start.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Result of one successful `sync` call.
///
/// Failures are the `Err` arm of the call itself (contention, retry
/// exhaustion, permanent store errors); a `SyncOutcome` is only produced
/// once the remote store is confirmed to hold the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A new row was appended at this index.
    Created(u32),
    /// An existing row was overwritten at this index.
    Updated(u32),
    /// The remote row already matched; no write was issued.
    Unchanged,
}

impl SyncOutcome {
    /// The row index touched, if a write happened.
    pub fn row_index(&self) -> Option<u32> {
        match self {
            Self::Created(row) | Self::Updated(row) => Some(*row),
            Self::Unchanged => None,
        }
    }

    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created(row) => write!(f, "created(row {})", row),
            Self::Updated(row) => write!(f, "updated(row {})", row),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Outcome carried on the event stream, including failures.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// A new row was appended.
    Created(u32),
    /// An existing row was overwritten.
    Updated(u32),
    /// No write was needed.
    Unchanged,
    /// The sync failed; the reason is the error's display form.
    Failed(String),
}

impl From<SyncOutcome> for EventOutcome {
    fn from(outcome: SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::Created(row) => Self::Created(row),
            SyncOutcome::Updated(row) => Self::Updated(row),
            SyncOutcome::Unchanged => Self::Unchanged,
        }
    }
}

/// One entry on the optional outcome event stream.
///
/// Emitted for every `sync` call, success or failure. A feedback/training
/// subsystem can subscribe without the engine knowing about it.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    /// Business key of the synced record.
    pub uid: String,
    /// What happened.
    pub outcome: EventOutcome,
}

/// Point-in-time engine diagnostics.
///
/// Collected without remote I/O; all data comes from cached internal
/// state.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Current lifecycle state.
    pub state: EngineState,
    /// Whether `sync()` calls are currently accepted.
    pub ready: bool,
    /// Whether the uniqueness index has been built or adopted.
    pub index_built: bool,
    /// Entries in the uniqueness index.
    pub index_entries: usize,
    /// Live leases (including the sheet lease).
    pub leases_held: usize,
    /// Whether snapshot persistence is active.
    pub snapshot_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Starting.to_string(), "Starting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_sync_outcome_row_index() {
        assert_eq!(SyncOutcome::Created(5).row_index(), Some(5));
        assert_eq!(SyncOutcome::Updated(3).row_index(), Some(3));
        assert_eq!(SyncOutcome::Unchanged.row_index(), None);
    }

    #[test]
    fn test_sync_outcome_labels() {
        assert_eq!(SyncOutcome::Created(2).label(), "created");
        assert_eq!(SyncOutcome::Updated(2).label(), "updated");
        assert_eq!(SyncOutcome::Unchanged.label(), "unchanged");
    }

    #[test]
    fn test_event_outcome_from_sync_outcome() {
        assert_eq!(EventOutcome::from(SyncOutcome::Created(4)), EventOutcome::Created(4));
        assert_eq!(EventOutcome::from(SyncOutcome::Unchanged), EventOutcome::Unchanged);
    }

    #[test]
    fn test_sync_outcome_display() {
        assert_eq!(SyncOutcome::Created(7).to_string(), "created(row 7)");
        assert_eq!(SyncOutcome::Unchanged.to_string(), "unchanged");
    }
}
