//! # Sheetsync
//!
//! A synchronization engine that turns locally-produced invoice records
//! into correct, deduplicated, durable rows in a remote spreadsheet-like
//! store, under request quotas, no native transactions, and no native
//! unique-index enforcement.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            sheetsync                                │
//! │                                                                     │
//! │  caller ──▶ SyncEngine::sync(record)                                │
//! │                │                                                    │
//! │                ▼                                                    │
//! │  ┌──────────────┐   ┌─────────────────┐   ┌─────────────────────┐   │
//! │  │ LeaseManager │──▶│ UniquenessIndex │──▶│ RemoteStore (HTTP / │   │
//! │  │ (per-uid)    │   │ (uid → row)     │   │ in-memory), wrapped │   │
//! │  └──────────────┘   └─────────────────┘   │ by RetryPolicy      │   │
//! │         │                   │             └─────────────────────┘   │
//! │         ▼                   ▼                                       │
//! │  ┌──────────────┐   ┌─────────────────┐                             │
//! │  │ lease expiry │   │ IndexSnapshot   │                             │
//! │  │ (safety net) │   │ (SQLite, opt.)  │                             │
//! │  └──────────────┘   └─────────────────┘                             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The remote store is treated as dumb, key-less storage: uniqueness and
//! mutual exclusion are built as explicit layers above it. Per-uid leases
//! serialize writers on the same invoice; the append/update decision is
//! re-verified against the remote store at the point of every write, so a
//! stale cache can never produce duplicate rows.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sheetsync::{InvoiceRecord, SyncConfig, SyncEngine};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut engine = SyncEngine::new(SyncConfig::default()).expect("config");
//!     engine.start().await.expect("start");
//!
//!     let record = InvoiceRecord::new("ACME/INV-001", "d41d8c...")
//!         .with_field("amount", 100.0);
//!     let outcome = engine.sync(record, Duration::from_secs(10)).await;
//!     println!("sync outcome: {:?}", outcome);
//!
//!     engine.shutdown().await;
//! }
//! ```

pub mod batch;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod lease;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod snapshot;
pub mod store;

// Re-exports for convenience
pub use batch::{BatchConfig, BatchResult, UpsertBatch};
pub use client::{RestSheetClient, StaticTokenProvider, TokenProvider};
pub use config::SyncConfig;
pub use engine::{EngineState, EventOutcome, HealthCheck, SyncEngine, SyncEvent, SyncOutcome};
pub use error::{FailureKind, Result, StoreError, SyncError};
pub use index::UniquenessIndex;
pub use lease::{LeaseManager, LeaseToken, SHEET_LEASE_KEY};
pub use record::{derive_uid, source_fingerprint, FieldValue, InvoiceRecord, RemoteRow, SheetSchema};
pub use retry::{QuotaLimit, RateLimiter, RetryPolicy};
pub use snapshot::IndexSnapshot;
pub use store::{InMemorySheetStore, RemoteStore, RowRange};
