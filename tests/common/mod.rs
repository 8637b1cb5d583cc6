//! Shared test helpers.

pub mod recording_store;

pub use recording_store::RecordingStore;

use sheetsync::{InvoiceRecord, SyncConfig};

/// A record with the standard test shape.
pub fn record(uid: &str, amount: f64) -> InvoiceRecord {
    InvoiceRecord::new(uid, "test-hash")
        .with_field("invoice_number", uid)
        .with_field("amount", amount)
}

/// Engine config with fast retries and short leases.
pub fn test_config(writer_id: &str) -> SyncConfig {
    SyncConfig::for_testing(writer_id)
}
