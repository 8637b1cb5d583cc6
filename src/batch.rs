//! Batch upsert front-end.
//!
//! Accumulates records with uid deduplication (latest wins) and flushes
//! them through [`SyncEngine::sync`] with bounded concurrency. Distinct
//! uids proceed in parallel; same-uid records are already collapsed by
//! the dedup map, and the per-uid lease serializes whatever remains.
//!
//! ```text
//! records ──▶ UpsertBatch ──▶ HashMap<uid, record> (latest wins)
//!                                    │
//!                                    ▼
//!                        JoinSet (max_concurrent)
//!                                    │
//!                                    ▼
//!                            SyncEngine::sync()
//! ```

use crate::engine::{SyncEngine, SyncOutcome};
use crate::record::InvoiceRecord;
use crate::store::RemoteStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Configuration for batch flushing.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum concurrent sync calls.
    pub max_concurrent: usize,
    /// Per-record sync timeout (bounds the lease acquisition).
    pub sync_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            sync_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of flushing a batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchResult {
    /// Records submitted after dedup.
    pub total: usize,
    /// New rows appended.
    pub created: usize,
    /// Existing rows overwritten.
    pub updated: usize,
    /// Rows already current (no write).
    pub unchanged: usize,
    /// Failed sync calls.
    pub failed: usize,
    /// Records dropped before submission (missing uid).
    pub skipped: usize,
}

impl BatchResult {
    /// Check if every submitted record synced.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Accumulates records and flushes them through the engine.
pub struct UpsertBatch {
    /// Pending records keyed by uid (latest wins).
    pending: HashMap<String, InvoiceRecord>,
    skipped: usize,
    config: BatchConfig,
}

impl UpsertBatch {
    /// Create an empty batch.
    pub fn new(config: BatchConfig) -> Self {
        Self {
            pending: HashMap::new(),
            skipped: 0,
            config,
        }
    }

    /// Add a record to the batch.
    ///
    /// A later record with the same uid replaces an earlier one (latest
    /// wins). Records without a uid are dropped and counted.
    pub fn add(&mut self, record: InvoiceRecord) {
        if record.uid.trim().is_empty() {
            warn!("Skipping record without uid");
            self.skipped += 1;
            return;
        }
        self.pending.insert(record.uid.clone(), record);
    }

    /// Number of pending records.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Flush the batch through the engine.
    pub async fn flush<S: RemoteStore>(self, engine: &Arc<SyncEngine<S>>) -> BatchResult {
        let mut result = BatchResult {
            total: self.pending.len(),
            skipped: self.skipped,
            ..Default::default()
        };

        if self.pending.is_empty() {
            return result;
        }

        debug!(batch_size = result.total, "Flushing batch");

        let mut set: JoinSet<(String, crate::error::Result<SyncOutcome>)> = JoinSet::new();
        for (uid, record) in self.pending {
            while set.len() >= self.config.max_concurrent {
                if let Some(joined) = set.join_next().await {
                    tally(&mut result, joined);
                }
            }
            let engine = Arc::clone(engine);
            let timeout = self.config.sync_timeout;
            set.spawn(async move {
                let outcome = engine.sync(record, timeout).await;
                (uid, outcome)
            });
        }
        while let Some(joined) = set.join_next().await {
            tally(&mut result, joined);
        }

        debug!(
            created = result.created,
            updated = result.updated,
            unchanged = result.unchanged,
            failed = result.failed,
            "Batch flush complete"
        );
        result
    }
}

fn tally(
    result: &mut BatchResult,
    joined: std::result::Result<
        (String, crate::error::Result<SyncOutcome>),
        tokio::task::JoinError,
    >,
) {
    match joined {
        Ok((_, Ok(SyncOutcome::Created(_)))) => result.created += 1,
        Ok((_, Ok(SyncOutcome::Updated(_)))) => result.updated += 1,
        Ok((_, Ok(SyncOutcome::Unchanged))) => result.unchanged += 1,
        Ok((uid, Err(e))) => {
            warn!(uid = %uid, error = %e, "Record failed to sync");
            result.failed += 1;
        }
        Err(e) => {
            warn!(error = %e, "Sync task panicked");
            result.failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;

    fn record(uid: &str, amount: f64) -> InvoiceRecord {
        InvoiceRecord::new(uid, "hash").with_field("amount", amount)
    }

    async fn running_engine() -> Arc<SyncEngine> {
        let mut engine = SyncEngine::new(SyncConfig::for_testing("batch-writer")).unwrap();
        engine.start().await.unwrap();
        Arc::new(engine)
    }

    #[test]
    fn test_add_dedups_latest_wins() {
        let mut batch = UpsertBatch::new(BatchConfig::default());
        batch.add(record("ACME/1", 100.0));
        batch.add(record("ACME/1", 150.0));
        batch.add(record("ACME/2", 30.0));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_add_skips_missing_uid() {
        let mut batch = UpsertBatch::new(BatchConfig::default());
        batch.add(record("", 10.0));
        batch.add(record("   ", 10.0));
        assert!(batch.is_empty());
        assert_eq!(batch.skipped, 2);
    }

    #[tokio::test]
    async fn test_flush_empty_batch() {
        let engine = running_engine().await;
        let batch = UpsertBatch::new(BatchConfig::default());
        let result = batch.flush(&engine).await;
        assert_eq!(result, BatchResult::default());
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_flush_creates_rows() {
        let engine = running_engine().await;
        let mut batch = UpsertBatch::new(BatchConfig::default());
        for i in 0..5 {
            batch.add(record(&format!("ACME/{}", i), i as f64));
        }

        let result = batch.flush(&engine).await;
        assert_eq!(result.total, 5);
        assert_eq!(result.created, 5);
        assert!(result.is_success());
        assert_eq!(engine.store().row_count().await, 5);
    }

    #[tokio::test]
    async fn test_flush_mixed_outcomes() {
        let engine = running_engine().await;

        // Seed one record via a direct sync
        engine
            .sync(record("ACME/1", 100.0), Duration::from_secs(1))
            .await
            .unwrap();

        let mut batch = UpsertBatch::new(BatchConfig::default());
        batch.add(record("ACME/1", 100.0)); // unchanged
        batch.add(record("ACME/2", 50.0)); // created

        let result = batch.flush(&engine).await;
        assert_eq!(result.unchanged, 1);
        assert_eq!(result.created, 1);
        assert_eq!(result.failed, 0);
    }

    #[tokio::test]
    async fn test_flush_latest_wins_within_batch() {
        let engine = running_engine().await;
        let mut batch = UpsertBatch::new(BatchConfig::default());
        batch.add(record("ACME/1", 100.0));
        batch.add(record("ACME/1", 150.0));

        let result = batch.flush(&engine).await;
        assert_eq!(result.total, 1);
        assert_eq!(engine.store().rows_with_uid("ACME/1").await, 1);

        let cells = engine.store().cells_at(2).await.unwrap();
        assert_eq!(cells[5], "150");
    }

    #[tokio::test]
    async fn test_flush_counts_failures() {
        let engine = running_engine().await;
        let mut batch = UpsertBatch::new(BatchConfig::default());
        batch.add(record("ACME/1", 100.0));
        batch.add(InvoiceRecord::new("ACME/2", "h").with_field("nonsense", "x"));

        let result = batch.flush(&engine).await;
        assert_eq!(result.created, 1);
        assert_eq!(result.failed, 1);
        assert!(!result.is_success());
    }
}
