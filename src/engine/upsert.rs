//! The per-record upsert state machine.
//!
//! One `sync` call walks `IndexLookup → Upserting → IndexUpdate` while its
//! uid lease is held (the caller owns `Locking` and `Done`). The invariant
//! enforced here is the engine's core correctness guarantee: **uid
//! uniqueness holds even when the cache is stale**, because the
//! append/update decision is never taken on the cache alone.
//!
//! # Write-Point Verification
//!
//! - A cached row is re-read and its uid checked before being trusted.
//!   A mismatch means the sheet was edited or compacted externally; the
//!   stale entry is dropped and resolution falls through to a scan.
//! - A cache miss (or failed verification) triggers a uid-column scan at
//!   the point of the write. Only a scan that comes back empty may
//!   append; a hit resolves to an update of the discovered row.
//!
//! Every remote call is wrapped by the retry controller, and the lease is
//! renewed before each phase so a long backoff cannot silently outlive
//! the holder's exclusivity.

use crate::error::Result;
use crate::index::UniquenessIndex;
use crate::lease::{LeaseManager, LeaseToken};
use crate::metrics;
use crate::record::{timestamp_now, InvoiceRecord, SheetSchema};
use crate::retry::RetryPolicy;
use crate::store::{RemoteStore, RowRange};
use std::time::Duration;
use tracing::{debug, warn};

/// Run the upsert phase for one record. The caller holds (and releases)
/// the uid lease.
///
/// Returns the outcome together with the row index the uid now lives at,
/// which the caller records in the index under the same lease.
pub(super) async fn run<S: RemoteStore>(
    store: &S,
    schema: &SheetSchema,
    index: &UniquenessIndex,
    retry: &RetryPolicy,
    leases: &LeaseManager,
    token: &mut LeaseToken,
    lease_duration: Duration,
    record: &InvoiceRecord,
) -> Result<(super::SyncOutcome, u32)> {
    use super::SyncOutcome;

    let uid = record.uid.as_str();
    let candidate = schema.cells_for(record, &timestamp_now());

    // IndexLookup: an optimistic cache read. Whatever it says is
    // re-validated against the remote store before any write below.
    if let Some(cached_row) = index.lookup(uid).await {
        leases.renew(token, lease_duration)?;
        let fetched = retry
            .run("batch_read", || {
                store.batch_read(RowRange::single(cached_row))
            })
            .await?;

        match fetched.first() {
            Some(existing) if existing.uid == uid => {
                if schema.content_eq(&existing.cells, &candidate) {
                    debug!(uid, row = cached_row, "Row already current; skipping write");
                    return Ok((SyncOutcome::Unchanged, cached_row));
                }
                leases.renew(token, lease_duration)?;
                retry
                    .run("update_row", || {
                        store.update_row(cached_row, candidate.clone())
                    })
                    .await?;
                return Ok((SyncOutcome::Updated(cached_row), cached_row));
            }
            _ => {
                // The cached row is gone or holds a different uid: the
                // sheet changed behind our back (external delete or
                // compaction). Heal the entry and fall through to a scan.
                warn!(uid, row = cached_row, "Stale index entry; re-resolving remotely");
                metrics::record_index_conflict(uid);
                index.remove(uid).await;
            }
        }
    }

    // Write-point verification: scan the uid column before deciding
    // between append and update. The cache is never trusted here.
    leases.renew(token, lease_duration)?;
    let rows = retry
        .run("batch_read", || store.batch_read(RowRange::all_data()))
        .await?;

    // The scan doubles as a full read; if the sheet size drifted from
    // what the index was built against, refresh the whole cache from it.
    if index.built_row_count().await != Some(rows.len()) {
        index.rebuild_from(&rows).await;
    }

    let discovered = rows.iter().find(|row| row.uid == uid);

    match discovered {
        Some(existing) => {
            // Present remotely but unknown to the cache: another writer
            // (or a human) created it after our last rebuild.
            let row = existing.row_index;
            debug!(uid, row, "Found uid during write-point scan");
            if schema.content_eq(&existing.cells, &candidate) {
                return Ok((SyncOutcome::Unchanged, row));
            }
            leases.renew(token, lease_duration)?;
            retry
                .run("update_row", || store.update_row(row, candidate.clone()))
                .await?;
            Ok((SyncOutcome::Updated(row), row))
        }
        None => {
            leases.renew(token, lease_duration)?;
            let row = retry
                .run("append_row", || store.append_row(candidate.clone()))
                .await?;
            debug!(uid, row, "Appended new row");
            Ok((SyncOutcome::Created(row), row))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyncOutcome;
    use crate::store::InMemorySheetStore;
    use std::time::Duration;

    const LEASE: Duration = Duration::from_secs(5);

    struct Fixture {
        store: InMemorySheetStore,
        schema: SheetSchema,
        index: UniquenessIndex,
        retry: RetryPolicy,
        leases: LeaseManager,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: InMemorySheetStore::new(),
                schema: SheetSchema::default(),
                index: UniquenessIndex::new(),
                retry: RetryPolicy::testing(),
                leases: LeaseManager::new("test-writer"),
            }
        }

        async fn upsert(&self, record: &InvoiceRecord) -> Result<(SyncOutcome, u32)> {
            let mut token = self
                .leases
                .acquire(&record.uid, LEASE, Duration::from_millis(100))
                .await?;
            let result = run(
                &self.store,
                &self.schema,
                &self.index,
                &self.retry,
                &self.leases,
                &mut token,
                LEASE,
                record,
            )
            .await;
            self.leases.release(token).unwrap();
            result
        }
    }

    fn record(uid: &str, amount: f64) -> InvoiceRecord {
        InvoiceRecord::new(uid, "hash").with_field("amount", amount)
    }

    #[tokio::test]
    async fn test_append_when_absent() {
        let fx = Fixture::new();
        let (outcome, row) = fx.upsert(&record("ACME/1", 100.0)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Created(2));
        assert_eq!(row, 2);
        assert_eq!(fx.store.rows_with_uid("ACME/1").await, 1);
    }

    #[tokio::test]
    async fn test_unchanged_when_identical() {
        let fx = Fixture::new();
        let rec = record("ACME/1", 100.0);
        let (_, row) = fx.upsert(&rec).await.unwrap();
        fx.index.record("ACME/1", row).await;

        let (outcome, _) = fx.upsert(&rec).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_update_when_fields_differ() {
        let fx = Fixture::new();
        let (_, row) = fx.upsert(&record("ACME/1", 100.0)).await.unwrap();
        fx.index.record("ACME/1", row).await;

        let (outcome, _) = fx.upsert(&record("ACME/1", 150.0)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Updated(row));
        assert_eq!(fx.store.rows_with_uid("ACME/1").await, 1);
        assert_eq!(fx.store.cells_at(row).await.unwrap()[5], "150");
    }

    #[tokio::test]
    async fn test_stale_cache_miss_resolves_to_update() {
        // uid present remotely, absent from the cache: another process
        // inserted it after our last rebuild.
        let fx = Fixture::new();
        let seeded = fx
            .schema
            .cells_for(&record("ACME/1", 100.0), "2026-01-01T00:00:00Z");
        fx.store.seed_row(seeded).await;

        let (outcome, row) = fx.upsert(&record("ACME/1", 150.0)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Updated(2));
        assert_eq!(row, 2);
        assert_eq!(fx.store.rows_with_uid("ACME/1").await, 1);
    }

    #[tokio::test]
    async fn test_stale_cache_pointing_at_wrong_row_heals() {
        // Index points at row 2, but an external compaction shifted a
        // different uid into that slot.
        let fx = Fixture::new();
        let other = fx
            .schema
            .cells_for(&record("OTHER/9", 1.0), "2026-01-01T00:00:00Z");
        fx.store.seed_row(other).await;
        fx.index.record("ACME/1", 2).await;

        let (outcome, row) = fx.upsert(&record("ACME/1", 100.0)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Created(3));
        assert_eq!(row, 3);
        // The other uid's row is untouched
        assert_eq!(fx.store.rows_with_uid("OTHER/9").await, 1);
        assert_eq!(fx.store.rows_with_uid("ACME/1").await, 1);
    }

    #[tokio::test]
    async fn test_externally_deleted_row_treated_as_create() {
        let fx = Fixture::new();
        let (_, row) = fx.upsert(&record("ACME/1", 100.0)).await.unwrap();
        fx.index.record("ACME/1", row).await;

        // Manual deletion outside the engine
        fx.store.remove_row(row).await;

        let (outcome, _) = fx.upsert(&record("ACME/1", 100.0)).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Created(_)));
        assert_eq!(fx.store.rows_with_uid("ACME/1").await, 1);
    }
}
