// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synchronization orchestrator.
//!
//! The public entry point that ties together:
//! - The remote store seam ([`crate::store::RemoteStore`])
//! - The uniqueness index ([`crate::index::UniquenessIndex`])
//! - The lease manager ([`crate::lease::LeaseManager`])
//! - The retry controller ([`crate::retry::RetryPolicy`])
//! - Optional index snapshot persistence ([`crate::snapshot::IndexSnapshot`])
//!
//! # Per-Call State Machine
//!
//! ```text
//! Start → IndexLookup → Locking → Upserting → IndexUpdate → Done
//!                          │           │
//!                        Busy      classified
//!                          │        failure
//!                          ↓           ↓
//!                      Contended    Failed
//! ```
//!
//! The engine guarantees at-most-one remote mutation per successful
//! `sync` call, and uid uniqueness even under concurrent stale-cache
//! retries (see [`upsert`] for the write-point verification). A failure
//! before the write leaves the remote store untouched; the lease is
//! always released or allowed to expire.

mod types;
mod upsert;

pub use types::{EngineState, EventOutcome, HealthCheck, SyncEvent, SyncOutcome};

use crate::batch::{BatchConfig, BatchResult, UpsertBatch};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::index::UniquenessIndex;
use crate::lease::{LeaseManager, SHEET_LEASE_KEY};
use crate::metrics;
use crate::record::{InvoiceRecord, SheetSchema};
use crate::retry::RetryPolicy;
use crate::snapshot::IndexSnapshot;
use crate::store::{InMemorySheetStore, RemoteStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, error, info, warn};

/// Capacity of the outcome event channel. Slow subscribers lag rather
/// than block the engine.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The synchronization engine.
///
/// Accepts [`InvoiceRecord`]s from any number of concurrent tasks and
/// turns them into correct, deduplicated rows in the remote store.
/// Cloneable via `Arc`; all methods that writers need take `&self`.
pub struct SyncEngine<S: RemoteStore = InMemorySheetStore> {
    config: SyncConfig,
    schema: SheetSchema,
    store: Arc<S>,
    index: Arc<UniquenessIndex>,
    leases: Arc<LeaseManager>,
    retry: RetryPolicy,

    /// Optional persisted index cache.
    snapshot: Arc<RwLock<Option<IndexSnapshot>>>,

    /// Outcome event stream (optional consumers).
    events: broadcast::Sender<SyncEvent>,

    /// Engine state (broadcast to watchers).
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    /// Shutdown signal for background tasks.
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Background task handles (snapshot flusher).
    background: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl SyncEngine<InMemorySheetStore> {
    /// Create an engine backed by an in-process store (tests, standalone).
    pub fn new(config: SyncConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(InMemorySheetStore::new()))
    }
}

impl<S: RemoteStore> SyncEngine<S> {
    /// Create an engine over the given remote store.
    ///
    /// This is the primary constructor: pass a
    /// [`RestSheetClient`](crate::client::RestSheetClient) for a real
    /// deployment.
    pub fn with_store(config: SyncConfig, store: Arc<S>) -> Result<Self> {
        let schema = config.schema()?;
        let retry = config.retry.policy();
        let leases = Arc::new(LeaseManager::new(config.writer_id.clone()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            schema,
            store,
            index: Arc::new(UniquenessIndex::new()),
            leases,
            retry,
            snapshot: Arc::new(RwLock::new(None)),
            events,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            background: RwLock::new(Vec::new()),
        })
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// A receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if the engine accepts `sync()` calls.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Subscribe to the outcome event stream.
    ///
    /// Every `sync` call emits one event, success or failure. Slow
    /// subscribers lag (dropping oldest events) rather than blocking
    /// writers.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// The store this engine writes to.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// This writer's lease owner identity.
    pub fn writer_id(&self) -> &str {
        &self.config.writer_id
    }

    /// Point-in-time diagnostics without remote I/O.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        HealthCheck {
            state,
            ready: state == EngineState::Running,
            index_built: self.index.is_built().await,
            index_entries: self.index.len().await,
            leases_held: self.leases.held_count(),
            snapshot_enabled: self.snapshot.read().await.is_some(),
        }
    }

    /// Start the engine.
    ///
    /// 1. Opens the index snapshot (if configured) and adopts its entries
    ///    for a warm start, or
    /// 2. Rebuilds the uniqueness index with a full remote read
    /// 3. Spawns the snapshot flush task
    ///
    /// A warm-started index may be stale; that is safe by construction,
    /// since every write re-validates against the remote store.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(SyncError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(writer_id = %self.config.writer_id, "Starting sync engine");
        let _ = self.state_tx.send(EngineState::Starting);
        metrics::set_engine_state("Starting");

        let mut warm_started = false;
        if self.config.snapshot.enabled {
            match IndexSnapshot::open(&self.config.snapshot.sqlite_path).await {
                Ok(snapshot) => {
                    match snapshot.load().await {
                        Ok((entries, row_count)) if !entries.is_empty() => {
                            info!(entries = entries.len(), "Warm-starting index from snapshot");
                            self.index.adopt(entries, row_count).await;
                            warm_started = true;
                        }
                        Ok(_) => debug!("Snapshot empty; full rebuild required"),
                        Err(e) => warn!(error = %e, "Snapshot unreadable; full rebuild required"),
                    }
                    *self.snapshot.write().await = Some(snapshot);
                }
                Err(e) => {
                    // The snapshot is an optimization; never fail startup over it.
                    warn!(error = %e, "Snapshot store unavailable; continuing without it");
                }
            }
        }

        if !warm_started {
            if let Err(e) = self.rebuild_index().await {
                error!(error = %e, "Initial index rebuild failed");
                let _ = self.state_tx.send(EngineState::Failed);
                metrics::set_engine_state("Failed");
                return Err(e);
            }
        }

        if self.snapshot.read().await.is_some() {
            self.spawn_snapshot_flush_task().await;
        }

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!(
            index_entries = self.index.len().await,
            warm_started, "Sync engine running"
        );
        Ok(())
    }

    /// Force a full re-read of the remote store into the uniqueness
    /// index. Callable on startup or on suspected drift.
    ///
    /// Holds the whole-sheet lease for the duration, so no upsert can
    /// interleave with the rebuild.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let token = self
            .leases
            .acquire(
                SHEET_LEASE_KEY,
                self.config.lease.lease_duration(),
                self.config.lease.acquire_timeout(),
            )
            .await?;

        let started = Instant::now();
        let result = async {
            let rows = self.retry.run("read_all", || self.store.read_all()).await?;
            let entries = self.index.rebuild_from(&rows).await;

            if let Some(snapshot) = self.snapshot.read().await.as_ref() {
                let map = self.index.entries().await;
                if let Err(e) = snapshot.replace_all(&map, rows.len()).await {
                    warn!(error = %e, "Failed to persist rebuilt index snapshot");
                }
            }

            metrics::record_index_rebuild(rows.len(), started.elapsed());
            info!(entries, rows = rows.len(), "Uniqueness index rebuilt");
            Ok(entries)
        }
        .await;

        if let Err(e) = self.leases.release(token) {
            warn!(error = %e, "Sheet lease release failed");
        }
        result
    }

    /// Synchronize one record into the remote store.
    ///
    /// `timeout` bounds the lease acquisition (the only unbounded wait);
    /// remote calls are bounded by the retry budget. Returns `Contended`
    /// if the uid's lease stays held past the timeout, in which case the
    /// caller decides whether to re-attempt.
    pub async fn sync(&self, record: InvoiceRecord, timeout: Duration) -> Result<SyncOutcome> {
        let uid = record.uid.clone();
        let started = Instant::now();

        let outcome = self.sync_inner(record, timeout).await;

        let label = outcome.as_ref().map(|o| o.label()).unwrap_or("failed");
        metrics::record_sync_outcome(label);
        metrics::record_sync_latency(started.elapsed());

        // Every call emits one event, success or failure, so a feedback
        // consumer sees the full stream.
        let event_outcome = match &outcome {
            Ok(o) => EventOutcome::from(*o),
            Err(e) => EventOutcome::Failed(e.to_string()),
        };
        let _ = self.events.send(SyncEvent {
            uid,
            outcome: event_outcome,
        });

        outcome
    }

    async fn sync_inner(&self, record: InvoiceRecord, timeout: Duration) -> Result<SyncOutcome> {
        match self.state() {
            EngineState::Running => {}
            EngineState::ShuttingDown | EngineState::Stopped => return Err(SyncError::Shutdown),
            other => {
                return Err(SyncError::InvalidState {
                    expected: "Running".to_string(),
                    actual: format!("{:?}", other),
                })
            }
        }

        record.validate(&self.schema)?;

        let uid = record.uid.clone();
        let lease_duration = self.config.lease.lease_duration();

        // Locking: bounded by the caller's timeout.
        let mut token = self.leases.acquire(&uid, lease_duration, timeout).await?;

        let result = upsert::run(
            self.store.as_ref(),
            &self.schema,
            &self.index,
            &self.retry,
            &self.leases,
            &mut token,
            lease_duration,
            &record,
        )
        .await;

        let outcome = match result {
            Ok((outcome, row_index)) => {
                // IndexUpdate: only under a still-valid lease. If the
                // lease lapsed mid-write, another holder may have moved
                // the row; drop the cache entry and let the next sync
                // re-resolve. The remote write itself is confirmed, so
                // the outcome stands (last-writer-wins).
                if self.leases.validate(&token) {
                    self.index.record(&uid, row_index).await;
                    if let Some(snapshot) = self.snapshot.read().await.as_ref() {
                        snapshot.set(&uid, row_index).await;
                        if let Some(count) = self.index.built_row_count().await {
                            snapshot.set_row_count(count).await;
                        }
                    }
                } else {
                    warn!(uid = %uid, "Lease lapsed during upsert; index entry dropped");
                    self.index.remove(&uid).await;
                }
                Ok(outcome)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = self.leases.release(token) {
            debug!(uid = %uid, error = %e, "Lease already lapsed at release");
        }

        outcome
    }

    /// Synchronize a batch of records with latest-wins uid deduplication
    /// and bounded concurrency across distinct uids.
    pub async fn sync_all(
        self: &Arc<Self>,
        records: impl IntoIterator<Item = InvoiceRecord>,
    ) -> BatchResult {
        let mut batch = UpsertBatch::new(BatchConfig {
            sync_timeout: self.config.lease.acquire_timeout(),
            ..BatchConfig::default()
        });
        for record in records {
            batch.add(record);
        }
        batch.flush(self).await
    }

    /// Spawn the periodic snapshot flush task (debounced writes).
    async fn spawn_snapshot_flush_task(&self) {
        let snapshot = Arc::clone(&self.snapshot);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let flush_interval = self.config.snapshot.flush_interval_duration();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let guard = snapshot.read().await;
                        if let Some(ref snap) = *guard {
                            if let Err(e) = snap.flush_dirty().await {
                                warn!(error = %e, "Failed to flush index snapshot");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Snapshot flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!("Spawned snapshot flush task");
        self.background.write().await.push(handle);
    }

    /// Shutdown the engine gracefully.
    ///
    /// 1. Signals background tasks to stop
    /// 2. Waits for them (with a timeout)
    /// 3. Flushes and closes the index snapshot
    ///
    /// In-flight `sync` calls observe `ShuttingDown` on their next state
    /// check; leases they still hold expire on their own.
    pub async fn shutdown(&mut self) {
        info!("Shutting down sync engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.background.write().await;
            std::mem::take(&mut *guard)
        };

        let drain_timeout = Duration::from_secs(10);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Background task completed"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Background task panicked"),
                Err(_) => warn!(task = i + 1, "Background task timed out during shutdown"),
            }
        }

        if let Some(snapshot) = self.snapshot.write().await.take() {
            snapshot.close().await;
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Sync engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::InvoiceRecord;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn test_engine() -> SyncEngine {
        SyncEngine::new(SyncConfig::for_testing("test-writer")).unwrap()
    }

    fn record(uid: &str, amount: f64) -> InvoiceRecord {
        InvoiceRecord::new(uid, "hash").with_field("amount", amount)
    }

    #[test]
    fn test_engine_initial_state() {
        let engine = test_engine();
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
        assert_eq!(engine.writer_id(), "test-writer");
    }

    #[test]
    fn test_engine_rejects_bad_schema() {
        let config = SyncConfig {
            columns: vec!["amount".to_string()],
            ..SyncConfig::for_testing("w")
        };
        assert!(SyncEngine::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_transitions_to_running() {
        let mut engine = test_engine();
        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let mut engine = test_engine();
        engine.start().await.unwrap();
        let result = engine.start().await;
        assert!(matches!(result, Err(SyncError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_sync_before_start_is_invalid() {
        let engine = test_engine();
        let result = engine.sync(record("ACME/1", 100.0), TIMEOUT).await;
        assert!(matches!(result, Err(SyncError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_sync_after_shutdown_is_shutdown() {
        let mut engine = test_engine();
        engine.start().await.unwrap();
        engine.shutdown().await;
        let result = engine.sync(record("ACME/1", 100.0), TIMEOUT).await;
        assert!(matches!(result, Err(SyncError::Shutdown)));
    }

    #[tokio::test]
    async fn test_sync_rejects_invalid_record() {
        let mut engine = test_engine();
        engine.start().await.unwrap();
        let result = engine.sync(InvoiceRecord::new("", "h"), TIMEOUT).await;
        assert!(matches!(result, Err(SyncError::InvalidRecord(_))));
    }

    #[tokio::test]
    async fn test_start_rebuilds_index_from_store() {
        let store = Arc::new(InMemorySheetStore::new());
        let schema = SheetSchema::default();
        store
            .seed_row(schema.cells_for(&record("ACME/1", 100.0), "2026-01-01T00:00:00Z"))
            .await;

        let mut engine =
            SyncEngine::with_store(SyncConfig::for_testing("w"), Arc::clone(&store)).unwrap();
        engine.start().await.unwrap();

        let health = engine.health_check().await;
        assert!(health.index_built);
        assert_eq!(health.index_entries, 1);
    }

    #[tokio::test]
    async fn test_shutdown_from_created() {
        let mut engine = test_engine();
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_event_stream_emits_outcomes() {
        let mut engine = test_engine();
        engine.start().await.unwrap();
        let mut events = engine.subscribe();

        engine.sync(record("ACME/1", 100.0), TIMEOUT).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.uid, "ACME/1");
        assert!(matches!(event.outcome, EventOutcome::Created(_)));
    }

    #[tokio::test]
    async fn test_event_stream_emits_failures() {
        let mut engine = test_engine();
        engine.start().await.unwrap();
        let mut events = engine.subscribe();

        let bad = InvoiceRecord::new("ACME/1", "h").with_field("nonsense", "x");
        let _ = engine.sync(bad, TIMEOUT).await;

        let event = events.recv().await.unwrap();
        assert!(matches!(event.outcome, EventOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_health_check_fields() {
        let mut engine = test_engine();
        let before = engine.health_check().await;
        assert!(!before.ready);
        assert!(!before.index_built);

        engine.start().await.unwrap();
        let after = engine.health_check().await;
        assert!(after.ready);
        assert!(after.index_built);
        assert_eq!(after.leases_held, 0);
        assert!(!after.snapshot_enabled);
    }

    #[tokio::test]
    async fn test_rebuild_index_reports_entries() {
        let store = Arc::new(InMemorySheetStore::new());
        let schema = SheetSchema::default();
        let mut engine =
            SyncEngine::with_store(SyncConfig::for_testing("w"), Arc::clone(&store)).unwrap();
        engine.start().await.unwrap();

        store
            .seed_row(schema.cells_for(&record("EXT/1", 1.0), "2026-01-01T00:00:00Z"))
            .await;
        store
            .seed_row(schema.cells_for(&record("EXT/2", 2.0), "2026-01-01T00:00:00Z"))
            .await;

        assert_eq!(engine.rebuild_index().await.unwrap(), 2);
    }
}
