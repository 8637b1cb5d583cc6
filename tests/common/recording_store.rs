//! Recording, fault-injecting RemoteStore for tests.
//!
//! Wraps an [`InMemorySheetStore`] and records every call so tests can
//! assert exact write counts (idempotence, no-partial-write). Failures
//! are scripted per operation: each queued error is consumed by one call
//! before the call reaches the inner store, so a failed operation never
//! mutates anything. Optional per-operation delays let tests hold a sync
//! in flight to provoke lease contention.

use sheetsync::error::StoreError;
use sheetsync::record::RemoteRow;
use sheetsync::store::{BoxFuture, InMemorySheetStore, RemoteStore, RowRange};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct CallCounts {
    read_all: AtomicUsize,
    append_row: AtomicUsize,
    update_row: AtomicUsize,
    batch_read: AtomicUsize,
}

/// A `RemoteStore` wrapper that records calls and injects faults.
#[derive(Default)]
pub struct RecordingStore {
    inner: InMemorySheetStore,
    counts: CallCounts,
    failures: Mutex<HashMap<String, VecDeque<StoreError>>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl RecordingStore {
    /// Create an empty recording store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped store, for seeding rows and asserting final state.
    pub fn inner(&self) -> &InMemorySheetStore {
        &self.inner
    }

    /// Queue one failure for the next call to `operation`.
    pub fn fail_next(&self, operation: &str, error: StoreError) {
        self.failures
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    /// Queue `n` copies of a failure for `operation`.
    pub fn fail_times(&self, operation: &str, n: usize, error: StoreError) {
        for _ in 0..n {
            self.fail_next(operation, error.clone());
        }
    }

    /// Delay every call to `operation` (holds syncs in flight).
    pub fn set_delay(&self, operation: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(operation.to_string(), delay);
    }

    /// Remove the delay for `operation`.
    pub fn clear_delay(&self, operation: &str) {
        self.delays.lock().unwrap().remove(operation);
    }

    /// Number of calls made to `operation` (failed calls included).
    pub fn calls(&self, operation: &str) -> usize {
        match operation {
            "read_all" => self.counts.read_all.load(Ordering::SeqCst),
            "append_row" => self.counts.append_row.load(Ordering::SeqCst),
            "update_row" => self.counts.update_row.load(Ordering::SeqCst),
            "batch_read" => self.counts.batch_read.load(Ordering::SeqCst),
            other => panic!("unknown operation: {}", other),
        }
    }

    /// Total mutating calls (appends + updates).
    pub fn write_calls(&self) -> usize {
        self.calls("append_row") + self.calls("update_row")
    }

    fn count(&self, operation: &str) {
        match operation {
            "read_all" => self.counts.read_all.fetch_add(1, Ordering::SeqCst),
            "append_row" => self.counts.append_row.fetch_add(1, Ordering::SeqCst),
            "update_row" => self.counts.update_row.fetch_add(1, Ordering::SeqCst),
            "batch_read" => self.counts.batch_read.fetch_add(1, Ordering::SeqCst),
            _ => 0,
        };
    }

    fn next_failure(&self, operation: &str) -> Option<StoreError> {
        self.failures
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
    }

    async fn pause(&self, operation: &str) {
        let delay = self.delays.lock().unwrap().get(operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn intercept(&self, operation: &str) -> Result<(), StoreError> {
        self.count(operation);
        self.pause(operation).await;
        match self.next_failure(operation) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl RemoteStore for RecordingStore {
    fn read_all(&self) -> BoxFuture<'_, Vec<RemoteRow>> {
        Box::pin(async move {
            self.intercept("read_all").await?;
            self.inner.read_all().await
        })
    }

    fn append_row(&self, cells: Vec<String>) -> BoxFuture<'_, u32> {
        Box::pin(async move {
            self.intercept("append_row").await?;
            self.inner.append_row(cells).await
        })
    }

    fn update_row(&self, row_index: u32, cells: Vec<String>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.intercept("update_row").await?;
            self.inner.update_row(row_index, cells).await
        })
    }

    fn batch_read(&self, range: RowRange) -> BoxFuture<'_, Vec<RemoteRow>> {
        Box::pin(async move {
            self.intercept("batch_read").await?;
            self.inner.batch_read(range).await
        })
    }
}
