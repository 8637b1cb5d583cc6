//! Uniqueness index: uid → remote row location.
//!
//! Answers "does uid X already have a row, and where" in O(1) after an
//! O(rows) rebuild. The index is a cache, never authoritative: the
//! orchestrator tolerates it being stale or missing an externally-added
//! row, and re-validates any decision derived from it at the point of the
//! actual remote write. Entries are mutated only while holding the
//! corresponding uid's lease.
//!
//! The row count observed at build time is kept alongside the map so
//! callers can detect drift (the remote sheet changing size behind our
//! back) cheaply.

use crate::record::RemoteRow;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Default)]
struct IndexState {
    map: HashMap<String, u32>,
    /// Rows seen at the last rebuild/adopt; `None` until first build.
    built_row_count: Option<usize>,
}

/// In-memory mapping from business key to remote row index.
#[derive(Default)]
pub struct UniquenessIndex {
    inner: RwLock<IndexState>,
}

impl UniquenessIndex {
    /// Create an empty, unbuilt index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the cached row index for a uid.
    ///
    /// This is an optimistic read; callers must not trust it at the point
    /// of a remote write.
    pub async fn lookup(&self, uid: &str) -> Option<u32> {
        self.inner.read().await.map.get(uid).copied()
    }

    /// Record a uid → row mapping after a confirmed remote write.
    pub async fn record(&self, uid: &str, row_index: u32) {
        let mut state = self.inner.write().await;
        let previous = state.map.insert(uid.to_string(), row_index);
        if previous.is_none() {
            // A confirmed append grew the sheet by one row.
            if let Some(count) = state.built_row_count.as_mut() {
                *count += 1;
            }
        }
        debug!(uid, row_index, "Index entry recorded");
    }

    /// Drop a single entry (e.g. after discovering it points at the wrong
    /// row). Returns the removed row index.
    pub async fn remove(&self, uid: &str) -> Option<u32> {
        self.inner.write().await.map.remove(uid)
    }

    /// Drop everything and mark the index unbuilt.
    pub async fn invalidate(&self) {
        let mut state = self.inner.write().await;
        state.map.clear();
        state.built_row_count = None;
        debug!("Index invalidated");
    }

    /// Rebuild from a full remote read. Returns the number of entries.
    ///
    /// If the remote sheet already contains duplicate uids (it shouldn't,
    /// but the store enforces nothing), the first occurrence wins and the
    /// rest are logged for operator attention.
    pub async fn rebuild_from(&self, rows: &[RemoteRow]) -> usize {
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            if row.uid.is_empty() {
                warn!(row_index = row.row_index, "Skipping row without uid");
                continue;
            }
            if let Some(existing) = map.get(&row.uid) {
                warn!(
                    uid = %row.uid,
                    kept_row = existing,
                    duplicate_row = row.row_index,
                    "Duplicate uid in remote store; keeping first occurrence"
                );
                continue;
            }
            map.insert(row.uid.clone(), row.row_index);
        }
        let entries = map.len();
        let mut state = self.inner.write().await;
        state.map = map;
        state.built_row_count = Some(rows.len());
        debug!(entries, rows = rows.len(), "Index rebuilt");
        entries
    }

    /// Adopt entries from a persisted snapshot (warm start).
    pub async fn adopt(&self, entries: HashMap<String, u32>, row_count: Option<usize>) {
        let mut state = self.inner.write().await;
        debug!(entries = entries.len(), "Index adopted from snapshot");
        state.map = entries;
        state.built_row_count = row_count;
    }

    /// Whether the index has been built (or adopted) since the last
    /// invalidation.
    pub async fn is_built(&self) -> bool {
        self.inner.read().await.built_row_count.is_some()
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.inner.read().await.map.len()
    }

    /// True if the index holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.map.is_empty()
    }

    /// Row count observed at build time, for drift checks.
    pub async fn built_row_count(&self) -> Option<usize> {
        self.inner.read().await.built_row_count
    }

    /// Copy out all entries (snapshot persistence).
    pub async fn entries(&self) -> HashMap<String, u32> {
        self.inner.read().await.map.clone()
    }
}
