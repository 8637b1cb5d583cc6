//! Remote store seam.
//!
//! Defines the interface the engine needs from the remote tabular backend:
//! four typed operations, each failing with a classified [`StoreError`].
//! The classification (transient vs permanent) is the contract the retry
//! controller depends on.
//!
//! The trait is object-safe (boxed futures) so tests can wrap any store
//! with recording and fault injection, and so the engine can be driven by
//! either the HTTP client ([`RestSheetClient`](crate::client::RestSheetClient))
//! or the in-process [`InMemorySheetStore`].
//!
//! # Row Addressing
//!
//! Rows are addressed by their 1-based sheet position. Row 1 is the header
//! row; data rows start at 2. The first cell of every data row is the
//! record uid (see [`SheetSchema`](crate::record::SheetSchema)).

use crate::error::StoreError;
use crate::record::RemoteRow;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;
use tracing::debug;

/// Result type for remote store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// An inclusive range of 1-based sheet rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    /// First row of the range.
    pub start: u32,
    /// Last row, or `None` for "to the end of the sheet".
    pub end: Option<u32>,
}

impl RowRange {
    /// A single row.
    pub fn single(row: u32) -> Self {
        Self {
            start: row,
            end: Some(row),
        }
    }

    /// All rows from `start` to the end of the sheet.
    pub fn from_row(start: u32) -> Self {
        Self { start, end: None }
    }

    /// All data rows (row 2 onward).
    pub fn all_data() -> Self {
        Self::from_row(2)
    }

    /// Check if a row falls inside the range.
    pub fn contains(&self, row: u32) -> bool {
        row >= self.start && self.end.map_or(true, |end| row <= end)
    }
}

/// Trait defining what the engine needs from the remote tabular store.
///
/// Every operation may fail `Transient` (network timeout, 5xx, quota) or
/// `Permanent` (auth rejected, malformed request, sheet not found); see
/// [`StoreError`]. Implementations must serialize cells deterministically
/// (stable column ordering) so `Unchanged` detection is well-defined.
pub trait RemoteStore: Send + Sync + 'static {
    /// Full ordered read of all data rows.
    fn read_all(&self) -> BoxFuture<'_, Vec<RemoteRow>>;

    /// Append a row; returns the store-assigned 1-based row index.
    fn append_row(&self, cells: Vec<String>) -> BoxFuture<'_, u32>;

    /// Overwrite a row in place.
    fn update_row(&self, row_index: u32, cells: Vec<String>) -> BoxFuture<'_, ()>;

    /// Read a bounded range of data rows.
    ///
    /// Rows that fall outside the sheet are simply absent from the result;
    /// reading past the end is not an error.
    fn batch_read(&self, range: RowRange) -> BoxFuture<'_, Vec<RemoteRow>>;
}

/// In-process store for tests and standalone mode.
///
/// Stores rows for real (unlike a no-op stub) so the engine's uniqueness
/// and idempotence guarantees can be exercised without a network. Also
/// exposes mutators that simulate external edits: seeding rows behind the
/// engine's back and deleting rows with compaction (later rows shift up),
/// which is how a real spreadsheet misbehaves under manual cleanup.
#[derive(Default)]
pub struct InMemorySheetStore {
    rows: RwLock<Vec<Vec<String>>>,
}

impl InMemorySheetStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row directly, bypassing the engine (simulates another
    /// writer or a human edit). Returns the assigned row index.
    pub async fn seed_row(&self, cells: Vec<String>) -> u32 {
        let mut rows = self.rows.write().await;
        rows.push(cells);
        rows.len() as u32 + 1
    }

    /// Delete a row with compaction: rows below shift up by one, as in a
    /// spreadsheet. Returns `true` if the row existed.
    pub async fn remove_row(&self, row_index: u32) -> bool {
        let mut rows = self.rows.write().await;
        let Some(idx) = Self::data_offset(row_index) else {
            return false;
        };
        if idx < rows.len() {
            rows.remove(idx);
            true
        } else {
            false
        }
    }

    /// Number of data rows currently stored.
    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Number of rows whose uid cell matches. Test assertions use this to
    /// verify uniqueness.
    pub async fn rows_with_uid(&self, uid: &str) -> usize {
        self.rows
            .read()
            .await
            .iter()
            .filter(|cells| cells.first().map(String::as_str) == Some(uid))
            .count()
    }

    /// Fetch a row's cells by sheet index.
    pub async fn cells_at(&self, row_index: u32) -> Option<Vec<String>> {
        let rows = self.rows.read().await;
        Self::data_offset(row_index).and_then(|idx| rows.get(idx).cloned())
    }

    fn data_offset(row_index: u32) -> Option<usize> {
        // Row 1 is the header; data starts at 2.
        row_index.checked_sub(2).map(|i| i as usize)
    }
}

impl RemoteStore for InMemorySheetStore {
    fn read_all(&self) -> BoxFuture<'_, Vec<RemoteRow>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            Ok(rows
                .iter()
                .enumerate()
                .map(|(i, cells)| RemoteRow::from_cells(i as u32 + 2, cells.clone()))
                .collect())
        })
    }

    fn append_row(&self, cells: Vec<String>) -> BoxFuture<'_, u32> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            rows.push(cells);
            let row_index = rows.len() as u32 + 1;
            debug!(row_index, "Appended row");
            Ok(row_index)
        })
    }

    fn update_row(&self, row_index: u32, cells: Vec<String>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            let idx = Self::data_offset(row_index)
                .filter(|&i| i < rows.len())
                .ok_or_else(|| {
                    StoreError::permanent("update_row", format!("row {} out of range", row_index))
                })?;
            rows[idx] = cells;
            debug!(row_index, "Updated row");
            Ok(())
        })
    }

    fn batch_read(&self, range: RowRange) -> BoxFuture<'_, Vec<RemoteRow>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            Ok(rows
                .iter()
                .enumerate()
                .map(|(i, cells)| (i as u32 + 2, cells))
                .filter(|(row_index, _)| range.contains(*row_index))
                .map(|(row_index, cells)| RemoteRow::from_cells(row_index, cells.clone()))
                .collect())
        })
    }
}
