// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Optional persisted cache of the uniqueness index.
//!
//! Stores uid → row-index entries in SQLite so a restarted engine can warm
//! up without a full remote read. The snapshot is a pure performance
//! optimization: it is never authoritative, and deleting the database file
//! at any time is safe (the engine rebuilds from the remote store).
//!
//! # Debounced Writes
//!
//! To reduce SQLite write pressure, entries are debounced:
//! - `set()`/`remove()` update an in-memory pending map immediately
//! - `flush_dirty()` persists all pending changes in a batch
//! - The engine calls `flush_dirty()` periodically (every few seconds)
//! - On shutdown, `flush_dirty()` is called to avoid losing warm-up data
//!
//! A crash between `set()` and `flush_dirty()` loses at most one flush
//! interval of cache entries. On restart the engine re-learns them from
//! the remote store (idempotent, safe).
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes are retried with exponential backoff up to a small
//! bound; persistent failures surface as `Snapshot` errors.

use crate::error::{Result, SyncError};
use crate::metrics;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                metrics::record_snapshot_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// A pending change: `Some(row)` upserts, `None` deletes.
type PendingChange = Option<u32>;

/// Persistent snapshot of the uniqueness index, backed by SQLite.
///
/// Supports debounced writes: updates go to a pending map immediately,
/// and are flushed to disk periodically via `flush_dirty()`.
pub struct IndexSnapshot {
    /// SQLite connection pool
    pool: SqlitePool,
    /// Pending (not yet persisted) changes
    pending: Arc<RwLock<HashMap<String, PendingChange>>>,
    /// Pending row-count update for drift checks on the next load
    pending_row_count: Arc<RwLock<Option<i64>>>,
    /// Path to database file
    path: String,
}

impl IndexSnapshot {
    /// Open (or create) a snapshot database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening index snapshot");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        // A single connection is plenty (low write volume) and keeps
        // `:memory:` databases coherent across operations.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(SyncError::Snapshot)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS uid_index (
                uid TEXT PRIMARY KEY,
                row_index INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(SyncError::Snapshot)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshot_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(SyncError::Snapshot)?;

        Ok(Self {
            pool,
            pending: Arc::new(RwLock::new(HashMap::new())),
            pending_row_count: Arc::new(RwLock::new(None)),
            path: path_str,
        })
    }

    /// Open an in-memory snapshot (testing).
    pub async fn in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    /// Load all persisted entries and the stored row count.
    pub async fn load(&self) -> Result<(HashMap<String, u32>, Option<usize>)> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT uid, row_index FROM uid_index")
            .fetch_all(&self.pool)
            .await
            .map_err(SyncError::Snapshot)?;

        let mut entries = HashMap::with_capacity(rows.len());
        for (uid, row_index) in rows {
            entries.insert(uid, row_index as u32);
        }

        let row_count: Option<(i64,)> =
            sqlx::query_as("SELECT value FROM snapshot_meta WHERE key = 'row_count'")
                .fetch_optional(&self.pool)
                .await
                .map_err(SyncError::Snapshot)?;

        if !entries.is_empty() {
            info!(count = entries.len(), "Restored index entries from snapshot");
        }

        Ok((entries, row_count.map(|(n,)| n as usize)))
    }

    /// Stage a uid → row entry (debounced).
    pub async fn set(&self, uid: &str, row_index: u32) {
        self.pending
            .write()
            .await
            .insert(uid.to_string(), Some(row_index));
        debug!(uid, row_index, "Snapshot entry staged (pending flush)");
    }

    /// Stage a uid removal (debounced).
    pub async fn remove(&self, uid: &str) {
        self.pending.write().await.insert(uid.to_string(), None);
    }

    /// Stage the remote row count observed by the index.
    pub async fn set_row_count(&self, row_count: usize) {
        *self.pending_row_count.write().await = Some(row_count as i64);
    }

    /// Replace all persisted entries with a freshly rebuilt index.
    pub async fn replace_all(&self, entries: &HashMap<String, u32>, row_count: usize) -> Result<()> {
        // Pending changes predate the rebuild; drop them.
        self.pending.write().await.clear();
        *self.pending_row_count.write().await = None;

        execute_with_retry("replace_all", || async {
            sqlx::query("DELETE FROM uid_index")
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
        .map_err(SyncError::Snapshot)?;

        let updated_at = unix_now();
        for (uid, row_index) in entries {
            execute_with_retry("replace_insert", || async {
                sqlx::query(
                    "INSERT INTO uid_index (uid, row_index, updated_at) VALUES (?, ?, ?)",
                )
                .bind(uid.as_str())
                .bind(*row_index as i64)
                .bind(updated_at)
                .execute(&self.pool)
                .await?;
                Ok(())
            })
            .await
            .map_err(SyncError::Snapshot)?;
        }

        self.persist_row_count(row_count as i64).await?;
        info!(entries = entries.len(), row_count, "Snapshot replaced");
        Ok(())
    }

    /// Flush all pending changes to disk.
    ///
    /// Call this periodically and on shutdown. Returns the number of
    /// entries flushed; failed entries are re-staged for the next flush.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let drained: Vec<(String, PendingChange)> = {
            let mut pending = self.pending.write().await;
            pending.drain().collect()
        };
        let row_count = self.pending_row_count.write().await.take();

        if drained.is_empty() && row_count.is_none() {
            return Ok(0);
        }

        let updated_at = unix_now();
        let mut flushed = 0usize;
        let mut errors = 0usize;

        for (uid, change) in drained {
            let result = match change {
                Some(row_index) => {
                    execute_with_retry("flush_upsert", || async {
                        sqlx::query(
                            r#"
                            INSERT INTO uid_index (uid, row_index, updated_at)
                            VALUES (?, ?, ?)
                            ON CONFLICT(uid) DO UPDATE SET
                                row_index = excluded.row_index,
                                updated_at = excluded.updated_at
                            "#,
                        )
                        .bind(uid.as_str())
                        .bind(row_index as i64)
                        .bind(updated_at)
                        .execute(&self.pool)
                        .await?;
                        Ok(())
                    })
                    .await
                }
                None => {
                    execute_with_retry("flush_delete", || async {
                        sqlx::query("DELETE FROM uid_index WHERE uid = ?")
                            .bind(uid.as_str())
                            .execute(&self.pool)
                            .await?;
                        Ok(())
                    })
                    .await
                }
            };

            match result {
                Ok(()) => flushed += 1,
                Err(e) => {
                    warn!(uid = %uid, error = %e, "Failed to flush snapshot entry");
                    errors += 1;
                    self.pending.write().await.entry(uid).or_insert(change);
                }
            }
        }

        if let Some(n) = row_count {
            if let Err(e) = self.persist_row_count(n).await {
                warn!(error = %e, "Failed to flush snapshot row count");
                errors += 1;
                *self.pending_row_count.write().await = Some(n);
            }
        }

        metrics::record_snapshot_flush(flushed, errors);
        debug!(flushed, errors, "Snapshot flush complete");
        Ok(flushed)
    }

    /// Number of pending (unflushed) changes.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Path of the backing database.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Flush and close the pool (includes WAL checkpoint).
    pub async fn close(&self) {
        if let Err(e) = self.flush_dirty().await {
            warn!(error = %e, "Final snapshot flush failed");
        }
        self.pool.close().await;
        info!(path = %self.path, "Index snapshot closed");
    }

    async fn persist_row_count(&self, row_count: i64) -> Result<()> {
        execute_with_retry("row_count", || async {
            sqlx::query(
                r#"
                INSERT INTO snapshot_meta (key, value) VALUES ('row_count', ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(row_count)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
        .map_err(SyncError::Snapshot)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
