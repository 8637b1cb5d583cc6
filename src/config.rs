//! Configuration for the synchronization engine.
//!
//! This module defines all configuration types needed to run the engine.
//! Configuration is passed to [`SyncEngine::new()`](crate::SyncEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use sheetsync::config::SyncConfig;
//!
//! let config = SyncConfig {
//!     writer_id: "ingest-worker-1".into(),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── writer_id: String          # Lease owner identity for this writer
//! ├── columns: Vec<String>       # Worksheet column layout
//! ├── store: StoreConfig         # Remote endpoint, auth, timeouts
//! ├── retry: RetrySettings       # Backoff policy
//! ├── lease: LeaseConfig         # Lease duration and acquire timeout
//! ├── quota: QuotaConfig         # Request rate shaping
//! └── snapshot: SnapshotConfig   # Optional SQLite index cache
//! ```
//!
//! Durations are humantime strings (`"10s"`, `"500ms"`); invalid strings
//! fall back to the documented defaults rather than failing the load.

use crate::record::SheetSchema;
use crate::retry::{QuotaLimit, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The top-level config object passed to `SyncEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Identity of this writer, used as the lease owner. Distinguishes
    /// concurrent producers (interactive sessions, batch jobs) in logs.
    pub writer_id: String,

    /// Worksheet column layout. First column must be `uid`, last must be
    /// `last_synced_at`.
    #[serde(default = "default_columns")]
    pub columns: Vec<String>,

    /// Remote store endpoint and auth settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Retry/backoff policy for remote operations.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Lease durations and acquisition timeout.
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Request rate shaping under the remote quota.
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Optional SQLite snapshot of the uniqueness index.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            writer_id: "local.dev.writer.default".to_string(),
            columns: default_columns(),
            store: StoreConfig::default(),
            retry: RetrySettings::default(),
            lease: LeaseConfig::default(),
            quota: QuotaConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Create a minimal config for testing: fast retries, short leases,
    /// no snapshot.
    pub fn for_testing(writer_id: &str) -> Self {
        Self {
            writer_id: writer_id.to_string(),
            retry: RetrySettings::testing(),
            lease: LeaseConfig::testing(),
            ..Default::default()
        }
    }

    /// Build the schema from the configured columns.
    pub fn schema(&self) -> crate::error::Result<SheetSchema> {
        SheetSchema::new(self.columns.clone())
    }
}

fn default_columns() -> Vec<String> {
    SheetSchema::default().columns().to_vec()
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: remote endpoint and auth
// ═══════════════════════════════════════════════════════════════════════════════

/// Remote store endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URL of the values API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Spreadsheet identifier.
    #[serde(default)]
    pub spreadsheet_id: String,

    /// Worksheet (tab) holding the records.
    #[serde(default = "default_worksheet")]
    pub worksheet: String,

    /// Per-request timeout as a duration string (e.g. "10s").
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

fn default_base_url() -> String {
    "https://sheets.googleapis.com/v4".to_string()
}

fn default_worksheet() -> String {
    "Records".to_string()
}

fn default_request_timeout() -> String {
    "10s".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            spreadsheet_id: String::new(),
            worksheet: default_worksheet(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl StoreConfig {
    /// Parse the request timeout, falling back to 10 seconds.
    pub fn request_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings: backoff policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry/backoff settings for remote operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempt budget per operation (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, as a duration string.
    #[serde(default = "default_base_delay")]
    pub base_delay: String,

    /// Ceiling for the exponential backoff, as a duration string.
    #[serde(default = "default_max_retry_delay")]
    pub max_delay: String,

    /// Whether to add random jitter in [0, delay/2].
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> String {
    "500ms".to_string()
}

fn default_max_retry_delay() -> String {
    "30s".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: default_base_delay(),
            max_delay: default_max_retry_delay(),
            jitter: true,
        }
    }
}

impl RetrySettings {
    /// Fast-fail settings for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            base_delay: "5ms".to_string(),
            max_delay: "20ms".to_string(),
            jitter: false,
        }
    }

    /// Build the runtime policy, with fallbacks for unparseable strings.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: humantime::parse_duration(&self.base_delay)
                .unwrap_or(Duration::from_millis(500)),
            max_delay: humantime::parse_duration(&self.max_delay)
                .unwrap_or(Duration::from_secs(30)),
            jitter: self.jitter,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LeaseConfig: lock manager settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Lease settings for the lock manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// How long a granted lease lives without renewal.
    #[serde(default = "default_lease_duration")]
    pub lease_duration: String,

    /// Default acquisition timeout when the caller does not pass one.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: String,
}

fn default_lease_duration() -> String {
    "30s".to_string()
}

fn default_acquire_timeout() -> String {
    "10s".to_string()
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: default_lease_duration(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

impl LeaseConfig {
    /// Short leases for tests.
    pub fn testing() -> Self {
        Self {
            lease_duration: "500ms".to_string(),
            acquire_timeout: "200ms".to_string(),
        }
    }

    /// Parse the lease duration, falling back to 30 seconds.
    pub fn lease_duration(&self) -> Duration {
        humantime::parse_duration(&self.lease_duration).unwrap_or(Duration::from_secs(30))
    }

    /// Parse the acquire timeout, falling back to 10 seconds.
    pub fn acquire_timeout(&self) -> Duration {
        humantime::parse_duration(&self.acquire_timeout).unwrap_or(Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QuotaConfig: request rate shaping
// ═══════════════════════════════════════════════════════════════════════════════

/// Request rate shaping configuration.
///
/// When enabled, the store client paces requests with a token bucket so
/// sustained load stays under the remote quota and backoff only has to
/// absorb genuine bursts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Whether to shape request rate locally.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sustained requests per minute.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Maximum burst above the sustained rate.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_burst() -> u32 {
    10
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 60,
            burst: 10,
        }
    }
}

impl QuotaConfig {
    /// Build the limiter config, or `None` when shaping is disabled.
    pub fn limit(&self) -> Option<QuotaLimit> {
        if self.enabled {
            Some(QuotaLimit {
                requests_per_minute: self.requests_per_minute,
                burst: self.burst,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SnapshotConfig: optional index cache persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Index snapshot persistence configuration.
///
/// Disabled by default: the snapshot is a pure startup optimization and
/// the engine is fully functional without it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Whether to persist the uniqueness index to SQLite.
    #[serde(default)]
    pub enabled: bool,

    /// Path to the SQLite database file.
    #[serde(default = "default_snapshot_path")]
    pub sqlite_path: String,

    /// How often to flush dirty entries, as a duration string.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_snapshot_path() -> String {
    "sheetsync_index.db".to_string()
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sqlite_path: default_snapshot_path(),
            flush_interval: default_flush_interval(),
        }
    }
}

impl SnapshotConfig {
    /// In-memory snapshot config for testing.
    pub fn in_memory() -> Self {
        Self {
            enabled: true,
            sqlite_path: ":memory:".to_string(),
            flush_interval: "50ms".to_string(),
        }
    }

    /// Parse the flush interval, falling back to 5 seconds.
    pub fn flush_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.flush_interval).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
