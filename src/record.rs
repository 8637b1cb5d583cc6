// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record model and deterministic row serialization.
//!
//! An [`InvoiceRecord`] is the unit of synchronization: a business key
//! (`uid`), a set of named scalar fields, optional per-field confidence
//! scores, and a fingerprint of the originating document. The engine never
//! mutates a record.
//!
//! # Deterministic Serialization
//!
//! The [`SheetSchema`] fixes the column set and order of the remote
//! worksheet. [`SheetSchema::cells_for`] renders a record into cells in
//! schema order, so equality comparison for `Unchanged` detection is
//! well-defined: two records are content-equal iff their rendered cells
//! match in every column except the engine-maintained `last_synced_at`.
//!
//! # Column Layout
//!
//! ```text
//! | uid | invoice_date | invoice_number | address | description | amount | vendor_code | last_synced_at |
//! ```
//!
//! `uid` is always the first column (stores rely on this to extract the
//! key from a raw row) and `last_synced_at` is always the last.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::SystemTime;

/// Name of the uid column. Always first in the schema.
pub const UID_COLUMN: &str = "uid";

/// Name of the engine-maintained timestamp column. Always last.
pub const LAST_SYNCED_AT_COLUMN: &str = "last_synced_at";

/// Default column set of the Records worksheet.
const DEFAULT_COLUMNS: [&str; 8] = [
    UID_COLUMN,
    "invoice_date",
    "invoice_number",
    "address",
    "description",
    "amount",
    "vendor_code",
    LAST_SYNCED_AT_COLUMN,
];

/// A scalar cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Free text.
    Text(String),
    /// Numeric amount.
    Number(f64),
    /// Date, already formatted by the extraction pipeline.
    Date(String),
}

impl FieldValue {
    /// Render the value as a worksheet cell.
    ///
    /// Rendering is deterministic: `f64` uses Rust's shortest round-trip
    /// formatting, so the same number always produces the same cell.
    pub fn as_cell(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) => format!("{}", n),
            Self::Date(d) => d.clone(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

/// The unit of synchronization, produced by the extraction pipeline.
///
/// Immutable once handed to the engine. `uid` is assumed to be
/// deterministically derived and stable across re-runs on the same
/// document (see [`derive_uid`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    /// Globally unique business key (vendor + invoice number composite).
    pub uid: String,
    /// Column name → scalar value. Values may be absent.
    #[serde(default)]
    pub fields: HashMap<String, FieldValue>,
    /// Optional per-field confidence in [0, 1]. Informational only.
    #[serde(default)]
    pub confidence: HashMap<String, f32>,
    /// SHA-256 fingerprint of the originating document.
    #[serde(default)]
    pub source_hash: String,
}

impl InvoiceRecord {
    /// Create a record with the given uid and source fingerprint.
    pub fn new(uid: impl Into<String>, source_hash: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            fields: HashMap::new(),
            confidence: HashMap::new(),
            source_hash: source_hash.into(),
        }
    }

    /// Set a field value (builder style).
    pub fn with_field(mut self, column: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }

    /// Set a per-field confidence score (builder style).
    pub fn with_confidence(mut self, column: impl Into<String>, score: f32) -> Self {
        self.confidence.insert(column.into(), score);
        self
    }

    /// Validate the record against a schema.
    ///
    /// Checks: non-empty uid, every field name is a schema column (and not
    /// one of the engine-owned columns), confidence scores in [0, 1].
    pub fn validate(&self, schema: &SheetSchema) -> Result<()> {
        if self.uid.trim().is_empty() {
            return Err(SyncError::InvalidRecord("uid is empty".to_string()));
        }
        for column in self.fields.keys() {
            if column == UID_COLUMN || column == LAST_SYNCED_AT_COLUMN {
                return Err(SyncError::InvalidRecord(format!(
                    "column {} is engine-owned",
                    column
                )));
            }
            if !schema.has_column(column) {
                return Err(SyncError::InvalidRecord(format!(
                    "unknown column: {}",
                    column
                )));
            }
        }
        for (column, score) in &self.confidence {
            if !(0.0..=1.0).contains(score) {
                return Err(SyncError::InvalidRecord(format!(
                    "confidence for {} out of range: {}",
                    column, score
                )));
            }
        }
        Ok(())
    }
}

/// A row as persisted in the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRow {
    /// 1-based sheet position. Row 1 is the header; data starts at row 2.
    /// Assigned by the store, stable until the row is deleted or the
    /// sheet is compacted.
    pub row_index: u32,
    /// Business key, extracted from the first cell.
    pub uid: String,
    /// Serialized cells in schema order.
    pub cells: Vec<String>,
}

impl RemoteRow {
    /// Build a row from raw cells, extracting the uid from the first cell.
    pub fn from_cells(row_index: u32, cells: Vec<String>) -> Self {
        let uid = cells.first().cloned().unwrap_or_default();
        Self {
            row_index,
            uid,
            cells,
        }
    }
}

/// The fixed column layout of the remote worksheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetSchema {
    columns: Vec<String>,
}

impl Default for SheetSchema {
    fn default() -> Self {
        Self {
            columns: DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl SheetSchema {
    /// Build a schema from an explicit column list.
    ///
    /// The first column must be `uid` and the last `last_synced_at`;
    /// stores and the orchestrator rely on those positions.
    pub fn new(columns: Vec<String>) -> Result<Self> {
        if columns.first().map(String::as_str) != Some(UID_COLUMN) {
            return Err(SyncError::Config(format!(
                "first schema column must be {}",
                UID_COLUMN
            )));
        }
        if columns.last().map(String::as_str) != Some(LAST_SYNCED_AT_COLUMN) {
            return Err(SyncError::Config(format!(
                "last schema column must be {}",
                LAST_SYNCED_AT_COLUMN
            )));
        }
        Ok(Self { columns })
    }

    /// The column names, in order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Check if a column exists in the schema.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// The A1 letter of the last column (e.g. `H` for 8 columns).
    pub fn last_column_letter(&self) -> String {
        column_letter(self.columns.len() as u32)
    }

    /// Render a record into cells in schema order.
    ///
    /// Missing fields render as empty cells; `uid` and `last_synced_at`
    /// are filled by the engine.
    pub fn cells_for(&self, record: &InvoiceRecord, synced_at: &str) -> Vec<String> {
        self.columns
            .iter()
            .map(|column| {
                if column == UID_COLUMN {
                    record.uid.clone()
                } else if column == LAST_SYNCED_AT_COLUMN {
                    synced_at.to_string()
                } else {
                    record
                        .fields
                        .get(column)
                        .map(FieldValue::as_cell)
                        .unwrap_or_default()
                }
            })
            .collect()
    }

    /// Compare two cell rows for content equality.
    ///
    /// Ignores the `last_synced_at` column (the engine rewrites it on every
    /// write) and treats missing trailing cells as empty, since remote APIs
    /// trim trailing blanks.
    pub fn content_eq(&self, a: &[String], b: &[String]) -> bool {
        let skip = self.columns.len() - 1;
        for i in 0..self.columns.len() {
            if i == skip {
                continue;
            }
            let left = a.get(i).map(String::as_str).unwrap_or("");
            let right = b.get(i).map(String::as_str).unwrap_or("");
            if left != right {
                return false;
            }
        }
        true
    }
}

/// Derive the composite business key for an invoice.
///
/// Stable across re-runs: trimmed, uppercased `VENDOR/NUMBER`.
pub fn derive_uid(vendor_code: &str, invoice_number: &str) -> String {
    format!(
        "{}/{}",
        vendor_code.trim().to_uppercase(),
        invoice_number.trim().to_uppercase()
    )
}

/// SHA-256 fingerprint of a source document, hex-encoded.
pub fn source_fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Current wall-clock time as an RFC 3339 string, for `last_synced_at`.
pub(crate) fn timestamp_now() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}

/// Convert a 1-based column index to its A1 letter (1 → A, 27 → AA).
pub fn column_letter(mut index: u32) -> String {
    let mut letters = String::new();
    while index > 0 {
        let remainder = (index - 1) % 26;
        letters.insert(0, (b'A' + remainder as u8) as char);
        index = (index - 1) / 26;
    }
    if letters.is_empty() {
        letters.push('A');
    }
    letters
}
