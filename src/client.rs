//! HTTP client for the remote values API.
//!
//! Implements [`RemoteStore`] against a spreadsheet-style values endpoint:
//! ranges are addressed in A1 notation, rows are appended through the
//! `:append` verb, and the store assigns row positions.
//!
//! # Failure Classification
//!
//! Every response is classified for the retry controller:
//!
//! - `429`, `408`, `5xx`, transport errors → `Transient`
//! - `401`/`403` (auth rejected), `400` (malformed), `404` (sheet not
//!   found) → `Permanent`
//!
//! Credential failures from the [`TokenProvider`] are always `Permanent`;
//! retrying a rejected credential only burns quota.
//!
//! # Quota Shaping
//!
//! When configured, a token bucket paces requests under the remote API's
//! quota so sustained load never trips it; the retry controller's backoff
//! only has to absorb genuine bursts and remote-side throttling.

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::metrics;
use crate::record::{RemoteRow, SheetSchema};
use crate::retry::{QuotaLimit, RateLimiter};
use crate::store::{BoxFuture, RemoteStore, RowRange, StoreResult};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Supplies bearer tokens for the values API.
///
/// The engine treats credential failure as permanent; the provider should
/// refresh expiring tokens internally rather than surfacing them.
pub trait TokenProvider: Send + Sync + 'static {
    /// Return a currently-valid bearer token.
    fn token(&self) -> StoreResult<String>;
}

/// A fixed token, for service-account setups where refresh happens
/// out-of-process.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wrap a pre-issued token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> StoreResult<String> {
        if self.token.is_empty() {
            return Err(StoreError::permanent("auth", "empty bearer token"));
        }
        Ok(self.token.clone())
    }
}

/// Values-API response body for range reads.
#[derive(Debug, Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Values-API response body for appends.
#[derive(Debug, Deserialize)]
struct AppendResponse {
    updates: Option<AppendUpdates>,
}

#[derive(Debug, Deserialize)]
struct AppendUpdates {
    #[serde(rename = "updatedRange")]
    updated_range: Option<String>,
}

/// HTTP implementation of [`RemoteStore`].
pub struct RestSheetClient {
    http: reqwest::Client,
    config: StoreConfig,
    schema: SheetSchema,
    tokens: Arc<dyn TokenProvider>,
    limiter: Option<RateLimiter>,
}

impl RestSheetClient {
    /// Build a client for the configured endpoint.
    pub fn new(
        config: StoreConfig,
        schema: SheetSchema,
        tokens: Arc<dyn TokenProvider>,
        quota: Option<QuotaLimit>,
    ) -> StoreResult<Self> {
        if config.spreadsheet_id.is_empty() {
            return Err(StoreError::permanent("config", "spreadsheet_id is empty"));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout_duration())
            .build()
            .map_err(|e| StoreError::permanent("client", format!("HTTP client build: {}", e)))?;
        Ok(Self {
            http,
            config,
            schema,
            tokens,
            limiter: quota.map(RateLimiter::new),
        })
    }

    /// Initialize the header row if the worksheet is blank.
    ///
    /// Idempotent; call once before `SyncEngine::start()` on a fresh
    /// spreadsheet.
    pub async fn ensure_headers(&self) -> StoreResult<()> {
        let header_range = format!("A1:{}1", self.schema.last_column_letter());
        let existing = self.get_values("ensure_headers", &header_range).await?;
        if !existing.is_empty() {
            return Ok(());
        }
        let headers: Vec<String> = self.schema.columns().to_vec();
        debug!(?headers, "Initializing worksheet headers");
        self.put_values("ensure_headers", &header_range, headers)
            .await
    }

    fn values_url(&self, cell_range: &str) -> String {
        format!(
            "{}/spreadsheets/{}/values/{}!{}",
            self.config.base_url, self.config.spreadsheet_id, self.config.worksheet, cell_range
        )
    }

    /// A1 cell range for data rows, e.g. `A2:H` (open) or `A2:H7`.
    fn data_range(&self, range: RowRange) -> String {
        let last = self.schema.last_column_letter();
        match range.end {
            Some(end) => format!("A{}:{}{}", range.start, last, end),
            None => format!("A{}:{}", range.start, last),
        }
    }

    async fn shape(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
    }

    async fn get_values(&self, op: &'static str, cell_range: &str) -> StoreResult<Vec<Vec<String>>> {
        self.shape().await;
        let token = self.tokens.token()?;
        let started = Instant::now();

        let result = self
            .http
            .get(self.values_url(cell_range))
            .bearer_auth(token)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                metrics::record_remote_call(op, false, started.elapsed());
                return Err(wrap_transport(op, e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            metrics::record_remote_call(op, false, started.elapsed());
            return Err(classify_status(op, status, &detail));
        }

        let body: ValuesResponse = response
            .json()
            .await
            .map_err(|e| StoreError::permanent(op, format!("malformed response: {}", e)))?;
        metrics::record_remote_call(op, true, started.elapsed());

        Ok(body
            .values
            .into_iter()
            .map(|row| row.into_iter().map(|v| value_to_cell(&v)).collect())
            .collect())
    }

    async fn put_values(
        &self,
        op: &'static str,
        cell_range: &str,
        cells: Vec<String>,
    ) -> StoreResult<()> {
        self.shape().await;
        let token = self.tokens.token()?;
        let started = Instant::now();

        let url = format!("{}?valueInputOption=RAW", self.values_url(cell_range));
        let result = self
            .http
            .put(url)
            .bearer_auth(token)
            .json(&json!({ "values": [cells] }))
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                metrics::record_remote_call(op, false, started.elapsed());
                return Err(wrap_transport(op, e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            metrics::record_remote_call(op, false, started.elapsed());
            return Err(classify_status(op, status, &detail));
        }
        metrics::record_remote_call(op, true, started.elapsed());
        Ok(())
    }

    async fn post_append(&self, op: &'static str, cells: Vec<String>) -> StoreResult<u32> {
        self.shape().await;
        let token = self.tokens.token()?;
        let started = Instant::now();

        let table_range = format!("A1:{}", self.schema.last_column_letter());
        let url = format!(
            "{}:append?valueInputOption=RAW&insertDataOption=INSERT_ROWS",
            self.values_url(&table_range)
        );
        let result = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&json!({ "values": [cells] }))
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                metrics::record_remote_call(op, false, started.elapsed());
                return Err(wrap_transport(op, e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            metrics::record_remote_call(op, false, started.elapsed());
            return Err(classify_status(op, status, &detail));
        }

        let body: AppendResponse = response
            .json()
            .await
            .map_err(|e| StoreError::permanent(op, format!("malformed response: {}", e)))?;
        metrics::record_remote_call(op, true, started.elapsed());

        let range = body
            .updates
            .and_then(|u| u.updated_range)
            .ok_or_else(|| StoreError::permanent(op, "append response missing updatedRange"))?;
        parse_row_from_range(&range).ok_or_else(|| {
            StoreError::permanent(op, format!("unparseable updatedRange: {}", range))
        })
    }
}

impl RemoteStore for RestSheetClient {
    fn read_all(&self) -> BoxFuture<'_, Vec<RemoteRow>> {
        Box::pin(async move {
            let range = RowRange::all_data();
            let rows = self.get_values("read_all", &self.data_range(range)).await?;
            Ok(rows
                .into_iter()
                .enumerate()
                .map(|(i, cells)| RemoteRow::from_cells(i as u32 + 2, cells))
                .collect())
        })
    }

    fn append_row(&self, cells: Vec<String>) -> BoxFuture<'_, u32> {
        Box::pin(async move {
            let row_index = self.post_append("append_row", cells).await?;
            debug!(row_index, "Appended row");
            if row_index < 2 {
                // The store put data in the header row; the sheet was
                // created without headers.
                warn!(row_index, "Append landed above the data region");
            }
            Ok(row_index)
        })
    }

    fn update_row(&self, row_index: u32, cells: Vec<String>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if row_index < 2 {
                return Err(StoreError::permanent(
                    "update_row",
                    format!("row {} is in the header region", row_index),
                ));
            }
            let range = self.data_range(RowRange::single(row_index));
            self.put_values("update_row", &range, cells).await?;
            debug!(row_index, "Updated row");
            Ok(())
        })
    }

    fn batch_read(&self, range: RowRange) -> BoxFuture<'_, Vec<RemoteRow>> {
        Box::pin(async move {
            // Clamp into the data region; row 1 is the header.
            let clamped = RowRange {
                start: range.start.max(2),
                end: range.end,
            };
            let rows = self
                .get_values("batch_read", &self.data_range(clamped))
                .await?;
            Ok(rows
                .into_iter()
                .enumerate()
                .map(|(i, cells)| RemoteRow::from_cells(clamped.start + i as u32, cells))
                .collect())
        })
    }
}

/// Classify an HTTP status into the transient/permanent contract.
fn classify_status(op: &str, status: StatusCode, detail: &str) -> StoreError {
    let message = if detail.is_empty() {
        format!("HTTP {}", status)
    } else {
        // Error bodies can be huge HTML pages; keep logs readable.
        let trimmed: String = detail.chars().take(200).collect();
        format!("HTTP {}: {}", status, trimmed)
    };
    let transient = status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error();
    if transient {
        StoreError::transient(op, message)
    } else {
        StoreError::permanent(op, message)
    }
}

/// Classify a transport-level failure (timeout, connect, protocol).
fn wrap_transport(op: &str, e: reqwest::Error) -> StoreError {
    if e.is_builder() {
        StoreError::permanent(op, format!("request build: {}", e))
    } else {
        StoreError::transient(op, format!("transport: {}", e))
    }
}

/// Render a JSON cell value as a string cell.
fn value_to_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Extract the starting row number from an A1 range like `Records!A7:H7`.
fn parse_row_from_range(range: &str) -> Option<u32> {
    let cells = range.rsplit('!').next().unwrap_or(range);
    let first = cells.split(':').next().unwrap_or(cells);
    let digits: String = first
        .chars()
        .skip_while(|c| c.is_ascii_alphabetic())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn test_client() -> RestSheetClient {
        let config = StoreConfig {
            spreadsheet_id: "sheet-123".to_string(),
            ..Default::default()
        };
        RestSheetClient::new(
            config,
            SheetSchema::default(),
            Arc::new(StaticTokenProvider::new("token")),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_new_requires_spreadsheet_id() {
        let result = RestSheetClient::new(
            StoreConfig::default(),
            SheetSchema::default(),
            Arc::new(StaticTokenProvider::new("token")),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_static_token_provider() {
        assert_eq!(StaticTokenProvider::new("abc").token().unwrap(), "abc");
        assert!(StaticTokenProvider::new("").token().is_err());
    }

    #[test]
    fn test_values_url() {
        let client = test_client();
        assert_eq!(
            client.values_url("A2:H"),
            "https://sheets.googleapis.com/v4/spreadsheets/sheet-123/values/Records!A2:H"
        );
    }

    #[test]
    fn test_data_range_open_and_bounded() {
        let client = test_client();
        assert_eq!(client.data_range(RowRange::all_data()), "A2:H");
        assert_eq!(client.data_range(RowRange::single(7)), "A7:H7");
        assert_eq!(
            client.data_range(RowRange {
                start: 3,
                end: Some(9)
            }),
            "A3:H9"
        );
    }

    #[test]
    fn test_parse_row_from_range() {
        assert_eq!(parse_row_from_range("Records!A7:H7"), Some(7));
        assert_eq!(parse_row_from_range("Records!A152"), Some(152));
        assert_eq!(parse_row_from_range("A2:H2"), Some(2));
        assert_eq!(parse_row_from_range("Records!AB10:AC10"), Some(10));
        assert_eq!(parse_row_from_range("Records!A:H"), None);
        assert_eq!(parse_row_from_range(""), None);
    }

    #[test]
    fn test_classify_status_transient() {
        assert!(classify_status("op", StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status("op", StatusCode::INTERNAL_SERVER_ERROR, "").is_transient());
        assert!(classify_status("op", StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status("op", StatusCode::REQUEST_TIMEOUT, "").is_transient());
    }

    #[test]
    fn test_classify_status_permanent() {
        assert!(!classify_status("op", StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!classify_status("op", StatusCode::FORBIDDEN, "").is_transient());
        assert!(!classify_status("op", StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!classify_status("op", StatusCode::NOT_FOUND, "").is_transient());
    }

    #[test]
    fn test_classify_status_truncates_detail() {
        let huge = "x".repeat(10_000);
        let err = classify_status("op", StatusCode::BAD_REQUEST, &huge);
        assert!(err.message.len() < 300);
    }

    #[test]
    fn test_value_to_cell() {
        assert_eq!(value_to_cell(&serde_json::json!("text")), "text");
        assert_eq!(value_to_cell(&serde_json::json!(100)), "100");
        assert_eq!(value_to_cell(&serde_json::json!(99.95)), "99.95");
        assert_eq!(value_to_cell(&serde_json::json!(true)), "true");
        assert_eq!(value_to_cell(&serde_json::Value::Null), "");
    }
}
