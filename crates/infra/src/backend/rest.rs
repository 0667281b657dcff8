//! Row-store adapter speaking the PostgREST dialect over HTTP.
//!
//! Tables: `stock(serialNumber PK, productName)` and
//! `count_records(serialNumber UNIQUE, productName, employeeId, timestamp,
//! correlationId UNIQUE)`. The unique constraint on `serialNumber` is what
//! makes the backend the arbiter of "already counted"; batch inserts use
//! `on_conflict` with ignore-duplicates so a retried or racing batch never
//! fails as a whole.
//!
//! Serials are written lowercased, and the unique constraint only arbitrates
//! correctly if every row is lowercased: a table that also holds rows
//! written with the serial as scanned would accept both `SN001` and
//! `sn001`. Such tables must be migrated before this adapter writes to them:
//!
//! ```sql
//! UPDATE count_records SET "serialNumber" = lower("serialNumber");
//! ALTER TABLE count_records
//!     ADD CONSTRAINT count_records_serial_lowercase
//!     CHECK ("serialNumber" = lower("serialNumber"));
//! ```
//!
//! The check keeps the plain column constraint usable as the
//! `on_conflict` target and refuses mixed-case writes from older clients.
//!
//! PostgREST has no push channel, so [`RestBackend::subscribe`] returns
//! `None` and clients run refresh-only.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use stockcount_core::{CorrelationId, CountEvent, OperatorId, Serial, StockItem};

use super::r#trait::{
    BackendError, BackendStore, ChangeEvent, InsertOutcome, InsertReport, RecordAck, Table,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StockRow {
    serial_number: String,
    #[serde(default)]
    product_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountRow {
    serial_number: String,
    #[serde(default)]
    product_name: String,
    employee_id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    correlation_id: Option<CorrelationId>,
}

impl From<&CountEvent> for CountRow {
    fn from(event: &CountEvent) -> Self {
        Self {
            serial_number: event.serial.to_string(),
            product_name: event.name.clone(),
            employee_id: event.operator.to_string(),
            timestamp: event.created_at,
            correlation_id: Some(event.correlation_id),
        }
    }
}

impl CountRow {
    fn into_event(self) -> Option<CountEvent> {
        let serial = Serial::parse(&self.serial_number).ok()?;
        let operator = OperatorId::parse(&self.employee_id).ok()?;
        let mut event = CountEvent::pending(serial, self.product_name, operator, self.timestamp);
        if let Some(id) = self.correlation_id {
            event.correlation_id = id;
        }
        Some(event.confirm())
    }
}

/// PostgREST-backed store.
#[derive(Debug, Clone)]
pub struct RestBackend {
    base_url: String,
    client: reqwest::Client,
}

impl RestBackend {
    /// `base_url` is the project URL; requests go to `{base_url}/rest/v1/...`.
    pub fn new(base_url: impl Into<String>, api_key: &str) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key)
            .map_err(|e| BackendError::Rejected(format!("invalid api key header: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| BackendError::Rejected(format!("invalid api key header: {e}")))?;
        headers.insert("apikey", key);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Unavailable(format!("failed to build http client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.as_str())
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let resp = req
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(BackendError::Http { status, body })
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, BackendError> {
        resp.json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    /// Existing count rows for the given identifiers.
    async fn fetch_counts_for(&self, serials: &[&Serial]) -> Result<Vec<CountRow>, BackendError> {
        if serials.is_empty() {
            return Ok(Vec::new());
        }
        let filter = in_filter(serials.iter().map(|s| s.as_str()));
        let req = self
            .client
            .get(self.url(Table::CountRecords))
            .query(&[("select", "*"), ("serialNumber", filter.as_str())]);
        Self::json(self.send(req).await?).await
    }
}

#[async_trait::async_trait]
impl BackendStore for RestBackend {
    async fn list_stock_items(&self) -> Result<Vec<StockItem>, BackendError> {
        let req = self
            .client
            .get(self.url(Table::Stock))
            .query(&[("select", "serialNumber,productName")]);
        let rows: Vec<StockRow> = Self::json(self.send(req).await?).await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            match Serial::parse(&row.serial_number) {
                Ok(serial) => items.push(StockItem::new(serial, row.product_name)),
                Err(_) => tracing::warn!("skipping stock row with empty serial"),
            }
        }
        Ok(items)
    }

    async fn upsert_stock_items(&self, items: &[StockItem]) -> Result<usize, BackendError> {
        if items.is_empty() {
            return Ok(0);
        }
        let rows: Vec<StockRow> = items
            .iter()
            .map(|i| StockRow {
                serial_number: i.serial.to_string(),
                product_name: i.name.clone(),
            })
            .collect();
        let req = self
            .client
            .post(self.url(Table::Stock))
            .query(&[("on_conflict", "serialNumber")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&rows);
        self.send(req).await?;
        Ok(items.len())
    }

    async fn insert_count_events(&self, batch: &[CountEvent]) -> Result<InsertReport, BackendError> {
        if batch.is_empty() {
            return Ok(InsertReport::default());
        }
        let rows: Vec<CountRow> = batch.iter().map(CountRow::from).collect();
        let req = self
            .client
            .post(self.url(Table::CountRecords))
            .query(&[("on_conflict", "serialNumber")])
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(&rows);
        let stored: Vec<CountRow> = Self::json(self.send(req).await?).await?;

        let inserted: HashSet<CorrelationId> =
            stored.iter().filter_map(|r| r.correlation_id).collect();

        // Rows skipped by ignore-duplicates: tell replays from real duplicates.
        let skipped: Vec<&Serial> = batch
            .iter()
            .filter(|e| !inserted.contains(&e.correlation_id))
            .map(|e| &e.serial)
            .collect();
        let existing: HashMap<Serial, CountRow> = self
            .fetch_counts_for(&skipped)
            .await?
            .into_iter()
            .filter_map(|row| Serial::parse(&row.serial_number).ok().map(|s| (s, row)))
            .collect();

        let mut report = InsertReport::default();
        for event in batch {
            let outcome = if inserted.contains(&event.correlation_id) {
                InsertOutcome::Inserted
            } else {
                match existing.get(&event.serial) {
                    Some(row) if row.correlation_id == Some(event.correlation_id) => {
                        InsertOutcome::Replayed
                    }
                    Some(row) => InsertOutcome::Duplicate {
                        existing: row.clone().into_event().ok_or_else(|| {
                            BackendError::Decode(format!(
                                "stored count row for {} is malformed",
                                event.serial
                            ))
                        })?,
                    },
                    None => {
                        return Err(BackendError::Rejected(format!(
                            "row for {} neither stored nor found",
                            event.serial
                        )));
                    }
                }
            };
            report.records.push(RecordAck {
                correlation_id: event.correlation_id,
                serial: event.serial.clone(),
                outcome,
            });
        }
        Ok(report)
    }

    async fn list_count_events(&self, limit: Option<usize>) -> Result<Vec<CountEvent>, BackendError> {
        let mut query = vec![
            ("select", "*".to_string()),
            ("order", "timestamp.desc".to_string()),
        ];
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        let req = self.client.get(self.url(Table::CountRecords)).query(&query);
        let rows: Vec<CountRow> = Self::json(self.send(req).await?).await?;

        let total = rows.len();
        let events: Vec<CountEvent> = rows.into_iter().filter_map(CountRow::into_event).collect();
        if events.len() != total {
            tracing::warn!(skipped = total - events.len(), "skipping malformed count rows");
        }
        Ok(events)
    }

    async fn count_count_events(&self) -> Result<usize, BackendError> {
        let req = self
            .client
            .get(self.url(Table::CountRecords))
            .query(&[("select", "serialNumber")])
            .header("Prefer", "count=exact")
            .header("Range", "0-0");
        let resp = self.send(req).await?;
        content_range_total(resp.headers())
            .ok_or_else(|| BackendError::Decode("missing Content-Range total".to_string()))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        None
    }

    async fn delete_all(&self, table: Table) -> Result<usize, BackendError> {
        let req = self
            .client
            .delete(self.url(table))
            .query(&[("serialNumber", "not.is.null")])
            .header("Prefer", "count=exact,return=minimal");
        let resp = self.send(req).await?;
        Ok(content_range_total(resp.headers()).unwrap_or(0))
    }
}

/// `in.("a","b")` with embedded quotes and backslashes escaped.
fn in_filter<'a>(values: impl Iterator<Item = &'a str>) -> String {
    let quoted: Vec<String> = values
        .map(|v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

/// Total from `Content-Range: 0-0/42` or `*/42`.
fn content_range_total(headers: &HeaderMap) -> Option<usize> {
    let value = headers.get(reqwest::header::CONTENT_RANGE)?.to_str().ok()?;
    value.rsplit_once('/')?.1.parse().ok()
}
