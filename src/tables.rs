//! Table reader: ordered rows from the analytical dataset store.
//!
//! Rows keep the dynamic column layout of the source table. Each cell is a
//! [`CellValue`] tagged by type, and a [`Row`] preserves column order.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::TableError;

/// Page size hint passed to the reader.
pub const DEFAULT_PAGE_SIZE: u32 = 10_000;

/// Column every dataset table is ordered and filtered by.
pub const DATE_COLUMN: &str = "date";

/// A single cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl CellValue {
    /// Date carried by this cell, if any.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            CellValue::Date(d) => Some(*d),
            CellValue::Timestamp(ts) => Some(ts.date_naive()),
            CellValue::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
            _ => None,
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::String(s.to_string())
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Integer(v)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Float(v)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(d: NaiveDate) -> Self {
        CellValue::Date(d)
    }
}

/// Ordered mapping of column name to cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: Vec<(String, CellValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert; replaces an existing column in place.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<CellValue>) {
        let column = column.into();
        let value = value.into();
        match self.cells.iter_mut().find(|(c, _)| *c == column) {
            Some((_, existing)) => *existing = value,
            None => self.cells.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(c, _)| c.as_str())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Keep only `columns`, in that order. Missing columns become null.
    pub fn project(&self, columns: &[String]) -> Row {
        Row {
            cells: columns
                .iter()
                .map(|c| (c.clone(), self.get(c).cloned().unwrap_or(CellValue::Null)))
                .collect(),
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.get(DATE_COLUMN).and_then(CellValue::as_date)
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (column, value) in &self.cells {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// A read against one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableQuery {
    /// Fully qualified `project.dataset.table`.
    pub table_id: String,
    /// Empty selects every column.
    pub columns: Vec<String>,
    pub date_equals: Option<NaiveDate>,
    pub order_by_date_asc: bool,
    pub page_size: u32,
}

impl TableQuery {
    /// All rows ordered by date ascending.
    pub fn full_table(table_id: &str) -> Self {
        Self {
            table_id: table_id.to_string(),
            columns: Vec::new(),
            date_equals: None,
            order_by_date_asc: true,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn on_date(mut self, date: NaiveDate) -> Self {
        self.date_equals = Some(date);
        self
    }

    pub fn unordered(mut self) -> Self {
        self.order_by_date_asc = false;
        self
    }

    /// Standard SQL for this query.
    pub fn to_sql(&self) -> String {
        let select = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        let mut sql = format!("SELECT {} FROM `{}`", select, self.table_id);
        if let Some(date) = self.date_equals {
            sql.push_str(&format!(" WHERE {} = DATE '{}'", DATE_COLUMN, date.format("%Y-%m-%d")));
        }
        if self.order_by_date_asc {
            sql.push_str(&format!(" ORDER BY {} ASC", DATE_COLUMN));
        }
        sql
    }

    /// Stable cache key.
    pub fn cache_key(&self) -> String {
        self.to_sql()
    }
}

/// Executes table queries against the dataset store.
#[async_trait]
pub trait TableReader: Send + Sync {
    async fn read_table(&self, query: &TableQuery) -> Result<Vec<Row>, TableError>;
}

// ---------------------------------------------------------------------------
// In-memory tables
// ---------------------------------------------------------------------------

/// Tables held in process memory, keyed by table id.
#[derive(Debug, Default, Clone)]
pub struct MemoryTableReader {
    tables: HashMap<String, Vec<Row>>,
}

impl MemoryTableReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table_id: &str, rows: Vec<Row>) -> Self {
        self.tables.insert(table_id.to_string(), rows);
        self
    }
}

#[async_trait]
impl TableReader for MemoryTableReader {
    async fn read_table(&self, query: &TableQuery) -> Result<Vec<Row>, TableError> {
        let rows = self
            .tables
            .get(&query.table_id)
            .ok_or_else(|| TableError::Query(format!("table not found: {}", query.table_id)))?;

        let mut selected: Vec<Row> = rows
            .iter()
            .filter(|row| match query.date_equals {
                Some(date) => row.date() == Some(date),
                None => true,
            })
            .cloned()
            .collect();

        if query.order_by_date_asc {
            // Rows without a date sort first, as NULLs do in ascending order
            selected.sort_by_key(Row::date);
        }

        if !query.columns.is_empty() {
            selected = selected.iter().map(|row| row.project(&query.columns)).collect();
        }
        Ok(selected)
    }
}

// ---------------------------------------------------------------------------
// BigQuery reader
// ---------------------------------------------------------------------------

/// Default BigQuery REST endpoint
pub const DEFAULT_BIGQUERY_URL: &str = "https://bigquery.googleapis.com";

/// Server-side wait per request before the job is polled again.
const QUERY_TIMEOUT_MS: u32 = 10_000;

/// Upper bound on result pages and polls for one query.
const MAX_ROUND_TRIPS: usize = 1_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<WireRow>,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

#[derive(Debug, Deserialize)]
struct WireRow {
    #[serde(default)]
    f: Vec<WireCell>,
}

#[derive(Debug, Deserialize)]
struct WireCell {
    #[serde(default)]
    v: Value,
}

/// Reads tables through the BigQuery `jobs.query` REST API.
pub struct BigQueryReader {
    base_url: String,
    project: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl BigQueryReader {
    pub fn new(base_url: &str, project: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.to_string(),
            access_token: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token;
        self
    }

    fn queries_url(&self) -> String {
        format!("{}/bigquery/v2/projects/{}/queries", self.base_url, self.project)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<QueryResponse, TableError> {
        let request = match self.access_token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        };
        let resp = request
            .send()
            .await
            .map_err(|e| TableError::Query(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TableError::Query(format!("HTTP {}", status)));
        }
        resp.json()
            .await
            .map_err(|e| TableError::Decode(e.to_string()))
    }

    async fn start(&self, query: &TableQuery) -> Result<QueryResponse, TableError> {
        let body = serde_json::json!({
            "query": query.to_sql(),
            "useLegacySql": false,
            "maxResults": query.page_size,
            "timeoutMs": QUERY_TIMEOUT_MS,
        });
        self.send(self.client.post(self.queries_url()).json(&body))
            .await
    }

    async fn fetch_page(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<QueryResponse, TableError> {
        let url = format!("{}/{}", self.queries_url(), job.job_id);
        let mut params: Vec<(&str, String)> = vec![
            ("maxResults", page_size.to_string()),
            ("timeoutMs", QUERY_TIMEOUT_MS.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        if let Some(ref location) = job.location {
            params.push(("location", location.clone()));
        }
        self.send(self.client.get(url).query(&params)).await
    }
}

#[async_trait]
impl TableReader for BigQueryReader {
    async fn read_table(&self, query: &TableQuery) -> Result<Vec<Row>, TableError> {
        let mut resp = self.start(query).await?;
        let mut schema: Option<TableSchema> = None;
        let mut rows = Vec::new();

        for _ in 0..MAX_ROUND_TRIPS {
            if resp.job_complete {
                if schema.is_none() {
                    schema = resp.schema.take();
                }
                let fields = schema
                    .as_ref()
                    .ok_or_else(|| TableError::Decode("missing schema".into()))?;
                for wire in &resp.rows {
                    rows.push(decode_row(&fields.fields, wire)?);
                }
                if resp.page_token.is_none() {
                    return Ok(rows);
                }
            }

            let job = resp
                .job_reference
                .as_ref()
                .ok_or_else(|| TableError::Decode("missing job reference".into()))?;
            // An incomplete job is polled without a page token
            let token = if resp.job_complete {
                resp.page_token.as_deref()
            } else {
                None
            };
            let next = self.fetch_page(job, token, query.page_size).await?;
            // Later pages may omit the job reference
            let job_reference = next.job_reference.or(resp.job_reference.take());
            resp = QueryResponse {
                job_reference,
                ..next
            };
        }

        Err(TableError::Timeout)
    }
}

fn decode_row(fields: &[FieldSchema], wire: &WireRow) -> Result<Row, TableError> {
    if wire.f.len() != fields.len() {
        return Err(TableError::Decode(format!(
            "row has {} cells, schema has {} fields",
            wire.f.len(),
            fields.len()
        )));
    }
    let mut row = Row::new();
    for (field, cell) in fields.iter().zip(&wire.f) {
        row.insert(field.name.clone(), decode_cell(&field.field_type, &cell.v));
    }
    Ok(row)
}

/// Convert a wire cell (always a JSON string or null) using its schema type.
fn decode_cell(field_type: &str, value: &Value) -> CellValue {
    let raw = match value {
        Value::Null => return CellValue::Null,
        Value::String(s) => s.as_str(),
        other => return CellValue::String(other.to_string()),
    };
    let parsed = match field_type {
        "INTEGER" | "INT64" => raw.parse().ok().map(CellValue::Integer),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => raw.parse().ok().map(CellValue::Float),
        "BOOLEAN" | "BOOL" => raw.parse().ok().map(CellValue::Bool),
        "DATE" => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .map(CellValue::Date),
        "TIMESTAMP" => raw.parse::<f64>().ok().and_then(|secs| {
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9).round() as u32;
            DateTime::from_timestamp(whole as i64, nanos.min(999_999_999)).map(CellValue::Timestamp)
        }),
        _ => None,
    };
    parsed.unwrap_or_else(|| CellValue::String(raw.to_string()))
}
