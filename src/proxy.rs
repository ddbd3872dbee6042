//! Table proxy: the protected read path behind credential verification.
//!
//! Each dataset maps to one warehouse table. Reads return every row ordered
//! by date ascending, or fail as a whole.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate};
use eyre::{bail, Result};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::cache::TableCache;
use crate::credential::{SharedClock, ValidCredential};
use crate::error::{GatewayError, TableError};
use crate::tables::{Row, TableQuery, TableReader};
use crate::verifier::PrivilegedAccess;

/// Columns returned by the preview, in output order.
pub const PREVIEW_COLUMNS: [&str; 4] = ["project_id", "twitter_user", "discord_user", "telegram_user"];

/// Default age of the preview snapshot, in days before today (UTC).
pub const DEFAULT_PREVIEW_DAYS_AGO: u32 = 1;

/// Default bound on one warehouse read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Paths served by the gateway itself; datasets may not shadow them.
const RESERVED_PATHS: [&str; 4] = ["preview", "api_key", "health", "metrics"];

/// One dataset exposed at `/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub table: String,
}

impl Dataset {
    pub fn new(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
        }
    }
}

/// Ordered set of datasets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetCatalog {
    datasets: Vec<Dataset>,
}

impl DatasetCatalog {
    /// Build a catalog, rejecting duplicate or reserved names.
    pub fn new(datasets: Vec<Dataset>) -> Result<Self> {
        for (i, ds) in datasets.iter().enumerate() {
            let valid_name = !ds.name.is_empty()
                && ds
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid_name {
                bail!("invalid dataset name: {:?}", ds.name);
            }
            if RESERVED_PATHS.contains(&ds.name.as_str()) {
                bail!("dataset name {:?} collides with a built-in route", ds.name);
            }
            if ds.table.is_empty() || ds.table.contains('`') {
                bail!("invalid table id for dataset {}: {:?}", ds.name, ds.table);
            }
            if datasets[..i].iter().any(|other| other.name == ds.name) {
                bail!("duplicate dataset name: {}", ds.name);
            }
        }
        Ok(Self { datasets })
    }

    pub fn get(&self, name: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.iter()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

impl Default for DatasetCatalog {
    fn default() -> Self {
        let project = "tranquil-lore-396810.mopsos_ai";
        Self {
            datasets: [
                ("oceanprotocol", "ocean_protocol"),
                ("dimitra", "dimitra"),
                ("numerai", "numerai"),
                ("anyone", "anyone"),
                ("genomes", "genomes"),
            ]
            .iter()
            .map(|(name, table)| Dataset::new(name, &format!("{}.{}", project, table)))
            .collect(),
        }
    }
}

/// Reads datasets on behalf of authenticated callers.
#[derive(Clone)]
pub struct TableProxy {
    reader: Arc<dyn TableReader>,
    catalog: DatasetCatalog,
    cache: Option<TableCache>,
    clock: SharedClock,
    read_timeout: Duration,
    preview_days_ago: u32,
}

impl TableProxy {
    pub fn new(reader: Arc<dyn TableReader>, catalog: DatasetCatalog, clock: SharedClock) -> Self {
        Self {
            reader,
            catalog,
            cache: None,
            clock,
            read_timeout: DEFAULT_READ_TIMEOUT,
            preview_days_ago: DEFAULT_PREVIEW_DAYS_AGO,
        }
    }

    pub fn with_cache(mut self, cache: TableCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_preview_days_ago(mut self, days: u32) -> Self {
        self.preview_days_ago = days;
        self
    }

    pub fn catalog(&self) -> &DatasetCatalog {
        &self.catalog
    }

    /// All rows of a dataset, ordered by date ascending.
    pub async fn dataset_rows(
        &self,
        _key: &ValidCredential,
        name: &str,
    ) -> Result<Arc<Vec<Row>>, GatewayError> {
        let dataset = self
            .catalog
            .get(name)
            .ok_or_else(|| GatewayError::NotFound(format!("Unknown dataset: {}", name)))?;
        self.read(&TableQuery::full_table(&dataset.table)).await
    }

    /// Snapshot date used by the preview.
    pub fn preview_date(&self) -> NaiveDate {
        let today = DateTime::from_timestamp(self.clock.now_unix(), 0)
            .map(|dt| dt.date_naive())
            .unwrap_or_default();
        today - chrono::Days::new(u64::from(self.preview_days_ago))
    }

    /// Social-handle columns of every dataset on the preview date,
    /// concatenated in catalog order.
    pub async fn preview_rows(&self, _access: PrivilegedAccess) -> Result<Vec<Row>, GatewayError> {
        let date = self.preview_date();
        let queries: Vec<TableQuery> = self
            .catalog
            .iter()
            .map(|ds| {
                TableQuery::full_table(&ds.table)
                    .with_columns(&PREVIEW_COLUMNS)
                    .on_date(date)
                    .unordered()
            })
            .collect();

        let parts = try_join_all(queries.iter().map(|q| self.read(q))).await?;
        let rows: Vec<Row> = parts.iter().flat_map(|p| p.iter().cloned()).collect();
        tracing::info!(%date, rows = rows.len(), "preview assembled");
        Ok(rows)
    }

    async fn read(&self, query: &TableQuery) -> Result<Arc<Vec<Row>>, GatewayError> {
        if let Some(ref cache) = self.cache {
            if let Some(rows) = cache.get(query) {
                crate::metrics::record_cache_hit();
                return Ok(rows);
            }
            crate::metrics::record_cache_miss();
        }

        let started = Instant::now();
        let result = tokio::time::timeout(self.read_timeout, self.reader.read_table(query))
            .await
            .unwrap_or(Err(TableError::Timeout));
        let duration_ms = started.elapsed().as_millis() as u64;
        crate::metrics::record_table_read(&query.table_id, result.is_ok(), duration_ms);

        let rows = Arc::new(result?);
        tracing::debug!(table = %query.table_id, rows = rows.len(), duration_ms, "table read");
        if let Some(ref cache) = self.cache {
            cache.insert(query, rows.clone());
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::credential::{CredentialChannel, FixedClock};
    use crate::tables::{CellValue, MemoryTableReader};

    // 2024-03-02T12:00:00Z
    const NOW: i64 = 1_709_380_800;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn key() -> ValidCredential {
        ValidCredential::new("k1", CredentialChannel::Query)
    }

    fn access() -> PrivilegedAccess {
        PrivilegedAccess::operator()
    }

    struct CountingReader {
        inner: MemoryTableReader,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl TableReader for CountingReader {
        async fn read_table(&self, query: &TableQuery) -> Result<Vec<Row>, TableError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_table(query).await
        }
    }

    fn catalog() -> DatasetCatalog {
        DatasetCatalog::new(vec![Dataset::new("a", "p.d.a"), Dataset::new("b", "p.d.b")]).unwrap()
    }

    fn reader() -> MemoryTableReader {
        MemoryTableReader::new()
            .with_table(
                "p.d.a",
                vec![
                    Row::new()
                        .with("date", date("2024-03-01"))
                        .with("project_id", "a1")
                        .with("twitter_user", "@a1")
                        .with("stars", 5i64),
                    Row::new()
                        .with("date", date("2024-02-29"))
                        .with("project_id", "a0"),
                ],
            )
            .with_table(
                "p.d.b",
                vec![Row::new()
                    .with("date", date("2024-03-01"))
                    .with("project_id", "b1")
                    .with("telegram_user", "b1_tg")],
            )
    }

    fn proxy() -> TableProxy {
        TableProxy::new(Arc::new(reader()), catalog(), Arc::new(FixedClock::new(NOW)))
    }

    #[test]
    fn test_default_catalog() {
        let catalog = DatasetCatalog::default();
        assert_eq!(catalog.len(), 5);
        assert_eq!(
            catalog.get("oceanprotocol").unwrap().table,
            "tranquil-lore-396810.mopsos_ai.ocean_protocol"
        );
        assert!(DatasetCatalog::new(catalog.iter().cloned().collect()).is_ok());
    }

    #[test]
    fn test_catalog_rejects_reserved_and_duplicates() {
        assert!(DatasetCatalog::new(vec![Dataset::new("preview", "p.d.t")]).is_err());
        assert!(DatasetCatalog::new(vec![Dataset::new("x", "t"), Dataset::new("x", "u")]).is_err());
        assert!(DatasetCatalog::new(vec![Dataset::new("a/b", "t")]).is_err());
        assert!(DatasetCatalog::new(vec![Dataset::new("a", "t` OR 1")]).is_err());
    }

    #[tokio::test]
    async fn test_dataset_rows_ordered() {
        let rows = proxy().dataset_rows(&key(), "a").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("project_id"), Some(&CellValue::from("a0")));
        assert_eq!(rows[1].get("project_id"), Some(&CellValue::from("a1")));
    }

    #[tokio::test]
    async fn test_unknown_dataset() {
        let err = proxy().dataset_rows(&key(), "zzz").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[test]
    fn test_preview_date_is_relative() {
        assert_eq!(proxy().preview_date(), date("2024-03-01"));
        assert_eq!(proxy().with_preview_days_ago(0).preview_date(), date("2024-03-02"));
    }

    #[tokio::test]
    async fn test_preview_union() {
        let rows = proxy().preview_rows(access()).await.unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.columns().collect::<Vec<_>>(), PREVIEW_COLUMNS.to_vec());
        }
        assert_eq!(rows[0].get("twitter_user"), Some(&CellValue::from("@a1")));
        assert_eq!(rows[1].get("telegram_user"), Some(&CellValue::from("b1_tg")));
        assert_eq!(rows[1].get("discord_user"), Some(&CellValue::Null));
    }

    #[tokio::test]
    async fn test_cache_avoids_second_read() {
        let counting = Arc::new(CountingReader {
            inner: reader(),
            reads: AtomicUsize::new(0),
        });
        let proxy = TableProxy::new(counting.clone(), catalog(), Arc::new(FixedClock::new(NOW)))
            .with_cache(TableCache::new(60, 10));
        proxy.dataset_rows(&key(), "a").await.unwrap();
        proxy.dataset_rows(&key(), "a").await.unwrap();
        assert_eq!(counting.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reader_failure_is_unavailable() {
        let proxy = TableProxy::new(
            Arc::new(MemoryTableReader::new()),
            catalog(),
            Arc::new(FixedClock::new(NOW)),
        );
        let err = proxy.dataset_rows(&key(), "a").await.unwrap_err();
        assert!(matches!(err, GatewayError::ServiceUnavailable));
    }
}
