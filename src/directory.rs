//! Key directory: read-only lookups of credential records by equality.
//!
//! The gateway never writes to the directory. Two backends are provided:
//! an in-process [`MemoryDirectory`] and a [`FirestoreDirectory`] speaking the
//! Firestore REST `runQuery` API.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::credential::CredentialRecord;
use crate::error::DirectoryError;

/// Equality lookups against the store of issued keys.
///
/// Both methods return every matching record; the store does not enforce
/// uniqueness of either field. Callers pick one with [`select_authoritative`].
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn find_by_identity(&self, identity: &str)
        -> Result<Vec<CredentialRecord>, DirectoryError>;

    async fn find_by_key(&self, key: &str) -> Result<Vec<CredentialRecord>, DirectoryError>;
}

/// Shared directory handle.
pub type SharedDirectory = Arc<dyn KeyDirectory>;

/// Pick the record that decides a lookup when several match.
///
/// Greatest expiry wins; ties fall back to the lexicographically smallest key
/// so the result never depends on store ordering.
pub fn select_authoritative(records: Vec<CredentialRecord>) -> Option<CredentialRecord> {
    records
        .into_iter()
        .max_by(|a, b| a.expiry.cmp(&b.expiry).then_with(|| b.key.cmp(&a.key)))
}

// ---------------------------------------------------------------------------
// In-memory directory
// ---------------------------------------------------------------------------

/// Directory held in process memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryDirectory {
    records: Arc<RwLock<Vec<CredentialRecord>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<CredentialRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    /// Load a JSON array of `{identity, key, expiry}` objects.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read directory file: {}", path.display()))?;
        let records: Vec<CredentialRecord> = serde_json::from_str(&content)
            .wrap_err_with(|| format!("Failed to parse directory file: {}", path.display()))?;
        tracing::info!(path = %path.display(), records = records.len(), "loaded key directory");
        Ok(Self::with_records(records))
    }

    pub fn insert(&self, record: CredentialRecord) {
        self.records.write().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl KeyDirectory for MemoryDirectory {
    async fn find_by_identity(
        &self,
        identity: &str,
    ) -> Result<Vec<CredentialRecord>, DirectoryError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.identity == identity)
            .cloned()
            .collect())
    }

    async fn find_by_key(&self, key: &str) -> Result<Vec<CredentialRecord>, DirectoryError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.key == key)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Firestore directory
// ---------------------------------------------------------------------------

/// Default Firestore REST endpoint
pub const DEFAULT_FIRESTORE_URL: &str = "https://firestore.googleapis.com";

/// Field layout of the credential documents.
#[derive(Debug, Clone)]
pub struct DocumentFields {
    pub identity: String,
    pub key: String,
    pub expiry: String,
}

impl Default for DocumentFields {
    fn default() -> Self {
        Self {
            identity: "address".to_string(),
            key: "api_key".to_string(),
            expiry: "expiry_date".to_string(),
        }
    }
}

/// Key directory backed by a Firestore collection.
pub struct FirestoreDirectory {
    query_url: String,
    collection: String,
    fields: DocumentFields,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl FirestoreDirectory {
    pub fn new(base_url: &str, project: &str, database: &str, collection: &str) -> Self {
        let query_url = format!(
            "{}/v1/projects/{}/databases/{}/documents:runQuery",
            base_url.trim_end_matches('/'),
            project,
            database
        );
        Self {
            query_url,
            collection: collection.to_string(),
            fields: DocumentFields::default(),
            access_token: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_fields(mut self, fields: DocumentFields) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token;
        self
    }

    /// Run an equality query on a single string field.
    async fn query_equal(
        &self,
        field: &str,
        value: &str,
    ) -> Result<Vec<CredentialRecord>, DirectoryError> {
        let body = structured_query(&self.collection, field, value);

        let mut request = self.client.post(&self.query_url).json(&body);
        if let Some(ref token) = self.access_token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DirectoryError::Unavailable(format!("HTTP {}", status)));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| DirectoryError::Malformed(e.to_string()))?;

        parse_run_query_response(&json, &self.fields)
    }
}

#[async_trait]
impl KeyDirectory for FirestoreDirectory {
    async fn find_by_identity(
        &self,
        identity: &str,
    ) -> Result<Vec<CredentialRecord>, DirectoryError> {
        self.query_equal(&self.fields.identity, identity).await
    }

    async fn find_by_key(&self, key: &str) -> Result<Vec<CredentialRecord>, DirectoryError> {
        self.query_equal(&self.fields.key, key).await
    }
}

/// Build a `runQuery` body filtering `collection` on `field == value`.
fn structured_query(collection: &str, field: &str, value: &str) -> Value {
    json!({
        "structuredQuery": {
            "from": [{ "collectionId": collection }],
            "where": {
                "fieldFilter": {
                    "field": { "fieldPath": field },
                    "op": "EQUAL",
                    "value": { "stringValue": value },
                }
            }
        }
    })
}

/// Parse the streamed array returned by `runQuery`.
///
/// Entries without a `document` (pure `readTime` markers) are skipped.
fn parse_run_query_response(
    json: &Value,
    fields: &DocumentFields,
) -> Result<Vec<CredentialRecord>, DirectoryError> {
    let entries = json
        .as_array()
        .ok_or_else(|| DirectoryError::Malformed("expected array response".into()))?;

    let mut records = Vec::new();
    for entry in entries {
        let Some(doc_fields) = entry.get("document").and_then(|d| d.get("fields")) else {
            continue;
        };
        let identity = string_field(doc_fields, &fields.identity).unwrap_or_default();
        let key = string_field(doc_fields, &fields.key)
            .ok_or_else(|| DirectoryError::Malformed(format!("missing field {}", fields.key)))?;
        let expiry = expiry_field(doc_fields, &fields.expiry).ok_or_else(|| {
            DirectoryError::Malformed(format!("missing field {}", fields.expiry))
        })?;
        records.push(CredentialRecord {
            identity,
            key,
            expiry,
        });
    }
    Ok(records)
}

fn string_field(fields: &Value, name: &str) -> Option<String> {
    fields
        .get(name)?
        .get("stringValue")?
        .as_str()
        .map(str::to_string)
}

/// Expiry may be stored as an integer, a double or a timestamp.
fn expiry_field(fields: &Value, name: &str) -> Option<i64> {
    let value = fields.get(name)?;
    if let Some(v) = value.get("integerValue") {
        // Firestore encodes int64 as a JSON string
        return match v {
            Value::String(s) => s.parse().ok(),
            other => other.as_i64(),
        };
    }
    if let Some(v) = value.get("doubleValue").and_then(Value::as_f64) {
        return Some(v as i64);
    }
    if let Some(v) = value.get("timestampValue").and_then(Value::as_str) {
        return chrono::DateTime::parse_from_rfc3339(v)
            .ok()
            .map(|dt| dt.timestamp());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<CredentialRecord> {
        vec![
            CredentialRecord::new("0xABC", "k1", 100),
            CredentialRecord::new("0xABC", "k2", 300),
            CredentialRecord::new("0xDEF", "k3", 200),
        ]
    }

    #[test]
    fn test_select_authoritative_prefers_latest_expiry() {
        let selected = select_authoritative(records()).unwrap();
        assert_eq!(selected.key, "k2");
    }

    #[test]
    fn test_select_authoritative_tie_breaks_on_key() {
        let tied = vec![
            CredentialRecord::new("0xABC", "kb", 500),
            CredentialRecord::new("0xABC", "ka", 500),
        ];
        assert_eq!(select_authoritative(tied.clone()).unwrap().key, "ka");
        let reversed: Vec<_> = tied.into_iter().rev().collect();
        assert_eq!(select_authoritative(reversed).unwrap().key, "ka");
    }

    #[test]
    fn test_select_authoritative_empty() {
        assert!(select_authoritative(Vec::new()).is_none());
    }

    #[tokio::test]
    async fn test_memory_directory_lookups() {
        let dir = MemoryDirectory::with_records(records());
        assert_eq!(dir.find_by_identity("0xABC").await.unwrap().len(), 2);
        assert_eq!(dir.find_by_key("k3").await.unwrap()[0].identity, "0xDEF");
        assert!(dir.find_by_key("missing").await.unwrap().is_empty());
        // Equality is exact
        assert!(dir.find_by_identity("0xabc").await.unwrap().is_empty());
    }

    #[test]
    fn test_memory_directory_load() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"[{"identity":"0xABC","key":"k1","expiry":1700000000}]"#,
        )
        .unwrap();
        let dir = MemoryDirectory::load(file.path()).unwrap();
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_structured_query_shape() {
        let q = structured_query("collection api", "api_key", "k1");
        assert_eq!(
            q["structuredQuery"]["from"][0]["collectionId"],
            "collection api"
        );
        let filter = &q["structuredQuery"]["where"]["fieldFilter"];
        assert_eq!(filter["field"]["fieldPath"], "api_key");
        assert_eq!(filter["op"], "EQUAL");
        assert_eq!(filter["value"]["stringValue"], "k1");
    }

    #[test]
    fn test_parse_run_query_response() {
        let json = json!([
            { "readTime": "2024-01-01T00:00:00Z" },
            { "document": { "name": "a", "fields": {
                "address": { "stringValue": "0xABC" },
                "api_key": { "stringValue": "k1" },
                "expiry_date": { "integerValue": "1700000000" }
            }}},
            { "document": { "name": "b", "fields": {
                "address": { "stringValue": "0xDEF" },
                "api_key": { "stringValue": "k2" },
                "expiry_date": { "timestampValue": "2024-01-01T00:00:00Z" }
            }}}
        ]);
        let records = parse_run_query_response(&json, &DocumentFields::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], CredentialRecord::new("0xABC", "k1", 1_700_000_000));
        assert_eq!(records[1].expiry, 1_704_067_200);
    }

    #[test]
    fn test_parse_run_query_missing_expiry() {
        let json = json!([
            { "document": { "fields": { "api_key": { "stringValue": "k1" } } } }
        ]);
        let err = parse_run_query_response(&json, &DocumentFields::default()).unwrap_err();
        assert!(matches!(err, DirectoryError::Malformed(_)));
    }
}
