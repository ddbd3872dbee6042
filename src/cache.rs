//! Row-set cache for the table proxy.
//!
//! Caches complete row sets keyed by the rendered query so that repeated
//! dataset reads within the TTL do not hit the warehouse. Credential lookups
//! are never cached.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use crate::tables::{Row, TableQuery};

/// Cache for table query results.
#[derive(Clone)]
pub struct TableCache {
    inner: Arc<Cache<String, Arc<Vec<Row>>>>,
}

impl TableCache {
    /// Create a new cache with the given TTL and max entries.
    pub fn new(ttl_seconds: u64, max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(Duration::from_secs(ttl_seconds))
            .build();

        Self {
            inner: Arc::new(cache),
        }
    }

    pub fn get(&self, query: &TableQuery) -> Option<Arc<Vec<Row>>> {
        self.inner.get(&query.cache_key())
    }

    pub fn insert(&self, query: &TableQuery, rows: Arc<Vec<Row>>) {
        self.inner.insert(query.cache_key(), rows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_roundtrip_by_query() {
        let cache = TableCache::new(60, 10);
        let q = TableQuery::full_table("p.d.t");
        assert!(cache.get(&q).is_none());

        cache.insert(&q, Arc::new(vec![Row::new().with("a", 1i64)]));
        assert_eq!(cache.get(&q).unwrap().len(), 1);
        // A different query does not share the entry
        assert!(cache.get(&q.clone().unordered()).is_none());
    }
}
