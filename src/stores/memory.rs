use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::{CacheStore, Document, RelationalStore, Row, SearchIndex, SearchQuery, StoreError};

struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Process-local [`CacheStore`] with per-entry expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let expires_at = now.checked_add(ttl).ok_or(StoreError::InvalidTtl(ttl))?;
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }
}

/// Call counter and injectable failure shared by the in-memory stores.
#[derive(Default)]
struct Probe {
    calls: AtomicUsize,
    failure: Mutex<Option<StoreError>>,
}

impl Probe {
    fn hit(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &*self.failure.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn set_failure(&self, failure: Option<StoreError>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = failure;
    }
}

/// In-memory table answering queries by matching one column against the
/// query parameters. The SQL text is not interpreted.
pub struct MemoryRelationalStore {
    key_column: String,
    rows: Vec<Row>,
    probe: Probe,
}

impl MemoryRelationalStore {
    pub fn new(key_column: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            key_column: key_column.into(),
            rows,
            probe: Probe::default(),
        }
    }

    /// Number of queries received so far.
    pub fn calls(&self) -> usize {
        self.probe.calls.load(Ordering::SeqCst)
    }

    /// Make every following query fail with `err` (or succeed again with `None`).
    pub fn fail_with(&self, err: Option<StoreError>) {
        self.probe.set_failure(err);
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        self.probe.hit()?;
        debug!(sql, params = params.len(), "memory relational query");
        Ok(self
            .rows
            .iter()
            .filter(|row| row.get(&self.key_column).is_some_and(|v| params.contains(v)))
            .cloned()
            .collect())
    }
}

/// In-memory index matching documents whose `source` fields equal one of the
/// filter values.
pub struct MemorySearchIndex {
    documents: Vec<Document>,
    probe: Probe,
}

impl MemorySearchIndex {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents,
            probe: Probe::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.probe.calls.load(Ordering::SeqCst)
    }

    pub fn fail_with(&self, err: Option<StoreError>) {
        self.probe.set_failure(err);
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Document>, StoreError> {
        self.probe.hit()?;
        let mut hits: Vec<Document> = self
            .documents
            .iter()
            .filter(|doc| {
                query.filters.iter().all(|(field, values)| {
                    doc.source
                        .get(field)
                        .and_then(Value::as_str)
                        .is_some_and(|v| values.iter().any(|want| want == v))
                })
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(query.limit);
        Ok(hits)
    }
}
