//! Narrow capability traits for the backing stores a handler talks to.
//!
//! Concrete database, search and cache wire protocols live outside this
//! crate; handlers only ever see these traits through `Arc<dyn ...>` handles
//! injected at construction. [`memory`] provides process-local versions for
//! local runs and tests.

pub mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use memory::{MemoryCache, MemoryRelationalStore, MemorySearchIndex};

/// One result row, column name to value.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("cache ttl out of range: {0:?}")]
    InvalidTtl(Duration),
}

/// Structured query against a search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub index: String,
    /// Field name to accepted values; a document matches if every listed
    /// field matches one of its values.
    pub filters: BTreeMap<String, Vec<String>>,
    pub limit: usize,
}

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub score: f64,
    pub source: Value,
}

/// Parameterized query → rows.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError>;
}

/// Structured query → ranked documents.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Document>, StoreError>;
}

/// TTL'd blob cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;
}
