//! Cache-aside, fan-out aggregation over several backing sources.
//!
//! [`Aggregator::aggregate`] resolves an ordered entity list from the cache
//! or, on a miss, queries every applicable requested source concurrently and
//! merges their contributions. The first source failure aborts the whole
//! call: remaining queries are cancelled and drained, and no partial result
//! is returned or cached.

mod sources;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, StandardError};
use crate::http::HttpError;
use crate::retry::RetryError;
use crate::stores::{CacheStore, StoreError};

pub use sources::{ExternalApiSource, RelationalSource, SearchSource};

pub const INTERNAL_DB: &str = "internal_db";
pub const SEARCH: &str = "search";
pub const EXTERNAL_API: &str = "external_api";

/// Every source name a caller may request.
pub const KNOWN_SOURCES: &[&str] = &[INTERNAL_DB, SEARCH, EXTERNAL_API];

/// Separator between `type:value` pairs in a cache key.
const KEY_SEPARATOR: &str = "|";

/// A typed value extracted by an earlier workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            value: value.into(),
        }
    }
}

/// Per-call query parameters: entity values grouped by entity type, in
/// first-seen order, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationFilters(BTreeMap<String, Vec<String>>);

impl AggregationFilters {
    pub fn from_entities(entities: &[Entity]) -> Self {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entity in entities {
            let values = grouped.entry(entity.entity_type.clone()).or_default();
            if !values.contains(&entity.value) {
                values.push(entity.value.clone());
            }
        }
        Self(grouped)
    }

    pub fn values(&self, entity_type: &str) -> &[String] {
        self.0.get(entity_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has(&self, entity_type: &str) -> bool {
        !self.values(entity_type).is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Why a single source could not contribute.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Http(#[from] RetryError<HttpError>),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SourceError::Http(err) if err.is_timeout())
    }
}

/// One backing source the aggregator can fan out to.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the filters carry anything this source can query by.
    fn is_applicable(&self, filters: &AggregationFilters) -> bool;

    /// Query the source. An empty map means "nothing found".
    async fn fetch(
        &self,
        filters: &AggregationFilters,
        deadline: Instant,
    ) -> Result<Map<String, Value>, SourceError>;
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("source {source_name} failed: {error}")]
    SourceFailed {
        source_name: String,
        error: SourceError,
    },

    #[error("source {source_name} did not answer before the deadline")]
    Timeout { source_name: String },

    #[error("aggregation task failed: {0}")]
    Internal(String),
}

impl From<AggregationError> for StandardError {
    fn from(err: AggregationError) -> Self {
        let message = err.to_string();
        match err {
            AggregationError::SourceFailed { source_name, .. } => {
                StandardError::new(ErrorCode::AggregationFailed, message)
                    .with_details(serde_json::json!({ "source": source_name }))
            }
            AggregationError::Timeout { source_name } => StandardError::timeout(message)
                .with_details(serde_json::json!({ "source": source_name })),
            AggregationError::Internal(_) => StandardError::internal(message),
        }
    }
}

/// What the cache holds for one entity list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub data: Map<String, Value>,
    /// Sources that were queried and contributed to `data`.
    pub contributed: Vec<String>,
    /// Requested sources that were not queried (unregistered or not
    /// applicable to these entities).
    pub skipped: Vec<String>,
}

impl CacheRecord {
    /// Whether this record answers a request for `requested` sources.
    fn covers(&self, requested: &[String]) -> bool {
        requested
            .iter()
            .all(|s| self.contributed.contains(s) || self.skipped.contains(s))
    }
}

/// Merged result of one aggregation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub data: Map<String, Value>,
    pub contributed: Vec<String>,
    pub skipped: Vec<String>,
    /// Served from the cache without querying any source.
    pub cached: bool,
}

/// Cache-aside fan-out over a fixed set of sources.
pub struct Aggregator {
    cache: Arc<dyn CacheStore>,
    sources: Vec<Arc<dyn DataSource>>,
    namespace: String,
    ttl: Duration,
}

impl Aggregator {
    pub fn new(cache: Arc<dyn CacheStore>, namespace: impl Into<String>, ttl: Duration) -> Self {
        Self {
            cache,
            sources: Vec::new(),
            namespace: namespace.into(),
            ttl,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Cache key for an ordered entity list: `ns:type:value|type:value`.
    /// Reordering the entities changes the key.
    pub fn cache_key(&self, entities: &[Entity]) -> String {
        let pairs: Vec<String> = entities
            .iter()
            .map(|e| format!("{}:{}", e.entity_type, e.value))
            .collect();
        format!("{}:{}", self.namespace, pairs.join(KEY_SEPARATOR))
    }

    pub async fn aggregate(
        &self,
        entities: &[Entity],
        requested: &[String],
        deadline: Instant,
    ) -> Result<AggregationResult, AggregationError> {
        if entities.is_empty() || requested.is_empty() {
            debug!("nothing to aggregate");
            return Ok(AggregationResult::default());
        }

        let key = self.cache_key(entities);
        if let Some(record) = self.lookup(&key, requested).await {
            debug!(key = %key, "aggregation cache hit");
            return Ok(AggregationResult {
                data: record.data,
                contributed: record.contributed,
                skipped: record.skipped,
                cached: true,
            });
        }

        let filters = Arc::new(AggregationFilters::from_entities(entities));
        let mut selected: Vec<Arc<dyn DataSource>> = Vec::new();
        let mut skipped = Vec::new();
        let mut seen = BTreeSet::new();
        for name in requested {
            if !seen.insert(name.as_str()) {
                continue;
            }
            match self.sources.iter().find(|s| s.name() == name) {
                Some(source) if source.is_applicable(&filters) => selected.push(source.clone()),
                Some(_) => skipped.push(name.clone()),
                None => {
                    warn!(source = %name, "requested source is not configured, skipping");
                    skipped.push(name.clone());
                }
            }
        }

        let parts = fan_out(&selected, filters, deadline).await?;

        let mut data = Map::new();
        for part in parts {
            data.extend(part);
        }
        let contributed: Vec<String> = selected.iter().map(|s| s.name().to_string()).collect();

        let record = CacheRecord {
            data,
            contributed,
            skipped,
        };
        if !record.data.is_empty() {
            self.store(&key, &record).await;
        }

        info!(
            key = %key,
            sources = record.contributed.len(),
            keys = record.data.len(),
            "aggregation complete"
        );
        Ok(AggregationResult {
            data: record.data,
            contributed: record.contributed,
            skipped: record.skipped,
            cached: false,
        })
    }

    async fn lookup(&self, key: &str, requested: &[String]) -> Option<CacheRecord> {
        let bytes = match self.cache.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_slice::<CacheRecord>(&bytes) {
            Ok(record) if record.covers(requested) => Some(record),
            Ok(_) => {
                debug!(key, "cached record does not cover requested sources");
                None
            }
            Err(e) => {
                warn!(key, error = %e, "undecodable cache record, treating as miss");
                None
            }
        }
    }

    async fn store(&self, key: &str, record: &CacheRecord) {
        let bytes = match serde_json::to_vec(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "failed to encode cache record");
                return;
            }
        };
        if let Err(e) = self.cache.set(key, bytes, self.ttl).await {
            warn!(key, error = %e, "cache write failed");
        }
    }
}

/// Query every source concurrently; contributions come back in source order.
async fn fan_out(
    sources: &[Arc<dyn DataSource>],
    filters: Arc<AggregationFilters>,
    deadline: Instant,
) -> Result<Vec<Map<String, Value>>, AggregationError> {
    let mut tasks = JoinSet::new();
    for (idx, source) in sources.iter().enumerate() {
        let source = source.clone();
        let filters = filters.clone();
        tasks.spawn(async move {
            let result = timeout_at(deadline, source.fetch(&filters, deadline)).await;
            (idx, result)
        });
    }

    let mut parts: Vec<Option<Map<String, Value>>> = vec![None; sources.len()];
    while let Some(joined) = tasks.join_next().await {
        let failure = match joined {
            Ok((idx, Ok(Ok(part)))) => {
                parts[idx] = Some(part);
                continue;
            }
            Ok((idx, Ok(Err(error)))) => {
                let source_name = sources[idx].name().to_string();
                if error.is_timeout() {
                    AggregationError::Timeout { source_name }
                } else {
                    AggregationError::SourceFailed { source_name, error }
                }
            }
            Ok((idx, Err(_elapsed))) => AggregationError::Timeout {
                source_name: sources[idx].name().to_string(),
            },
            Err(join_err) => AggregationError::Internal(join_err.to_string()),
        };

        // Fail fast: cancel siblings and wait for them before returning so
        // nothing is still running once the caller moves on.
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        warn!(error = %failure, "aggregation aborted");
        return Err(failure);
    }

    Ok(parts.into_iter().flatten().collect())
}
