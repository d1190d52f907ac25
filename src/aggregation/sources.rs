use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tracing::debug;

use super::{AggregationFilters, DataSource, EXTERNAL_API, INTERNAL_DB, SEARCH, SourceError};
use crate::http::{HttpTransport, send_with_retry};
use crate::retry::RetryPolicy;
use crate::stores::{RelationalStore, SearchIndex, SearchQuery};

const FRANCHISE_NAME: &str = "franchise_name";
const LOCATION: &str = "location";

/// Franchise records from the relational store, keyed by name.
pub struct RelationalSource {
    store: Arc<dyn RelationalStore>,
}

impl RelationalSource {
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self { store }
    }

    fn query_for(names: &[String]) -> String {
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("${i}")).collect();
        format!(
            "SELECT id, name, owner, location, status FROM franchises WHERE name IN ({}) ORDER BY name",
            placeholders.join(", ")
        )
    }
}

#[async_trait]
impl DataSource for RelationalSource {
    fn name(&self) -> &str {
        INTERNAL_DB
    }

    fn is_applicable(&self, filters: &AggregationFilters) -> bool {
        filters.has(FRANCHISE_NAME)
    }

    async fn fetch(
        &self,
        filters: &AggregationFilters,
        _deadline: Instant,
    ) -> Result<Map<String, Value>, SourceError> {
        let names = filters.values(FRANCHISE_NAME);
        let params: Vec<Value> = names.iter().map(|n| Value::String(n.clone())).collect();
        let rows = self.store.query(&Self::query_for(names), &params).await?;
        debug!(rows = rows.len(), "relational source answered");

        let mut part = Map::new();
        if !rows.is_empty() {
            let rows = rows.into_iter().map(Value::Object).collect();
            part.insert("franchises".into(), Value::Array(rows));
        }
        Ok(part)
    }
}

/// Ranked documents from the search index, filtered by name and location.
pub struct SearchSource {
    index: Arc<dyn SearchIndex>,
    index_name: String,
    max_results: usize,
}

impl SearchSource {
    pub fn new(index: Arc<dyn SearchIndex>, index_name: impl Into<String>, max_results: usize) -> Self {
        Self {
            index,
            index_name: index_name.into(),
            max_results,
        }
    }
}

#[async_trait]
impl DataSource for SearchSource {
    fn name(&self) -> &str {
        SEARCH
    }

    fn is_applicable(&self, filters: &AggregationFilters) -> bool {
        filters.has(FRANCHISE_NAME) || filters.has(LOCATION)
    }

    async fn fetch(
        &self,
        filters: &AggregationFilters,
        _deadline: Instant,
    ) -> Result<Map<String, Value>, SourceError> {
        let mut query = SearchQuery {
            index: self.index_name.clone(),
            filters: Default::default(),
            limit: self.max_results,
        };
        for (field, entity_type) in [("name", FRANCHISE_NAME), ("location", LOCATION)] {
            let values = filters.values(entity_type);
            if !values.is_empty() {
                query.filters.insert(field.to_string(), values.to_vec());
            }
        }

        let documents = self.index.search(&query).await?;
        debug!(hits = documents.len(), "search source answered");

        let mut part = Map::new();
        if !documents.is_empty() {
            let hits =
                serde_json::to_value(&documents).map_err(|e| SourceError::Decode(e.to_string()))?;
            part.insert("search_results".into(), hits);
        }
        Ok(part)
    }
}

/// Partner profiles from a third-party HTTP API, with bounded retry.
pub struct ExternalApiSource {
    transport: Arc<dyn HttpTransport>,
    endpoint: String,
    policy: RetryPolicy,
}

impl ExternalApiSource {
    pub fn new(transport: Arc<dyn HttpTransport>, endpoint: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            policy,
        }
    }
}

#[async_trait]
impl DataSource for ExternalApiSource {
    fn name(&self) -> &str {
        EXTERNAL_API
    }

    fn is_applicable(&self, filters: &AggregationFilters) -> bool {
        filters.has(FRANCHISE_NAME)
    }

    async fn fetch(
        &self,
        filters: &AggregationFilters,
        deadline: Instant,
    ) -> Result<Map<String, Value>, SourceError> {
        let body = json!({
            "names": filters.values(FRANCHISE_NAME),
            "locations": filters.values(LOCATION),
        });
        let response = send_with_retry(
            self.transport.as_ref(),
            &self.policy,
            Method::POST,
            &self.endpoint,
            Some(&body),
            deadline,
        )
        .await?;

        let profiles = response
            .json()
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        let mut part = Map::new();
        match profiles {
            Value::Null => {}
            Value::Array(items) if items.is_empty() => {}
            other => {
                part.insert("external_profiles".into(), other);
            }
        }
        Ok(part)
    }
}
