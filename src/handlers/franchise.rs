use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::aggregation::{Aggregator, Entity, KNOWN_SOURCES};
use crate::error::{JobError, StandardError};
use crate::handler::{HandlerSettings, TaskHandler};
use crate::state_machine::ExecutionContext;

pub(super) const TASK_TYPE: &str = "aggregate-franchise-data";

const MAX_ENTITIES: usize = 20;
const MAX_FIELD_LEN: usize = 256;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FranchiseInput {
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Aggregates franchise data for extracted entities across the configured
/// sources.
pub struct FranchiseDataHandler {
    aggregator: Arc<Aggregator>,
    settings: HandlerSettings,
}

impl FranchiseDataHandler {
    pub fn new(aggregator: Arc<Aggregator>, settings: HandlerSettings) -> Self {
        Self {
            aggregator,
            settings,
        }
    }
}

#[async_trait]
impl TaskHandler for FranchiseDataHandler {
    type Input = FranchiseInput;

    fn task_type(&self) -> &str {
        TASK_TYPE
    }

    fn settings(&self) -> HandlerSettings {
        self.settings
    }

    fn validate(&self, input: &FranchiseInput) -> Result<(), StandardError> {
        if input.entities.len() > MAX_ENTITIES {
            return Err(StandardError::validation(format!(
                "at most {MAX_ENTITIES} entities are allowed, got {}",
                input.entities.len()
            )));
        }

        for (idx, entity) in input.entities.iter().enumerate() {
            for (field, value) in [("type", &entity.entity_type), ("value", &entity.value)] {
                if value.trim().is_empty() {
                    return Err(StandardError::validation(format!(
                        "entities[{idx}].{field} must not be empty"
                    )));
                }
                if value.chars().count() > MAX_FIELD_LEN {
                    return Err(StandardError::validation(format!(
                        "entities[{idx}].{field} exceeds {MAX_FIELD_LEN} characters"
                    )));
                }
            }
        }

        let mut seen = BTreeSet::new();
        for source in &input.sources {
            if !KNOWN_SOURCES.contains(&source.as_str()) {
                return Err(StandardError::validation(format!("unknown source: {source}"))
                    .with_details(json!({ "known_sources": KNOWN_SOURCES })));
            }
            if !seen.insert(source.as_str()) {
                return Err(StandardError::validation(format!(
                    "source listed more than once: {source}"
                )));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext, input: FranchiseInput) -> Result<Value, JobError> {
        let result = self
            .aggregator
            .aggregate(&input.entities, &input.sources, ctx.deadline)
            .await
            .map_err(StandardError::from)?;

        if !input.sources.is_empty() && result.data.is_empty() {
            debug!(entities = input.entities.len(), "no source returned franchise data");
            return Err(JobError::business(
                "FRANCHISE_NOT_FOUND",
                "no franchise data found for the given entities",
            ));
        }

        Ok(json!({
            "data": result.data,
            "contributed": result.contributed,
            "skipped": result.skipped,
            "cached": result.cached,
        }))
    }
}
