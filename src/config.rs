//! Worker configuration loaded from `jobworker.toml`.
//!
//! [`WorkerConfig`] holds worker-wide settings plus one [`HandlerConfig`]
//! table per task type. Missing values use defaults; unknown keys are
//! rejected. `JOBWORKER_API_KEY` fills in any handler `api_key` left empty.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MAX_RETRY_BUDGET, WorkerError};
use crate::handler::HandlerSettings;
use crate::handlers::KNOWN_TASK_TYPES;
use crate::retry::RetryPolicy;
use crate::state_machine::MAX_JOB_TIMEOUT;
use crate::worker::DEFAULT_MAX_JOBS_ACTIVE;

pub const DEFAULT_CONFIG_FILE: &str = "jobworker.toml";
pub const API_KEY_ENV: &str = "JOBWORKER_API_KEY";

/// Hard ceiling on in-call retries for one outbound dependency.
const MAX_RETRIES_LIMIT: u32 = 10;

/// Longest time an aggregation result may stay cached (30 days).
const MAX_CACHE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

const REDACTED: &str = "<redacted>";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    #[serde(default)]
    pub worker: WorkerSection,

    /// Per task type options, keyed by task type.
    #[serde(default)]
    pub handlers: BTreeMap<String, HandlerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSection {
    /// Jobs of one task type allowed to run at the same time.
    #[serde(default = "default_max_jobs_active")]
    pub max_jobs_active: usize,

    /// Prefix for every aggregation cache key.
    #[serde(default = "default_cache_namespace")]
    pub cache_namespace: String,
}

fn default_max_jobs_active() -> usize {
    DEFAULT_MAX_JOBS_ACTIVE
}

fn default_cache_namespace() -> String {
    "franchise".to_string()
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            max_jobs_active: default_max_jobs_active(),
            cache_namespace: default_cache_namespace(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retries of one outbound call within a single execution.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Redeliveries requested from the orchestrator on retryable failures.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Named outbound endpoints, e.g. `external_api` or `records`.
    #[serde(default)]
    pub endpoint_urls: BTreeMap<String, String>,

    #[serde(default)]
    pub api_key: String,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_retry_budget() -> u32 {
    2
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_max_results() -> usize {
    25
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            retry_budget: default_retry_budget(),
            cache_ttl_secs: default_cache_ttl_secs(),
            max_results: default_max_results(),
            endpoint_urls: BTreeMap::new(),
            api_key: String::new(),
        }
    }
}

impl HandlerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.base_delay_ms)
    }

    pub fn settings(&self) -> HandlerSettings {
        HandlerSettings {
            timeout: self.timeout(),
            retry_budget: self.retry_budget,
        }
    }

    pub fn endpoint(&self, name: &str) -> Option<&str> {
        self.endpoint_urls.get(name).map(String::as_str)
    }

    /// The API key, or `None` when unset.
    pub fn api_key(&self) -> Option<String> {
        Some(self.api_key.clone()).filter(|k| !k.is_empty())
    }
}

impl WorkerConfig {
    /// Load from `path`; a missing file yields defaults. The env key is
    /// applied and the result validated.
    pub fn load_from(path: &Path) -> Result<Self, WorkerError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<WorkerConfig>(&contents)?
        } else {
            Self::default()
        };

        config.apply_api_key(std::env::var(API_KEY_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// Environment key takes precedence over an empty `api_key`.
    pub fn apply_api_key(&mut self, key: Option<String>) {
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            return;
        };
        for handler in self.handlers.values_mut() {
            if handler.api_key.is_empty() {
                handler.api_key = key.clone();
            }
        }
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.worker.max_jobs_active == 0 {
            return Err(WorkerError::Config(
                "worker.max_jobs_active must be at least 1".into(),
            ));
        }
        for (task_type, handler) in &self.handlers {
            if !KNOWN_TASK_TYPES.contains(&task_type.as_str()) {
                return Err(WorkerError::Config(format!(
                    "unknown handler table: handlers.{task_type}"
                )));
            }
            if handler.retry_budget > MAX_RETRY_BUDGET {
                return Err(WorkerError::Config(format!(
                    "handlers.{task_type}.retry_budget must be at most {MAX_RETRY_BUDGET}"
                )));
            }
            if handler.max_retries > MAX_RETRIES_LIMIT {
                return Err(WorkerError::Config(format!(
                    "handlers.{task_type}.max_retries must be at most {MAX_RETRIES_LIMIT}"
                )));
            }
            if handler.timeout_ms == 0 || handler.timeout() > MAX_JOB_TIMEOUT {
                return Err(WorkerError::Config(format!(
                    "handlers.{task_type}.timeout_ms must be between 1 and {}",
                    MAX_JOB_TIMEOUT.as_millis()
                )));
            }
            if handler.cache_ttl_secs > MAX_CACHE_TTL_SECS {
                return Err(WorkerError::Config(format!(
                    "handlers.{task_type}.cache_ttl_secs must be at most {MAX_CACHE_TTL_SECS}"
                )));
            }
        }
        Ok(())
    }

    /// A copy safe to print: every non-empty `api_key` is masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for handler in config.handlers.values_mut() {
            if !handler.api_key.is_empty() {
                handler.api_key = REDACTED.to_string();
            }
        }
        config
    }

    /// Options for `task_type`, falling back to defaults.
    pub fn handler(&self, task_type: &str) -> HandlerConfig {
        self.handlers.get(task_type).cloned().unwrap_or_default()
    }
}
