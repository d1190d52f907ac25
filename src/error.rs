//! Error taxonomy shared by every task handler.
//!
//! [`ErrorCode`] is the fixed, orchestrator-visible set of failure kinds and
//! [`StandardError`] is the only error shape that leaves a job. Retryability
//! is a property of the code, so callers never choose it per call.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Upper bound on the redelivery budget reported to the orchestrator.
pub const MAX_RETRY_BUDGET: u32 = 3;

/// Process-level failures: configuration, IO and adapter plumbing.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("No handler registered for task type: {0}")]
    UnknownTaskType(String),

    #[error("Adapter error: {0}")]
    Adapter(#[from] crate::adapter::AdapterError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Machine-readable failure kinds reported to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Payload could not be decoded.
    InputParsingFailed,
    /// Decoded input violates required shape or bounds.
    ValidationFailed,
    /// Job or outbound-call deadline exceeded.
    Timeout,
    /// Outbound call exhausted its retries.
    UpstreamFailure,
    /// A backing source failed during fan-out.
    AggregationFailed,
    /// Invariant violation or unexpected condition.
    InternalError,
}

impl ErrorCode {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::UpstreamFailure | ErrorCode::AggregationFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InputParsingFailed => "INPUT_PARSING_FAILED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::UpstreamFailure => "UPSTREAM_FAILURE",
            ErrorCode::AggregationFailed => "AGGREGATION_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structured error carried by every failed job outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct StandardError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub details: Value,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
}

impl StandardError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Value::Null,
            retryable: code.is_retryable(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InputParsingFailed, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Redelivery budget for this error under a handler's policy.
    ///
    /// Non-retryable errors always get 0. Retryable errors get the handler's
    /// budget, bounded by what the orchestrator has left and by
    /// [`MAX_RETRY_BUDGET`].
    pub fn retry_budget(&self, policy_budget: u32, remaining_retries: u32) -> u32 {
        if !self.retryable {
            return 0;
        }
        policy_budget
            .min(remaining_retries.saturating_sub(1))
            .min(MAX_RETRY_BUDGET)
    }
}

/// Classifies how a job failure is routed back to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Routed through the workflow's error boundary (`throw_business_error`).
    Business,
    /// Generic failure with a retry budget (`fail`).
    System,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Business => write!(f, "Business"),
            FailureKind::System => write!(f, "System"),
        }
    }
}

/// Error returned from a handler's `execute`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    /// A taxonomy error; reported with `fail` and a derived retry budget.
    #[error(transparent)]
    Failed(#[from] StandardError),

    /// A domain outcome the workflow models explicitly.
    #[error("business error {code}: {message}")]
    Business { code: String, message: String },
}

impl JobError {
    pub fn business(code: impl Into<String>, message: impl Into<String>) -> Self {
        JobError::Business {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Failed(_) => FailureKind::System,
            JobError::Business { .. } => FailureKind::Business,
        }
    }
}
