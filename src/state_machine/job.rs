use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use uuid::Uuid;

use super::state::State;
use crate::error::{ErrorCode, StandardError};

/// One job as delivered by the orchestrator.
///
/// `payload` is the serialized, still-opaque key→value map; handlers decode
/// it into their own typed input during the parsing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    pub task_type: String,
    pub payload: String,
    pub deadline: DateTime<Utc>,
    pub remaining_retries: u32,
}

/// Longest execution window a job may ask for.
pub const MAX_JOB_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// `now + after` on the monotonic clock; saturates far in the future instead
/// of overflowing.
pub(crate) fn instant_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after)
        .or_else(|| now.checked_add(MAX_JOB_TIMEOUT))
        .unwrap_or(now)
}

impl JobEnvelope {
    /// Build an envelope with a fresh id and a deadline `timeout` from now.
    /// Timeouts above [`MAX_JOB_TIMEOUT`] are clamped to it.
    pub fn new(task_type: impl Into<String>, payload: &Map<String, Value>, timeout: Duration) -> Self {
        let now = Utc::now();
        let deadline = chrono::Duration::from_std(timeout.min(MAX_JOB_TIMEOUT))
            .ok()
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload: Value::Object(payload.clone()).to_string(),
            deadline,
            remaining_retries: 3,
        }
    }

    pub fn with_remaining_retries(mut self, remaining: u32) -> Self {
        self.remaining_retries = remaining;
        self
    }

    /// The wall-clock deadline as a monotonic instant; already-past
    /// deadlines map to "now".
    pub fn deadline_instant(&self) -> Instant {
        let remaining = (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        instant_after(remaining)
    }
}

/// Per-execution context handed to a handler's `execute`.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: String,
    pub task_type: String,
    pub deadline: Instant,
    pub remaining_retries: u32,
}

impl ExecutionContext {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Error to return when work is abandoned because the deadline passed.
    pub fn deadline_exceeded(&self) -> StandardError {
        StandardError::timeout(format!("job {} exceeded its deadline", self.job_id))
    }
}

/// The single terminal result of one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success { output: Value },
    Failure(StandardError),
    BusinessError { code: String, message: String },
}

impl ExecutionOutcome {
    /// Stable label for logs and reports: `COMPLETED`, an error code, or the
    /// business error code.
    pub fn label(&self) -> String {
        match self {
            ExecutionOutcome::Success { .. } => "COMPLETED".to_string(),
            ExecutionOutcome::Failure(err) => err.code.to_string(),
            ExecutionOutcome::BusinessError { code, .. } => code.clone(),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ExecutionOutcome::Failure(err) => Some(err.code),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }
}

/// Lifecycle bookkeeping for one envelope.
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub job_id: String,
    pub task_type: String,
    pub state: State,
    pub state_history: Vec<State>,
    pub started_at: DateTime<Utc>,
}

impl JobExecution {
    pub fn new(envelope: &JobEnvelope) -> Self {
        Self {
            job_id: envelope.id.clone(),
            task_type: envelope.task_type.clone(),
            state: State::Received,
            state_history: Vec::new(),
            started_at: Utc::now(),
        }
    }
}

/// Summary produced once a job reaches `Terminal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub job_id: String,
    pub task_type: String,
    pub state_transitions: Vec<State>,
    pub outcome: String,
    pub reported_retries: u32,
    /// Whether the orchestrator accepted the outcome command.
    pub delivered: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl ExecutionReport {
    pub fn from_execution(
        execution: &JobExecution,
        outcome: &ExecutionOutcome,
        reported_retries: u32,
        delivered: bool,
    ) -> Self {
        let now = Utc::now();
        let mut transitions = execution.state_history.clone();
        transitions.push(execution.state);

        Self {
            job_id: execution.job_id.clone(),
            task_type: execution.task_type.clone(),
            state_transitions: transitions,
            outcome: outcome.label(),
            reported_retries,
            delivered,
            started_at: execution.started_at,
            completed_at: now,
            duration_ms: (now - execution.started_at).num_milliseconds(),
        }
    }
}
