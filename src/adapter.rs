//! Boundary to the workflow orchestrator.
//!
//! The orchestrator delivers [`JobEnvelope`]s and accepts exactly one outcome
//! command per job. [`OrchestratorAdapter`] is that command surface;
//! [`RecordingAdapter`] keeps outcomes in memory and [`StdoutAdapter`] prints
//! them as JSON lines for local runs.

use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, stdout};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::state_machine::{JobEnvelope, MAX_JOB_TIMEOUT};

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The orchestrator refused the command (unknown job, lease lost).
    #[error("orchestrator rejected command for job {job_id}: {message}")]
    Rejected { job_id: String, message: String },

    #[error("adapter transport error: {0}")]
    Transport(String),

    #[error("adapter IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome commands a task handler may issue, once per job.
#[async_trait]
pub trait OrchestratorAdapter: Send + Sync {
    async fn complete(&self, job_id: &str, output: &str) -> Result<(), AdapterError>;

    async fn fail(
        &self,
        job_id: &str,
        code: &str,
        message: &str,
        retries: u32,
    ) -> Result<(), AdapterError>;

    async fn throw_business_error(
        &self,
        job_id: &str,
        code: &str,
        message: &str,
    ) -> Result<(), AdapterError>;
}

/// An outcome command as received by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ReportedOutcome {
    Complete {
        job_id: String,
        output: Value,
    },
    Fail {
        job_id: String,
        code: String,
        message: String,
        retries: u32,
    },
    ThrowBusinessError {
        job_id: String,
        code: String,
        message: String,
    },
}

impl ReportedOutcome {
    fn complete(job_id: &str, output: &str) -> Self {
        let output = serde_json::from_str(output).unwrap_or_else(|_| Value::String(output.into()));
        ReportedOutcome::Complete {
            job_id: job_id.to_string(),
            output,
        }
    }

    fn fail(job_id: &str, code: &str, message: &str, retries: u32) -> Self {
        ReportedOutcome::Fail {
            job_id: job_id.to_string(),
            code: code.to_string(),
            message: message.to_string(),
            retries,
        }
    }

    fn business(job_id: &str, code: &str, message: &str) -> Self {
        ReportedOutcome::ThrowBusinessError {
            job_id: job_id.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            ReportedOutcome::Complete { job_id, .. }
            | ReportedOutcome::Fail { job_id, .. }
            | ReportedOutcome::ThrowBusinessError { job_id, .. } => job_id,
        }
    }
}

/// Keeps every outcome command in memory, in arrival order.
#[derive(Default)]
pub struct RecordingAdapter {
    outcomes: Mutex<Vec<ReportedOutcome>>,
    reject: bool,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// An adapter that records every command but answers with `Rejected`.
    pub fn rejecting() -> Self {
        Self {
            outcomes: Mutex::default(),
            reject: true,
        }
    }

    pub fn outcomes(&self) -> Vec<ReportedOutcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn outcomes_for(&self, job_id: &str) -> Vec<ReportedOutcome> {
        self.outcomes()
            .into_iter()
            .filter(|o| o.job_id() == job_id)
            .collect()
    }

    fn record(&self, outcome: ReportedOutcome) -> Result<(), AdapterError> {
        let job_id = outcome.job_id().to_string();
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome);
        if self.reject {
            return Err(AdapterError::Rejected {
                job_id,
                message: "job is not activated".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OrchestratorAdapter for RecordingAdapter {
    async fn complete(&self, job_id: &str, output: &str) -> Result<(), AdapterError> {
        self.record(ReportedOutcome::complete(job_id, output))
    }

    async fn fail(
        &self,
        job_id: &str,
        code: &str,
        message: &str,
        retries: u32,
    ) -> Result<(), AdapterError> {
        self.record(ReportedOutcome::fail(job_id, code, message, retries))
    }

    async fn throw_business_error(
        &self,
        job_id: &str,
        code: &str,
        message: &str,
    ) -> Result<(), AdapterError> {
        self.record(ReportedOutcome::business(job_id, code, message))
    }
}

/// Writes each outcome command to stdout as one JSON line.
#[derive(Debug, Default)]
pub struct StdoutAdapter;

impl StdoutAdapter {
    async fn emit(&self, outcome: ReportedOutcome) -> Result<(), AdapterError> {
        let mut line = serde_json::to_vec(&outcome)
            .map_err(|e| AdapterError::Transport(e.to_string()))?;
        line.push(b'\n');
        let mut out = stdout();
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl OrchestratorAdapter for StdoutAdapter {
    async fn complete(&self, job_id: &str, output: &str) -> Result<(), AdapterError> {
        self.emit(ReportedOutcome::complete(job_id, output)).await
    }

    async fn fail(
        &self,
        job_id: &str,
        code: &str,
        message: &str,
        retries: u32,
    ) -> Result<(), AdapterError> {
        self.emit(ReportedOutcome::fail(job_id, code, message, retries))
            .await
    }

    async fn throw_business_error(
        &self,
        job_id: &str,
        code: &str,
        message: &str,
    ) -> Result<(), AdapterError> {
        self.emit(ReportedOutcome::business(job_id, code, message))
            .await
    }
}

/// A job as written in a local jobs file; the deadline is relative so the
/// file stays reusable.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueuedJob {
    #[serde(default)]
    pub id: Option<String>,
    pub task_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_remaining_retries")]
    pub remaining_retries: u32,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_remaining_retries() -> u32 {
    3
}

impl QueuedJob {
    /// Fails when `timeout_ms` is zero or above [`MAX_JOB_TIMEOUT`].
    pub fn into_envelope(self) -> Result<JobEnvelope, WorkerError> {
        let timeout = Duration::from_millis(self.timeout_ms);
        if timeout.is_zero() || timeout > MAX_JOB_TIMEOUT {
            return Err(WorkerError::Config(format!(
                "job {}: timeout_ms must be between 1 and {}, got {}",
                self.id.as_deref().unwrap_or(&self.task_type),
                MAX_JOB_TIMEOUT.as_millis(),
                self.timeout_ms
            )));
        }

        let mut envelope = JobEnvelope::new(self.task_type, &self.payload, timeout)
            .with_remaining_retries(self.remaining_retries);
        envelope.id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(envelope)
    }
}

/// Read a JSON array of [`QueuedJob`]s and turn them into envelopes.
pub fn load_jobs(path: &Path) -> Result<Vec<JobEnvelope>, WorkerError> {
    let contents = std::fs::read_to_string(path)?;
    let jobs: Vec<QueuedJob> = serde_json::from_str(&contents)?;
    jobs.into_iter().map(QueuedJob::into_envelope).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn recording_adapter_keeps_commands_in_order() {
        let adapter = RecordingAdapter::new();
        adapter.complete("a", r#"{"ok":true}"#).await.unwrap();
        adapter.fail("b", "TIMEOUT", "slow", 2).await.unwrap();
        adapter
            .throw_business_error("c", "FRANCHISE_NOT_FOUND", "none")
            .await
            .unwrap();

        let outcomes = adapter.outcomes();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            outcomes[0],
            ReportedOutcome::Complete {
                job_id: "a".into(),
                output: serde_json::json!({"ok": true})
            }
        );
        assert_eq!(adapter.outcomes_for("b").len(), 1);
        assert_eq!(outcomes[2].job_id(), "c");
    }

    #[tokio::test]
    async fn rejecting_adapter_still_records() {
        let adapter = RecordingAdapter::rejecting();
        let err = adapter.complete("a", "{}").await.unwrap_err();
        assert!(matches!(err, AdapterError::Rejected { .. }));
        assert_eq!(adapter.outcomes().len(), 1);
    }

    #[test]
    fn reported_outcome_serializes_with_command_tag() {
        let outcome = ReportedOutcome::fail("j1", "TIMEOUT", "slow", 1);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["command"], "fail");
        assert_eq!(json["retries"], 1);
    }

    #[test]
    fn load_jobs_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "job-1", "task_type": "fetch-external-record", "payload": {{"resource_id": "r1"}}}},
                {{"task_type": "aggregate-franchise-data", "timeout_ms": 500, "remaining_retries": 1}}
            ]"#
        )
        .unwrap();

        let envelopes = load_jobs(file.path()).unwrap();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].id, "job-1");
        assert_eq!(envelopes[0].remaining_retries, 3);
        assert_eq!(envelopes[1].remaining_retries, 1);
        assert!(!envelopes[1].id.is_empty());
    }

    #[test]
    fn load_jobs_rejects_out_of_range_timeouts() {
        for timeout_ms in ["0", "9000000000000000000", "18446744073709551615"] {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            write!(file, r#"[{{"task_type": "x", "timeout_ms": {timeout_ms}}}]"#).unwrap();
            assert!(
                matches!(load_jobs(file.path()), Err(WorkerError::Config(_))),
                "timeout_ms = {timeout_ms}"
            );
        }
    }

    #[test]
    fn longest_allowed_timeout_keeps_its_deadline() {
        let job = QueuedJob {
            id: None,
            task_type: "x".into(),
            payload: Map::new(),
            timeout_ms: MAX_JOB_TIMEOUT.as_millis() as u64,
            remaining_retries: 3,
        };
        let envelope = job.into_envelope().unwrap();
        let window = envelope.deadline - chrono::Utc::now();
        assert!(window > chrono::Duration::days(6));
    }

    #[test]
    fn load_jobs_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"task_type": "x", "priority": 5}}]"#).unwrap();
        assert!(matches!(load_jobs(file.path()), Err(WorkerError::Json(_))));
    }
}
