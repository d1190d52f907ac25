//! Task handler contract and the per-job lifecycle driver.
//!
//! [`process_job`] takes one envelope through parse → validate → execute →
//! report. Reporting goes through an [`OutcomeReporter`], which is consumed
//! by its only method, so every envelope produces exactly one outcome
//! command.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::timeout_at;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::adapter::{AdapterError, OrchestratorAdapter};
use crate::error::{ErrorCode, JobError, StandardError};
use crate::state_machine::{
    ExecutionContext, ExecutionOutcome, ExecutionReport, JobEnvelope, JobExecution,
    LifecycleError, StateMachine, Step, instant_after,
};

/// Execution limits a handler applies to every job it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerSettings {
    /// Upper bound on a single execution; the envelope deadline may be sooner.
    pub timeout: Duration,
    /// Redelivery budget requested for retryable failures.
    pub retry_budget: u32,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_budget: 2,
        }
    }
}

/// Business logic for one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Typed view of the job payload.
    type Input: DeserializeOwned + Send + 'static;

    fn task_type(&self) -> &str;

    fn settings(&self) -> HandlerSettings;

    /// Structural and semantic checks on decoded input.
    fn validate(&self, input: &Self::Input) -> Result<(), StandardError>;

    /// Run the job. Outbound calls must observe `ctx.deadline`.
    async fn execute(&self, ctx: &ExecutionContext, input: Self::Input) -> Result<Value, JobError>;
}

/// Single-use handle for reporting a job's outcome.
pub struct OutcomeReporter<'a> {
    adapter: &'a dyn OrchestratorAdapter,
    job_id: String,
    remaining_retries: u32,
    retry_budget: u32,
}

impl<'a> OutcomeReporter<'a> {
    pub fn new(adapter: &'a dyn OrchestratorAdapter, envelope: &JobEnvelope, retry_budget: u32) -> Self {
        Self {
            adapter,
            job_id: envelope.id.clone(),
            remaining_retries: envelope.remaining_retries,
            retry_budget,
        }
    }

    /// Issue the one outcome command for this job. Returns the retry budget
    /// that was reported (0 for anything but a retryable failure).
    pub async fn report(self, outcome: &ExecutionOutcome) -> (u32, Result<(), AdapterError>) {
        match outcome {
            ExecutionOutcome::Success { output } => {
                let result = self.adapter.complete(&self.job_id, &output.to_string()).await;
                (0, result)
            }
            ExecutionOutcome::Failure(err) => {
                let retries = err.retry_budget(self.retry_budget, self.remaining_retries);
                let result = self
                    .adapter
                    .fail(&self.job_id, err.code.as_str(), &err.message, retries)
                    .await;
                (retries, result)
            }
            ExecutionOutcome::BusinessError { code, message } => {
                let result = self
                    .adapter
                    .throw_business_error(&self.job_id, code, message)
                    .await;
                (0, result)
            }
        }
    }
}

/// Drive one envelope from RECEIVED to TERMINAL.
pub async fn process_job<H: TaskHandler>(
    handler: Arc<H>,
    envelope: JobEnvelope,
    adapter: &dyn OrchestratorAdapter,
) -> ExecutionReport {
    let span = info_span!("job", job_id = %envelope.id, task_type = %envelope.task_type);
    async move {
        let settings = handler.settings();
        let mut execution = JobExecution::new(&envelope);

        let outcome = match run_steps(handler, &envelope, &mut execution, settings).await {
            Ok(outcome) => outcome,
            Err(err) => ExecutionOutcome::Failure(err.into()),
        };

        finish(execution, envelope, outcome, settings.retry_budget, adapter).await
    }
    .instrument(span)
    .await
}

/// Report a job that never reached a handler (for example an unknown task
/// type) so it still gets its single outcome.
pub async fn reject_job(
    envelope: JobEnvelope,
    err: StandardError,
    adapter: &dyn OrchestratorAdapter,
) -> ExecutionReport {
    let span = info_span!("job", job_id = %envelope.id, task_type = %envelope.task_type);
    async move {
        let mut execution = JobExecution::new(&envelope);
        let outcome = match StateMachine::next(&mut execution, Step::Failed) {
            Ok(_) => ExecutionOutcome::Failure(err),
            Err(lifecycle) => ExecutionOutcome::Failure(lifecycle.into()),
        };
        finish(execution, envelope, outcome, 0, adapter).await
    }
    .instrument(span)
    .await
}

async fn run_steps<H: TaskHandler>(
    handler: Arc<H>,
    envelope: &JobEnvelope,
    execution: &mut JobExecution,
    settings: HandlerSettings,
) -> Result<ExecutionOutcome, LifecycleError> {
    // RECEIVED → PARSING
    StateMachine::next(execution, Step::Succeeded)?;

    let input: H::Input = match serde_json::from_str(&envelope.payload) {
        Ok(input) => input,
        Err(e) => {
            StateMachine::next(execution, Step::Failed)?;
            return Ok(ExecutionOutcome::Failure(StandardError::parsing(format!(
                "invalid payload: {e}"
            ))));
        }
    };
    StateMachine::next(execution, Step::Succeeded)?;

    if let Err(err) = handler.validate(&input) {
        StateMachine::next(execution, Step::Failed)?;
        return Ok(ExecutionOutcome::Failure(err));
    }
    StateMachine::next(execution, Step::Succeeded)?;

    let deadline = envelope
        .deadline_instant()
        .min(instant_after(settings.timeout));
    let ctx = ExecutionContext {
        job_id: envelope.id.clone(),
        task_type: envelope.task_type.clone(),
        deadline,
        remaining_retries: envelope.remaining_retries,
    };
    debug!(remaining_ms = ctx.remaining().as_millis() as u64, "executing");

    let outcome = execute_with_deadline(handler, ctx, input).await;
    let step = if outcome.is_success() {
        Step::Succeeded
    } else {
        Step::Failed
    };
    StateMachine::next(execution, step)?;
    Ok(outcome)
}

async fn execute_with_deadline<H: TaskHandler>(
    handler: Arc<H>,
    ctx: ExecutionContext,
    input: H::Input,
) -> ExecutionOutcome {
    let deadline = ctx.deadline;
    let timeout_err = ctx.deadline_exceeded();
    let mut task = tokio::spawn(async move { handler.execute(&ctx, input).await });

    match timeout_at(deadline, &mut task).await {
        Ok(Ok(Ok(output))) => ExecutionOutcome::Success { output },
        Ok(Ok(Err(err))) => {
            debug!(kind = %err.kind(), error = %err, "handler returned an error");
            match err {
                JobError::Failed(err) => ExecutionOutcome::Failure(err),
                JobError::Business { code, message } => {
                    ExecutionOutcome::BusinessError { code, message }
                }
            }
        }
        Ok(Err(join_err)) => {
            ExecutionOutcome::Failure(StandardError::internal(format!("handler aborted: {join_err}")))
        }
        Err(_) => {
            task.abort();
            ExecutionOutcome::Failure(timeout_err)
        }
    }
}

async fn finish(
    mut execution: JobExecution,
    envelope: JobEnvelope,
    outcome: ExecutionOutcome,
    retry_budget: u32,
    adapter: &dyn OrchestratorAdapter,
) -> ExecutionReport {
    log_outcome(&outcome);

    let reporter = OutcomeReporter::new(adapter, &envelope, retry_budget);
    let (retries, delivered) = match reporter.report(&outcome).await {
        (retries, Ok(())) => (retries, true),
        (retries, Err(e)) => {
            error!(error = %e, "failed to report job outcome");
            (retries, false)
        }
    };

    // REPORTING → TERMINAL
    if let Err(e) = StateMachine::next(&mut execution, Step::Succeeded) {
        error!(error = %e, "lifecycle violation after reporting");
    }

    let report = ExecutionReport::from_execution(&execution, &outcome, retries, delivered);
    info!(
        outcome = %report.outcome,
        retries = report.reported_retries,
        duration_ms = report.duration_ms,
        "job finished"
    );
    report
}

fn log_outcome(outcome: &ExecutionOutcome) {
    match outcome {
        ExecutionOutcome::Success { .. } => {}
        ExecutionOutcome::Failure(err) if err.code == ErrorCode::InternalError => {
            error!(code = %err.code, message = %err.message, details = %err.details, "job failed with internal error");
        }
        ExecutionOutcome::Failure(err) => {
            warn!(code = %err.code, message = %err.message, retryable = err.retryable, "job failed");
        }
        ExecutionOutcome::BusinessError { code, message } => {
            info!(code = %code, message = %message, "job raised business error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{RecordingAdapter, ReportedOutcome};
    use crate::state_machine::State;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, Deserialize)]
    struct EchoInput {
        text: String,
        #[serde(default)]
        mode: Option<String>,
    }

    #[derive(Default)]
    struct EchoHandler {
        executions: AtomicU32,
        timeout: Option<Duration>,
    }

    #[async_trait]
    impl TaskHandler for EchoHandler {
        type Input = EchoInput;

        fn task_type(&self) -> &str {
            "echo"
        }

        fn settings(&self) -> HandlerSettings {
            HandlerSettings {
                timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
                retry_budget: 2,
            }
        }

        fn validate(&self, input: &EchoInput) -> Result<(), StandardError> {
            if input.text.is_empty() {
                return Err(StandardError::validation("text must not be empty"));
            }
            Ok(())
        }

        async fn execute(&self, ctx: &ExecutionContext, input: EchoInput) -> Result<Value, JobError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            match input.mode.as_deref() {
                Some("upstream") => Err(StandardError::new(ErrorCode::UpstreamFailure, "503").into()),
                Some("business") => Err(JobError::business("ECHO_REFUSED", "refused")),
                Some("hang") => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                }
                Some("panic") => panic!("echo handler bug"),
                _ => Ok(json!({ "echo": input.text, "job_id": ctx.job_id })),
            }
        }
    }

    fn envelope(payload: Value) -> JobEnvelope {
        JobEnvelope::new("echo", payload.as_object().unwrap(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn success_completes_once() {
        let adapter = RecordingAdapter::new();
        let handler = Arc::new(EchoHandler::default());
        let env = envelope(json!({"text": "hi"}));
        let id = env.id.clone();

        let report = process_job(handler.clone(), env, &adapter).await;

        let outcomes = adapter.outcomes_for(&id);
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            ReportedOutcome::Complete { output, .. } => assert_eq!(output["echo"], "hi"),
            other => panic!("expected Complete, got {other:?}"),
        }
        assert_eq!(report.outcome, "COMPLETED");
        assert!(report.delivered);
        assert_eq!(
            report.state_transitions,
            vec![
                State::Received,
                State::Parsing,
                State::Validating,
                State::Executing,
                State::Reporting,
                State::Terminal
            ]
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_parse_failure_without_retries() {
        let adapter = RecordingAdapter::new();
        let handler = Arc::new(EchoHandler::default());
        let mut env = envelope(json!({}));
        env.payload = "{not json".into();

        let report = process_job(handler.clone(), env, &adapter).await;

        assert_eq!(report.outcome, "INPUT_PARSING_FAILED");
        assert_eq!(report.reported_retries, 0);
        assert_eq!(handler.executions.load(Ordering::SeqCst), 0);
        assert!(matches!(
            &adapter.outcomes()[..],
            [ReportedOutcome::Fail { code, retries: 0, .. }] if code == "INPUT_PARSING_FAILED"
        ));
        assert!(!report.state_transitions.contains(&State::Validating));
    }

    #[tokio::test]
    async fn validation_failure_is_never_retried() {
        let adapter = RecordingAdapter::new();
        let handler = Arc::new(EchoHandler::default());
        let env = envelope(json!({"text": ""})).with_remaining_retries(10);

        let report = process_job(handler.clone(), env, &adapter).await;

        assert_eq!(report.outcome, "VALIDATION_FAILED");
        assert_eq!(report.reported_retries, 0);
        assert_eq!(handler.executions.load(Ordering::SeqCst), 0);
        assert!(matches!(
            &adapter.outcomes()[..],
            [ReportedOutcome::Fail { retries: 0, .. }]
        ));
    }

    #[tokio::test]
    async fn retryable_failure_carries_bounded_budget() {
        let adapter = RecordingAdapter::new();
        let handler = Arc::new(EchoHandler::default());
        let env = envelope(json!({"text": "x", "mode": "upstream"})).with_remaining_retries(5);

        let report = process_job(handler, env, &adapter).await;

        assert_eq!(report.outcome, "UPSTREAM_FAILURE");
        assert_eq!(report.reported_retries, 2);
        assert!(matches!(
            &adapter.outcomes()[..],
            [ReportedOutcome::Fail { retries: 2, .. }]
        ));
    }

    #[tokio::test]
    async fn business_error_is_thrown_not_failed() {
        let adapter = RecordingAdapter::new();
        let handler = Arc::new(EchoHandler::default());
        let env = envelope(json!({"text": "x", "mode": "business"}));

        process_job(handler, env, &adapter).await;

        assert!(matches!(
            &adapter.outcomes()[..],
            [ReportedOutcome::ThrowBusinessError { code, .. }] if code == "ECHO_REFUSED"
        ));
    }

    #[tokio::test]
    async fn overrunning_handler_times_out() {
        let adapter = RecordingAdapter::new();
        let handler = Arc::new(EchoHandler {
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let env = envelope(json!({"text": "x", "mode": "hang"}));
        let started = Instant::now();

        let report = process_job(handler, env, &adapter).await;

        assert_eq!(report.outcome, "TIMEOUT");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(adapter.outcomes().len(), 1);
    }

    #[tokio::test]
    async fn panicking_handler_reports_internal_error() {
        let adapter = RecordingAdapter::new();
        let handler = Arc::new(EchoHandler::default());
        let env = envelope(json!({"text": "x", "mode": "panic"}));

        let report = process_job(handler, env, &adapter).await;

        assert_eq!(report.outcome, "INTERNAL_ERROR");
        assert!(matches!(
            &adapter.outcomes()[..],
            [ReportedOutcome::Fail { retries: 0, .. }]
        ));
    }

    #[tokio::test]
    async fn rejected_report_is_not_repeated() {
        let adapter = RecordingAdapter::rejecting();
        let handler = Arc::new(EchoHandler::default());
        let env = envelope(json!({"text": "hi"}));

        let report = process_job(handler, env, &adapter).await;

        assert!(!report.delivered);
        assert_eq!(adapter.outcomes().len(), 1);
        assert_eq!(report.state_transitions.last(), Some(&State::Terminal));
    }

    #[tokio::test]
    async fn reject_job_reports_once() {
        let adapter = RecordingAdapter::new();
        let env = envelope(json!({}));

        let report = reject_job(env, StandardError::internal("no handler"), &adapter).await;

        assert_eq!(report.outcome, "INTERNAL_ERROR");
        assert_eq!(adapter.outcomes().len(), 1);
        assert_eq!(
            report.state_transitions,
            vec![State::Received, State::Reporting, State::Terminal]
        );
    }
}
