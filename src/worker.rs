//! Handler registry and concurrent dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::adapter::OrchestratorAdapter;
use crate::error::{StandardError, WorkerError};
use crate::handler::{TaskHandler, process_job, reject_job};
use crate::state_machine::{ExecutionReport, JobEnvelope};

/// Default number of jobs of one task type allowed to run at once.
pub const DEFAULT_MAX_JOBS_ACTIVE: usize = 4;

/// A [`TaskHandler`] with its input type erased so handlers of different
/// task types can share one registry.
#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn run(&self, envelope: JobEnvelope, adapter: &dyn OrchestratorAdapter) -> ExecutionReport;
}

struct Erased<H>(Arc<H>);

#[async_trait]
impl<H: TaskHandler> ErasedHandler for Erased<H> {
    async fn run(&self, envelope: JobEnvelope, adapter: &dyn OrchestratorAdapter) -> ExecutionReport {
        process_job(self.0.clone(), envelope, adapter).await
    }
}

struct Registration {
    handler: Arc<dyn ErasedHandler>,
    permits: Arc<Semaphore>,
}

/// Routes envelopes to the handler registered for their task type.
pub struct Worker {
    adapter: Arc<dyn OrchestratorAdapter>,
    handlers: HashMap<String, Registration>,
    max_jobs_active: usize,
}

impl Worker {
    pub fn new(adapter: Arc<dyn OrchestratorAdapter>) -> Self {
        Self {
            adapter,
            handlers: HashMap::new(),
            max_jobs_active: DEFAULT_MAX_JOBS_ACTIVE,
        }
    }

    /// Concurrency limit applied to handlers registered after this call.
    pub fn with_max_jobs_active(mut self, max_jobs_active: usize) -> Self {
        self.max_jobs_active = max_jobs_active.max(1);
        self
    }

    pub fn register<H: TaskHandler>(&mut self, handler: H) -> Result<(), WorkerError> {
        let limit = self.max_jobs_active;
        self.register_with_limit(handler, limit)
    }

    pub fn register_with_limit<H: TaskHandler>(
        &mut self,
        handler: H,
        max_jobs_active: usize,
    ) -> Result<(), WorkerError> {
        let task_type = handler.task_type().to_string();
        if self.handlers.contains_key(&task_type) {
            return Err(WorkerError::Config(format!(
                "handler for task type {task_type} registered twice"
            )));
        }
        info!(task_type = %task_type, max_jobs_active, "registered handler");
        self.handlers.insert(
            task_type,
            Registration {
                handler: Arc::new(Erased(Arc::new(handler))),
                permits: Arc::new(Semaphore::new(max_jobs_active.max(1))),
            },
        );
        Ok(())
    }

    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Start one envelope on its own task. Unknown task types are reported
    /// as failed without touching any handler.
    pub fn dispatch(&self, envelope: JobEnvelope) -> JoinHandle<ExecutionReport> {
        let adapter = self.adapter.clone();

        let Some(registration) = self.handlers.get(&envelope.task_type) else {
            let err = WorkerError::UnknownTaskType(envelope.task_type.clone());
            error!(job_id = %envelope.id, error = %err, "cannot dispatch job");
            return tokio::spawn(async move {
                reject_job(envelope, StandardError::internal(err.to_string()), adapter.as_ref()).await
            });
        };

        let handler = registration.handler.clone();
        let permits = registration.permits.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    let err = StandardError::internal(format!("concurrency limiter closed: {e}"));
                    return reject_job(envelope, err, adapter.as_ref()).await;
                }
            };
            debug!(job_id = %envelope.id, "acquired job slot");
            handler.run(envelope, adapter.as_ref()).await
        })
    }

    /// Dispatch every envelope concurrently and wait for all of them. Reports
    /// come back in input order.
    pub async fn run_batch(&self, envelopes: Vec<JobEnvelope>) -> Vec<ExecutionReport> {
        let handles: Vec<_> = envelopes.into_iter().map(|e| self.dispatch(e)).collect();

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "job task did not finish"),
            }
        }
        reports
    }
}
