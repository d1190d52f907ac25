mod job;
mod state;

pub(crate) use job::instant_after;
pub use job::{
    ExecutionContext, ExecutionOutcome, ExecutionReport, JobEnvelope, JobExecution, MAX_JOB_TIMEOUT,
};
pub use state::{LifecycleError, State, StateMachine, Step, Transition};
