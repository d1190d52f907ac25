use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::job::JobExecution;
use crate::error::StandardError;

/// The six states every job passes through.
///
/// RECEIVED → PARSING → VALIDATING → EXECUTING → REPORTING → TERMINAL.
/// Parsing and validation failures jump straight to REPORTING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Received,
    Parsing,
    Validating,
    Executing,
    Reporting,
    Terminal,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Received => write!(f, "RECEIVED"),
            State::Parsing => write!(f, "PARSING"),
            State::Validating => write!(f, "VALIDATING"),
            State::Executing => write!(f, "EXECUTING"),
            State::Reporting => write!(f, "REPORTING"),
            State::Terminal => write!(f, "TERMINAL"),
        }
    }
}

/// How the step run in the current state ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Succeeded,
    Failed,
}

/// The result of evaluating a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Advance to the next state.
    Next(State),
    /// A parse or validation step failed; go straight to reporting.
    SkipToReporting { from: State },
    /// The outcome was reported; the job is done.
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("job {job_id} already reached TERMINAL")]
    AlreadyTerminal { job_id: String },
}

impl From<LifecycleError> for StandardError {
    fn from(err: LifecycleError) -> Self {
        StandardError::internal(err.to_string())
    }
}

/// Drives a [`JobExecution`] through the lifecycle. States only move
/// forward; TERMINAL cannot be left or re-entered.
pub struct StateMachine;

impl StateMachine {
    pub fn next(execution: &mut JobExecution, step: Step) -> Result<Transition, LifecycleError> {
        let transition = match (execution.state, step) {
            (State::Terminal, _) => {
                return Err(LifecycleError::AlreadyTerminal {
                    job_id: execution.job_id.clone(),
                });
            }
            (State::Received, Step::Succeeded) => Transition::Next(State::Parsing),
            (State::Parsing, Step::Succeeded) => Transition::Next(State::Validating),
            (State::Validating, Step::Succeeded) => Transition::Next(State::Executing),
            (from @ (State::Received | State::Parsing | State::Validating), Step::Failed) => {
                Transition::SkipToReporting { from }
            }
            // Execution failures are still an outcome to report.
            (State::Executing, _) => Transition::Next(State::Reporting),
            (State::Reporting, _) => Transition::Terminal,
        };

        execution.state_history.push(execution.state);
        execution.state = match transition {
            Transition::Next(state) => state,
            Transition::SkipToReporting { .. } => State::Reporting,
            Transition::Terminal => State::Terminal,
        };

        Ok(transition)
    }
}
