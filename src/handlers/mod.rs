//! Task handlers shipped with the worker.

mod external_fetch;
mod franchise;

pub use external_fetch::{ExternalFetchHandler, FetchInput};
pub use franchise::{FranchiseDataHandler, FranchiseInput};

pub const FRANCHISE_TASK_TYPE: &str = franchise::TASK_TYPE;
pub const FETCH_TASK_TYPE: &str = external_fetch::TASK_TYPE;

/// Task types with a built-in handler.
pub const KNOWN_TASK_TYPES: &[&str] = &[FRANCHISE_TASK_TYPE, FETCH_TASK_TYPE];
