//! Command-line interface for the job worker.
//!
//! [`Cli`] carries the subcommands in [`Command`] plus the global
//! `--config` and `--verbose` flags.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Executes orchestrator jobs for franchise aggregation and external record lookups.
#[derive(Debug, Parser)]
#[command(name = "jobworker", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the worker configuration file.
    #[arg(long, short, global = true, default_value = crate::config::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run every job in a JSON file and print each outcome as a JSON line.
    Run {
        /// JSON array of jobs: `task_type`, `payload`, optional `id`,
        /// `timeout_ms` and `remaining_retries`.
        jobs: PathBuf,
    },

    /// Load and validate the configuration, then print it.
    CheckConfig,
}
