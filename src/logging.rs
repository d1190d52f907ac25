//! Tracing setup for the binary.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// Install the global subscriber: `RUST_LOG` if set, else `info`
/// (`debug` when verbose). Logs go to stderr so stdout carries only
/// outcome lines. Later calls are no-ops.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
