//! Tracing subscriber setup for the crate's binaries.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a global subscriber. `RUST_LOG` wins when set; otherwise
/// `synthesis` logs at `debug` when `verbose` and at `info` otherwise.
/// `json` switches to structured output for log collectors.
pub fn init_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("synthesis=debug,info")
        } else {
            EnvFilter::new("synthesis=info,warn")
        }
    });

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
