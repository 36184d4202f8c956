//! Log subscriber setup for the CLI
//!
//! `RUST_LOG` wins when set. Otherwise the configured level applies,
//! raised by one step per `-v`. Output goes to stderr so JSON on stdout
//! stays machine-readable.

use tracing_subscriber::EnvFilter;

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Level after applying `verbose` steps to `base`.
pub fn effective_level(base: &str, verbose: u8) -> &'static str {
    let start = LEVELS
        .iter()
        .position(|level| level.eq_ignore_ascii_case(base.trim()))
        .unwrap_or(2);
    LEVELS[(start + usize::from(verbose)).min(LEVELS.len() - 1)]
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(base_level: &str, verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(effective_level(base_level, verbose)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
