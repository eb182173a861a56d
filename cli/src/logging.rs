//! Tracing subscriber setup.
//!
//! Log lines go to stderr so they interleave with the progress line rather
//! than with anything a script may read from stdout. `RUST_LOG` wins over the
//! command-line level when set.

use tracing_subscriber::filter::EnvFilter;

/// Build the filter from `RUST_LOG`, `--verbose` or `--log-level`.
pub fn build_filter(level: &str, verbose: bool) -> Result<EnvFilter, String> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = if verbose { "debug" } else { level };
    EnvFilter::try_new(directive).map_err(|e| format!("Invalid log level '{}': {}", directive, e))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(level: &str, verbose: bool, json: bool) -> Result<(), String> {
    let filter = build_filter(level, verbose)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true);

    // try_init fails only when a subscriber is already installed
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.compact().with_target(false).try_init();
    }
    Ok(())
}
