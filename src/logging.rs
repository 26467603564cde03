//! Logging setup for the `docent` binary.
//!
//! Logs go to stderr so that command output on stdout stays pipeable.
//! `RUST_LOG` wins over everything; otherwise `--verbose` / `--quiet`
//! override `[logging] level`.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Effective filter directive.
pub fn level_for(config: &LoggingConfig, verbose: bool, quiet: bool) -> String {
    if quiet {
        "error".to_string()
    } else if verbose {
        "debug".to_string()
    } else {
        config.level.clone()
    }
}

/// Install the global subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init(config: &LoggingConfig, verbose: bool, quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(config, verbose, quiet)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
