//! Tracing bootstrap for the CLI.

use std::{env, io};

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,duochat_cli=info,backend_rest=info";

/// Initialize the global tracing subscriber, writing to stderr.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `DUOCHAT_CLI_LOG`
/// 3) `DUOCHAT_LOG`
/// 4) internal default filter
pub fn init() {
    let env_filter = filter_from_env();
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(io::stderr)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    for key in ["DUOCHAT_CLI_LOG", "DUOCHAT_LOG"] {
        if let Some(value) = env::var(key).ok().filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}
