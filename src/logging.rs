//! Diagnostic logging setup
//!
//! Diagnostics go to stderr through a `tracing` subscriber. `SLUICE_LOG`
//! takes an `EnvFilter` directive and overrides the `-v` count.

use std::io;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogFormat;

pub const LOG_ENV_VAR: &str = "SLUICE_LOG";

/// `-v` count to level: 0 = warn, 1 = info, 2 = debug, 3+ = trace
pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn build_filter(verbosity: u8) -> EnvFilter {
    match std::env::var(LOG_ENV_VAR) {
        Ok(directive) if !directive.trim().is_empty() => match EnvFilter::try_new(&directive) {
            Ok(filter) => filter,
            Err(e) => {
                eprintln!("sluice: ignoring invalid {}='{}': {}", LOG_ENV_VAR, directive, e);
                EnvFilter::new(level_for_verbosity(verbosity))
            }
        },
        _ => EnvFilter::new(level_for_verbosity(verbosity)),
    }
}

/// Install the global subscriber. A subscriber that is already installed
/// (for example by a test harness) is left in place.
pub fn init_logging(verbosity: u8, format: LogFormat) {
    let filter = build_filter(verbosity);
    let layer = match format {
        LogFormat::Text => fmt::layer()
            .with_writer(io::stderr)
            .with_target(verbosity >= 2)
            .with_ansi(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(io::stderr)
            .with_target(true)
            .with_thread_names(true)
            .json()
            .boxed(),
    };

    if tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .is_err()
    {
        tracing::debug!("global tracing subscriber already initialized");
    }
}
