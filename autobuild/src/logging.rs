//! Diagnostic tracing for autobuild.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics on stderr, filtered by `RUST_LOG`
//!   or the verbosity count. Stdout stays reserved for `query`/`print` output.
//!
//! - **Build logs (`io/build_log`, `io/build_status`)**: product artifacts
//!   under the CI state directory. Always written, unaffected by the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `verbosity` (the `script.loglevel`
/// setting or `-v` count) selects the level.
///
/// # Example
/// ```bash
/// RUST_LOG=autobuild=debug autobuild ci slave
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbosity)));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}
