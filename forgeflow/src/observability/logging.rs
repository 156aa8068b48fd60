//! Subscriber setup.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "FORGEFLOW_LOG";

const DEFAULT_FILTER: &str = "info";

/// Builds the filter from [`LOG_ENV`], falling back to `info`.
#[must_use]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a global fmt subscriber writing to stderr.
///
/// Returns false if a subscriber was already installed; calling this more
/// than once is harmless.
pub fn init_tracing(json: bool) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    result.is_ok()
}
