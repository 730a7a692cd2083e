use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging with human-readable output.
///
/// Uses the `RUST_LOG` environment variable if set, otherwise falls back to
/// `default_level` (e.g. "info", "tt_core=debug,warn").
///
/// Safe to call multiple times (e.g. in tests); subsequent calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised");
}
