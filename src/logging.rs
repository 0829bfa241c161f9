//! Logging initialization for host processes.
//!
//! The engine itself only emits `tracing` events; embedding applications
//! that do not already install a subscriber can call [`init_logging`] to
//! get an `RUST_LOG`-configurable console subscriber.

use tracing_subscriber::EnvFilter;

/// Initialize a console tracing subscriber.
///
/// The filter is taken from the `RUST_LOG` environment variable when set,
/// falling back to `default_directive` (e.g. `"stratacache=info"`).
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(
    default_directive: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
}
