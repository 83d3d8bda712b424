//! Tracing setup for the CLSP player core.
//!
//! Console-only subscriber initialization. Host applications that already
//! install their own subscriber should skip this and rely on the `tracing`
//! events the crate emits.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize a console tracing subscriber at the given default level.
///
/// The `RUST_LOG` environment variable overrides `console_level` when set.
/// Calling this twice is an error because a global subscriber may only be
/// installed once per process.
///
/// # Errors
///
/// - `tracing_subscriber::util::TryInitError` - If a global subscriber is
///   already installed
pub fn init_tracing(
    console_level: Level,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_env_filter(filter)
        .finish()
        .try_init()
}
