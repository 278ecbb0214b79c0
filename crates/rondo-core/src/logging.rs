//! Logging initialization for rondo.
//!
//! The server logs through `tracing`; nothing is printed until a subscriber
//! is installed. The level is controlled by the `RUST_LOG` environment
//! variable, which always takes precedence over the level passed in code:
//!
//! ```bash
//! # Show accept loop and connection details
//! RUST_LOG=debug rondo serve
//!
//! # Fine-grained control
//! RUST_LOG=rondo_core=debug,warn rondo serve
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging at `info` level.
///
/// Call once at startup, before the server runs.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with a specific default level (`"trace"`, `"debug"`,
/// `"info"`, `"warn"` or `"error"`).
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Initialize JSON-formatted logging, for log aggregation in production.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_json(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Like [`init_logging_with_level`], but returns `false` instead of
/// panicking when a subscriber is already installed. Handy in tests.
pub fn try_init_logging(level: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .is_ok()
}
