//! Logging initialization.
//!
//! The level is controlled by the `RUST_LOG` environment variable:
//!
//! ```bash
//! # Every parsed line and connection transition
//! RUST_LOG=etude=trace etude
//!
//! # Only warnings and errors (production)
//! RUST_LOG=warn etude
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging at `info` unless `RUST_LOG` says otherwise.
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Call it once at
/// startup.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with `level` as the fallback when `RUST_LOG` is unset.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}
