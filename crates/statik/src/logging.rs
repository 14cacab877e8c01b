//! Logging initialisation.
//!
//! The level is read from `RUST_LOG`; without it the server logs its own
//! lifecycle at `info`:
//!
//! ```bash
//! RUST_LOG=statik=debug statik 8080 --doc-root ./www   # one line per request
//! RUST_LOG=statik=trace statik 8080                    # every parsed header line
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global fmt subscriber with the `statik=info` default.
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Call it once, at the
/// top of `main`.
pub fn init_logging() {
    init_logging_with_level("statik=info");
}

/// Like [`init_logging`], with an explicit default directive for when
/// `RUST_LOG` is unset.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}
