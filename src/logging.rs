//! Logging setup
//!
//! Thin wrapper around `tracing` so the rest of the crate only needs one
//! import path. `init_tracing` installs an `EnvFilter`-driven subscriber
//! writing to stderr, honoring `RUST_LOG` and defaulting to `info`.

pub use tracing::{debug, error, info, trace, warn};

/// Install a process-wide tracing subscriber. Safe to call more than once;
/// subsequent calls are no-ops.
pub fn init_tracing() {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.try_init();
}

// vim: ts=4
