//! Tracing setup.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the binary or the host application.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Build the event filter. `RUST_LOG` wins over `level`; an unparsable
/// `level` falls back to `warn`.
#[must_use]
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("medsync={level}")))
        .unwrap_or_else(|_| EnvFilter::new("medsync=warn"))
}

/// Install a stderr subscriber. Returns `false` if one was already set.
pub fn init_logging(level: &str) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .is_ok()
}
