//! Tracing bootstrap for applications embedding the lock
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! the embedding application's choice.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Install a console subscriber. `RUST_LOG` takes precedence over `default_level`.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_level: &str) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_filter(filter);

    Registry::default().with(console_layer).try_init()
}
