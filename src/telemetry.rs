#![cfg(feature = "tracing")]
//! Tracing subscriber for binaries embedding the store.

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::util::TryInitError;

/// Install a global subscriber with a `RUST_LOG` driven filter and formatted output.
///
/// Fails if another global subscriber has been installed already.
pub fn init() -> Result<(), TryInitError> {
    let filter = tracing_subscriber::EnvFilter::from_default_env();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;

    info!("Tracing initialized");

    Ok(())
}
