// Logging module for structured logging using the tracing crate

use std::error::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Install the global tracing subscriber
///
/// The subscriber is configured with:
/// - JSON formatting for log aggregation systems
/// - Filtering from `RUST_LOG`, falling back to `default_level`
/// - Output to stdout
///
/// # Errors
///
/// Returns an error when `default_level` is not a valid filter directive or
/// a global subscriber is already installed.
///
/// # Examples
///
/// ```
/// use relaycore::logging::init_subscriber;
///
/// init_subscriber("info").expect("Failed to initialize logging");
/// tracing::info!("Retry engine ready");
/// ```
pub fn init_subscriber(default_level: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)?,
    };

    Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()?;

    Ok(())
}
