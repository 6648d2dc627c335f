//! Tracing subscriber setup for binaries and test harnesses.
//!
//! The library only emits `tracing` events; installing a subscriber is left to the process.

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Environment variable holding the filter directives; `RUST_LOG` is consulted when unset.
pub const LOG_ENV: &str = "SPLITCONV_LOG";

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Installs a fmt subscriber filtered by `SPLITCONV_LOG`, then `RUST_LOG`, then `info`.
pub fn init_tracing() -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);

    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InitError::Subscriber(err.to_string()))
}

/// Like [`init_tracing`], but treats an existing subscriber as success.
pub fn ensure_tracing() {
    match init_tracing() {
        Ok(()) | Err(InitError::AlreadyInitialised) => {}
        Err(err) => tracing::warn!("failed to initialise tracing subscriber: {err}"),
    }
}
