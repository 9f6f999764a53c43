//! Logging setup and configuration

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Setup tracing subscriber for the application.
///
/// Logs go to stderr: stdout is reserved for the JSON event stream when
/// running as the watch binary.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
