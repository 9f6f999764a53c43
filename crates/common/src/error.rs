//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid filter syntax or out-of-range value in watch settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The platform device source failed to come up.
    #[error("Enumeration init error: {0}")]
    Init(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
