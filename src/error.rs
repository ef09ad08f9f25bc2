// Error types module

use thiserror::Error;

use crate::quic::StreamError;

/// Top-level error for embedders of the crate
///
/// The retry engine never fails; it reports outcomes as enums. Errors come
/// from configuration loading and from misuse of the stream encode API.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Invalid YAML, missing env vars, failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::config::ConfigError> for RelayError {
    fn from(err: crate::config::ConfigError) -> Self {
        match err {
            crate::config::ConfigError::Io(e) => RelayError::Io(e),
            other => RelayError::Config(other.to_string()),
        }
    }
}
