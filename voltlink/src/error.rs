//! Error types for the relay.

use thiserror::Error;
use voltlink_modbus::PollerError;
use voltlink_mqtt::BusError;

/// Result type alias using [`RelayError`].
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can stop the relay from starting.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("Device poller: {0}")]
    Poller(#[from] PollerError),

    #[error("Bus client: {0}")]
    Bus(#[from] BusError),

    /// HTTP listener could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server error: {0}")]
    Server(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }
}

impl From<voltlink_common::Error> for RelayError {
    fn from(err: voltlink_common::Error) -> Self {
        Self::Config(err.to_string())
    }
}
