use thiserror::Error;

/// Errors raised while setting up the bus client.
///
/// Runtime failures (publish, broker loss) are not errors: they are logged
/// and reported as `false` or as a `Disconnected` event.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
