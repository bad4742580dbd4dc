use thiserror::Error;

/// Errors raised while connecting to or reading from field devices.
#[derive(Debug, Error)]
pub enum PollerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection timed out after {0}ms")]
    ConnectTimeout(u64),

    /// The transport under the device connection failed.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Modbus exception: {0}")]
    Exception(String),

    #[error("Read timed out after {0}ms")]
    ReadTimeout(u64),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PollerError {
    /// Whether the device connection must be considered lost.
    ///
    /// Timeouts and Modbus exceptions only degrade the current reading.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, PollerError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_loss_classification() {
        assert!(PollerError::Transport("broken pipe".into()).is_connection_loss());
        assert!(!PollerError::Exception("IllegalDataAddress".into()).is_connection_loss());
        assert!(!PollerError::ReadTimeout(1000).is_connection_loss());
    }
}
