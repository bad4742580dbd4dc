//! VoltLink Common Library
//!
//! Shared types and utilities for the VoltLink telemetry relay:
//!
//! - [`model`] - Devices, readings and connection states
//! - [`register`] - Register maps and unit conversion
//! - [`command`] - Commands and the [`CommandSink`] seam
//! - [`envelope`] - Messages delivered to viewers
//! - [`events`] - Poller and bus event types
//! - [`topics`] - Bus topic builder
//! - [`config`] - Configuration loading (JSON5 format)
//! - [`error`] - Error types

pub mod command;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod model;
pub mod register;
pub mod topics;

// Re-export commonly used types at the crate root
pub use command::{Command, CommandPayload, CommandSink, CommandValue, SYSTEM_DEVICE};
pub use config::{LogFormat, LoggingConfig, load_config, parse_config};
pub use envelope::{Envelope, EnvelopeKind};
pub use error::{Error, Result};
pub use events::{BusEvent, BusMessage, PollerEvent};
pub use model::{ConnectionState, DeviceClass, DeviceDescriptor, Reading, now};
pub use register::{DataType, Quantity, RegisterMap, RegisterSpec};
pub use topics::{DEFAULT_NAMESPACE, TopicBuilder};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Output is either
/// human-readable text or one JSON object per line.
///
/// # Example
///
/// ```ignore
/// use voltlink_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_current_span(false))
            .with(filter)
            .try_init(),
    };

    result.map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))
}
