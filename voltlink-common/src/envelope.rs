use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::model::Reading;

/// Discriminates the payload shape of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeKind {
    DeviceData,
    SystemStatus,
    Command,
    Error,
}

/// Wrapper for every message delivered to a viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// A `deviceData` envelope carrying a poll batch.
    pub fn device_data(readings: &[Reading]) -> Self {
        let payload = serde_json::to_value(readings).unwrap_or_else(|e| {
            error!(error = %e, "Failed to serialize readings");
            serde_json::Value::Array(Vec::new())
        });
        Self::new(EnvelopeKind::DeviceData, payload)
    }

    pub fn system_status(payload: serde_json::Value) -> Self {
        Self::new(EnvelopeKind::SystemStatus, payload)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            EnvelopeKind::Error,
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Serialize to JSON text for the wire.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
