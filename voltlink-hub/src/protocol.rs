//! Viewer protocol: inbound frames sent by viewers.
//!
//! Frames are JSON objects `{kind, payload}`. The older `{type, data}`
//! spelling is accepted as well.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use voltlink_common::Command;

/// Reply text sent to a viewer whose frame cannot be understood.
pub const INVALID_FORMAT: &str = "Invalid message format";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(alias = "type")]
    kind: String,

    #[serde(default, alias = "data")]
    payload: Value,
}

/// A decoded viewer request.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerRequest {
    /// Route a command to the bus. Missing fields are left empty and
    /// rejected downstream.
    Command(Command),
    Ping,
    /// A well-formed frame of a kind the hub does not handle.
    Unknown(String),
}

/// Decode one text frame.
pub fn parse_frame(raw: &str) -> Result<ViewerRequest, ProtocolError> {
    let frame: InboundFrame = serde_json::from_str(raw)?;

    match frame.kind.as_str() {
        "command" => {
            let command = match frame.payload {
                Value::Null => Command::new("", ""),
                payload => {
                    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
                        kind: frame.kind.clone(),
                        reason: e.to_string(),
                    })?
                }
            };
            Ok(ViewerRequest::Command(command))
        }
        "ping" => Ok(ViewerRequest::Ping),
        _ => Ok(ViewerRequest::Unknown(frame.kind)),
    }
}
