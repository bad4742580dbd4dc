use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved device id for system-wide controls.
pub const SYSTEM_DEVICE: &str = "system";

/// Typed command argument.
///
/// Whole numbers stay integers on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl From<bool> for CommandValue {
    fn from(v: bool) -> Self {
        CommandValue::Bool(v)
    }
}

impl From<f64> for CommandValue {
    fn from(v: f64) -> Self {
        CommandValue::Number(v)
    }
}

impl From<i64> for CommandValue {
    fn from(v: i64) -> Self {
        CommandValue::Integer(v)
    }
}

impl From<String> for CommandValue {
    fn from(v: String) -> Self {
        CommandValue::Text(v)
    }
}

impl From<&str> for CommandValue {
    fn from(v: &str) -> Self {
        CommandValue::Text(v.to_string())
    }
}

/// A command addressed to one device (or the `system` pseudo-device).
///
/// Missing fields deserialize as empty so that incomplete commands can be
/// rejected by [`Command::is_complete`] instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(default)]
    pub device_id: String,

    #[serde(default)]
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<CommandValue>,
}

impl Command {
    pub fn new(device_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            command: command.into(),
            value: None,
        }
    }

    /// A control for the `system` pseudo-device.
    pub fn system(control: impl Into<String>, value: Option<CommandValue>) -> Self {
        Self {
            device_id: SYSTEM_DEVICE.to_string(),
            command: control.into(),
            value,
        }
    }

    pub fn with_value(mut self, value: impl Into<CommandValue>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Both the target device and the command token are present.
    pub fn is_complete(&self) -> bool {
        !self.device_id.trim().is_empty() && !self.command.trim().is_empty()
    }

    /// Wire payload stamped with the publish time.
    pub fn to_payload(&self, timestamp: DateTime<Utc>) -> CommandPayload {
        CommandPayload {
            command: self.command.clone(),
            value: self.value.clone(),
            timestamp,
        }
    }
}

/// Body published on a device's command topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<CommandValue>,
    pub timestamp: DateTime<Utc>,
}

/// Destination for commands issued by viewers or the HTTP façade.
///
/// Implementations never fail loudly: a command that cannot be delivered
/// yields `false`.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Publish a command, returning whether it was accepted.
    async fn publish(&self, command: &Command) -> bool;

    /// Whether the sink currently has a live connection.
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_variants() {
        let values: Vec<CommandValue> =
            serde_json::from_str(r#"[true, 16, -3, 21.5, "eco"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                CommandValue::Bool(true),
                CommandValue::Integer(16),
                CommandValue::Integer(-3),
                CommandValue::Number(21.5),
                CommandValue::Text("eco".to_string())
            ]
        );
    }

    #[test]
    fn test_incomplete_command_parses() {
        let command: Command = serde_json::from_str(r#"{"command": "stop"}"#).unwrap();
        assert_eq!(command.device_id, "");
        assert!(!command.is_complete());

        let command: Command = serde_json::from_str(r#"{"deviceId": "heatpump"}"#).unwrap();
        assert!(!command.is_complete());
    }

    #[test]
    fn test_null_value_is_absent() {
        let command: Command =
            serde_json::from_str(r#"{"deviceId": "solar", "command": "stop", "value": null}"#)
                .unwrap();
        assert!(command.is_complete());
        assert_eq!(command.value, None);
    }

    #[test]
    fn test_payload_omits_absent_value() {
        let payload = Command::new("heatpump", "stop").to_payload(Utc::now());
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["command"], "stop");
        assert!(json.get("value").is_none());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_integer_value_stays_integer() {
        let command: Command =
            serde_json::from_str(r#"{"deviceId": "charger", "command": "set_current", "value": 16}"#)
                .unwrap();
        assert_eq!(command.value, Some(CommandValue::Integer(16)));

        let json = serde_json::to_string(&command.to_payload(Utc::now())).unwrap();
        assert!(json.contains(r#""value":16,"#));
        assert!(!json.contains("16.0"));

        let payload: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(payload["value"].is_i64());
    }

    #[test]
    fn test_system_command() {
        let command = Command::system("grid_export", Some(CommandValue::Bool(false)));
        assert_eq!(command.device_id, SYSTEM_DEVICE);
        assert_eq!(command.command, "grid_export");
        assert!(command.is_complete());
    }
}
