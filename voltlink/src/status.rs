//! Relay status announced on the bus.

use serde::{Deserialize, Serialize};
use voltlink_common::{DeviceDescriptor, TopicBuilder};
use voltlink_mqtt::Presence;

/// Name reported in the status document.
pub const RELAY_NAME: &str = "voltlink";

/// Relay status document, published retained on `<ns>/relay/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayStatus {
    pub relay: String,
    pub version: String,
    /// "running" or "offline".
    pub status: String,
    /// Ids of the configured devices.
    pub devices: Vec<String>,
}

impl RelayStatus {
    pub fn running(devices: &[DeviceDescriptor]) -> Self {
        Self::with_status("running", devices)
    }

    pub fn offline(devices: &[DeviceDescriptor]) -> Self {
        Self::with_status("offline", devices)
    }

    fn with_status(status: &str, devices: &[DeviceDescriptor]) -> Self {
        Self {
            relay: RELAY_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            status: status.to_string(),
            devices: devices.iter().map(|d| d.id.clone()).collect(),
        }
    }

    fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Presence announcement for the bus client.
///
/// The running status is republished on every broker (re)connect, the
/// offline status doubles as the last will.
pub fn presence(topics: &TopicBuilder, devices: &[DeviceDescriptor]) -> Presence {
    Presence {
        topic: topics.relay_status_topic(),
        online: RelayStatus::running(devices).to_value(),
        offline: RelayStatus::offline(devices).to_value(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voltlink_modbus::default_devices;

    #[test]
    fn test_status_document() {
        let status = RelayStatus::running(&default_devices());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["relay"], "voltlink");
        assert_eq!(json["status"], "running");
        assert_eq!(json["devices"], serde_json::json!(["solar", "heatpump", "charger"]));
        assert!(json["version"].is_string());
    }

    #[test]
    fn test_presence() {
        let presence = presence(&TopicBuilder::new("site1"), &default_devices());

        assert_eq!(presence.topic, "site1/relay/status");
        assert_eq!(presence.online["status"], "running");
        assert_eq!(presence.offline["status"], "offline");
        assert_eq!(presence.offline["devices"][2], "charger");
    }
}
