use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::register::{Quantity, RegisterMap};

/// Category of field device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    SolarInverter,
    HeatPump,
    EvCharger,
    /// Any other device class, kept verbatim.
    #[serde(untagged)]
    Other(String),
}

impl DeviceClass {
    pub fn as_str(&self) -> &str {
        match self {
            DeviceClass::SolarInverter => "solar-inverter",
            DeviceClass::HeatPump => "heat-pump",
            DeviceClass::EvCharger => "ev-charger",
            DeviceClass::Other(name) => name,
        }
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A configured field device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Stable short key (e.g. "solar"), used in topics and readings.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Host name or IP address.
    pub address: String,

    /// Modbus TCP port.
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit identifier.
    #[serde(default = "default_unit_id", alias = "unit_id")]
    pub unit_id: u8,

    /// Device category.
    pub class: DeviceClass,

    /// Register table for this device.
    pub registers: RegisterMap,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

impl DeviceDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        class: DeviceClass,
        registers: RegisterMap,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
            unit_id: default_unit_id(),
            class,
            registers,
        }
    }

    /// `address:port` endpoint string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Lifecycle of a device or broker connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One device's values from a poll round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub device_id: String,

    /// Active power in kW.
    pub power: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// When the reading was taken.
    pub timestamp: DateTime<Utc>,

    pub online: bool,
}

impl Reading {
    /// An online reading with only the power value set.
    pub fn online(device_id: impl Into<String>, power: f64) -> Self {
        Self {
            device_id: device_id.into(),
            power,
            voltage: None,
            current: None,
            temperature: None,
            timestamp: Utc::now(),
            online: true,
        }
    }

    /// Reading for a device whose read failed: zero power, nothing else.
    pub fn offline(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            power: 0.0,
            voltage: None,
            current: None,
            temperature: None,
            timestamp: Utc::now(),
            online: false,
        }
    }

    /// Set a converted quantity on this reading.
    pub fn set(&mut self, quantity: Quantity, value: f64) {
        match quantity {
            Quantity::Power => self.power = value,
            Quantity::Voltage => self.voltage = Some(value),
            Quantity::Current => self.current = Some(value),
            Quantity::Temperature => self.temperature = Some(value),
        }
    }

    /// Build an online reading from converted register values.
    pub fn from_values(
        device_id: impl Into<String>,
        values: impl IntoIterator<Item = (Quantity, f64)>,
    ) -> Self {
        let mut reading = Reading::online(device_id, 0.0);
        for (quantity, value) in values {
            reading.set(quantity, value);
        }
        reading
    }
}

/// Current UTC time, used for envelope and command timestamps.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::RegisterSpec;

    #[test]
    fn test_device_class_roundtrip() {
        let class: DeviceClass = serde_json::from_str("\"heat-pump\"").unwrap();
        assert_eq!(class, DeviceClass::HeatPump);

        let class: DeviceClass = serde_json::from_str("\"battery\"").unwrap();
        assert_eq!(class, DeviceClass::Other("battery".to_string()));
        assert_eq!(class.as_str(), "battery");

        assert_eq!(
            serde_json::to_string(&DeviceClass::EvCharger).unwrap(),
            "\"ev-charger\""
        );
    }

    #[test]
    fn test_descriptor_defaults() {
        let device: DeviceDescriptor = serde_json::from_value(serde_json::json!({
            "id": "solar",
            "name": "Solar Inverter",
            "address": "192.168.1.100",
            "class": "solar-inverter",
            "registers": { "power": { "address": 40083 } }
        }))
        .unwrap();

        assert_eq!(device.port, 502);
        assert_eq!(device.unit_id, 1);
        assert_eq!(device.endpoint(), "192.168.1.100:502");
        assert_eq!(device.registers.power, RegisterSpec::new(40083));
    }

    #[test]
    fn test_offline_reading_has_no_optional_fields() {
        let reading = Reading::offline("heatpump");
        let json = serde_json::to_value(&reading).unwrap();

        assert_eq!(json["deviceId"], "heatpump");
        assert_eq!(json["power"], 0.0);
        assert_eq!(json["online"], false);
        assert!(json.get("voltage").is_none());
        assert!(json.get("current").is_none());
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_reading_from_values() {
        let reading = Reading::from_values(
            "charger",
            [(Quantity::Power, 7.4), (Quantity::Voltage, 230.0)],
        );

        assert!(reading.online);
        assert_eq!(reading.power, 7.4);
        assert_eq!(reading.voltage, Some(230.0));
        assert_eq!(reading.current, None);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Disconnected).unwrap(),
            "\"disconnected\""
        );
    }
}
