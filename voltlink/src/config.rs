//! Relay configuration.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use voltlink_common::{LoggingConfig, load_config};
use voltlink_modbus::ModbusConfig;
use voltlink_mqtt::MqttConfig;

use crate::error::{RelayError, Result};

/// Top-level configuration file.
///
/// ```json5
/// {
///   logging: { level: "info", format: "text" },
///   modbus: { poll_interval_ms: 2000, devices: [ /* ... */ ] },
///   mqtt: { url: "mqtt://localhost:1883", namespace: "energy" },
///   server: { listen: "0.0.0.0:5000" },
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub modbus: ModbusConfig,

    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl RelayConfig {
    /// Load from a JSON5 file, falling back to the built-in defaults when
    /// the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        Ok(load_config(path)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up through `lookup`.
    ///
    /// Recognized keys: `MQTT_BROKER_URL`, `MQTT_USERNAME`,
    /// `MQTT_PASSWORD`, `VOLTLINK_LISTEN`, and per device
    /// `VOLTLINK_<ID>_HOST` / `VOLTLINK_<ID>_PORT` where `<ID>` is the
    /// upper-cased device id with `-` replaced by `_`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("MQTT_BROKER_URL") {
            self.mqtt.url = url;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(listen) = lookup("VOLTLINK_LISTEN") {
            self.server.listen = listen.parse().map_err(|e| {
                RelayError::config(format!("VOLTLINK_LISTEN '{}': {}", listen, e))
            })?;
        }

        for device in &mut self.modbus.devices {
            let prefix = format!("VOLTLINK_{}", env_key(&device.id));
            if let Some(host) = lookup(&format!("{}_HOST", prefix)) {
                device.address = host;
            }
            if let Some(port) = lookup(&format!("{}_PORT", prefix)) {
                device.port = port.parse().map_err(|e| {
                    RelayError::config(format!("{}_PORT '{}': {}", prefix, port, e))
                })?;
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.modbus
            .validate()
            .map_err(|e| RelayError::validation(e.to_string()))?;
        self.mqtt
            .validate()
            .map_err(|e| RelayError::validation(e.to_string()))?;
        Ok(())
    }
}

fn env_key(device_id: &str) -> String {
    device_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
