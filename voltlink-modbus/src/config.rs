//! Configuration for the device poller.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use voltlink_common::{DeviceClass, DeviceDescriptor, RegisterMap, RegisterSpec};

use crate::error::PollerError;

/// Modbus section of the relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Interval between poll rounds in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bound on each connection attempt in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bound on each register read in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Period between reconnect attempts in milliseconds (0 disables)
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Devices to poll
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceDescriptor>,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            devices: default_devices(),
        }
    }
}

/// The stock site: a solar inverter, a heat pump and an EV charger.
pub fn default_devices() -> Vec<DeviceDescriptor> {
    vec![
        DeviceDescriptor::new(
            "solar",
            "Solar Inverter",
            "192.168.1.100",
            502,
            DeviceClass::SolarInverter,
            RegisterMap::power_only(RegisterSpec::new(40083))
                .with_voltage(RegisterSpec::new(40085))
                .with_current(RegisterSpec::new(40087)),
        ),
        DeviceDescriptor::new(
            "heatpump",
            "Heat Pump",
            "192.168.1.101",
            502,
            DeviceClass::HeatPump,
            RegisterMap::power_only(RegisterSpec::new(1001))
                .with_temperature(RegisterSpec::new(1003)),
        ),
        DeviceDescriptor::new(
            "charger",
            "EV Charger",
            "192.168.1.102",
            502,
            DeviceClass::EvCharger,
            RegisterMap::power_only(RegisterSpec::new(5001))
                .with_voltage(RegisterSpec::new(5003))
                .with_current(RegisterSpec::new(5005)),
        ),
    ]
}

/// Timing parameters used by a running poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// `None` disables automatic reconnection.
    pub reconnect_interval: Option<Duration>,
}

impl Default for PollerSettings {
    fn default() -> Self {
        ModbusConfig::default().settings()
    }
}

impl ModbusConfig {
    pub fn settings(&self) -> PollerSettings {
        PollerSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            reconnect_interval: (self.reconnect_interval_ms > 0)
                .then(|| Duration::from_millis(self.reconnect_interval_ms)),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PollerError> {
        if self.poll_interval_ms == 0 {
            return Err(PollerError::Config(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(PollerError::Config(
                "connect_timeout_ms and read_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.devices.is_empty() {
            return Err(PollerError::Config(
                "At least one device must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(PollerError::Config("Device id cannot be empty".to_string()));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(PollerError::Config(format!(
                    "Duplicate device id '{}'",
                    device.id
                )));
            }
            if device.id.contains('/') || device.id.contains('+') || device.id.contains('#') {
                return Err(PollerError::Config(format!(
                    "Device '{}': id cannot contain '/', '+' or '#'",
                    device.id
                )));
            }
            if device.address.is_empty() {
                return Err(PollerError::Config(format!(
                    "Device '{}': address cannot be empty",
                    device.id
                )));
            }
            if device.unit_id == 0 || device.unit_id > 247 {
                return Err(PollerError::Config(format!(
                    "Device '{}': unit_id must be 1-247",
                    device.id
                )));
            }
            device
                .registers
                .validate()
                .map_err(|e| PollerError::Config(format!("Device '{}': {}", device.id, e)))?;
        }

        Ok(())
    }
}
