//! Register maps and unit conversion.
//!
//! Every device exposes a mandatory `power` register and optional `voltage`,
//! `current` and `temperature` registers. Raw 16-bit register values are
//! converted to engineering units by dividing by the register's scale.

use serde::{Deserialize, Serialize};

/// A logical quantity read from a field device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    Power,
    Voltage,
    Current,
    Temperature,
}

impl Quantity {
    /// All quantities in device read order.
    pub const ALL: [Quantity; 4] = [
        Quantity::Power,
        Quantity::Voltage,
        Quantity::Current,
        Quantity::Temperature,
    ];

    /// Scale used when a register does not configure one.
    ///
    /// Power is reported in hundredths of a kW, voltage in tenths of a volt,
    /// current in hundredths of an amp and temperature in tenths of a degree.
    pub fn default_scale(&self) -> f64 {
        match self {
            Quantity::Power => 100.0,
            Quantity::Voltage => 10.0,
            Quantity::Current => 100.0,
            Quantity::Temperature => 10.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quantity::Power => "power",
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
            Quantity::Temperature => "temperature",
        }
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Interpretation of a raw 16-bit register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 16-bit integer (default)
    #[default]
    U16,
    /// Signed 16-bit integer (two's complement)
    I16,
}

impl DataType {
    fn is_default(&self) -> bool {
        *self == DataType::U16
    }
}

/// A single holding register and its scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSpec {
    /// Holding register address.
    pub address: u16,

    /// Divisor applied to the raw value. Falls back to the quantity default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,

    /// Raw value interpretation.
    #[serde(default, alias = "data_type", skip_serializing_if = "DataType::is_default")]
    pub data_type: DataType,
}

impl RegisterSpec {
    /// Register at `address` using the quantity's default scale.
    pub fn new(address: u16) -> Self {
        Self {
            address,
            scale: None,
            data_type: DataType::U16,
        }
    }

    /// Register at `address` with an explicit scale.
    pub fn scaled(address: u16, scale: f64) -> Self {
        Self {
            address,
            scale: Some(scale),
            data_type: DataType::U16,
        }
    }

    /// Set the raw value interpretation.
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Effective scale for `quantity`.
    pub fn scale_for(&self, quantity: Quantity) -> f64 {
        self.scale.unwrap_or_else(|| quantity.default_scale())
    }

    /// Convert a raw register value to engineering units.
    pub fn convert(&self, quantity: Quantity, raw: u16) -> f64 {
        let value = match self.data_type {
            DataType::U16 => raw as f64,
            DataType::I16 => raw as i16 as f64,
        };
        value / self.scale_for(quantity)
    }
}

/// Per-device table of logical quantity to register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterMap {
    pub power: RegisterSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<RegisterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<RegisterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<RegisterSpec>,
}

impl RegisterMap {
    /// Map with only the mandatory power register.
    pub fn power_only(power: RegisterSpec) -> Self {
        Self {
            power,
            voltage: None,
            current: None,
            temperature: None,
        }
    }

    pub fn with_voltage(mut self, spec: RegisterSpec) -> Self {
        self.voltage = Some(spec);
        self
    }

    pub fn with_current(mut self, spec: RegisterSpec) -> Self {
        self.current = Some(spec);
        self
    }

    pub fn with_temperature(mut self, spec: RegisterSpec) -> Self {
        self.temperature = Some(spec);
        self
    }

    /// Register for a quantity, if the device exposes it.
    pub fn get(&self, quantity: Quantity) -> Option<&RegisterSpec> {
        match quantity {
            Quantity::Power => Some(&self.power),
            Quantity::Voltage => self.voltage.as_ref(),
            Quantity::Current => self.current.as_ref(),
            Quantity::Temperature => self.temperature.as_ref(),
        }
    }

    /// Configured registers in read order (power first).
    pub fn entries(&self) -> impl Iterator<Item = (Quantity, &RegisterSpec)> {
        Quantity::ALL
            .into_iter()
            .filter_map(|q| self.get(q).map(|spec| (q, spec)))
    }

    /// Check that every configured scale is finite and positive.
    pub fn validate(&self) -> Result<(), String> {
        for (quantity, spec) in self.entries() {
            let scale = spec.scale_for(quantity);
            if !scale.is_finite() || scale <= 0.0 {
                return Err(format!(
                    "{} register {}: scale must be a positive number, got {}",
                    quantity, spec.address, scale
                ));
            }
        }
        Ok(())
    }
}
