//! MQTT command/status bus client.
//!
//! Publishes device commands and receives device and system status over a
//! broker, tolerating broker loss with unbounded periodic reconnects.
//!
//! # Topics
//!
//! ```text
//! <namespace>/<device>/command    outbound commands
//! <namespace>/<device>/status     inbound device status
//! <namespace>/system/controls     inbound system controls
//! <namespace>/relay/status        relay presence (retained)
//! ```

pub mod client;
pub mod config;
pub mod error;

pub use client::{BusClient, Presence};
pub use config::{BrokerAddress, MqttConfig};
pub use error::BusError;
