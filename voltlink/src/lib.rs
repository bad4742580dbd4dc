//! VoltLink telemetry relay.
//!
//! Wires the Modbus [`DevicePoller`](voltlink_modbus::DevicePoller), the
//! MQTT [`BusClient`](voltlink_mqtt::BusClient) and the viewer
//! [`Hub`](voltlink_hub::Hub) together and serves the HTTP control façade
//! and the `/ws` viewer endpoint.
//!
//! # Example
//!
//! ```ignore
//! use clap::Parser;
//! use voltlink::{RelayArgs, run_relay};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     run_relay(RelayArgs::parse()).await
//! }
//! ```

mod args;
mod config;
mod error;
mod http;
mod runner;
mod status;

pub use args::{DEFAULT_CONFIG, RelayArgs};
pub use config::{RelayConfig, ServerConfig};
pub use error::{RelayError, Result};
pub use http::{AppState, create_router, serve};
pub use runner::{Relay, run_relay};
pub use status::{RELAY_NAME, RelayStatus, presence};
