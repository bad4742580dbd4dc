//! Modbus TCP device poller.
//!
//! Polls a fixed set of field devices (solar inverters, heat pumps, EV
//! chargers, ...) over Modbus TCP, converts raw holding register values to
//! engineering units and reports each round as a
//! [`voltlink_common::PollerEvent`].
//!
//! Devices that cannot be reached are reported offline and reconnected in
//! the background; one device failing never affects the others.

pub mod config;
pub mod connector;
pub mod error;
pub mod poller;

pub use config::{ModbusConfig, PollerSettings, default_devices};
pub use connector::{DeviceConnector, RegisterReader, TcpConnector};
pub use error::PollerError;
pub use poller::{DevicePoller, PollStats};
