use serde::{Deserialize, Serialize};

use crate::model::Reading;

/// Events emitted by the device poller.
#[derive(Debug, Clone, PartialEq)]
pub enum PollerEvent {
    /// One completed poll round, in configuration order.
    DataUpdate(Vec<Reading>),
    DeviceConnected(String),
    DeviceDisconnected(String),
}

/// An inbound message received from the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub data: serde_json::Value,
}

/// Events emitted by the bus client.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Message(BusMessage),
    Connected,
    Disconnected,
}
