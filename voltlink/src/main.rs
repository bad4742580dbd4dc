//! VoltLink relay binary.
//!
//! Polls Modbus field devices, bridges commands and status over MQTT and
//! streams live updates to WebSocket viewers.

use anyhow::Result;
use clap::Parser;
use voltlink::{RelayArgs, run_relay};

#[tokio::main]
async fn main() -> Result<()> {
    run_relay(RelayArgs::parse()).await
}
