//! Device connection seam and its Modbus TCP implementation.

use async_trait::async_trait;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;
use tracing::debug;
use voltlink_common::DeviceDescriptor;

use crate::error::PollerError;

/// An open connection able to read holding registers.
#[async_trait]
pub trait RegisterReader: Send {
    /// Read `count` holding registers starting at `address`.
    ///
    /// Transport failures must be reported as [`PollerError::Transport`] so
    /// the poller can drop the connection.
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, PollerError>;
}

/// Opens device connections. Each call creates a new connection.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(
        &self,
        device: &DeviceDescriptor,
    ) -> Result<Box<dyn RegisterReader>, PollerError>;
}

/// Connector for Modbus TCP devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl DeviceConnector for TcpConnector {
    async fn connect(
        &self,
        device: &DeviceDescriptor,
    ) -> Result<Box<dyn RegisterReader>, PollerError> {
        let endpoint = device.endpoint();
        let addr = tokio::net::lookup_host(&endpoint)
            .await
            .map_err(|e| PollerError::Connection(format!("Invalid address '{}': {}", endpoint, e)))?
            .next()
            .ok_or_else(|| PollerError::Connection(format!("No address for '{}'", endpoint)))?;

        let ctx = tcp::connect_slave(addr, Slave(device.unit_id))
            .await
            .map_err(|e| PollerError::Connection(e.to_string()))?;

        debug!(device = %device.id, %addr, "Modbus TCP connection established");
        Ok(Box::new(TcpReader { ctx }))
    }
}

struct TcpReader {
    ctx: Context,
}

#[async_trait]
impl RegisterReader for TcpReader {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, PollerError> {
        self.ctx
            .read_holding_registers(address, count)
            .await
            .map_err(|e| PollerError::Transport(e.to_string()))?
            .map_err(|e| PollerError::Exception(format!("{:?}", e)))
    }
}
