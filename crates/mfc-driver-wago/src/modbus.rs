//! Modbus TCP coil transport.

use async_trait::async_trait;
use mfc_core::transport::{CoilBus, CoilConnector, DynCoilBus};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

pub const MODBUS_PORT: u16 = 502;

/// Opens Modbus TCP sessions to one coupler.
#[derive(Debug, Clone)]
pub struct ModbusTcpConnector {
    address: String,
    timeout: Duration,
}

impl ModbusTcpConnector {
    /// `address` is an IP, optionally with a port (default 502).
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_secs(3),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn socket_addr(&self) -> io::Result<SocketAddr> {
        if let Ok(socket) = self.address.parse::<SocketAddr>() {
            return Ok(socket);
        }
        self.address
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, MODBUS_PORT))
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid coupler address '{}': {e}", self.address),
                )
            })
    }
}

#[async_trait]
impl CoilConnector for ModbusTcpConnector {
    async fn open(&self) -> io::Result<DynCoilBus> {
        let socket = self.socket_addr()?;
        let ctx = tokio::time::timeout(self.timeout, tcp::connect(socket))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        Ok(Box::new(ModbusSession {
            ctx,
            timeout: self.timeout,
        }))
    }

    fn describe(&self) -> String {
        match self.socket_addr() {
            Ok(socket) => format!("modbus://{socket}"),
            Err(_) => format!("modbus://{}", self.address),
        }
    }
}

struct ModbusSession {
    ctx: Context,
    timeout: Duration,
}

fn modbus_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}

fn exception(e: impl std::fmt::Debug) -> io::Error {
    io::Error::other(format!("exception: {e:?}"))
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "no reply from coupler")
}

#[async_trait]
impl CoilBus for ModbusSession {
    async fn read_coils(&mut self, address: u16, count: u16) -> io::Result<Vec<bool>> {
        let mut coils = tokio::time::timeout(self.timeout, self.ctx.read_coils(address, count))
            .await
            .map_err(|_| timed_out())?
            .map_err(modbus_error)?
            .map_err(exception)?;
        // Coils arrive packed in whole bytes
        coils.truncate(usize::from(count));
        Ok(coils)
    }

    async fn write_coil(&mut self, address: u16, state: bool) -> io::Result<()> {
        tokio::time::timeout(self.timeout, self.ctx.write_single_coil(address, state))
            .await
            .map_err(|_| timed_out())?
            .map_err(modbus_error)?
            .map_err(exception)
    }

    async fn disconnect(&mut self) -> io::Result<()> {
        self.ctx.disconnect().await.map_err(modbus_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_502() {
        assert_eq!(
            ModbusTcpConnector::new("192.168.1.3").describe(),
            "modbus://192.168.1.3:502"
        );
        assert_eq!(
            ModbusTcpConnector::new("192.168.1.3:1502").describe(),
            "modbus://192.168.1.3:1502"
        );
    }

    #[tokio::test]
    async fn bad_address_fails_before_connecting() {
        let err = ModbusTcpConnector::new("not-an-ip").open().await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
