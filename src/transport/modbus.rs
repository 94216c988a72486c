//! Modbus-TCP transport.

use crate::error::{AppResult, ConsoleError};
use crate::transport::Transport;
use log::{debug, warn};
use std::net::SocketAddr;
use tokio_modbus::client::sync::{self, Context, Reader, Writer};

/// Modbus-TCP transport wrapping the blocking `tokio-modbus` client.
///
/// Read failures are local events: the decoder substitutes NaN and sentinel
/// status words for the affected block, so this transport reports "no data"
/// rather than propagating wire errors.
pub struct ModbusTransport {
    address: String,
    ctx: Option<Context>,
}

impl ModbusTransport {
    /// Create an unopened transport; call [`ModbusTransport::open`] before use.
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ctx: None,
        }
    }

    /// Connect to the Modbus-TCP endpoint.
    ///
    /// Must run on the blocking pool: the sync client drives its own reactor.
    fn connect(&mut self) -> AppResult<()> {
        let socket_addr: SocketAddr = self.address.parse().map_err(|e| {
            ConsoleError::Configuration(format!(
                "invalid modbus address '{}': {}",
                self.address, e
            ))
        })?;
        let ctx = sync::tcp::connect(socket_addr).map_err(|e| {
            ConsoleError::Transport(format!("failed to connect to '{}': {}", self.address, e))
        })?;
        debug!("modbus endpoint '{}' connected", self.address);
        self.ctx = Some(ctx);
        Ok(())
    }
}

impl Transport for ModbusTransport {
    fn open(&mut self) -> AppResult<()> {
        self.connect()
    }

    fn is_open(&self) -> bool {
        self.ctx.is_some()
    }

    fn write_bytes(&mut self, _bytes: &[u8]) -> AppResult<()> {
        Err(ConsoleError::TransportUnsupported(
            "raw byte write on a modbus endpoint",
        ))
    }

    fn read_byte(&mut self) -> AppResult<Option<u8>> {
        Err(ConsoleError::TransportUnsupported(
            "raw byte read on a modbus endpoint",
        ))
    }

    fn read_input_registers(&mut self, addr: u16, count: u16) -> AppResult<Option<Vec<u16>>> {
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| ConsoleError::PortNotOpen(self.address.clone()))?;
        match ctx.read_input_registers(addr, count) {
            Ok(Ok(words)) => Ok(Some(words)),
            Ok(Err(exception)) => {
                warn!(
                    "modbus '{}': exception {} reading {} registers at {}",
                    self.address, exception, count, addr
                );
                Ok(None)
            }
            Err(e) => {
                warn!(
                    "modbus '{}': read of {} registers at {} failed: {}",
                    self.address, count, addr, e
                );
                Ok(None)
            }
        }
    }

    fn write_registers(&mut self, addr: u16, words: &[u16]) -> AppResult<()> {
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| ConsoleError::PortNotOpen(self.address.clone()))?;
        match ctx.write_multiple_registers(addr, words) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(exception)) => Err(ConsoleError::Transport(format!(
                "modbus '{}': exception {} writing registers at {}",
                self.address, exception, addr
            ))),
            Err(e) => Err(ConsoleError::Transport(format!(
                "modbus '{}': register write at {} failed: {}",
                self.address, addr, e
            ))),
        }
    }

    fn close(&mut self) {
        if self.ctx.take().is_some() {
            debug!("modbus endpoint '{}' closed", self.address);
        }
    }
}
