//! Serial transport for RS-232/USB-serial devices.

use crate::error::{AppResult, ConsoleError};
use crate::transport::Transport;
use log::debug;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;

/// Blocking serial transport wrapping the `serialport` crate.
///
/// The framed-ASCII decoder reads one character at a time, so the port's own
/// read timeout is kept short; the decoder's character budget bounds the
/// overall attempt.
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    read_timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Create an unopened transport; call [`SerialTransport::open`] before use.
    pub fn new(path: &str, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            path: path.to_string(),
            baud_rate,
            read_timeout,
            port: None,
        }
    }

    fn open_port(&mut self) -> AppResult<()> {
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| {
                ConsoleError::Transport(format!(
                    "failed to open serial port '{}' at {} baud: {}",
                    self.path, self.baud_rate, e
                ))
            })?;
        debug!("serial port '{}' opened at {} baud", self.path, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> AppResult<()> {
        self.open_port()
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ConsoleError::PortNotOpen(self.path.clone()))?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_byte(&mut self) -> AppResult<Option<u8>> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ConsoleError::PortNotOpen(self.path.clone()))?;
        let mut buffer = [0u8; 1];
        match port.read(&mut buffer) {
            Ok(1) => Ok(Some(buffer[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_input_registers(&mut self, _addr: u16, _count: u16) -> AppResult<Option<Vec<u16>>> {
        Err(ConsoleError::TransportUnsupported(
            "register read on a serial line",
        ))
    }

    fn write_registers(&mut self, _addr: u16, _words: &[u16]) -> AppResult<()> {
        Err(ConsoleError::TransportUnsupported(
            "register write on a serial line",
        ))
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("serial port '{}' closed", self.path);
        }
    }
}
