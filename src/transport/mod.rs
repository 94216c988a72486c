//! Transport seam between samplers and the physical links.
//!
//! A [`Transport`] is one already-opened communication handle: a serial line,
//! a Modbus-TCP context, or an in-memory mock. The trait is deliberately
//! blocking — sampling cycles run on the blocking pool and hold their port's
//! lock for the full write-then-read sequence, so there is nothing to await
//! here.
//!
//! Byte-level access serves the framed-ASCII protocol, register-level access
//! serves Modbus; a transport that does not speak one side returns
//! `TransportUnsupported` so a misconfigured device fails loudly instead of
//! silently reading nothing.

mod mock;
mod modbus;
mod serial;

pub use mock::{MockTransport, PortEvent};
pub use modbus::ModbusTransport;
pub use serial::SerialTransport;

use crate::error::AppResult;

/// One physical communication handle.
///
/// Read methods return `Ok(None)` when the link produced no data this attempt
/// (timeout, empty response, device silent); the decoders turn that into NaN
/// substitution locally. `Err` is reserved for misuse, like register access on
/// a serial line.
pub trait Transport: Send {
    /// Open the underlying handle. Runs on the blocking pool at startup; a
    /// failure leaves the transport closed and the owning samplers skipping
    /// their cycles with the closed-port warning policy.
    fn open(&mut self) -> AppResult<()>;

    /// Whether the underlying handle is open and usable.
    fn is_open(&self) -> bool;

    /// Write raw bytes (framed-ASCII queries and commands).
    fn write_bytes(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Read a single byte, `None` on timeout.
    fn read_byte(&mut self) -> AppResult<Option<u8>>;

    /// Read a contiguous input-register block, `None` when the device did not
    /// answer.
    fn read_input_registers(&mut self, addr: u16, count: u16) -> AppResult<Option<Vec<u16>>>;

    /// Write a holding-register run (setpoints).
    fn write_registers(&mut self, addr: u16, words: &[u16]) -> AppResult<()>;

    /// Close the handle; subsequent cycles see `is_open() == false`.
    fn close(&mut self);
}
