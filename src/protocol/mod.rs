//! Wire-protocol decoders.
//!
//! Each device speaks exactly one protocol, chosen from configuration when the
//! device is constructed — never re-dispatched by name inside the sampling
//! loop. A decoder owns the device's addressing (field indices or register
//! blocks) and turns one transport exchange into a [`DecodedFrame`].
//!
//! All failure paths fill every mapped measurement with NaN instead of leaving
//! values stale, so downstream consumers can tell "no new data" from "last
//! known value".

pub mod framed_ascii;
pub mod modbus_block;
pub mod status_bits;

pub use framed_ascii::FramedAsciiDecoder;
pub use modbus_block::{
    float_to_registers, registers_to_float, ModbusBlockDecoder, RegisterBlock, StatusField,
};

use crate::config::ProtocolConfig;
use crate::device::PendingWrite;
use crate::transport::Transport;

/// Transient result of one decode attempt; consumed immediately into the
/// device's value map.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Named measurements in decoder order
    pub values: Vec<(String, f64)>,
    /// False when the cycle is a read failure (values are NaN/sentinel fills)
    pub ok: bool,
}

impl DecodedFrame {
    pub fn success(values: Vec<(String, f64)>) -> Self {
        Self { values, ok: true }
    }

    /// All mapped names set to NaN.
    pub fn failure<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: names.into_iter().map(|n| (n.into(), f64::NAN)).collect(),
            ok: false,
        }
    }
}

/// One wire protocol: a read exchange plus the matching setpoint-write
/// encoding.
pub trait ProtocolDecoder: Send {
    /// Perform one full read exchange and decode the response.
    fn sample(&self, transport: &mut dyn Transport) -> DecodedFrame;

    /// Encode and send the drained write intents; returns how many were
    /// applied. Individual write failures are logged, not propagated — the
    /// next cycle simply sees the flag re-requested or not.
    fn apply_writes(&self, transport: &mut dyn Transport, writes: &[PendingWrite]) -> usize;

    /// Every measurement name this decoder can produce.
    fn measurement_names(&self) -> Vec<String>;
}

/// Build the decoder for a device, fixing protocol choice at construction.
pub fn build_decoder(
    device_id: &str,
    protocol: &ProtocolConfig,
    precision: u32,
) -> Box<dyn ProtocolDecoder> {
    match protocol {
        ProtocolConfig::FramedAscii {
            query,
            expected_fields,
            fields,
            retry_limit,
        } => Box::new(FramedAsciiDecoder::new(
            device_id,
            query,
            *expected_fields,
            fields
                .iter()
                .map(|m| (m.index, m.name.clone()))
                .collect(),
            precision,
            *retry_limit,
        )),
        ProtocolConfig::Modbus {
            blocks,
            write_registers,
        } => Box::new(ModbusBlockDecoder::new(
            device_id,
            blocks
                .iter()
                .map(|b| RegisterBlock {
                    name: b.name.clone(),
                    start: b.start,
                    floats: b.floats.clone(),
                    status: b
                        .status
                        .iter()
                        .map(|s| StatusField {
                            name: s.name.clone(),
                            sentinel: s.sentinel,
                            bits: s.bits.iter().map(|f| (f.bit, f.name.clone())).collect(),
                        })
                        .collect(),
                })
                .collect(),
            precision,
            write_registers.clone(),
        )),
    }
}

/// Round to a fixed number of decimal places.
pub(crate) fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_frame_is_all_nan() {
        let frame = DecodedFrame::failure(["a", "b"]);
        assert!(!frame.ok);
        assert_eq!(frame.values.len(), 2);
        assert!(frame.values.iter().all(|(_, v)| v.is_nan()));
    }

    #[test]
    fn rounding_keeps_requested_digits() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(1.2377, 3), 1.238);
        assert_eq!(round_to(881.6, 0), 882.0);
    }
}
