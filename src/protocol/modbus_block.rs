//! Modbus register-block decoder.
//!
//! The gas/vacuum monitoring units expose their measurements as contiguous
//! input-register blocks: IEEE-754 single-precision floats packed big-endian
//! into register pairs, followed by plain 16-bit status words. Which blocks a
//! device carries differs between hardware generations, so the block list is
//! per-device configuration, not a protocol constant.

use crate::device::PendingWrite;
use crate::protocol::{round_to, DecodedFrame, ProtocolDecoder};
use crate::transport::Transport;
use log::warn;
use std::collections::HashMap;

/// A status word's name and the sentinel substituted when the device does not
/// answer. Different word semantics place the interface-error flag on
/// different bits, so the sentinel is explicit per field.
///
/// `bits` surfaces selected bits of the word as named 0/1 measurements, via
/// the shared [`status_bits`](crate::protocol::status_bits) codec.
#[derive(Debug, Clone)]
pub struct StatusField {
    pub name: String,
    pub sentinel: u16,
    pub bits: Vec<(usize, String)>,
}

/// One contiguous input-register block: `2 * floats.len()` registers of float
/// pairs followed by one register per status word.
#[derive(Debug, Clone)]
pub struct RegisterBlock {
    pub name: String,
    pub start: u16,
    pub floats: Vec<String>,
    pub status: Vec<StatusField>,
}

impl RegisterBlock {
    fn register_count(&self) -> u16 {
        (2 * self.floats.len() + self.status.len()) as u16
    }
}

/// Combine two big-endian registers into an `f32`.
pub fn registers_to_float(hi: u16, lo: u16) -> f32 {
    f32::from_bits(((hi as u32) << 16) | lo as u32)
}

/// Split an `f32` into its two big-endian registers.
pub fn float_to_registers(value: f32) -> [u16; 2] {
    let bits = value.to_bits();
    [(bits >> 16) as u16, bits as u16]
}

/// Decoder reading one or more named register blocks per cycle.
pub struct ModbusBlockDecoder {
    device_id: String,
    blocks: Vec<RegisterBlock>,
    precision: u32,
    /// Holding-register address per writable value name
    write_registers: HashMap<String, u16>,
}

impl ModbusBlockDecoder {
    pub fn new(
        device_id: &str,
        blocks: Vec<RegisterBlock>,
        precision: u32,
        write_registers: HashMap<String, u16>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            blocks,
            precision,
            write_registers,
        }
    }

    /// NaN floats plus per-field sentinel status words for a silent block.
    fn fill_absent(&self, block: &RegisterBlock, values: &mut Vec<(String, f64)>) {
        for name in &block.floats {
            values.push((name.clone(), f64::NAN));
        }
        for status in &block.status {
            values.push((status.name.clone(), status.sentinel as f64));
            for (_, flag_name) in &status.bits {
                values.push((flag_name.clone(), f64::NAN));
            }
        }
    }

    fn decode_block(
        &self,
        block: &RegisterBlock,
        words: &[u16],
        values: &mut Vec<(String, f64)>,
    ) {
        for (i, name) in block.floats.iter().enumerate() {
            let raw = registers_to_float(words[2 * i], words[2 * i + 1]);
            if raw.is_finite() {
                values.push((name.clone(), round_to(raw as f64, self.precision)));
            } else {
                // One corrupt field must not invalidate the whole block.
                warn!(
                    "{}: block '{}' field '{}' did not decode to a finite float",
                    self.device_id, block.name, name
                );
                values.push((name.clone(), f64::NAN));
            }
        }
        let status_base = 2 * block.floats.len();
        for (j, status) in block.status.iter().enumerate() {
            let word = words[status_base + j];
            values.push((status.name.clone(), word as f64));
            if !status.bits.is_empty() {
                let decoded = crate::protocol::status_bits::decode(word as u32);
                for (bit, flag_name) in &status.bits {
                    let set = crate::protocol::status_bits::bit(&decoded, *bit);
                    values.push((flag_name.clone(), if set { 1.0 } else { 0.0 }));
                }
            }
        }
    }
}

impl ProtocolDecoder for ModbusBlockDecoder {
    fn sample(&self, transport: &mut dyn Transport) -> DecodedFrame {
        let mut values = Vec::new();
        let mut ok = true;
        for block in &self.blocks {
            let count = block.register_count();
            match transport.read_input_registers(block.start, count) {
                Ok(Some(words)) if words.len() == count as usize => {
                    self.decode_block(block, &words, &mut values);
                }
                Ok(Some(words)) => {
                    warn!(
                        "{}: block '{}' returned {} registers, expected {}",
                        self.device_id,
                        block.name,
                        words.len(),
                        count
                    );
                    self.fill_absent(block, &mut values);
                    ok = false;
                }
                Ok(None) => {
                    warn!(
                        "{}: block '{}' read returned no data",
                        self.device_id, block.name
                    );
                    self.fill_absent(block, &mut values);
                    ok = false;
                }
                Err(e) => {
                    warn!(
                        "{}: block '{}' read failed: {}",
                        self.device_id, block.name, e
                    );
                    self.fill_absent(block, &mut values);
                    ok = false;
                }
            }
        }
        DecodedFrame { values, ok }
    }

    fn apply_writes(&self, transport: &mut dyn Transport, writes: &[PendingWrite]) -> usize {
        let mut applied = 0;
        for write in writes {
            let Some(&addr) = self.write_registers.get(&write.name) else {
                warn!(
                    "{}: no holding register mapped for '{}'",
                    self.device_id, write.name
                );
                continue;
            };
            let words: Vec<u16> = match write.value {
                Some(value) => float_to_registers(value as f32).to_vec(),
                // Bare command flags write 1 into their register.
                None => vec![1],
            };
            match transport.write_registers(addr, &words) {
                Ok(()) => applied += 1,
                Err(e) => warn!(
                    "{}: write of '{}' at {} failed: {}",
                    self.device_id, write.name, addr, e
                ),
            }
        }
        applied
    }

    fn measurement_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for block in &self.blocks {
            names.extend(block.floats.iter().cloned());
            for status in &block.status {
                names.push(status.name.clone());
                names.extend(status.bits.iter().map(|(_, name)| name.clone()));
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, PortEvent};

    fn gas_block() -> RegisterBlock {
        RegisterBlock {
            name: "pressures".into(),
            start: 0,
            floats: vec!["p_chamber".into(), "p_forearm".into()],
            status: vec![
                StatusField {
                    name: "unit_status".into(),
                    sentinel: 64,
                    bits: vec![],
                },
                StatusField {
                    name: "valve_inlet".into(),
                    sentinel: 1024,
                    bits: vec![],
                },
            ],
        }
    }

    fn decoder(blocks: Vec<RegisterBlock>) -> ModbusBlockDecoder {
        ModbusBlockDecoder::new("gas_monitor", blocks, 3, HashMap::new())
    }

    #[test]
    fn float_register_round_trip_preserves_bit_pattern() {
        for value in [0.0f32, 1.5, -273.15, 1013.25, f32::MIN_POSITIVE] {
            let [hi, lo] = float_to_registers(value);
            assert_eq!(registers_to_float(hi, lo).to_bits(), value.to_bits());
        }
    }

    #[test]
    fn decodes_floats_and_status_words() {
        let [hi1, lo1] = float_to_registers(1013.25);
        let [hi2, lo2] = float_to_registers(0.5);
        let mut mock = MockTransport::new()
            .with_register_block(0, vec![hi1, lo1, hi2, lo2, 3, 17]);
        let frame = decoder(vec![gas_block()]).sample(&mut mock);
        assert!(frame.ok);
        assert_eq!(frame.values[0], ("p_chamber".into(), 1013.25));
        assert_eq!(frame.values[1], ("p_forearm".into(), 0.5));
        assert_eq!(frame.values[2], ("unit_status".into(), 3.0));
        assert_eq!(frame.values[3], ("valve_inlet".into(), 17.0));
    }

    #[test]
    fn silent_device_fills_nan_and_per_field_sentinels() {
        let mut mock = MockTransport::new().with_register_response(None);
        let frame = decoder(vec![gas_block()]).sample(&mut mock);
        assert!(!frame.ok);
        assert!(frame.values[0].1.is_nan());
        assert!(frame.values[1].1.is_nan());
        assert_eq!(frame.values[2], ("unit_status".into(), 64.0));
        assert_eq!(frame.values[3], ("valve_inlet".into(), 1024.0));
    }

    #[test]
    fn corrupt_field_does_not_invalidate_block() {
        let [hi, lo] = float_to_registers(2.25);
        // First float slot holds an infinity bit pattern.
        let [bad_hi, bad_lo] = float_to_registers(f32::INFINITY);
        let mut mock = MockTransport::new()
            .with_register_block(0, vec![bad_hi, bad_lo, hi, lo, 0, 0]);
        let frame = decoder(vec![gas_block()]).sample(&mut mock);
        assert!(frame.ok);
        assert!(frame.values[0].1.is_nan());
        assert_eq!(frame.values[1].1, 2.25);
    }

    #[test]
    fn short_response_counts_as_absent() {
        let mut mock = MockTransport::new().with_register_response(Some(vec![1, 2]));
        let frame = decoder(vec![gas_block()]).sample(&mut mock);
        assert!(!frame.ok);
        assert!(frame.values[0].1.is_nan());
        assert_eq!(frame.values[2].1, 64.0);
    }

    #[test]
    fn status_bits_surface_as_named_flags() {
        let block = RegisterBlock {
            name: "axis".into(),
            start: 0,
            floats: vec![],
            status: vec![StatusField {
                name: "axis_status".into(),
                sentinel: 64,
                bits: vec![(0, "enabled".into()), (5, "referenced".into())],
            }],
        };
        let mut mock = MockTransport::new().with_register_block(0, vec![0b10_0001]);
        let frame = decoder(vec![block.clone()]).sample(&mut mock);
        assert!(frame.ok);
        assert_eq!(frame.values[0], ("axis_status".into(), 33.0));
        assert_eq!(frame.values[1], ("enabled".into(), 1.0));
        assert_eq!(frame.values[2], ("referenced".into(), 1.0));

        // Silent device: the word gets its sentinel, the flags go NaN.
        let mut silent = MockTransport::new().with_register_response(None);
        let frame = decoder(vec![block]).sample(&mut silent);
        assert_eq!(frame.values[0].1, 64.0);
        assert!(frame.values[1].1.is_nan());
        assert!(frame.values[2].1.is_nan());
    }

    #[test]
    fn block_set_is_per_device_capability() {
        // A "version 2" unit reads a second block; the decoder just walks
        // whatever list it was built with.
        let extra = RegisterBlock {
            name: "temperatures".into(),
            start: 20,
            floats: vec!["t_cell".into()],
            status: vec![],
        };
        let [hi1, lo1] = float_to_registers(1.0);
        let [hi2, lo2] = float_to_registers(0.25);
        let [hi3, lo3] = float_to_registers(42.0);
        let mut mock = MockTransport::new()
            .with_register_block(0, vec![hi1, lo1, hi2, lo2, 0, 0])
            .with_register_block(20, vec![hi3, lo3]);
        let frame = decoder(vec![gas_block(), extra]).sample(&mut mock);
        assert!(frame.ok);
        assert_eq!(frame.values.len(), 5);
        assert_eq!(frame.values[4], ("t_cell".into(), 42.0));
    }

    #[test]
    fn setpoint_write_lands_on_mapped_register() {
        let mut writes = HashMap::new();
        writes.insert("flow_sp".to_string(), 100u16);
        let dec = ModbusBlockDecoder::new("gas_monitor", vec![gas_block()], 2, writes);
        let mock = MockTransport::new();
        let events = mock.events();
        let mut mock = mock;
        let applied = dec.apply_writes(
            &mut mock,
            &[PendingWrite {
                name: "flow_sp".into(),
                value: Some(12.5),
            }],
        );
        assert_eq!(applied, 1);
        let recorded = events.lock().unwrap();
        let [hi, lo] = float_to_registers(12.5);
        assert_eq!(
            recorded[0],
            PortEvent::RegisterWrite {
                addr: 100,
                words: vec![hi, lo]
            }
        );
    }
}
