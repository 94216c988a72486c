//! Framed-ASCII protocol decoder.
//!
//! The furnace control unit answers a one-character query with a single frame
//! of space-separated decimal fields bounded by `*` and `#`. The line is slow
//! and occasionally mid-frame when we start listening, so the reader works one
//! character at a time: a fresh `*` restarts accumulation (a stray earlier
//! partial frame must not corrupt the next one), and the character budget
//! grows across a few attempts before the whole exchange is retried from the
//! query.

use crate::device::PendingWrite;
use crate::error::AppResult;
use crate::protocol::{round_to, DecodedFrame, ProtocolDecoder};
use crate::transport::Transport;
use log::{debug, trace, warn};

const FRAME_START: char = '*';
const FRAME_END: char = '#';

/// Attempts to finish one frame with a growing character budget before the
/// query is re-sent.
const READ_ATTEMPTS: usize = 3;

/// Character budget for the first read attempt; doubled per retry.
const INITIAL_BUDGET: usize = 256;

/// Decoder for the `*<fields>#` framed ASCII protocol.
pub struct FramedAsciiDecoder {
    device_id: String,
    query: String,
    expected_fields: usize,
    /// (frame index, measurement name) in push order
    fields: Vec<(usize, String)>,
    precision: u32,
    retry_limit: usize,
}

impl FramedAsciiDecoder {
    pub fn new(
        device_id: &str,
        query: &str,
        expected_fields: usize,
        fields: Vec<(usize, String)>,
        precision: u32,
        retry_limit: usize,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            query: query.to_string(),
            expected_fields,
            fields,
            precision,
            retry_limit,
        }
    }

    fn failure(&self) -> DecodedFrame {
        DecodedFrame::failure(self.fields.iter().map(|(_, name)| name.clone()))
    }

    /// Accumulate characters until a frame terminator lands, the budget runs
    /// out too often, or the line goes quiet. Returns the raw frame including
    /// markers, or an empty string.
    fn read_raw(&self, transport: &mut dyn Transport) -> AppResult<String> {
        let mut budget = INITIAL_BUDGET;
        for attempt in 1..=READ_ATTEMPTS {
            let mut accumulated = String::new();
            let mut consumed = 0usize;
            while consumed < budget {
                match transport.read_byte()? {
                    Some(byte) => {
                        consumed += 1;
                        let ch = byte as char;
                        if ch == FRAME_START {
                            // Resynchronize: drop whatever partial frame we
                            // were holding and restart at this marker.
                            accumulated.clear();
                            accumulated.push(ch);
                        } else {
                            accumulated.push(ch);
                            if ch == FRAME_END {
                                return Ok(accumulated);
                            }
                        }
                    }
                    None => break,
                }
            }
            if consumed == 0 {
                // Line is quiet; re-reading without a fresh query is pointless.
                return Ok(String::new());
            }
            trace!(
                "{}: no terminator within {} chars (attempt {}/{})",
                self.device_id,
                budget,
                attempt,
                READ_ATTEMPTS
            );
            budget *= 2;
        }
        Ok(String::new())
    }

    fn decode_fields(&self, raw_fields: &[&str]) -> DecodedFrame {
        let mut values = Vec::with_capacity(self.fields.len());
        for (index, name) in &self.fields {
            let value = match raw_fields.get(*index).map(|raw| raw.parse::<f64>()) {
                Some(Ok(v)) => round_to(v, self.precision),
                Some(Err(_)) => {
                    warn!(
                        "{}: field '{}' is not numeric: '{}'",
                        self.device_id, name, raw_fields[*index]
                    );
                    f64::NAN
                }
                None => {
                    warn!(
                        "{}: field '{}' index {} outside the frame",
                        self.device_id, name, index
                    );
                    f64::NAN
                }
            };
            values.push((name.clone(), value));
        }
        DecodedFrame::success(values)
    }
}

impl ProtocolDecoder for FramedAsciiDecoder {
    fn sample(&self, transport: &mut dyn Transport) -> DecodedFrame {
        for attempt in 1..=self.retry_limit {
            // First try sends the bare token; retries add a terminator in case
            // the unit missed the unterminated one.
            let query = if attempt == 1 {
                self.query.clone()
            } else {
                format!("{}\r\n", self.query)
            };
            if let Err(e) = transport.write_bytes(query.as_bytes()) {
                warn!("{}: query write failed: {}", self.device_id, e);
                return self.failure();
            }

            let raw = match self.read_raw(transport) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("{}: read failed: {}", self.device_id, e);
                    return self.failure();
                }
            };

            if raw.len() >= 2 && raw.starts_with(FRAME_START) && raw.ends_with(FRAME_END) {
                let inner = &raw[1..raw.len() - 1];
                let fields: Vec<&str> = inner.split(' ').collect();
                if fields.len() != self.expected_fields {
                    warn!(
                        "{}: frame has {} fields, expected {}",
                        self.device_id,
                        fields.len(),
                        self.expected_fields
                    );
                    return self.failure();
                }
                return self.decode_fields(&fields);
            }

            debug!(
                "{}: empty or malformed frame (attempt {}/{})",
                self.device_id, attempt, self.retry_limit
            );
        }
        warn!(
            "{}: no valid frame after {} attempts",
            self.device_id, self.retry_limit
        );
        self.failure()
    }

    fn apply_writes(&self, transport: &mut dyn Transport, writes: &[PendingWrite]) -> usize {
        let mut applied = 0;
        for write in writes {
            let token = match write.value {
                Some(value) => format!(
                    "{}{}={:.*}\r",
                    self.query,
                    write.name,
                    self.precision as usize,
                    value
                ),
                None => format!("{}{}\r", self.query, write.name),
            };
            match transport.write_bytes(token.as_bytes()) {
                Ok(()) => applied += 1,
                Err(e) => warn!(
                    "{}: write of '{}' failed: {}",
                    self.device_id, write.name, e
                ),
            }
        }
        applied
    }

    fn measurement_names(&self) -> Vec<String> {
        self.fields.iter().map(|(_, name)| name.clone()).collect()
    }
}
