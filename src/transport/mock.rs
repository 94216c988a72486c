//! In-memory transport for tests and dry runs.

use crate::error::AppResult;
use crate::transport::Transport;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One observable I/O event on a mock port.
///
/// Tests use the event stream to assert that cycles from port-mates never
/// interleave: every `Write` must be followed by its own frame/register
/// traffic before another device's `Write` may appear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// Raw bytes written (query or command tokens)
    Write(String),
    /// A scripted frame was fully drained by byte reads
    FrameDrained,
    /// Input-register block read
    RegisterRead { addr: u16, count: u16 },
    /// Holding-register block written
    RegisterWrite { addr: u16, words: Vec<u16> },
}

/// Scriptable in-memory transport.
///
/// Serial side: canned replies keyed by query prefix are loaded into the read
/// buffer when a matching token is written. Modbus side: a static register map
/// serves repeatable block reads, with an ordered response queue layered on
/// top for one-shot scripting (including `None` for a silent device).
pub struct MockTransport {
    open: bool,
    rx: VecDeque<u8>,
    replies: Vec<(String, String)>,
    register_map: HashMap<u16, Vec<u16>>,
    register_responses: VecDeque<Option<Vec<u16>>>,
    op_delay: Duration,
    events: Arc<Mutex<Vec<PortEvent>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            open: true,
            rx: VecDeque::new(),
            replies: Vec::new(),
            register_map: HashMap::new(),
            register_responses: VecDeque::new(),
            op_delay: Duration::ZERO,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A transport that reports closed, for outage scenarios.
    pub fn closed() -> Self {
        let mut t = Self::new();
        t.open = false;
        t
    }

    /// Serve `reply` whenever a written token starts with `query`.
    pub fn with_reply(mut self, query: &str, reply: &str) -> Self {
        self.replies.push((query.to_string(), reply.to_string()));
        self
    }

    /// Serve `words` for every block read starting at `addr`.
    pub fn with_register_block(mut self, addr: u16, words: Vec<u16>) -> Self {
        self.register_map.insert(addr, words);
        self
    }

    /// Queue a one-shot block response; `None` plays a silent device.
    pub fn with_register_response(mut self, response: Option<Vec<u16>>) -> Self {
        self.register_responses.push_back(response);
        self
    }

    /// Sleep this long inside every I/O call; widens race windows and can
    /// simulate a wedged device.
    pub fn with_op_delay(mut self, delay: Duration) -> Self {
        self.op_delay = delay;
        self
    }

    /// Queue raw bytes for `read_byte` without a triggering write.
    pub fn queue_bytes(&mut self, bytes: &str) {
        self.rx.extend(bytes.bytes());
    }

    /// Handle onto the recorded event stream; clone before boxing the
    /// transport into a registry.
    pub fn events(&self) -> Arc<Mutex<Vec<PortEvent>>> {
        Arc::clone(&self.events)
    }

    fn record(&self, event: PortEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn pause(&self) {
        if !self.op_delay.is_zero() {
            std::thread::sleep(self.op_delay);
        }
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.pause();
        let written = String::from_utf8_lossy(bytes).to_string();
        self.record(PortEvent::Write(written.clone()));
        if let Some((_, reply)) = self
            .replies
            .iter()
            .find(|(query, _)| written.starts_with(query.as_str()))
        {
            self.rx.clear();
            self.rx.extend(reply.bytes());
        }
        Ok(())
    }

    fn read_byte(&mut self) -> AppResult<Option<u8>> {
        self.pause();
        match self.rx.pop_front() {
            Some(byte) => {
                if byte == b'#' {
                    self.record(PortEvent::FrameDrained);
                }
                Ok(Some(byte))
            }
            None => Ok(None),
        }
    }

    fn read_input_registers(&mut self, addr: u16, count: u16) -> AppResult<Option<Vec<u16>>> {
        self.pause();
        self.record(PortEvent::RegisterRead { addr, count });
        if let Some(words) = self.register_map.get(&addr) {
            return Ok(Some(words.clone()));
        }
        Ok(self.register_responses.pop_front().flatten())
    }

    fn write_registers(&mut self, addr: u16, words: &[u16]) -> AppResult<()> {
        self.pause();
        self.record(PortEvent::RegisterWrite {
            addr,
            words: words.to_vec(),
        });
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_is_loaded_on_matching_write() {
        let mut mock = MockTransport::new().with_reply("!", "*1 2#");
        mock.write_bytes(b"!").unwrap();
        let mut drained = String::new();
        while let Some(byte) = mock.read_byte().unwrap() {
            drained.push(byte as char);
        }
        assert_eq!(drained, "*1 2#");
    }

    #[test]
    fn silent_register_read_returns_none() {
        let mut mock = MockTransport::new().with_register_response(None);
        assert_eq!(mock.read_input_registers(0, 4).unwrap(), None);
        // Queue exhausted: still silent.
        assert_eq!(mock.read_input_registers(0, 4).unwrap(), None);
    }

    #[test]
    fn register_map_serves_repeatedly() {
        let mut mock = MockTransport::new().with_register_block(10, vec![1, 2, 3]);
        assert_eq!(mock.read_input_registers(10, 3).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(mock.read_input_registers(10, 3).unwrap(), Some(vec![1, 2, 3]));
    }
}
