//! Per-device sampling worker.
//!
//! Every device gets one sampler running on the blocking pool. The dispatch
//! tick is the shared *reaction* rate: on each tick the sampler applies any
//! pending writes, but it only performs an actual device read when the
//! device's own poll interval has elapsed. This two-tier cadence lets a fast
//! gas monitor and a slow furnace axis share one scheduler without
//! over-polling either.
//!
//! The port lock is held for the whole cycle (write attempt, optional read,
//! decode), so port-mates never interleave wire traffic.

use crate::device::{SharedDevice, SharedIntent};
use crate::dispatcher::DispatchMsg;
use crate::measurement::{ActivityLog, MeasurementBatch, MeasurementSink, RunClock};
use crate::protocol::ProtocolDecoder;
use crate::registry::SharedPort;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

pub struct Sampler {
    id: String,
    device: SharedDevice,
    intent: SharedIntent,
    port: Arc<SharedPort>,
    decoder: Box<dyn ProtocolDecoder>,
    sink: Arc<dyn MeasurementSink>,
    activity: Arc<dyn ActivityLog>,
    clock: RunClock,
    /// Consecutive closed-port cycles after which warnings are suppressed
    warn_threshold: u32,
    last_read: Option<Instant>,
    closed_cycles: u32,
}

impl Sampler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: SharedDevice,
        intent: SharedIntent,
        port: Arc<SharedPort>,
        decoder: Box<dyn ProtocolDecoder>,
        sink: Arc<dyn MeasurementSink>,
        activity: Arc<dyn ActivityLog>,
        clock: RunClock,
        warn_threshold: u32,
    ) -> Self {
        let id = match device.lock() {
            Ok(guard) => guard.id().to_string(),
            Err(poisoned) => poisoned.into_inner().id().to_string(),
        };
        Self {
            id,
            device,
            intent,
            port,
            decoder,
            sink,
            activity,
            clock,
            warn_threshold,
            last_read: None,
            closed_cycles: 0,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.id
    }

    /// Worker loop: one cycle per dispatch tick until `Stop` or the
    /// dispatcher goes away. Runs on the blocking pool.
    pub fn run(mut self, mut ticks: broadcast::Receiver<DispatchMsg>) {
        loop {
            match ticks.blocking_recv() {
                Ok(DispatchMsg::Tick) => self.cycle(),
                Ok(DispatchMsg::Stop) => break,
                // Missed ticks are not made up; the next one samples afresh.
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("{}: lagged {} dispatch ticks", self.id, missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("{}: sampler stopped", self.id);
    }

    /// One sampling cycle: acquire the port, write, maybe read, decode, push.
    pub fn cycle(&mut self) {
        if self.port.is_failed() {
            return;
        }

        let mut transport = self.port.lock_blocking();
        if !transport.is_open() {
            drop(transport);
            self.note_closed_port();
            return;
        }
        if self.closed_cycles >= self.warn_threshold {
            warn!("{}: port '{}' recovered", self.id, self.port.id());
        }
        self.closed_cycles = 0;

        // Writes are attempted on every dispatch tick.
        let writes = {
            let mut intent = match self.intent.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            intent.drain()
        };
        if !writes.is_empty() {
            let applied = self.decoder.apply_writes(&mut **transport, &writes);
            debug!("{}: applied {}/{} pending writes", self.id, applied, writes.len());
        }

        // Reads only when the device's own interval elapsed; 0 disables them.
        let interval = {
            let device = match self.device.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            device.poll_interval()
        };
        let due = match interval {
            None => false,
            Some(interval) => self
                .last_read
                .map_or(true, |at| at.elapsed() >= interval),
        };
        if !due {
            return;
        }

        let frame = self.decoder.sample(&mut **transport);
        drop(transport);

        let values = {
            let mut device = match self.device.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            device.apply_frame(&frame.values);
            device.values().clone()
        };
        self.sink.push_result(MeasurementBatch {
            device: self.id.clone(),
            values,
            sample: self.clock.sample(),
        });

        if frame.ok {
            self.last_read = Some(Instant::now());
        } else {
            self.activity
                .append(&format!("{}: read failed, measurements set to NaN", self.id));
        }
    }

    fn note_closed_port(&mut self) {
        self.closed_cycles += 1;
        if self.closed_cycles < self.warn_threshold {
            warn!(
                "{}: port '{}' is not open, skipping cycle",
                self.id,
                self.port.id()
            );
        } else if self.closed_cycles == self.warn_threshold {
            warn!(
                "{}: port '{}' still not open after {} cycles, suppressing further warnings",
                self.id,
                self.port.id(),
                self.closed_cycles
            );
        }
    }
}
