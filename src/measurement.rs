//! Measurement samples and the push interfaces towards external consumers.
//!
//! The display layer, the measurement-file writer and anything else living
//! outside this crate receive decoded values through [`MeasurementSink`] and
//! operator-readable lines through [`ActivityLog`]. Consumers must tolerate
//! NaN values: a NaN means "this cycle produced no data", never "stale".

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::broadcast;

/// One x-axis sample: wall-clock time plus seconds since console start.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub elapsed_secs: f64,
}

/// One completed read pushed downstream.
#[derive(Debug, Clone)]
pub struct MeasurementBatch {
    pub device: String,
    pub values: HashMap<String, f64>,
    pub sample: Sample,
}

/// Clock producing the shared x-axis for every device.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    start: Instant,
}

impl RunClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn sample(&self) -> Sample {
        Sample {
            timestamp: Utc::now(),
            elapsed_secs: self.start.elapsed().as_secs_f64(),
        }
    }
}

impl Default for RunClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Push interface invoked once per completed read.
pub trait MeasurementSink: Send + Sync {
    fn push_result(&self, batch: MeasurementBatch);
}

/// Human-readable activity log the operator reconstructs events from.
pub trait ActivityLog: Send + Sync {
    fn append(&self, line: &str);
}

/// Sink broadcasting batches to any number of subscribers (display, file
/// writer). Lagging or absent subscribers never block a sampler.
pub struct BroadcastSink {
    sender: broadcast::Sender<MeasurementBatch>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<MeasurementBatch>) {
        let (sender, receiver) = broadcast::channel(capacity);
        (Self { sender }, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeasurementBatch> {
        self.sender.subscribe()
    }
}

impl MeasurementSink for BroadcastSink {
    fn push_result(&self, batch: MeasurementBatch) {
        // A send error only means nobody is listening right now.
        let _ = self.sender.send(batch);
    }
}

/// Activity log forwarding to the `log` facade under its own target.
pub struct LogActivity;

impl ActivityLog for LogActivity {
    fn append(&self, line: &str) {
        info!(target: "activity", "{line}");
    }
}

/// Test helper collecting pushed batches.
#[derive(Default)]
pub struct CollectingSink {
    batches: std::sync::Mutex<Vec<MeasurementBatch>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<MeasurementBatch> {
        match self.batches.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MeasurementSink for CollectingSink {
    fn push_result(&self, batch: MeasurementBatch) {
        if let Ok(mut batches) = self.batches.lock() {
            batches.push(batch);
        }
    }
}

/// Test helper collecting activity lines.
#[derive(Default)]
pub struct CollectingLog {
    lines: std::sync::Mutex<Vec<String>>,
}

impl CollectingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ActivityLog for CollectingLog {
    fn append(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_elapsed_is_monotonic() {
        let clock = RunClock::new();
        let first = clock.sample();
        let second = clock.sample();
        assert!(second.elapsed_secs >= first.elapsed_secs);
    }

    #[test]
    fn broadcast_sink_delivers_to_subscriber() {
        let (sink, mut rx) = BroadcastSink::new(8);
        sink.push_result(MeasurementBatch {
            device: "heater".into(),
            values: HashMap::from([("T".to_string(), 21.5)]),
            sample: RunClock::new().sample(),
        });
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.device, "heater");
        assert_eq!(batch.values["T"], 21.5);
    }

    #[test]
    fn push_without_subscribers_does_not_panic() {
        let (sink, rx) = BroadcastSink::new(8);
        drop(rx);
        sink.push_result(MeasurementBatch {
            device: "heater".into(),
            values: HashMap::new(),
            sample: RunClock::new().sample(),
        });
    }
}
