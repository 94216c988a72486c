//! Dispatch tick fan-out and lifecycle control.
//!
//! One fixed-interval tick source broadcasts "run one sampling cycle" to every
//! sampler. The tick rate is the shared reaction rate — each sampler gates its
//! actual device reads on its own poll interval (see [`crate::sampler`]).
//!
//! Shutdown follows a fixed sequence: stop the tick source first, issue one
//! final dispatch so in-flight writes and safety stops are applied, then wait
//! a bounded time for every worker to confirm by exiting. Workers that do not
//! confirm are abandoned: their ports are latched failed so the already
//! stopping cycles short-circuit, and transports are closed anyway. Shutdown
//! never hangs on a wedged device.

use crate::error::{AppResult, ConsoleError};
use crate::registry::PortRegistry;
use crate::sampler::Sampler;
use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

/// Broadcast message consumed by every sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMsg {
    /// Run one sampling cycle
    Tick,
    /// Finish the current cycle and exit
    Stop,
}

const DISPATCH_CHANNEL_CAPACITY: usize = 64;

pub struct Dispatcher {
    tick_interval: Duration,
    shutdown_timeout: Duration,
    sender: broadcast::Sender<DispatchMsg>,
    registry: Arc<PortRegistry>,
    workers: Vec<(String, JoinHandle<()>)>,
    ticker: Option<JoinHandle<()>>,
    stop_tick: Option<watch::Sender<bool>>,
}

impl Dispatcher {
    pub fn new(
        tick_interval: Duration,
        shutdown_timeout: Duration,
        registry: Arc<PortRegistry>,
    ) -> Self {
        let (sender, _) = broadcast::channel(DISPATCH_CHANNEL_CAPACITY);
        Self {
            tick_interval,
            shutdown_timeout,
            sender,
            registry,
            workers: Vec::new(),
            ticker: None,
            stop_tick: None,
        }
    }

    /// Move a sampler onto the blocking pool, subscribed to the tick stream.
    pub fn spawn_sampler(&mut self, sampler: Sampler) {
        let ticks = self.sender.subscribe();
        let id = sampler.device_id().to_string();
        debug!("starting sampler for '{}'", id);
        let handle = tokio::task::spawn_blocking(move || sampler.run(ticks));
        self.workers.push((id, handle));
    }

    /// Start the tick source. Idempotent.
    pub fn start(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let sender = self.sender.clone();
        let tick_interval = self.tick_interval;
        self.stop_tick = Some(stop_tx);
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if sender.send(DispatchMsg::Tick).is_err() {
                            break;
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        }));
        info!(
            "dispatcher started, tick every {:?} for {} samplers",
            self.tick_interval,
            self.workers.len()
        );
    }

    /// Graceful shutdown with a bounded wait; see the module docs for the
    /// sequence. Returns [`ConsoleError::ShutdownTimeout`] when one or more
    /// samplers had to be abandoned — transports are closed either way.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        // Stop the tick source first so no new cycles are scheduled.
        if let Some(stop) = self.stop_tick.take() {
            let _ = stop.send(true);
        }
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.await;
        }

        let workers = std::mem::take(&mut self.workers);
        let mut timed_out = false;
        if !workers.is_empty() {
            // One final dispatch cycle so pending writes and safety stops are
            // applied, then the stop marker.
            let _ = self.sender.send(DispatchMsg::Tick);
            let _ = self.sender.send(DispatchMsg::Stop);

            let (ids, handles): (Vec<_>, Vec<_>) = workers.into_iter().unzip();
            match timeout(self.shutdown_timeout, join_all(handles)).await {
                Ok(results) => {
                    for (id, result) in ids.iter().zip(results) {
                        if result.is_err() {
                            warn!("sampler '{}' panicked before confirming its final cycle", id);
                        }
                    }
                    info!("all samplers confirmed their final cycle");
                }
                Err(_) => {
                    warn!(
                        "graceful stop not confirmed within {:?}, abandoning remaining cycles",
                        self.shutdown_timeout
                    );
                    self.registry.mark_all_failed();
                    timed_out = true;
                }
            }
        }

        self.registry.close_all();
        if timed_out {
            Err(ConsoleError::ShutdownTimeout)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tick_stream_reaches_subscribers() {
        let registry = Arc::new(PortRegistry::new());
        let mut dispatcher = Dispatcher::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
            registry,
        );
        let mut ticks = dispatcher.sender.subscribe();
        dispatcher.start();
        assert_eq!(ticks.recv().await.unwrap(), DispatchMsg::Tick);
        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_without_workers_is_immediate() {
        let registry = Arc::new(PortRegistry::new());
        let mut dispatcher = Dispatcher::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
            registry,
        );
        dispatcher.start();
        dispatcher.shutdown().await.unwrap();
        // Second call is a no-op.
        dispatcher.shutdown().await.unwrap();
    }
}
