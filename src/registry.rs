//! Shared-port registry.
//!
//! Several logical devices can be configured onto one physical link (two
//! furnace axes on one RS-485 line, heater and gas unit behind one Modbus
//! gateway). All I/O for such port-mates must serialize: the registry keeps
//! exactly one transport handle and exactly one lock per distinct port
//! identifier, created lazily on first reference and never re-created for the
//! lifetime of the process.
//!
//! A sampler holds its port's lock for the whole sampling cycle (write attempt
//! plus optional read plus decode), so a slow device delays its port-mates but
//! never corrupts their frames — the wire decoders are not reentrant-safe
//! against interleaved traffic.

use crate::transport::Transport;
use log::warn;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One physical port: the transport handle behind its single lock, plus the
/// failure latch the shutdown sequencer uses to short-circuit wedged cycles.
pub struct SharedPort {
    id: String,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    failed: AtomicBool,
}

impl SharedPort {
    fn new(id: &str, transport: Box<dyn Transport>) -> Self {
        Self {
            id: id.to_string(),
            transport: tokio::sync::Mutex::new(transport),
            failed: AtomicBool::new(false),
        }
    }

    /// Port identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Acquire the port for one full sampling cycle. Blocking-pool only.
    pub fn lock_blocking(&self) -> tokio::sync::MutexGuard<'_, Box<dyn Transport>> {
        self.transport.blocking_lock()
    }

    /// Async acquisition, used at connect/close time.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Box<dyn Transport>> {
        self.transport.lock().await
    }

    /// Mark the port unusable; samplers skip it from their next cycle on.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Registry mapping port identifiers to their shared handles.
///
/// Constructed once at startup and passed by shared ownership into every
/// sampler; there is no ambient global state.
#[derive(Default)]
pub struct PortRegistry {
    ports: Mutex<HashMap<String, Arc<SharedPort>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared handle for `id`, creating it from `open` on first
    /// reference. Later calls for the same identifier always return the same
    /// instance, whatever `open` would have produced.
    pub fn acquire<F>(&self, id: &str, open: F) -> Arc<SharedPort>
    where
        F: FnOnce() -> Box<dyn Transport>,
    {
        let mut ports = match self.ports.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            ports
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(SharedPort::new(id, open()))),
        )
    }

    /// Look up an existing handle without creating one.
    pub fn get(&self, id: &str) -> Option<Arc<SharedPort>> {
        let ports = match self.ports.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ports.get(id).cloned()
    }

    /// Registered handles, for connect/close sweeps.
    pub fn ports(&self) -> Vec<Arc<SharedPort>> {
        let ports = match self.ports.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ports.values().cloned().collect()
    }

    /// Latch every port failed, so already-stopping cycles short-circuit.
    pub fn mark_all_failed(&self) {
        for port in self.ports() {
            port.mark_failed();
        }
    }

    /// Close every transport that is not wedged.
    ///
    /// Uses `try_lock` on purpose: a port whose holder never finished its
    /// cycle must not stall process exit, it is left to the OS.
    pub fn close_all(&self) {
        for port in self.ports() {
            match port.transport.try_lock() {
                Ok(mut transport) => transport.close(),
                Err(_) => warn!(
                    "port '{}' still busy at shutdown, leaving its handle to the OS",
                    port.id()
                ),
            }
        }
    }
}
