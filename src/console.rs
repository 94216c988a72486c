//! The console facade.
//!
//! [`Console`] wires configuration into running machinery: it builds the port
//! registry, constructs every device with its decoder, hands one sampler per
//! device to the dispatcher, and exposes lifecycle plus the per-device control
//! surface (write intents, recipe start/stop, control-mode switching) that the
//! display layer drives.

use crate::config::{Config, PortKind};
use crate::device::{shared_pair, SharedDevice, SharedIntent};
use crate::dispatcher::Dispatcher;
use crate::error::{AppResult, ConsoleError};
use crate::measurement::{ActivityLog, MeasurementSink, RunClock};
use crate::protocol::build_decoder;
use crate::recipe::{RecipeEngine, StopReason};
use crate::registry::PortRegistry;
use crate::sampler::Sampler;
use crate::transport::{MockTransport, ModbusTransport, SerialTransport, Transport};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-device handles kept by the console.
pub struct DeviceHandles {
    pub device: SharedDevice,
    pub intent: SharedIntent,
    pub recipe: Option<Arc<RecipeEngine>>,
}

pub struct Console {
    registry: Arc<PortRegistry>,
    dispatcher: Dispatcher,
    devices: HashMap<String, DeviceHandles>,
}

fn build_transport(kind: &PortKind) -> Box<dyn Transport> {
    match kind {
        PortKind::Serial {
            path,
            baud_rate,
            read_timeout_ms,
        } => Box::new(SerialTransport::new(
            path,
            *baud_rate,
            std::time::Duration::from_millis(*read_timeout_ms),
        )),
        PortKind::ModbusTcp { address } => Box::new(ModbusTransport::new(address)),
        PortKind::Mock => Box::new(MockTransport::new()),
    }
}

impl Console {
    /// Validate the configuration and assemble registry, devices and
    /// samplers. Nothing is opened or started yet.
    pub fn new(
        config: Config,
        sink: Arc<dyn MeasurementSink>,
        activity: Arc<dyn ActivityLog>,
    ) -> AppResult<Self> {
        config.validate()?;

        let registry = Arc::new(PortRegistry::new());
        let clock = RunClock::new();
        let mut dispatcher = Dispatcher::new(
            config.dispatcher.tick_interval,
            config.dispatcher.shutdown_timeout,
            Arc::clone(&registry),
        );

        let port_kinds: HashMap<&str, &PortKind> = config
            .ports
            .iter()
            .map(|p| (p.id.as_str(), &p.kind))
            .collect();

        let mut devices = HashMap::new();
        for device_config in &config.devices {
            let kind = port_kinds
                .get(device_config.port.as_str())
                .copied()
                .ok_or_else(|| ConsoleError::UnknownPort(device_config.port.clone()))?;
            let port = registry.acquire(&device_config.port, || build_transport(kind));

            let (device, intent) = shared_pair(device_config);
            let decoder = build_decoder(
                &device_config.id,
                &device_config.protocol,
                device_config.precision,
            );
            let sampler = Sampler::new(
                Arc::clone(&device),
                Arc::clone(&intent),
                port,
                decoder,
                Arc::clone(&sink),
                Arc::clone(&activity),
                clock,
                config.dispatcher.port_warning_threshold,
            );
            dispatcher.spawn_sampler(sampler);

            let recipe = device_config.recipe.as_ref().map(|recipe_config| {
                Arc::new(RecipeEngine::new(
                    Arc::clone(&device),
                    Arc::clone(&intent),
                    Arc::clone(&activity),
                    recipe_config.clone(),
                ))
            });
            devices.insert(
                device_config.id.clone(),
                DeviceHandles {
                    device,
                    intent,
                    recipe,
                },
            );
        }

        info!(
            "console assembled: {} devices on {} ports",
            devices.len(),
            registry.ports().len()
        );
        Ok(Self {
            registry,
            dispatcher,
            devices,
        })
    }

    /// Open every transport on the blocking pool. A port that fails to open
    /// stays closed; its samplers skip cycles with the usual warning policy
    /// until it is reachable.
    pub async fn connect(&self) -> AppResult<()> {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || {
            for port in registry.ports() {
                let mut transport = port.lock_blocking();
                if transport.is_open() {
                    continue;
                }
                if let Err(e) = transport.open() {
                    warn!("port '{}' failed to open: {}", port.id(), e);
                }
            }
        })
        .await
        .map_err(|e| ConsoleError::Transport(format!("connect task failed: {e}")))?;
        Ok(())
    }

    /// Start the dispatch tick.
    pub fn start(&mut self) {
        self.dispatcher.start();
    }

    /// Graceful shutdown; never hangs past the configured timeout. Safe to
    /// call more than once.
    pub async fn shutdown(&mut self) {
        match self.dispatcher.shutdown().await {
            Ok(()) => {}
            Err(e) => warn!("{e}"),
        }
    }

    pub fn device(&self, id: &str) -> Option<SharedDevice> {
        self.devices.get(id).map(|h| Arc::clone(&h.device))
    }

    /// The write-intent record the display layer mutates for this device.
    pub fn intent(&self, id: &str) -> Option<SharedIntent> {
        self.devices.get(id).map(|h| Arc::clone(&h.intent))
    }

    pub fn recipe(&self, id: &str) -> Option<Arc<RecipeEngine>> {
        self.devices.get(id).and_then(|h| h.recipe.clone())
    }

    /// Start the configured recipe on a device.
    pub fn start_recipe(&self, id: &str) -> AppResult<()> {
        let handles = self
            .devices
            .get(id)
            .ok_or_else(|| ConsoleError::UnknownDevice(id.to_string()))?;
        let engine = handles
            .recipe
            .as_ref()
            .ok_or(crate::recipe::RecipeError::NoRecipeSelected)?;
        engine.start()?;
        Ok(())
    }

    /// Stop a running recipe on a device; no-op when nothing runs.
    pub fn stop_recipe(&self, id: &str, reason: StopReason) -> AppResult<()> {
        let handles = self
            .devices
            .get(id)
            .ok_or_else(|| ConsoleError::UnknownDevice(id.to_string()))?;
        if let Some(engine) = &handles.recipe {
            engine.stop(reason);
        }
        Ok(())
    }

    /// Switch a device into or out of external-controller-driven mode.
    /// A running recipe is aborted: its validation was done against the
    /// other limit pair.
    pub fn set_external_mode(&self, id: &str, on: bool) -> AppResult<()> {
        let handles = self
            .devices
            .get(id)
            .ok_or_else(|| ConsoleError::UnknownDevice(id.to_string()))?;
        {
            let mut device = match handles.device.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            device.set_external_mode(on);
        }
        if let Some(engine) = &handles.recipe {
            if engine.is_running() {
                engine.stop(StopReason::ModeSwitch);
            }
        }
        Ok(())
    }
}
