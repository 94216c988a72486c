//! Logical device model and the write-intent record.
//!
//! A [`Device`] is one logical unit bound to exactly one physical port: an
//! axis of the furnace, the generator, a gas monitor. It is created at startup
//! from configuration, its value map is overwritten on every read cycle, and
//! it lives until process shutdown.
//!
//! The [`WriteIntent`] is the narrow channel between the display/recipe layer
//! and the hardware: producers flag named commands with target values, the
//! device's sampler drains and clears them once per dispatch tick.

use crate::config::{DeviceConfig, LimitsConfig, RecipeConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared handle to a device's mutable state.
pub type SharedDevice = Arc<Mutex<Device>>;

/// Shared handle to a device's write-intent record.
pub type SharedIntent = Arc<Mutex<WriteIntent>>;

/// Name under which a prioritized stop is drained from a [`WriteIntent`].
pub const PRIORITY_STOP: &str = "stop";

/// Setpoint limit pair resolved for the device's current control mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub lower: f64,
    pub upper: f64,
}

/// Angular travel limits for rotary axes.
#[derive(Debug, Clone)]
pub struct RotationLimits {
    pub min_angle: f64,
    pub max_angle: f64,
    pub continuous: bool,
    pub position_name: Option<String>,
}

/// One logical device.
pub struct Device {
    id: String,
    port_id: String,
    /// `None` disables reading (write-only device)
    poll_interval: Option<Duration>,
    precision: u32,
    limits: LimitsConfig,
    rotation: Option<RotationLimits>,
    recipe: Option<RecipeConfig>,
    /// While true, the external-control limit pair applies
    external_mode: bool,
    values: HashMap<String, f64>,
}

impl Device {
    pub fn from_config(config: &DeviceConfig) -> Self {
        let poll_interval = if config.poll_interval_secs > 0.0 {
            Some(Duration::from_secs_f64(config.poll_interval_secs))
        } else {
            None
        };
        Self {
            id: config.id.clone(),
            port_id: config.port.clone(),
            poll_interval,
            precision: config.precision,
            limits: config.limits.clone(),
            rotation: config.rotation.as_ref().map(|r| RotationLimits {
                min_angle: r.min_angle,
                max_angle: r.max_angle,
                continuous: r.continuous,
                position_name: r.position_name.clone(),
            }),
            recipe: config.recipe.clone(),
            external_mode: false,
            values: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port_id(&self) -> &str {
        &self.port_id
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    pub fn rotation(&self) -> Option<&RotationLimits> {
        self.rotation.as_ref()
    }

    pub fn recipe(&self) -> Option<&RecipeConfig> {
        self.recipe.as_ref()
    }

    /// Current decoded value, if the measurement exists and is not NaN.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied().filter(|v| !v.is_nan())
    }

    /// The full value map as pushed downstream.
    pub fn values(&self) -> &HashMap<String, f64> {
        &self.values
    }

    /// Overwrite measurements from one decoded frame. Failure frames carry
    /// NaN for every mapped name, so consumers never see stale values.
    pub fn apply_frame(&mut self, values: &[(String, f64)]) {
        for (name, value) in values {
            self.values.insert(name.clone(), *value);
        }
    }

    /// Whether the device is driven by an external controller; this switches
    /// the active limit pair.
    pub fn set_external_mode(&mut self, on: bool) {
        self.external_mode = on;
    }

    pub fn external_mode(&self) -> bool {
        self.external_mode
    }

    /// The limit pair recipes validate against right now.
    pub fn active_limits(&self) -> Limits {
        if self.external_mode {
            Limits {
                lower: self.limits.external_lower.unwrap_or(self.limits.lower),
                upper: self.limits.external_upper.unwrap_or(self.limits.upper),
            }
        } else {
            Limits {
                lower: self.limits.lower,
                upper: self.limits.upper,
            }
        }
    }
}

/// One drained write request.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub name: String,
    /// `None` for bare command flags (e.g. a stop)
    pub value: Option<f64>,
}

/// Pending command flags and target values for one device.
///
/// Mutated by at most one producer context (display or recipe layer) and
/// drained by exactly one sampler; request order is preserved so consecutive
/// setpoints arrive in the order they were issued. A prioritized stop always
/// drains first, ahead of any setpoint queued in the same window.
#[derive(Default)]
pub struct WriteIntent {
    flags: HashMap<String, bool>,
    values: HashMap<String, f64>,
    order: Vec<String>,
    priority_stop: bool,
}

impl WriteIntent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag `name` for writing with a target value.
    pub fn request(&mut self, name: &str, value: f64) {
        if !self.flags.get(name).copied().unwrap_or(false) {
            self.order.push(name.to_string());
        }
        self.flags.insert(name.to_string(), true);
        self.values.insert(name.to_string(), value);
    }

    /// Flag a bare command with no value.
    pub fn request_command(&mut self, name: &str) {
        if !self.flags.get(name).copied().unwrap_or(false) {
            self.order.push(name.to_string());
        }
        self.flags.insert(name.to_string(), true);
        self.values.remove(name);
    }

    /// Request an immediate stop that outranks everything else pending.
    pub fn request_priority_stop(&mut self) {
        self.priority_stop = true;
    }

    pub fn has_pending(&self) -> bool {
        self.priority_stop || self.flags.values().any(|&flagged| flagged)
    }

    /// Target value currently flagged for `name`, if any.
    pub fn pending_value(&self, name: &str) -> Option<f64> {
        if self.flags.get(name).copied().unwrap_or(false) {
            self.values.get(name).copied()
        } else {
            None
        }
    }

    /// Drain all flagged writes in request order, clearing the flags. The
    /// prioritized stop, when set, is emitted first.
    pub fn drain(&mut self) -> Vec<PendingWrite> {
        let mut writes = Vec::new();
        if self.priority_stop {
            self.priority_stop = false;
            writes.push(PendingWrite {
                name: PRIORITY_STOP.to_string(),
                value: None,
            });
        }
        for name in self.order.drain(..) {
            if self.flags.get(&name).copied().unwrap_or(false) {
                self.flags.insert(name.clone(), false);
                writes.push(PendingWrite {
                    value: self.values.get(&name).copied(),
                    name,
                });
            }
        }
        writes
    }
}

/// Convenience constructor used by the console and tests.
pub fn shared_pair(config: &DeviceConfig) -> (SharedDevice, SharedIntent) {
    (
        Arc::new(Mutex::new(Device::from_config(config))),
        Arc::new(Mutex::new(WriteIntent::new())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;

    fn test_config() -> DeviceConfig {
        DeviceConfig {
            id: "heater".into(),
            port: "line1".into(),
            poll_interval_secs: 2.0,
            precision: 2,
            protocol: ProtocolConfig::FramedAscii {
                query: "!".into(),
                expected_fields: 29,
                fields: vec![],
                retry_limit: 10,
            },
            limits: LimitsConfig {
                lower: 0.0,
                upper: 100.0,
                external_lower: Some(10.0),
                external_upper: Some(50.0),
            },
            rotation: None,
            recipe: None,
        }
    }

    #[test]
    fn zero_poll_interval_disables_reading() {
        let mut config = test_config();
        config.poll_interval_secs = 0.0;
        let device = Device::from_config(&config);
        assert!(device.poll_interval().is_none());
    }

    #[test]
    fn nan_values_read_as_absent() {
        let mut device = Device::from_config(&test_config());
        device.apply_frame(&[("T".into(), f64::NAN)]);
        assert_eq!(device.value("T"), None);
        device.apply_frame(&[("T".into(), 21.5)]);
        assert_eq!(device.value("T"), Some(21.5));
    }

    #[test]
    fn external_mode_switches_limit_pair() {
        let mut device = Device::from_config(&test_config());
        assert_eq!(device.active_limits(), Limits { lower: 0.0, upper: 100.0 });
        device.set_external_mode(true);
        assert_eq!(device.active_limits(), Limits { lower: 10.0, upper: 50.0 });
    }

    #[test]
    fn drain_clears_flags_and_preserves_order() {
        let mut intent = WriteIntent::new();
        intent.request("T_sp", 450.0);
        intent.request("rot_sp", 5.0);
        assert!(intent.has_pending());

        let writes = intent.drain();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].name, "T_sp");
        assert_eq!(writes[0].value, Some(450.0));
        assert_eq!(writes[1].name, "rot_sp");

        assert!(!intent.has_pending());
        assert!(intent.drain().is_empty());
    }

    #[test]
    fn rerequest_updates_value_without_duplicating() {
        let mut intent = WriteIntent::new();
        intent.request("T_sp", 450.0);
        intent.request("T_sp", 500.0);
        let writes = intent.drain();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].value, Some(500.0));
    }

    #[test]
    fn priority_stop_drains_first() {
        let mut intent = WriteIntent::new();
        intent.request("rot_sp", 5.0);
        intent.request_priority_stop();
        let writes = intent.drain();
        assert_eq!(writes[0].name, PRIORITY_STOP);
        assert_eq!(writes[0].value, None);
        assert_eq!(writes[1].name, "rot_sp");
    }
}
