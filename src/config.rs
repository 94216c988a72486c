//! Configuration loading for the console.
//!
//! Configuration is strongly typed and loaded from:
//! 1. a TOML file (base configuration),
//! 2. environment variables prefixed with `CRYSDAQ_`.
//!
//! Optional fields fall back to defaults; [`Config::validate`] logs a warning
//! for each fallback that matters to an operator and fails hard only where a
//! default cannot stand in, i.e. for fields required to address hardware
//! (register blocks on a Modbus device, field maps on a framed-ASCII device,
//! a device referencing an unconfigured port).
//!
//! # Example
//! ```no_run
//! use crysdaq::config::Config;
//!
//! let config = Config::load()?;
//! println!("Console: {}", config.application.name);
//! # Ok::<(), crysdaq::ConsoleError>(())
//! ```

use crate::error::{AppResult, ConsoleError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application settings
    pub application: ApplicationConfig,
    /// Dispatch tick and shutdown settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Physical port definitions
    pub ports: Vec<PortConfig>,
    /// Logical device definitions
    pub devices: Vec<DeviceConfig>,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Console name, used in log lines and pushed batches
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Dispatch scheduling configuration.
///
/// The tick interval is the *reaction* rate shared by all samplers; each
/// device reads on its own slower cadence (see `DeviceConfig::poll_interval_secs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Interval between dispatch ticks
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,
    /// Bounded wait for samplers to confirm their final cycle on shutdown
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
    /// Consecutive closed-port cycles after which duplicate warnings are
    /// suppressed until the port recovers
    #[serde(default = "default_port_warning_threshold")]
    pub port_warning_threshold: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            port_warning_threshold: default_port_warning_threshold(),
        }
    }
}

/// One physical communication port, shared by any number of devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// Port identifier referenced by `DeviceConfig::port`
    pub id: String,
    #[serde(flatten)]
    pub kind: PortKind,
}

/// Transport flavor of a physical port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PortKind {
    /// RS-232/USB serial line
    Serial {
        /// Device path, e.g. "/dev/ttyUSB0" or "COM3"
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Per-byte read timeout in milliseconds
        #[serde(default = "default_serial_timeout_ms")]
        read_timeout_ms: u64,
    },
    /// Modbus-TCP endpoint
    ModbusTcp {
        /// Socket address, e.g. "192.168.2.40:502"
        address: String,
    },
    /// In-memory transport for tests and dry runs
    Mock,
}

/// One logical device bound to a physical port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier
    pub id: String,
    /// Physical port this device talks over
    pub port: String,
    /// Seconds between device reads; 0 disables reading (write-only device)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,
    /// Decimal places kept on decoded measurements
    #[serde(default = "default_precision")]
    pub precision: u32,
    /// Wire protocol and addressing
    pub protocol: ProtocolConfig,
    /// Setpoint limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Angular travel limits for rotary axes
    #[serde(default)]
    pub rotation: Option<RotationConfig>,
    /// Recipe wiring (setpoint/feedback names plus the step table)
    #[serde(default)]
    pub recipe: Option<RecipeConfig>,
}

/// Protocol selection, fixed at device construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolConfig {
    /// Framed ASCII: `!` query, `*<fields>#` response
    FramedAscii {
        #[serde(default = "default_query_token")]
        query: String,
        /// Exact number of space-separated fields in a valid frame
        #[serde(default = "default_expected_fields")]
        expected_fields: usize,
        /// Which frame fields become which named measurements
        fields: Vec<FieldMapping>,
        /// Re-query attempts on empty/malformed frames
        #[serde(default = "default_retry_limit")]
        retry_limit: usize,
    },
    /// Modbus input-register blocks
    Modbus {
        /// Register blocks read each cycle; the set differs per hardware
        /// generation and is configuration data, not a protocol constant
        blocks: Vec<BlockConfig>,
        /// Holding-register address for each writable value name
        #[serde(default)]
        write_registers: HashMap<String, u16>,
    },
}

/// Maps one frame field index to a measurement name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub index: usize,
    pub name: String,
}

/// One contiguous Modbus input-register block.
///
/// The block holds `2 * floats.len() + status.len()` registers: each float is
/// two big-endian registers, each status word one register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    pub name: String,
    /// Starting register address
    pub start: u16,
    /// Names of the float measurements, in register order
    pub floats: Vec<String>,
    /// Trailing status words
    #[serde(default)]
    pub status: Vec<StatusFieldConfig>,
}

/// Per-field status-word metadata.
///
/// The sentinel is substituted when the transport returns no data; which bit
/// carries the interface-error flag differs per word semantics (64 for the
/// generic words, 1024 for valve words on the observed hardware), so it is
/// explicit configuration rather than something inferred from the name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFieldConfig {
    pub name: String,
    pub sentinel: u16,
    /// Individual bits surfaced as named 0/1 measurements
    #[serde(default)]
    pub bits: Vec<BitFlagConfig>,
}

/// One named bit of a status word.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitFlagConfig {
    pub bit: usize,
    pub name: String,
}

/// Setpoint limit pairs.
///
/// The external pair applies while the device is driven by an external
/// controller; it falls back to the direct pair when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_lower_limit")]
    pub lower: f64,
    #[serde(default = "default_upper_limit")]
    pub upper: f64,
    #[serde(default)]
    pub external_lower: Option<f64>,
    #[serde(default)]
    pub external_upper: Option<f64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            lower: default_lower_limit(),
            upper: default_upper_limit(),
            external_lower: None,
            external_upper: None,
        }
    }
}

/// Angular travel limits for directional axes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    pub min_angle: f64,
    pub max_angle: f64,
    /// Unbounded rotation: skip the position-reachability check
    #[serde(default)]
    pub continuous: bool,
    /// Measurement name holding the current angular position
    #[serde(default)]
    pub position_name: Option<String>,
}

/// Recipe wiring for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeConfig {
    /// Write-intent name the expanded setpoints are written to
    pub setpoint: String,
    /// Measurement name a ramp-first recipe starts from
    pub feedback: String,
    /// Step table, one `duration ; value ; mode [ ; extra ]` entry per line
    #[serde(default)]
    pub steps: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_port_warning_threshold() -> u32 {
    5
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_serial_timeout_ms() -> u64 {
    100
}

fn default_poll_interval() -> f64 {
    1.0
}

fn default_precision() -> u32 {
    2
}

fn default_query_token() -> String {
    "!".to_string()
}

fn default_expected_fields() -> usize {
    29
}

fn default_retry_limit() -> usize {
    10
}

fn default_lower_limit() -> f64 {
    0.0
}

fn default_upper_limit() -> f64 {
    f64::MAX
}

impl Config {
    /// Load configuration from the default path and environment variables.
    ///
    /// Environment variables override file values with prefix `CRYSDAQ_`,
    /// e.g. `CRYSDAQ_APPLICATION_LOG_LEVEL=debug`.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/crysdaq.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CRYSDAQ_").split("_"))
            .extract()?;
        Ok(config)
    }

    /// Validate the configuration after loading.
    ///
    /// Missing hardware addressing is fatal; everything else gets a default
    /// and a warning so an operator can see what the console fell back to.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConsoleError::Configuration(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.dispatcher.tick_interval.is_zero() {
            return Err(ConsoleError::Configuration(
                "dispatcher.tick_interval must be non-zero".into(),
            ));
        }

        let mut port_ids = std::collections::HashSet::new();
        for port in &self.ports {
            if !port_ids.insert(port.id.as_str()) {
                return Err(ConsoleError::Configuration(format!(
                    "duplicate port id '{}'",
                    port.id
                )));
            }
        }

        let mut device_ids = std::collections::HashSet::new();
        for device in &self.devices {
            if !device_ids.insert(device.id.as_str()) {
                return Err(ConsoleError::Configuration(format!(
                    "duplicate device id '{}'",
                    device.id
                )));
            }
            device.validate(&port_ids)?;
        }

        Ok(())
    }
}

impl DeviceConfig {
    fn validate(&self, port_ids: &std::collections::HashSet<&str>) -> AppResult<()> {
        if !port_ids.contains(self.port.as_str()) {
            return Err(ConsoleError::Configuration(format!(
                "device '{}' references unconfigured port '{}'",
                self.id, self.port
            )));
        }

        if self.poll_interval_secs < 0.0 || !self.poll_interval_secs.is_finite() {
            return Err(ConsoleError::Configuration(format!(
                "device '{}': poll_interval_secs must be >= 0",
                self.id
            )));
        }

        if self.limits.lower >= self.limits.upper {
            return Err(ConsoleError::Configuration(format!(
                "device '{}': lower limit must be below upper limit",
                self.id
            )));
        }

        match &self.protocol {
            ProtocolConfig::FramedAscii {
                expected_fields,
                fields,
                ..
            } => {
                if fields.is_empty() {
                    return Err(ConsoleError::Configuration(format!(
                        "device '{}': framed_ascii protocol needs at least one field mapping",
                        self.id
                    )));
                }
                for mapping in fields {
                    if mapping.index >= *expected_fields {
                        return Err(ConsoleError::Configuration(format!(
                            "device '{}': field '{}' index {} exceeds frame width {}",
                            self.id, mapping.name, mapping.index, expected_fields
                        )));
                    }
                }
            }
            ProtocolConfig::Modbus { blocks, .. } => {
                if blocks.is_empty() {
                    return Err(ConsoleError::Configuration(format!(
                        "device '{}': modbus protocol needs at least one register block",
                        self.id
                    )));
                }
                for block in blocks {
                    if block.floats.is_empty() && block.status.is_empty() {
                        return Err(ConsoleError::Configuration(format!(
                            "device '{}': block '{}' maps no registers",
                            self.id, block.name
                        )));
                    }
                }
            }
        }

        if self.limits.external_lower.is_none() && self.limits.external_upper.is_none() {
            // Not an error: external-control mode then shares the direct pair.
            warn!(
                "device '{}': no external-control limits configured, using direct limits",
                self.id
            );
        }

        Ok(())
    }
}
