//! # crysdaq
//!
//! Core library for the `crysdaq` process-control console. It polls the
//! crystal-growth laboratory hardware (furnace axes, generator, gas and vacuum
//! monitors) over shared serial and Modbus-TCP links, decodes the device wire
//! formats into named measurements, and drives time-scheduled setpoint recipes
//! back to the hardware.
//!
//! ## Crate Structure
//!
//! - **`config`**: Strongly-typed configuration loaded from TOML plus
//!   `CRYSDAQ_`-prefixed environment variables. See [`config::Config`].
//! - **`console`**: The [`console::Console`] facade owning the port registry,
//!   devices, samplers and dispatcher, with lifecycle control.
//! - **`device`**: The logical [`device::Device`] model (value map, limits) and
//!   the [`device::WriteIntent`] record the display and recipe layers mutate.
//! - **`dispatcher`**: Fixed-interval tick fan-out to all samplers and the
//!   bounded graceful-shutdown sequence.
//! - **`error`**: The [`error::ConsoleError`] enum for centralized error
//!   handling across the crate.
//! - **`measurement`**: Measurement samples, the push interface towards
//!   display/storage consumers, and the operator activity log.
//! - **`protocol`**: Wire-protocol decoders (framed ASCII, Modbus register
//!   blocks) and the shared status bitfield codec.
//! - **`recipe`**: The recipe step mini-language, ramp expansion, validation
//!   and the timed run engine.
//! - **`registry`**: One shared transport handle plus one lock per physical
//!   port, so port-mates never interleave I/O.
//! - **`sampler`**: The per-device worker performing one write-then-maybe-read
//!   cycle per dispatch tick.
//! - **`transport`**: The byte/register transport seam with serial, Modbus-TCP
//!   and mock implementations.

pub mod config;
pub mod console;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod measurement;
pub mod protocol;
pub mod recipe;
pub mod registry;
pub mod sampler;
pub mod transport;

pub use config::Config;
pub use console::Console;
pub use error::{AppResult, ConsoleError};
