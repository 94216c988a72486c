//! Recipe execution: the step mini-language, ramp expansion, validation and
//! the timed run engine.
//!
//! A recipe is a declarative table of setpoint steps. Ramps are expanded into
//! discrete sub-steps at ingestion time; the run engine then walks the
//! expanded list on a one-shot timer, writing each value into the device's
//! write intent where the next sampling cycle picks it up. The engine never
//! touches the transport itself.

pub mod engine;
pub mod step;

pub use engine::{Effect, RecipeEngine, RunEvent, RunState, StopReason};
pub use step::{expand, parse_table, Direction, ExpandedStep, RecipeStep, StepMode};

use thiserror::Error;

/// Recipe validation and lifecycle errors.
///
/// All of these refuse a start or reject a table; none of them leave partial
/// run state armed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecipeError {
    #[error("a recipe is already running")]
    AlreadyRunning,

    #[error("no recipe is configured for this device")]
    NoRecipeSelected,

    #[error("no current measurement to start the leading ramp from")]
    NoMeasurement,

    #[error("line {line}: unknown step mode '{mode}'")]
    UnknownMode { line: usize, mode: String },

    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("step {step}: ramp is invalid: {reason}")]
    InvalidRamp { step: usize, reason: String },

    #[error("step {step}: value {value} outside limits [{lower}, {upper}]")]
    ValueOutOfLimits {
        step: usize,
        value: f64,
        lower: f64,
        upper: f64,
    },

    #[error(
        "step {step}: projected position {position} leaves angular limits [{min}, {max}]"
    )]
    PositionOutOfRange {
        step: usize,
        position: f64,
        min: f64,
        max: f64,
    },
}
