//! Custom error types for the application.
//!
//! This module defines the primary error type, `ConsoleError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and consistent
//! way to handle the different kinds of errors that can occur, from I/O and
//! configuration issues to recipe validation failures.
//!
//! Transient wire-level problems (empty frames, closed ports, corrupt Modbus
//! fields) are deliberately *not* represented here: they are recovered locally
//! inside the samplers and decoders via retry loops and NaN substitution, and
//! never cross the sampler boundary as errors.

use crate::recipe::RecipeError;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, ConsoleError>;

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Port '{0}' is not open")]
    PortNotOpen(String),

    #[error("Port '{0}' is not configured")]
    UnknownPort(String),

    #[error("Device '{0}' is not configured")]
    UnknownDevice(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation not supported by this transport: {0}")]
    TransportUnsupported(&'static str),

    #[error("Recipe error: {0}")]
    Recipe(#[from] RecipeError),

    #[error("Graceful stop could not be confirmed for all samplers")]
    ShutdownTimeout,
}
