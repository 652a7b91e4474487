//! Error types for Kimai Autotrack.
//!
//! Each concern owns its own error enum (`ConfigError`, `SensorError`,
//! `RemoteError`); this module ties them together into the crate-level
//! [`TrackerError`] used by the engine and binary.

use thiserror::Error;

use crate::client::RemoteError;
use crate::config::ConfigError;
use crate::sampler::SensorError;

/// Errors that can occur during tracker operations.
///
/// # Examples
///
/// ```ignore
/// use kimai_autotrack::error::TrackerError;
///
/// fn load() -> Result<(), TrackerError> {
///     let config = Config::load()?;
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The idle-time sensor could not be read.
    #[error("idle sensor error: {0}")]
    Sensor(#[from] SensorError),

    /// A call to the Kimai API failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The engine task is gone (shut down or panicked).
    #[error("engine is not running")]
    EngineStopped,
}

/// A specialized `Result` type for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
