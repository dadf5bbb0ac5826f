//! Error types for the HazardLens environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The device refused access to a sensor (camera, motion, location)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The device lacks a required capability (spatial tracking, camera)
    #[error("Unsupported capability: {0}")]
    Unsupported(String),

    /// A device sensor could not be read
    #[error("Device sensor error: {0}")]
    SensorError(String),

    /// Telemetry record rejected or serialization failed
    #[error("Telemetry error: {0}")]
    TelemetryError(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a sensor error.
    pub fn sensor(msg: impl Into<String>) -> Self {
        Self::SensorError(msg.into())
    }

    /// Creates a permission error for the named sensor.
    pub fn permission(sensor: impl std::fmt::Display) -> Self {
        Self::PermissionDenied(sensor.to_string())
    }
}
