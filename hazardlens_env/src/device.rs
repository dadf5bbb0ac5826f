//! Device telemetry abstraction for HazardLens sessions.

use crate::error::EnvError;
use serde::{Deserialize, Serialize};

/// Platform thermal pressure, mildest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ThermalState {
    #[default]
    Nominal,
    Fair,
    /// The platform is throttling; work should be shed
    Serious,
    Critical,
}

impl ThermalState {
    /// Serious or worse.
    pub fn is_throttling(&self) -> bool {
        *self >= ThermalState::Serious
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThermalState::Nominal => "nominal",
            ThermalState::Fair => "fair",
            ThermalState::Serious => "serious",
            ThermalState::Critical => "critical",
        }
    }
}

/// A point-in-time reading of the device's power, memory and thermal state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    /// Battery charge level (0.0 - 1.0)
    pub battery_level: f32,

    /// Battery drain rate in percent of full charge per hour
    pub battery_drain_rate: f32,

    /// Resident memory used by the session, in bytes
    pub memory_bytes: u64,

    /// Whether the device is currently charging
    pub charging: bool,

    #[serde(default)]
    pub thermal_state: ThermalState,

    /// CPU+GPU time the platform reports for the last rendered frame.
    /// `None` when the platform does not expose it.
    #[serde(default)]
    pub frame_time_ms: Option<f64>,
}

impl Default for DeviceReading {
    fn default() -> Self {
        Self {
            battery_level: 1.0,
            battery_drain_rate: 0.0,
            memory_bytes: 0,
            charging: false,
            thermal_state: ThermalState::Nominal,
            frame_time_ms: None,
        }
    }
}

/// Abstraction for reading device power and memory state.
///
/// # Implementations
///
/// - **Production**: Wraps the platform battery / memory APIs
/// - **Simulation**: `SimDevice` with a scripted discharge curve
///
/// # Reading Flow
///
/// ```text
/// Session tick                DeviceSensor
///   |                             |
///   |-- read() ------------------>|
///   |<--------- DeviceReading ----|
///   |-- PerformanceMonitor.record |
/// ```
pub trait DeviceSensor: Send + Sync + 'static {
    /// Reads the current device state.
    ///
    /// # Returns
    /// * `Ok(reading)` - A fresh reading
    /// * `Err(EnvError::SensorError)` - The platform API failed
    /// * `Err(EnvError::PermissionDenied)` - Battery/memory stats are not accessible
    fn read(&self) -> Result<DeviceReading, EnvError>;

    /// Whether the device exposes spatial tracking at all.
    ///
    /// Sessions on devices without it run in 2D fallback mode only.
    fn supports_spatial_tracking(&self) -> bool {
        true
    }
}

/// Control surface for simulated devices.
///
/// Allows injecting power and memory conditions during scenarios.
pub trait DeviceController: Send + Sync {
    /// Sets the battery level (clamped to 0.0 - 1.0).
    fn set_battery_level(&self, level: f32);

    /// Sets the discharge rate in percent per hour.
    fn set_drain_rate(&self, percent_per_hour: f32);

    /// Sets the reported memory footprint.
    fn set_memory_bytes(&self, bytes: u64);

    /// Multiplies simulated frame cost (thermal throttling, background load).
    fn set_load_factor(&self, factor: f64);
}

/// A sensor that always returns the same reading.
///
/// Useful on hosts without battery APIs and in unit tests.
#[derive(Debug, Clone, Default)]
pub struct FixedDeviceSensor {
    reading: DeviceReading,
}

impl FixedDeviceSensor {
    /// Creates a sensor reporting the given reading.
    pub fn new(reading: DeviceReading) -> Self {
        Self { reading }
    }
}

impl DeviceSensor for FixedDeviceSensor {
    fn read(&self) -> Result<DeviceReading, EnvError> {
        Ok(self.reading)
    }
}
