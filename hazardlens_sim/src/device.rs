//! Simulated handheld device with scripted power and thermal conditions.

use hazardlens_core::QualityLevel;
use hazardlens_env::{DeviceController, DeviceSensor, DeviceReading, EnvError, ThermalState};
use std::sync::{Mutex, MutexGuard};

/// Nominal cost of one capture tick at each quality level (ms).
///
/// High sits just under a 30Hz budget; a load factor above ~1.1 pushes it over.
pub fn base_frame_cost_ms(level: QualityLevel) -> f64 {
    match level {
        QualityLevel::High => 30.0,
        QualityLevel::Medium => 22.0,
        QualityLevel::Low => 16.0,
        QualityLevel::Minimal => 12.0,
    }
}

/// Extra drain (percent per hour) attributable to rendering + analysis at a level.
fn quality_drain_pct_per_hour(level: QualityLevel) -> f32 {
    match level {
        QualityLevel::High => 8.0,
        QualityLevel::Medium => 6.0,
        QualityLevel::Low => 4.0,
        QualityLevel::Minimal => 2.5,
    }
}

/// Thermal pressure implied by sustained extra load.
fn thermal_for_load(load_factor: f64) -> ThermalState {
    if load_factor >= 2.0 {
        ThermalState::Critical
    } else if load_factor >= 1.5 {
        ThermalState::Serious
    } else if load_factor >= 1.2 {
        ThermalState::Fair
    } else {
        ThermalState::Nominal
    }
}

#[derive(Debug, Clone)]
struct DeviceState {
    battery_level: f32,
    /// Baseline drain (screen, radios) in percent per hour
    base_drain: f32,
    memory_bytes: u64,
    load_factor: f64,
    quality: QualityLevel,
    charging: bool,
    spatial_tracking: bool,
    permission_denied: Option<String>,
}

/// A scriptable device for scenarios.
///
/// Reads report the baseline drain plus a quality-dependent component, so
/// downgrading quality visibly lowers the drain the session sees.
pub struct SimDevice {
    state: Mutex<DeviceState>,
}

impl SimDevice {
    /// Fully charged device with a 10%/h baseline drain and 180 MiB resident.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState {
                battery_level: 1.0,
                base_drain: 10.0,
                memory_bytes: 180 * 1024 * 1024,
                load_factor: 1.0,
                quality: QualityLevel::High,
                charging: false,
                spatial_tracking: true,
                permission_denied: None,
            }),
        }
    }

    /// Device without spatial tracking support.
    pub fn without_spatial_tracking() -> Self {
        let device = Self::new();
        device.lock().spatial_tracking = false;
        device
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reports the quality level the session is currently running at.
    pub fn set_quality(&self, level: QualityLevel) {
        self.lock().quality = level;
    }

    /// Makes every subsequent read fail with a permission error.
    pub fn deny_permission(&self, sensor: &str) {
        self.lock().permission_denied = Some(sensor.to_string());
    }

    pub fn set_charging(&self, charging: bool) {
        self.lock().charging = charging;
    }

    /// Total drain the device currently reports (percent per hour).
    pub fn drain_rate(&self) -> f32 {
        let s = self.lock();
        s.base_drain + quality_drain_pct_per_hour(s.quality)
    }

    pub fn battery_level(&self) -> f32 {
        self.lock().battery_level
    }

    /// Cost of the next tick at the current quality and load.
    pub fn frame_cost_ms(&self) -> f64 {
        let s = self.lock();
        base_frame_cost_ms(s.quality) * s.load_factor
    }

    /// Discharge the battery over `dt_secs` of simulated time.
    pub fn step(&self, dt_secs: f64) {
        let mut s = self.lock();
        if s.charging {
            return;
        }
        let drain = s.base_drain + quality_drain_pct_per_hour(s.quality);
        let used = f64::from(drain) / 100.0 * dt_secs / 3600.0;
        s.battery_level = (s.battery_level - used as f32).max(0.0);
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSensor for SimDevice {
    fn read(&self) -> Result<DeviceReading, EnvError> {
        let s = self.lock();
        if let Some(sensor) = &s.permission_denied {
            return Err(EnvError::permission(sensor.as_str()));
        }
        Ok(DeviceReading {
            battery_level: s.battery_level,
            battery_drain_rate: s.base_drain + quality_drain_pct_per_hour(s.quality),
            memory_bytes: s.memory_bytes,
            charging: s.charging,
            thermal_state: thermal_for_load(s.load_factor),
            frame_time_ms: Some(base_frame_cost_ms(s.quality) * s.load_factor),
        })
    }

    fn supports_spatial_tracking(&self) -> bool {
        self.lock().spatial_tracking
    }
}

impl DeviceController for SimDevice {
    fn set_battery_level(&self, level: f32) {
        self.lock().battery_level = level.clamp(0.0, 1.0);
    }

    fn set_drain_rate(&self, percent_per_hour: f32) {
        self.lock().base_drain = percent_per_hour.max(0.0);
    }

    fn set_memory_bytes(&self, bytes: u64) {
        self.lock().memory_bytes = bytes;
    }

    fn set_load_factor(&self, factor: f64) {
        self.lock().load_factor = factor.max(0.1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_cost_follows_quality_and_load() {
        let device = SimDevice::new();
        assert_eq!(device.frame_cost_ms(), 30.0);

        device.set_load_factor(1.5);
        assert_eq!(device.frame_cost_ms(), 45.0);

        device.set_quality(QualityLevel::Low);
        assert_eq!(device.frame_cost_ms(), 24.0);
    }

    #[test]
    fn test_battery_discharges_over_time() {
        let device = SimDevice::new();
        device.set_drain_rate(42.0);
        // 50%/h total at High for one hour
        device.step(3600.0);
        assert!((device.battery_level() - 0.5).abs() < 1e-4);

        device.set_charging(true);
        device.step(3600.0);
        assert!((device.battery_level() - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_reading_reflects_controller() {
        let device = SimDevice::new();
        device.set_battery_level(1.7);
        device.set_memory_bytes(512);
        device.set_drain_rate(2.0);
        device.set_quality(QualityLevel::Minimal);

        let r = device.read().unwrap();
        assert_eq!(r.battery_level, 1.0);
        assert_eq!(r.memory_bytes, 512);
        assert_eq!(r.battery_drain_rate, 4.5);
        assert_eq!(r.frame_time_ms, Some(12.0));
        assert_eq!(r.thermal_state, ThermalState::Nominal);
    }

    #[test]
    fn test_heavy_load_reads_as_throttling() {
        let device = SimDevice::new();
        device.set_load_factor(1.6);
        let r = device.read().unwrap();
        assert_eq!(r.thermal_state, ThermalState::Serious);
        assert_eq!(r.frame_time_ms, Some(48.0));

        device.set_load_factor(2.5);
        assert_eq!(device.read().unwrap().thermal_state, ThermalState::Critical);
    }

    #[test]
    fn test_permission_denied_read() {
        let device = SimDevice::new();
        device.deny_permission("camera");
        assert!(matches!(device.read(), Err(EnvError::PermissionDenied(_))));
    }
}
