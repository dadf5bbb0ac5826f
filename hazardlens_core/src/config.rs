//! Session configuration.
//!
//! One struct per engine, each with documented defaults; `HazardLensConfig`
//! aggregates them so a deployment can override any subset from JSON.

use crate::error::ConfigError;
use crate::geometry::CameraIntrinsics;
use crate::orchestrator::OrchestratorConfig;
use crate::overlay::OverlayConfig;
use crate::performance::PerformanceConfig;
use crate::privacy::PrivacyConfig;
use crate::quality::QualityConfig;
use crate::recovery::RecoveryConfig;
use crate::registry::RegistryConfig;
use crate::sampler::SamplerConfig;
use crate::tracking_state::TrackingStateConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HazardLensConfig {
    pub tracking: TrackingStateConfig,
    pub sampler: SamplerConfig,
    pub privacy: PrivacyConfig,
    pub registry: RegistryConfig,
    pub orchestrator: OrchestratorConfig,
    pub overlay: OverlayConfig,
    pub performance: PerformanceConfig,
    pub quality: QualityConfig,
    pub recovery: RecoveryConfig,
    pub camera: CameraIntrinsics,
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be positive, got {value}")))
    }
}

fn unit_range(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be within [0, 1], got {value}")))
    }
}

impl HazardLensConfig {
    /// Parse and validate.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.tracking;
        unit_range("tracking.min_tracking_quality", f64::from(t.min_tracking_quality))?;
        positive("tracking.anchor_timeout_secs", t.anchor_timeout_secs)?;
        positive("tracking.limited_fallback_after_secs", t.limited_fallback_after_secs)?;

        let s = &self.sampler;
        positive("sampler.base_interval_ms", s.base_interval_ms)?;
        positive("sampler.max_interval_ms", s.max_interval_ms)?;
        if s.interval_multiplier < 1.0 {
            return Err(ConfigError::invalid("sampler.interval_multiplier", "must be >= 1"));
        }
        if s.max_interval_ms < s.base_interval_ms {
            return Err(ConfigError::invalid(
                "sampler.max_interval_ms",
                "must not be below base_interval_ms",
            ));
        }
        unit_range("sampler.low_battery_threshold", f64::from(s.low_battery_threshold))?;

        positive("registry.merge_distance_m", self.registry.merge_distance_m)?;
        positive("registry.staleness_window_secs", self.registry.staleness_window_secs)?;

        let o = &self.orchestrator;
        positive("orchestrator.stale_after_secs", o.stale_after_secs)?;
        positive("orchestrator.frame_ttl_secs", o.frame_ttl_secs)?;
        if o.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("orchestrator.request_timeout_ms", "must be non-zero"));
        }
        if o.max_attempts == 0 {
            return Err(ConfigError::invalid("orchestrator.max_attempts", "must be at least 1"));
        }
        if o.max_backoff_ms < o.initial_backoff_ms {
            return Err(ConfigError::invalid(
                "orchestrator.max_backoff_ms",
                "must not be below initial_backoff_ms",
            ));
        }
        unit_range("orchestrator.backoff_jitter", o.backoff_jitter)?;

        unit_range("overlay.filter.min_confidence", f64::from(self.overlay.filter.min_confidence))?;

        if self.performance.capacity == 0 {
            return Err(ConfigError::invalid("performance.capacity", "must be non-zero"));
        }

        let q = &self.quality;
        positive("quality.budget.max_frame_time_ms", q.budget.max_frame_time_ms)?;
        positive("quality.budget.max_detection_latency_ms", q.budget.max_detection_latency_ms)?;
        positive("quality.budget.max_battery_drain_rate", q.budget.max_battery_drain_rate)?;
        if !(q.comfort_ratio > 0.0 && q.comfort_ratio < 1.0) {
            return Err(ConfigError::invalid("quality.comfort_ratio", "must be within (0, 1)"));
        }

        let c = &self.camera;
        if !(c.fov_y > 0.0 && c.fov_y < std::f64::consts::PI) {
            return Err(ConfigError::invalid("camera.fov_y", "must be within (0, pi)"));
        }
        if !(c.near > 0.0 && c.far > c.near) {
            return Err(ConfigError::invalid("camera.near", "require 0 < near < far"));
        }
        positive("camera.viewport.width", c.viewport.width)?;
        positive("camera.viewport.height", c.viewport.height)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::Prioritization;

    #[test]
    fn test_defaults_are_valid() {
        assert!(HazardLensConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_overrides() {
        let json = r#"{
            "registry": { "merge_distance_m": 2.0 },
            "overlay": { "filter": { "max_visible": 3, "prioritization": "DistanceFirst" } },
            "orchestrator": { "fallback_after_failures": 4 }
        }"#;
        let config = HazardLensConfig::from_json_str(json).unwrap();
        assert_eq!(config.registry.merge_distance_m, 2.0);
        assert_eq!(config.registry.staleness_window_secs, 30.0);
        assert_eq!(config.overlay.filter.max_visible, 3);
        assert_eq!(config.overlay.filter.prioritization, Prioritization::DistanceFirst);
        assert_eq!(config.orchestrator.fallback_after_failures, 4);
        assert_eq!(config.orchestrator.max_attempts, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = HazardLensConfig::from_json_str(r#"{ "registry": { "merge_distance_m": -1 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "registry.merge_distance_m", .. }));

        let err = HazardLensConfig::from_json_str(r#"{ "quality": { "comfort_ratio": 1.5 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "quality.comfort_ratio", .. }));

        assert!(matches!(
            HazardLensConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_json_roundtrip_of_defaults() {
        let config = HazardLensConfig::default();
        let json = config.to_json_pretty().unwrap();
        assert_eq!(HazardLensConfig::from_json_str(&json).unwrap(), config);
    }
}
