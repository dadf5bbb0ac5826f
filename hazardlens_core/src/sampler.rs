//! Adaptive frame sampler
//!
//! Decides whether the current frame is worth sending for hazard analysis.
//! The analysis interval widens multiplicatively while tracking is limited or
//! the battery is low, and narrows back toward the base interval once
//! conditions have been good for several adaptation cycles.

use crate::tracking_state::TrackingState;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Sampler tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Base analysis interval at High quality (default: 1000ms)
    pub base_interval_ms: f64,

    /// Factor applied per degraded adaptation cycle (default: 2.0)
    pub interval_multiplier: f64,

    /// Upper bound on the interval (default: 10s)
    pub max_interval_ms: f64,

    /// Battery fraction below which sampling backs off (default: 0.2)
    pub low_battery_threshold: f32,

    /// Battery must rise this far above the threshold to count as recovered (default: 0.05)
    pub battery_hysteresis: f32,

    /// Minimum time between interval adjustments (default: 2s)
    pub adaptation_period_secs: f64,

    /// Consecutive good cycles required before narrowing (default: 3)
    pub recovery_cycles: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 1000.0,
            interval_multiplier: 2.0,
            max_interval_ms: 10_000.0,
            low_battery_threshold: 0.2,
            battery_hysteresis: 0.05,
            adaptation_period_secs: 2.0,
            recovery_cycles: 3,
        }
    }
}

/// Frame sampling policy with its own adaptation state.
#[derive(Debug)]
pub struct AdaptiveFrameSampler {
    config: SamplerConfig,

    /// Current interval, `None` until the first decision
    interval_ms: Option<f64>,

    last_adaptation: Option<f64>,

    good_cycles: u32,

    /// Latched low-battery flag (cleared only above threshold + hysteresis)
    battery_low: bool,

    /// Frames approved for analysis
    approved: u64,

    /// Frames skipped
    skipped: u64,
}

impl AdaptiveFrameSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            interval_ms: None,
            last_adaptation: None,
            good_cycles: 0,
            battery_low: false,
            approved: 0,
            skipped: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SamplerConfig::default())
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Current analysis interval in milliseconds.
    pub fn current_interval_ms(&self) -> f64 {
        self.interval_ms.unwrap_or(self.config.base_interval_ms)
    }

    pub fn is_battery_low(&self) -> bool {
        self.battery_low
    }

    /// (approved, skipped) frame counts.
    pub fn stats(&self) -> (u64, u64) {
        (self.approved, self.skipped)
    }

    /// Decide whether to analyze the frame arriving at `now`.
    ///
    /// `base_interval_ms` is supplied per call so the quality level can scale
    /// it; the adapted interval never drops below it.
    pub fn should_analyze(
        &mut self,
        tracking_state: TrackingState,
        battery_level: f32,
        last_analysis_timestamp: Option<f64>,
        base_interval_ms: f64,
        now: f64,
    ) -> bool {
        if matches!(tracking_state, TrackingState::Stopped | TrackingState::Initializing) {
            self.skipped += 1;
            return false;
        }

        let base = base_interval_ms.max(1.0);
        let mut interval = self.interval_ms.unwrap_or(base).max(base);

        let due = self
            .last_adaptation
            .map(|t| now - t >= self.config.adaptation_period_secs)
            .unwrap_or(true);
        if due {
            interval = self.adapt(tracking_state, battery_level, interval, base);
            self.last_adaptation = Some(now);
        }
        self.interval_ms = Some(interval);

        let analyze = match last_analysis_timestamp {
            None => true,
            Some(last) => (now - last) * 1000.0 >= interval,
        };

        if analyze {
            self.approved += 1;
        } else {
            self.skipped += 1;
        }
        analyze
    }

    /// One adaptation cycle. Returns the new interval.
    fn adapt(&mut self, state: TrackingState, battery_level: f32, interval: f64, base: f64) -> f64 {
        if battery_level < self.config.low_battery_threshold {
            self.battery_low = true;
        } else if battery_level > self.config.low_battery_threshold + self.config.battery_hysteresis {
            self.battery_low = false;
        }

        let degraded = state.is_limited() || self.battery_low;
        if degraded {
            self.good_cycles = 0;
            let widened = (interval * self.config.interval_multiplier).min(self.config.max_interval_ms.max(base));
            if widened > interval {
                debug!(
                    "Sampler interval widened {:.0}ms -> {:.0}ms (limited={}, battery_low={})",
                    interval,
                    widened,
                    state.is_limited(),
                    self.battery_low
                );
            }
            return widened;
        }

        self.good_cycles += 1;
        if self.good_cycles >= self.config.recovery_cycles && interval > base {
            self.good_cycles = 0;
            let narrowed = (interval / self.config.interval_multiplier).max(base);
            debug!("Sampler interval narrowed {:.0}ms -> {:.0}ms", interval, narrowed);
            return narrowed;
        }
        interval
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::LimitedReason;

    const BASE: f64 = 1000.0;

    #[test]
    fn test_never_analyzes_when_initializing_or_stopped() {
        let mut s = AdaptiveFrameSampler::with_defaults();
        assert!(!s.should_analyze(TrackingState::Initializing, 1.0, None, BASE, 0.0));
        assert!(!s.should_analyze(TrackingState::Stopped, 1.0, None, BASE, 10.0));
        assert_eq!(s.stats(), (0, 2));
    }

    #[test]
    fn test_first_tracking_frame_is_analyzed() {
        let mut s = AdaptiveFrameSampler::with_defaults();
        assert!(s.should_analyze(TrackingState::Tracking, 1.0, None, BASE, 0.0));
    }

    #[test]
    fn test_respects_interval() {
        let mut s = AdaptiveFrameSampler::with_defaults();
        assert!(!s.should_analyze(TrackingState::Tracking, 1.0, Some(0.0), BASE, 0.5));
        assert!(s.should_analyze(TrackingState::Tracking, 1.0, Some(0.0), BASE, 1.0));
    }

    #[test]
    fn test_low_battery_widens_within_one_cycle() {
        let mut s = AdaptiveFrameSampler::with_defaults();
        s.should_analyze(TrackingState::Tracking, 0.8, Some(0.0), BASE, 0.0);
        assert_eq!(s.current_interval_ms(), BASE);

        s.should_analyze(TrackingState::Tracking, 0.1, Some(0.0), BASE, 2.0);
        assert_eq!(s.current_interval_ms(), BASE * 2.0);
        assert!(s.is_battery_low());
    }

    #[test]
    fn test_limited_tracking_widens_and_caps() {
        let mut s = AdaptiveFrameSampler::with_defaults();
        let limited = TrackingState::Limited(LimitedReason::ExcessiveMotion);
        for i in 0..20 {
            s.should_analyze(limited, 1.0, Some(0.0), BASE, i as f64 * 2.0);
        }
        assert_eq!(s.current_interval_ms(), 10_000.0);
    }

    #[test]
    fn test_battery_hysteresis_prevents_oscillation() {
        let mut s = AdaptiveFrameSampler::with_defaults();
        s.should_analyze(TrackingState::Tracking, 0.15, Some(0.0), BASE, 0.0);
        assert!(s.is_battery_low());

        // Just above the threshold is still inside the hysteresis band
        s.should_analyze(TrackingState::Tracking, 0.22, Some(0.0), BASE, 2.0);
        assert!(s.is_battery_low());

        s.should_analyze(TrackingState::Tracking, 0.30, Some(0.0), BASE, 4.0);
        assert!(!s.is_battery_low());
    }

    #[test]
    fn test_narrows_after_recovery_cycles() {
        let mut s = AdaptiveFrameSampler::with_defaults();
        s.should_analyze(TrackingState::Tracking, 0.1, Some(0.0), BASE, 0.0);
        s.should_analyze(TrackingState::Tracking, 0.1, Some(0.0), BASE, 2.0);
        assert_eq!(s.current_interval_ms(), 4000.0);

        // Three good cycles narrow by one step
        for i in 2..5 {
            s.should_analyze(TrackingState::Tracking, 0.9, Some(0.0), BASE, i as f64 * 2.0);
        }
        assert_eq!(s.current_interval_ms(), 2000.0);

        for i in 5..8 {
            s.should_analyze(TrackingState::Tracking, 0.9, Some(0.0), BASE, i as f64 * 2.0);
        }
        assert_eq!(s.current_interval_ms(), BASE);

        // Never below base
        for i in 8..14 {
            s.should_analyze(TrackingState::Tracking, 0.9, Some(0.0), BASE, i as f64 * 2.0);
        }
        assert_eq!(s.current_interval_ms(), BASE);
    }

    #[test]
    fn test_adapts_at_most_once_per_period() {
        let mut s = AdaptiveFrameSampler::with_defaults();
        let limited = TrackingState::Limited(LimitedReason::InsufficientLight);
        s.should_analyze(limited, 1.0, Some(0.0), BASE, 0.0);
        s.should_analyze(limited, 1.0, Some(0.0), BASE, 0.5);
        s.should_analyze(limited, 1.0, Some(0.0), BASE, 1.0);
        assert_eq!(s.current_interval_ms(), BASE * 2.0);
    }

    #[test]
    fn test_quality_scaled_base_raises_floor() {
        let mut s = AdaptiveFrameSampler::with_defaults();
        s.should_analyze(TrackingState::Tracking, 1.0, Some(0.0), BASE * 3.0, 0.0);
        assert_eq!(s.current_interval_ms(), 3000.0);
        assert!(!s.should_analyze(TrackingState::Tracking, 1.0, Some(0.0), BASE * 3.0, 2.0));
    }
}
