//! Adaptive quality controller
//!
//! Closed loop over `PerformanceMonitor` output:
//!
//! ```text
//!   High ──▶ Medium ──▶ Low ──▶ Minimal      over budget: one step down
//!   High ◀── Medium ◀── Low ◀── Minimal      comfortable for the cooldown: one step up
//! ```
//!
//! The current settings are published on a `watch` channel; the sampler,
//! privacy downscaler and renderer read them from there instead of from
//! shared global state.

use crate::performance::{PerformanceMonitor, PerformanceSummary};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Native input size of the hazard detector.
pub const DETECTOR_NATIVE_RESOLUTION_PX: u32 = 640;

// ============================================================================
// LEVELS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityLevel {
    Minimal,
    Low,
    Medium,
    High,
}

impl QualityLevel {
    pub fn settings(self) -> QualitySettings {
        let (tracking_feature_density, detection_resolution_px, sampler_interval_factor) = match self {
            QualityLevel::High => (1.0, DETECTOR_NATIVE_RESOLUTION_PX, 1.0),
            QualityLevel::Medium => (0.75, 512, 1.5),
            QualityLevel::Low => (0.5, 416, 2.0),
            QualityLevel::Minimal => (0.3, 320, 3.0),
        };
        QualitySettings {
            level: self,
            tracking_feature_density,
            detection_resolution_px,
            sampler_interval_factor,
        }
    }

    pub fn downgraded(self) -> Option<QualityLevel> {
        match self {
            QualityLevel::High => Some(QualityLevel::Medium),
            QualityLevel::Medium => Some(QualityLevel::Low),
            QualityLevel::Low => Some(QualityLevel::Minimal),
            QualityLevel::Minimal => None,
        }
    }

    pub fn upgraded(self) -> Option<QualityLevel> {
        match self {
            QualityLevel::Minimal => Some(QualityLevel::Low),
            QualityLevel::Low => Some(QualityLevel::Medium),
            QualityLevel::Medium => Some(QualityLevel::High),
            QualityLevel::High => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityLevel::High => "high",
            QualityLevel::Medium => "medium",
            QualityLevel::Low => "low",
            QualityLevel::Minimal => "minimal",
        }
    }
}

/// Parameters derived from a quality level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySettings {
    pub level: QualityLevel,

    /// Fraction of tracking features requested from the platform
    pub tracking_feature_density: f32,

    /// Longest side of images sent for analysis
    pub detection_resolution_px: u32,

    /// Multiplier on the sampler's base interval
    pub sampler_interval_factor: f64,
}

impl Default for QualitySettings {
    fn default() -> Self {
        QualityLevel::High.settings()
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Performance limits the controller enforces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceBudget {
    /// Rolling average frame time (default: 33.3ms = 30Hz)
    pub max_frame_time_ms: f64,

    /// Rolling average detection latency (default: 2000ms)
    pub max_detection_latency_ms: f64,

    /// Battery fraction per hour (default: 0.25)
    pub max_battery_drain_rate: f64,
}

impl Default for PerformanceBudget {
    fn default() -> Self {
        Self {
            max_frame_time_ms: 33.3,
            max_detection_latency_ms: 2000.0,
            max_battery_drain_rate: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub budget: PerformanceBudget,

    /// Cadence of `evaluate` (default: 1s)
    pub evaluation_interval_secs: f64,

    /// Rolling window read from the monitor (default: 5s)
    pub window_secs: f64,

    /// Samples needed in the window before acting (default: 10)
    pub min_samples: usize,

    /// "Comfortably under budget" means below this fraction (default: 0.7)
    pub comfort_ratio: f64,

    /// Time spent comfortable before upgrading (default: 10s)
    pub upgrade_cooldown_secs: f64,

    /// Minimum time between two downgrades (default: 3s)
    pub downgrade_cooldown_secs: f64,

    pub initial_level: QualityLevel,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            budget: PerformanceBudget::default(),
            evaluation_interval_secs: 1.0,
            window_secs: 5.0,
            min_samples: 10,
            comfort_ratio: 0.7,
            upgrade_cooldown_secs: 10.0,
            downgrade_cooldown_secs: 3.0,
            initial_level: QualityLevel::High,
        }
    }
}

// ============================================================================
// CHANGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityChangeReason {
    FrameTimeOverBudget,
    DetectionLatencyOverBudget,
    BatteryDrainOverBudget,
    /// Requested by the recovery manager
    Forced,
    /// Sustained comfort below budget
    Recovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityChange {
    pub from: QualityLevel,
    pub to: QualityLevel,
    pub reason: QualityChangeReason,
    pub at: f64,
}

// ============================================================================
// CONTROLLER
// ============================================================================

pub struct AdaptiveQualityController {
    config: QualityConfig,
    level: QualityLevel,
    last_evaluation: Option<f64>,
    last_downgrade: Option<f64>,
    comfortable_since: Option<f64>,
    tx: watch::Sender<QualitySettings>,
}

impl AdaptiveQualityController {
    pub fn new(config: QualityConfig) -> Self {
        let level = config.initial_level;
        let (tx, _rx) = watch::channel(level.settings());
        Self {
            config,
            level,
            last_evaluation: None,
            last_downgrade: None,
            comfortable_since: None,
            tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(QualityConfig::default())
    }

    pub fn level(&self) -> QualityLevel {
        self.level
    }

    pub fn current(&self) -> QualitySettings {
        self.level.settings()
    }

    /// Observe the current settings.
    pub fn subscribe(&self) -> watch::Receiver<QualitySettings> {
        self.tx.subscribe()
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    fn over_budget(&self, s: &PerformanceSummary) -> Option<QualityChangeReason> {
        let b = &self.config.budget;
        if s.avg_frame_time_ms > b.max_frame_time_ms {
            Some(QualityChangeReason::FrameTimeOverBudget)
        } else if s.avg_detection_latency_ms.is_some_and(|l| l > b.max_detection_latency_ms) {
            Some(QualityChangeReason::DetectionLatencyOverBudget)
        } else if s.avg_battery_drain_rate > b.max_battery_drain_rate {
            Some(QualityChangeReason::BatteryDrainOverBudget)
        } else {
            None
        }
    }

    fn comfortable(&self, s: &PerformanceSummary) -> bool {
        let b = &self.config.budget;
        let r = self.config.comfort_ratio;
        s.avg_frame_time_ms < b.max_frame_time_ms * r
            && s.avg_detection_latency_ms
                .map(|l| l < b.max_detection_latency_ms * r)
                .unwrap_or(true)
            && s.avg_battery_drain_rate < b.max_battery_drain_rate * r
    }

    fn apply(&mut self, to: QualityLevel, reason: QualityChangeReason, now: f64) -> QualityChange {
        let from = self.level;
        self.level = to;
        self.tx.send_replace(to.settings());
        info!("Quality {} -> {} ({:?})", from.as_str(), to.as_str(), reason);
        QualityChange { from, to, reason, at: now }
    }

    /// Run one control step. No-op until `evaluation_interval_secs` elapsed
    /// since the previous step.
    pub fn evaluate(&mut self, now: f64, monitor: &PerformanceMonitor) -> Option<QualityChange> {
        if let Some(last) = self.last_evaluation {
            if now - last < self.config.evaluation_interval_secs {
                return None;
            }
        }
        self.last_evaluation = Some(now);

        let summary = monitor.summary(now, self.config.window_secs);
        if summary.sample_count < self.config.min_samples {
            return None;
        }

        if let Some(reason) = self.over_budget(&summary) {
            self.comfortable_since = None;
            let cooling = self
                .last_downgrade
                .is_some_and(|t| now - t < self.config.downgrade_cooldown_secs);
            if cooling {
                return None;
            }
            let to = self.level.downgraded()?;
            self.last_downgrade = Some(now);
            return Some(self.apply(to, reason, now));
        }

        if !self.comfortable(&summary) {
            self.comfortable_since = None;
            return None;
        }

        let since = *self.comfortable_since.get_or_insert(now);
        if now - since < self.config.upgrade_cooldown_secs {
            return None;
        }
        let to = self.level.upgraded()?;
        self.comfortable_since = Some(now);
        Some(self.apply(to, QualityChangeReason::Recovered, now))
    }

    /// Step down one level immediately.
    pub fn force_downgrade(&mut self, now: f64) -> Option<QualityChange> {
        let to = self.level.downgraded()?;
        self.comfortable_since = None;
        self.last_downgrade = Some(now);
        Some(self.apply(to, QualityChangeReason::Forced, now))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::{PerformanceConfig, PerformanceSample};

    fn feed(m: &mut PerformanceMonitor, from: f64, to: f64, frame_ms: f64) {
        let mut t = from;
        while t < to {
            m.record(PerformanceSample {
                frame_time_ms: frame_ms,
                detection_latency_ms: None,
                memory_bytes: 0,
                battery_drain_rate: 0.05,
                timestamp: t,
            });
            t += 1.0 / 30.0;
        }
    }

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::new(PerformanceConfig::default())
    }

    #[test]
    fn test_settings_per_level() {
        assert_eq!(QualityLevel::High.settings().detection_resolution_px, 640);
        assert!(QualityLevel::Minimal.settings().sampler_interval_factor > 1.0);
        assert_eq!(QualityLevel::Minimal.downgraded(), None);
        assert_eq!(QualityLevel::High.upgraded(), None);
    }

    #[test]
    fn test_downgrade_when_frame_time_over_budget() {
        let mut m = monitor();
        let mut q = AdaptiveQualityController::with_defaults();
        let rx = q.subscribe();
        feed(&mut m, 0.0, 2.0, 50.0);

        let change = q.evaluate(2.0, &m).unwrap();
        assert_eq!(change.to, QualityLevel::Medium);
        assert_eq!(change.reason, QualityChangeReason::FrameTimeOverBudget);
        assert_eq!(rx.borrow().level, QualityLevel::Medium);
    }

    #[test]
    fn test_evaluation_cadence_and_downgrade_cooldown() {
        let mut m = monitor();
        let mut q = AdaptiveQualityController::with_defaults();
        feed(&mut m, 0.0, 2.0, 50.0);
        assert!(q.evaluate(2.0, &m).is_some());
        assert!(q.evaluate(2.5, &m).is_none());

        feed(&mut m, 2.0, 4.0, 50.0);
        assert!(q.evaluate(4.0, &m).is_none());
        feed(&mut m, 4.0, 5.5, 50.0);
        assert_eq!(q.evaluate(5.5, &m).unwrap().to, QualityLevel::Low);
    }

    #[test]
    fn test_upgrade_only_after_comfortable_cooldown() {
        let mut m = monitor();
        let mut q = AdaptiveQualityController::new(QualityConfig {
            initial_level: QualityLevel::Low,
            ..Default::default()
        });

        let mut t = 0.0;
        while t < 9.5 {
            feed(&mut m, t, t + 1.0, 10.0);
            t += 1.0;
            assert!(q.evaluate(t, &m).is_none(), "upgraded too early at {t}");
        }
        feed(&mut m, t, t + 1.0, 10.0);
        t += 1.0;
        let change = q.evaluate(t, &m).unwrap();
        assert_eq!(change.to, QualityLevel::Medium);
        assert_eq!(change.reason, QualityChangeReason::Recovered);
    }

    #[test]
    fn test_between_comfort_and_budget_holds_level() {
        let mut m = monitor();
        let mut q = AdaptiveQualityController::new(QualityConfig {
            initial_level: QualityLevel::Medium,
            ..Default::default()
        });
        for i in 0..30 {
            let t = i as f64;
            feed(&mut m, t, t + 1.0, 28.0);
            assert!(q.evaluate(t + 1.0, &m).is_none());
        }
        assert_eq!(q.level(), QualityLevel::Medium);
    }

    #[test]
    fn test_force_downgrade() {
        let mut q = AdaptiveQualityController::with_defaults();
        assert_eq!(q.force_downgrade(0.0).unwrap().reason, QualityChangeReason::Forced);
        q.force_downgrade(0.0);
        q.force_downgrade(0.0);
        assert_eq!(q.level(), QualityLevel::Minimal);
        assert!(q.force_downgrade(0.0).is_none());
    }

    #[test]
    fn test_no_action_without_enough_samples() {
        let mut m = monitor();
        let mut q = AdaptiveQualityController::with_defaults();
        feed(&mut m, 0.0, 0.1, 90.0);
        assert!(q.evaluate(0.1, &m).is_none());
    }
}
