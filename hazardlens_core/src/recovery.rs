//! Error recovery dispatch
//!
//! Maps every failure to retry / fallback / user-action semantics and
//! decides when (if ever) the user hears about it:
//!
//! - structural failures (permissions, unsupported hardware) are surfaced
//!   once per session
//! - degraded modes (fallback detector, 2D overlays, reduced quality) stay
//!   silent until they persist past the visibility threshold
//! - every notification is rate-limited per failure kind

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

// ============================================================================
// TAXONOMY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FailureKind {
    PermissionDenied,
    UnsupportedCapability,
    DetectionServiceUnavailable,
    TrackingLost,
    PerformanceBudgetExceeded,
}

impl FailureKind {
    pub fn all() -> [FailureKind; 5] {
        [
            FailureKind::PermissionDenied,
            FailureKind::UnsupportedCapability,
            FailureKind::DetectionServiceUnavailable,
            FailureKind::TrackingLost,
            FailureKind::PerformanceBudgetExceeded,
        ]
    }

    /// Structural failures need the user (or a restart) to change something.
    pub fn is_structural(&self) -> bool {
        matches!(self, FailureKind::PermissionDenied | FailureKind::UnsupportedCapability)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::UnsupportedCapability => "unsupported_capability",
            FailureKind::DetectionServiceUnavailable => "detection_service_unavailable",
            FailureKind::TrackingLost => "tracking_lost",
            FailureKind::PerformanceBudgetExceeded => "performance_budget_exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    pub retryable: bool,
    pub fallback_available: bool,
    pub user_action_required: bool,
    pub blocking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// Ask the user to grant access
    PromptUser,
    /// The session cannot continue
    Block,
    /// Switch overlays to pose-independent 2D mode
    UseOverlayFallback,
    /// Retry with backoff, then route to the local detector
    RetryThenFallbackDetector,
    /// Reduce quality one level
    DowngradeQuality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNotification {
    pub kind: FailureKind,
    pub message: String,
    pub blocking: bool,
    pub at: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryDecision {
    pub kind: FailureKind,
    pub policy: RecoveryPolicy,
    pub action: RecoveryAction,
    pub notification: Option<UserNotification>,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Minimum spacing of notifications of the same kind (default: 60s)
    pub notification_interval_secs: f64,

    /// Degraded modes become visible after this long (default: 10s)
    pub visibility_threshold_secs: f64,

    /// Whether pose-independent 2D overlays exist on this build (default: true)
    pub overlay_fallback_available: bool,

    /// Whether a local fallback detector is installed (default: true)
    pub fallback_detector_available: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            notification_interval_secs: 60.0,
            visibility_threshold_secs: 10.0,
            overlay_fallback_available: true,
            fallback_detector_available: true,
        }
    }
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct ErrorRecoveryManager {
    config: RecoveryConfig,
    /// Start of each ongoing degraded condition
    degraded_since: HashMap<FailureKind, f64>,
    last_notified: HashMap<FailureKind, f64>,
    /// Structural kinds already shown this session
    surfaced: HashSet<FailureKind>,
    counts: HashMap<FailureKind, u64>,
}

impl ErrorRecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            degraded_since: HashMap::new(),
            last_notified: HashMap::new(),
            surfaced: HashSet::new(),
            counts: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RecoveryConfig::default())
    }

    /// Static dispatch table.
    pub fn policy(&self, kind: FailureKind) -> RecoveryPolicy {
        match kind {
            FailureKind::PermissionDenied => RecoveryPolicy {
                retryable: false,
                fallback_available: false,
                user_action_required: true,
                blocking: true,
            },
            FailureKind::UnsupportedCapability => RecoveryPolicy {
                retryable: false,
                fallback_available: self.config.overlay_fallback_available,
                user_action_required: false,
                blocking: !self.config.overlay_fallback_available,
            },
            FailureKind::DetectionServiceUnavailable => RecoveryPolicy {
                retryable: true,
                fallback_available: self.config.fallback_detector_available,
                user_action_required: false,
                blocking: false,
            },
            FailureKind::TrackingLost => RecoveryPolicy {
                retryable: false,
                fallback_available: true,
                user_action_required: false,
                blocking: false,
            },
            FailureKind::PerformanceBudgetExceeded => RecoveryPolicy {
                retryable: false,
                fallback_available: true,
                user_action_required: false,
                blocking: false,
            },
        }
    }

    fn action(kind: FailureKind, policy: &RecoveryPolicy) -> RecoveryAction {
        match kind {
            FailureKind::PermissionDenied => RecoveryAction::PromptUser,
            FailureKind::UnsupportedCapability if policy.fallback_available => RecoveryAction::UseOverlayFallback,
            FailureKind::UnsupportedCapability => RecoveryAction::Block,
            FailureKind::DetectionServiceUnavailable => RecoveryAction::RetryThenFallbackDetector,
            FailureKind::TrackingLost => RecoveryAction::UseOverlayFallback,
            FailureKind::PerformanceBudgetExceeded => RecoveryAction::DowngradeQuality,
        }
    }

    fn message(kind: FailureKind, blocking: bool) -> String {
        match kind {
            FailureKind::PermissionDenied => "Camera access is required to detect hazards. Enable it in Settings.".into(),
            FailureKind::UnsupportedCapability if blocking => {
                "This device does not support spatial tracking.".into()
            }
            FailureKind::UnsupportedCapability => {
                "Spatial tracking is unavailable; hazards are shown as a list.".into()
            }
            FailureKind::DetectionServiceUnavailable => {
                "Hazard analysis is running in offline mode with reduced accuracy.".into()
            }
            FailureKind::TrackingLost => {
                "Tracking is limited. Move slowly and point the camera at a textured, well-lit area.".into()
            }
            FailureKind::PerformanceBudgetExceeded => {
                "Detection quality was reduced to save power.".into()
            }
        }
    }

    fn rate_limited(&self, kind: FailureKind, now: f64) -> bool {
        self.last_notified
            .get(&kind)
            .is_some_and(|t| now - t < self.config.notification_interval_secs)
    }

    /// Record a failure and decide the response.
    pub fn report(&mut self, kind: FailureKind, detail: &str, now: f64) -> RecoveryDecision {
        *self.counts.entry(kind).or_insert(0) += 1;
        let policy = self.policy(kind);
        let action = Self::action(kind, &policy);

        let notify = if kind.is_structural() {
            warn!("{}: {}", kind.as_str(), detail);
            !self.surfaced.contains(&kind)
        } else {
            debug!("{}: {}", kind.as_str(), detail);
            let since = *self.degraded_since.entry(kind).or_insert(now);
            now - since >= self.config.visibility_threshold_secs
        };

        let notification = if notify && !self.rate_limited(kind, now) {
            self.last_notified.insert(kind, now);
            if kind.is_structural() {
                self.surfaced.insert(kind);
            }
            info!("Notifying user: {}", kind.as_str());
            Some(UserNotification {
                kind,
                message: Self::message(kind, policy.blocking),
                blocking: policy.blocking,
                at: now,
            })
        } else {
            None
        };

        RecoveryDecision {
            kind,
            policy,
            action,
            notification,
        }
    }

    /// The degraded condition ended (tracking resumed, remote detector back).
    pub fn resolve(&mut self, kind: FailureKind) {
        if self.degraded_since.remove(&kind).is_some() {
            debug!("{} resolved", kind.as_str());
        }
    }

    pub fn is_degraded(&self, kind: FailureKind) -> bool {
        self.degraded_since.contains_key(&kind)
    }

    pub fn failure_count(&self, kind: FailureKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_table() {
        let m = ErrorRecoveryManager::with_defaults();
        let p = m.policy(FailureKind::PermissionDenied);
        assert!(p.blocking && p.user_action_required && !p.retryable);

        let p = m.policy(FailureKind::DetectionServiceUnavailable);
        assert!(p.retryable && p.fallback_available && !p.blocking);

        let p = m.policy(FailureKind::TrackingLost);
        assert!(!p.blocking && !p.user_action_required);
    }

    #[test]
    fn test_unsupported_blocks_without_overlay_fallback() {
        let with = ErrorRecoveryManager::with_defaults();
        assert!(!with.policy(FailureKind::UnsupportedCapability).blocking);

        let mut without = ErrorRecoveryManager::new(RecoveryConfig {
            overlay_fallback_available: false,
            ..Default::default()
        });
        let d = without.report(FailureKind::UnsupportedCapability, "no lidar", 0.0);
        assert!(d.policy.blocking);
        assert_eq!(d.action, RecoveryAction::Block);
    }

    #[test]
    fn test_structural_error_surfaced_once_per_session() {
        let mut m = ErrorRecoveryManager::with_defaults();
        assert!(m.report(FailureKind::PermissionDenied, "camera", 0.0).notification.is_some());
        for i in 1..200 {
            let d = m.report(FailureKind::PermissionDenied, "camera", i as f64);
            assert!(d.notification.is_none());
        }
        assert_eq!(m.failure_count(FailureKind::PermissionDenied), 200);
    }

    #[test]
    fn test_degraded_mode_silent_until_visibility_threshold() {
        let mut m = ErrorRecoveryManager::with_defaults();
        for i in 0..10 {
            let d = m.report(FailureKind::TrackingLost, "low light", i as f64);
            assert!(d.notification.is_none());
            assert_eq!(d.action, RecoveryAction::UseOverlayFallback);
        }
        assert!(m.report(FailureKind::TrackingLost, "low light", 10.0).notification.is_some());
        // Rate-limited afterwards
        assert!(m.report(FailureKind::TrackingLost, "low light", 11.0).notification.is_none());
        assert!(m.report(FailureKind::TrackingLost, "low light", 71.0).notification.is_some());
    }

    #[test]
    fn test_resolve_resets_visibility_timer() {
        let mut m = ErrorRecoveryManager::with_defaults();
        m.report(FailureKind::DetectionServiceUnavailable, "timeout", 0.0);
        assert!(m.is_degraded(FailureKind::DetectionServiceUnavailable));
        m.resolve(FailureKind::DetectionServiceUnavailable);
        assert!(!m.is_degraded(FailureKind::DetectionServiceUnavailable));
        let d = m.report(FailureKind::DetectionServiceUnavailable, "timeout", 15.0);
        assert!(d.notification.is_none());
    }

    #[test]
    fn test_budget_exceeded_downgrades_quality() {
        let mut m = ErrorRecoveryManager::with_defaults();
        let d = m.report(FailureKind::PerformanceBudgetExceeded, "frame time", 0.0);
        assert_eq!(d.action, RecoveryAction::DowngradeQuality);
        assert!(d.notification.is_none());
    }
}
