//! The "TRACKING" Engine - pose state machine and anchor table
//!
//! ```text
//!                  Normal                Limited(reason)
//!  Initializing ──────────▶ Tracking ◀───────────────▶ Limited(reason)
//!        ▲                     │                          │
//!        │                     │ stop()                   │ Initializing report
//!        │  reinitialize()     ▼                          ▼
//!        └─────────────────  Stopped                 Initializing
//! ```
//!
//! `Tracking` never goes straight back to `Initializing`: a platform
//! re-initialization while tracking is reported as `Limited(Relocalizing)`
//! first. `Stopped` is terminal until `reinitialize()`. Loss of tracking is
//! never fatal; it only degrades overlays to the 2D fallback mode.

use crate::frame::{LimitedReason, PlatformTrackingStatus};
use crate::geometry::CameraPose;
use crate::hazard::AnchorId;
use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the TrackingStateManager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingStateConfig {
    /// Platform quality below which a "Normal" frame counts as limited (default: 0.3)
    pub min_tracking_quality: f32,

    /// How long `Limited` may persist before overlays fall back to 2D (default: 3s)
    pub limited_fallback_after_secs: f64,

    /// Anchors unconfirmed for longer than this are removed (default: 30s)
    pub anchor_timeout_secs: f64,
}

impl Default for TrackingStateConfig {
    fn default() -> Self {
        Self {
            min_tracking_quality: 0.3,
            limited_fallback_after_secs: 3.0,
            anchor_timeout_secs: 30.0,
        }
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Session-level tracking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingState {
    Initializing,
    Tracking,
    Limited(LimitedReason),
    Stopped,
}

impl Default for TrackingState {
    fn default() -> Self {
        Self::Initializing
    }
}

impl TrackingState {
    pub fn is_limited(&self) -> bool {
        matches!(self, TrackingState::Limited(_))
    }

    /// Whether world-anchored overlays can be trusted in this state.
    pub fn has_reliable_pose(&self) -> bool {
        matches!(self, TrackingState::Tracking)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrackingState::Initializing => "initializing",
            TrackingState::Tracking => "tracking",
            TrackingState::Limited(_) => "limited",
            TrackingState::Stopped => "stopped",
        }
    }
}

/// A state change, reported to the session for recovery/telemetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingTransition {
    pub from: TrackingState,
    pub to: TrackingState,
    pub at: f64,
}

// ============================================================================
// ANCHORS
// ============================================================================

/// A stable spatial reference keeping a hazard in place as the camera moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingAnchor {
    pub id: AnchorId,

    /// World pose of the anchor
    pub pose: Isometry3<f64>,

    pub created_at: f64,

    pub last_confirmed_at: f64,
}

/// Anchors keyed by id. Hazards hold `AnchorId`s, never the anchors
/// themselves.
#[derive(Debug, Clone, Default)]
pub struct AnchorTable {
    anchors: HashMap<AnchorId, TrackingAnchor>,
}

impl AnchorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an anchor at `pose`, confirmed now.
    pub fn create(&mut self, pose: Isometry3<f64>, now: f64) -> AnchorId {
        let id = AnchorId::new();
        self.anchors.insert(
            id,
            TrackingAnchor {
                id,
                pose,
                created_at: now,
                last_confirmed_at: now,
            },
        );
        id
    }

    /// Mark an anchor as confirmed, optionally moving it. Returns `false`
    /// if the anchor no longer exists.
    pub fn confirm(&mut self, id: AnchorId, now: f64, pose: Option<Isometry3<f64>>) -> bool {
        match self.anchors.get_mut(&id) {
            Some(anchor) => {
                anchor.last_confirmed_at = anchor.last_confirmed_at.max(now);
                if let Some(pose) = pose {
                    anchor.pose = pose;
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &AnchorId) -> Option<&TrackingAnchor> {
        self.anchors.get(id)
    }

    pub fn contains(&self, id: &AnchorId) -> bool {
        self.anchors.contains_key(id)
    }

    pub fn remove(&mut self, id: &AnchorId) -> Option<TrackingAnchor> {
        self.anchors.remove(id)
    }

    /// Remove anchors with `now - last_confirmed_at > timeout`.
    pub fn expire(&mut self, now: f64, timeout: f64) -> Vec<AnchorId> {
        let expired: Vec<AnchorId> = self
            .anchors
            .values()
            .filter(|a| now - a.last_confirmed_at > timeout)
            .map(|a| a.id)
            .collect();
        for id in &expired {
            self.anchors.remove(id);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.anchors.clear();
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackingAnchor> {
        self.anchors.values()
    }
}

// ============================================================================
// TRACKING STATE MANAGER
// ============================================================================

/// Owns the tracking state machine, the last confirmed pose and the anchors.
#[derive(Debug)]
pub struct TrackingStateManager {
    config: TrackingStateConfig,
    state: TrackingState,
    state_since: f64,
    /// When the current run of `Limited` states began
    limited_since: Option<f64>,
    last_confirmed_pose: Option<CameraPose>,
    anchors: AnchorTable,
}

impl TrackingStateManager {
    pub fn new(config: TrackingStateConfig) -> Self {
        Self {
            config,
            state: TrackingState::Initializing,
            state_since: 0.0,
            limited_since: None,
            last_confirmed_pose: None,
            anchors: AnchorTable::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TrackingStateConfig::default())
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    /// Session time at which the current state was entered.
    pub fn state_since(&self) -> f64 {
        self.state_since
    }

    pub fn last_confirmed_pose(&self) -> Option<CameraPose> {
        self.last_confirmed_pose
    }

    pub fn anchors(&self) -> &AnchorTable {
        &self.anchors
    }

    pub fn anchors_mut(&mut self) -> &mut AnchorTable {
        &mut self.anchors
    }

    pub fn config(&self) -> &TrackingStateConfig {
        &self.config
    }

    /// Desired state for a platform report, before transition guards.
    fn classify(&self, status: PlatformTrackingStatus, quality: f32) -> TrackingState {
        match status {
            PlatformTrackingStatus::Normal if quality >= self.config.min_tracking_quality => {
                TrackingState::Tracking
            }
            PlatformTrackingStatus::Normal => TrackingState::Limited(LimitedReason::InsufficientFeatures),
            PlatformTrackingStatus::Limited(reason) => TrackingState::Limited(reason),
            PlatformTrackingStatus::Initializing | PlatformTrackingStatus::NotAvailable => {
                TrackingState::Initializing
            }
        }
    }

    /// Apply one platform report. Returns the transition if the state changed.
    ///
    /// Frames are ignored while `Stopped`.
    pub fn update(
        &mut self,
        status: PlatformTrackingStatus,
        quality: f32,
        pose: CameraPose,
        now: f64,
    ) -> Option<TrackingTransition> {
        if self.state == TrackingState::Stopped {
            return None;
        }

        let mut target = self.classify(status, quality);
        if self.state == TrackingState::Tracking && target == TrackingState::Initializing {
            target = TrackingState::Limited(LimitedReason::Relocalizing);
        }

        if target == TrackingState::Tracking {
            self.last_confirmed_pose = Some(pose);
        }

        self.transition_to(target, now)
    }

    fn transition_to(&mut self, target: TrackingState, now: f64) -> Option<TrackingTransition> {
        if target == self.state {
            return None;
        }

        let from = self.state;
        match (from.is_limited(), target.is_limited()) {
            (false, true) => self.limited_since = Some(now),
            (true, false) => self.limited_since = None,
            _ => {}
        }

        self.state = target;
        self.state_since = now;

        match target {
            TrackingState::Limited(reason) => {
                debug!("Tracking {} -> limited ({})", from.name(), reason.describe())
            }
            _ => info!("Tracking {} -> {}", from.name(), target.name()),
        }

        Some(TrackingTransition { from, to: target, at: now })
    }

    /// Stop tracking: terminal until `reinitialize`. Drops all anchors.
    pub fn stop(&mut self, now: f64) -> Option<TrackingTransition> {
        self.anchors.clear();
        self.transition_to(TrackingState::Stopped, now)
    }

    /// Restart after `stop`. No-op in any other state.
    pub fn reinitialize(&mut self, now: f64) -> Option<TrackingTransition> {
        if self.state != TrackingState::Stopped {
            return None;
        }
        self.last_confirmed_pose = None;
        self.transition_to(TrackingState::Initializing, now)
    }

    /// Whether the renderer should use pose-independent 2D overlays.
    pub fn fallback_mode(&self, now: f64) -> bool {
        match self.state {
            TrackingState::Stopped => true,
            TrackingState::Limited(_) => self
                .limited_since
                .map(|since| now - since > self.config.limited_fallback_after_secs)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Expire stale anchors (all anchors when stopped).
    pub fn expire_anchors(&mut self, now: f64) -> Vec<AnchorId> {
        if self.state == TrackingState::Stopped {
            let ids: Vec<AnchorId> = self.anchors.iter().map(|a| a.id).collect();
            self.anchors.clear();
            return ids;
        }
        self.anchors.expire(now, self.config.anchor_timeout_secs)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pose(t: f64) -> CameraPose {
        CameraPose::identity(t)
    }

    fn tracking_manager() -> TrackingStateManager {
        let mut m = TrackingStateManager::with_defaults();
        m.update(PlatformTrackingStatus::Normal, 0.9, pose(0.0), 0.0);
        assert_eq!(m.state(), TrackingState::Tracking);
        m
    }

    #[test]
    fn test_starts_initializing() {
        let m = TrackingStateManager::with_defaults();
        assert_eq!(m.state(), TrackingState::Initializing);
        assert!(m.last_confirmed_pose().is_none());
    }

    #[test]
    fn test_tracking_to_limited_and_back() {
        let mut m = tracking_manager();
        let t = m
            .update(PlatformTrackingStatus::Limited(LimitedReason::ExcessiveMotion), 0.5, pose(1.0), 1.0)
            .unwrap();
        assert_eq!(t.from, TrackingState::Tracking);
        assert_eq!(t.to, TrackingState::Limited(LimitedReason::ExcessiveMotion));

        m.update(PlatformTrackingStatus::Normal, 0.9, pose(2.0), 2.0);
        assert_eq!(m.state(), TrackingState::Tracking);
        assert_eq!(m.last_confirmed_pose().unwrap().timestamp(), 2.0);
    }

    #[test]
    fn test_low_quality_normal_counts_as_limited() {
        let mut m = tracking_manager();
        m.update(PlatformTrackingStatus::Normal, 0.1, pose(1.0), 1.0);
        assert_eq!(m.state(), TrackingState::Limited(LimitedReason::InsufficientFeatures));
        // Last confirmed pose is the last Tracking one
        assert_eq!(m.last_confirmed_pose().unwrap().timestamp(), 0.0);
    }

    #[test]
    fn test_tracking_never_goes_directly_to_initializing() {
        let mut m = tracking_manager();
        let t = m.update(PlatformTrackingStatus::Initializing, 0.0, pose(1.0), 1.0).unwrap();
        assert_eq!(t.from, TrackingState::Tracking);
        assert_eq!(t.to, TrackingState::Limited(LimitedReason::Relocalizing));

        // From Limited, a re-initialization is allowed
        let t = m.update(PlatformTrackingStatus::NotAvailable, 0.0, pose(2.0), 2.0).unwrap();
        assert_eq!(t.to, TrackingState::Initializing);
    }

    #[test]
    fn test_transition_sequence_never_tracking_to_initializing() {
        let statuses = [
            PlatformTrackingStatus::Normal,
            PlatformTrackingStatus::Initializing,
            PlatformTrackingStatus::Normal,
            PlatformTrackingStatus::NotAvailable,
            PlatformTrackingStatus::Limited(LimitedReason::InsufficientLight),
            PlatformTrackingStatus::Initializing,
            PlatformTrackingStatus::Normal,
            PlatformTrackingStatus::Initializing,
        ];
        let mut m = TrackingStateManager::with_defaults();
        for (i, s) in statuses.iter().cycle().take(64).enumerate() {
            let t = i as f64 * 0.1;
            if let Some(tr) = m.update(*s, 0.8, pose(t), t) {
                assert!(
                    !(tr.from == TrackingState::Tracking && tr.to == TrackingState::Initializing),
                    "illegal transition at step {}",
                    i
                );
            }
        }
    }

    #[test]
    fn test_stopped_is_terminal_until_reinitialized() {
        let mut m = tracking_manager();
        m.stop(1.0);
        assert_eq!(m.state(), TrackingState::Stopped);
        assert!(m.update(PlatformTrackingStatus::Normal, 1.0, pose(2.0), 2.0).is_none());
        assert_eq!(m.state(), TrackingState::Stopped);

        let t = m.reinitialize(3.0).unwrap();
        assert_eq!(t.to, TrackingState::Initializing);
        assert!(m.reinitialize(3.5).is_none());
    }

    #[test]
    fn test_fallback_mode_after_persistent_limited() {
        let mut m = tracking_manager();
        m.update(PlatformTrackingStatus::Limited(LimitedReason::InsufficientLight), 0.4, pose(1.0), 1.0);
        assert!(!m.fallback_mode(2.0));
        // Reason changes do not reset the limited timer
        m.update(PlatformTrackingStatus::Limited(LimitedReason::ExcessiveMotion), 0.4, pose(3.0), 3.0);
        assert!(m.fallback_mode(4.5));

        m.update(PlatformTrackingStatus::Normal, 0.9, pose(5.0), 5.0);
        assert!(!m.fallback_mode(5.0));
    }

    #[test]
    fn test_fallback_mode_when_stopped() {
        let mut m = tracking_manager();
        m.stop(1.0);
        assert!(m.fallback_mode(1.0));
    }

    #[test]
    fn test_anchor_expiry() {
        let mut m = tracking_manager();
        let a = m.anchors_mut().create(Isometry3::identity(), 0.0);
        let b = m.anchors_mut().create(Isometry3::identity(), 0.0);
        assert!(m.anchors_mut().confirm(b, 25.0, None));

        let expired = m.expire_anchors(31.0);
        assert_eq!(expired, vec![a]);
        assert!(m.anchors().contains(&b));
        assert!(!m.anchors_mut().confirm(a, 31.0, None));
    }

    #[test]
    fn test_stop_clears_anchors() {
        let mut m = tracking_manager();
        m.anchors_mut().create(Isometry3::identity(), 0.0);
        m.stop(1.0);
        assert!(m.anchors().is_empty());
    }
}
