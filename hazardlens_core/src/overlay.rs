//! The "OVERLAY" Engine - filtering, prioritization and projection
//!
//! Runs every render tick against the latest hazard snapshot and this tick's
//! pose. Output is derived data only; nothing here is cached across ticks.
//!
//! ```text
//!   snapshot ─▶ filter ─▶ prioritize ─▶ truncate(max_visible) ─▶ project ─▶ RenderFrame
//!                                                  │
//!                                  fallback_mode ──┴─▶ stacked 2D banners
//! ```

use crate::coordinate_transform::CoordinateTransformer;
use crate::geometry::{BoundingVolume, CameraIntrinsics, CameraPose, ScreenPoint, ScreenRect};
use crate::hazard::{DetectedHazard, HazardType, Severity};
use crate::registry::HazardSnapshot;
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Half-angle (degrees) of the cone described as "ahead".
const AHEAD_HALF_ANGLE_DEG: f64 = 20.0;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prioritization {
    /// Nearest first
    DistanceFirst,
    /// Most severe first, then most confident
    SeverityFirst,
}

/// Which hazards are shown and how many.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Severities shown (default: all)
    pub enabled_severities: BTreeSet<Severity>,

    /// Hazard types shown (default: all)
    pub enabled_types: BTreeSet<HazardType>,

    /// Hazards below this confidence are hidden (default: 0.5)
    pub min_confidence: f32,

    /// Upper bound on rendered items (default: 8)
    pub max_visible: usize,

    /// (default: SeverityFirst)
    pub prioritization: Prioritization,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled_severities: Severity::all().into_iter().collect(),
            enabled_types: HazardType::all().into_iter().collect(),
            min_confidence: 0.5,
            max_visible: 8,
            prioritization: Prioritization::SeverityFirst,
        }
    }
}

impl FilterConfig {
    pub fn accepts(&self, hazard: &DetectedHazard) -> bool {
        self.enabled_severities.contains(&hazard.severity)
            && self.enabled_types.contains(&hazard.hazard_type)
            && hazard.confidence >= self.min_confidence
    }
}

/// Layout of the pose-independent banner list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackLayout {
    /// (default: 96px)
    pub banner_height_px: f64,
    /// (default: 12px)
    pub spacing_px: f64,
    /// (default: 24px)
    pub margin_px: f64,
}

impl Default for FallbackLayout {
    fn default() -> Self {
        Self {
            banner_height_px: 96.0,
            spacing_px: 12.0,
            margin_px: 24.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub filter: FilterConfig,
    pub fallback_layout: FallbackLayout,
}

// ============================================================================
// OUTPUT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlayStyle {
    /// RGBA
    pub color: [u8; 4],
    pub scale: f32,
    pub pulsing: bool,
    /// Anchored in the scene (false for 2D banners)
    pub world_anchored: bool,
}

impl OverlayStyle {
    fn for_severity(severity: Severity, scale: f32, world_anchored: bool) -> Self {
        let color = match severity {
            Severity::Critical => [220, 38, 38, 230],
            Severity::Warning => [245, 158, 11, 220],
            Severity::Info => [59, 130, 246, 200],
        };
        Self {
            color,
            scale,
            pulsing: severity == Severity::Critical,
            world_anchored,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayRenderItem {
    pub hazard_id: Uuid,
    pub hazard_type: HazardType,
    pub severity: Severity,
    pub screen_rect: ScreenRect,
    /// View-space depth of the hazard center (meters)
    pub depth: f64,
    pub visible: bool,
    pub style: OverlayStyle,
    pub accessibility_label: String,
}

/// Everything the renderer needs for one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderFrame {
    pub items: Vec<OverlayRenderItem>,
    pub fallback_mode: bool,
    /// Generation of the snapshot these items came from
    pub snapshot_generation: u64,
    /// Timestamp of the pose they were projected with
    pub pose_timestamp: f64,
}

impl RenderFrame {
    pub fn visible_count(&self) -> usize {
        self.items.iter().filter(|i| i.visible).count()
    }

    pub fn accessibility_descriptions(&self) -> Vec<&str> {
        self.items
            .iter()
            .filter(|i| i.visible)
            .map(|i| i.accessibility_label.as_str())
            .collect()
    }
}

// ============================================================================
// OVERLAY MANAGER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct OverlayManager {
    config: OverlayConfig,
}

impl OverlayManager {
    pub fn new(config: OverlayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn set_filter(&mut self, filter: FilterConfig) {
        self.config.filter = filter;
    }

    /// Compute this tick's render list.
    pub fn compute(
        &self,
        snapshot: &HazardSnapshot,
        pose: &CameraPose,
        camera: &CameraIntrinsics,
        fallback_mode: bool,
    ) -> RenderFrame {
        let filter = &self.config.filter;
        let mut candidates: Vec<(&DetectedHazard, f64)> = snapshot
            .hazards
            .iter()
            .filter(|h| filter.accepts(h))
            .map(|h| (h, pose.distance_to(&h.bounding_volume.center)))
            .collect();

        candidates.sort_by(|a, b| Self::priority(filter.prioritization, a, b));
        candidates.truncate(filter.max_visible);

        let items = if fallback_mode {
            self.layout_fallback(&candidates, camera)
        } else {
            Self::project(&candidates, pose, camera)
        };

        RenderFrame {
            items,
            fallback_mode,
            snapshot_generation: snapshot.generation,
            pose_timestamp: pose.timestamp(),
        }
    }

    fn priority(mode: Prioritization, a: &(&DetectedHazard, f64), b: &(&DetectedHazard, f64)) -> Ordering {
        let by_distance = a.1.total_cmp(&b.1);
        let primary = match mode {
            Prioritization::DistanceFirst => by_distance,
            Prioritization::SeverityFirst => b
                .0
                .severity
                .cmp(&a.0.severity)
                .then_with(|| b.0.confidence.total_cmp(&a.0.confidence))
                .then(by_distance),
        };
        primary.then_with(|| a.0.id.cmp(&b.0.id))
    }

    fn project(candidates: &[(&DetectedHazard, f64)], pose: &CameraPose, camera: &CameraIntrinsics) -> Vec<OverlayRenderItem> {
        let viewport = &camera.viewport;
        let view = CoordinateTransformer::view_matrix(pose);
        let proj = CoordinateTransformer::projection_matrix(camera.fov_y, viewport.aspect(), camera.near, camera.far);

        candidates
            .iter()
            .map(|(hazard, distance)| {
                let bv = &hazard.bounding_volume;
                let center = CoordinateTransformer::world_to_screen(&bv.center, &view, &proj, viewport);
                let outline = clipped_outline(bv, &view, &proj, camera);

                let scale = CoordinateTransformer::overlay_scale(*distance);
                let (screen_rect, depth, visible) = match ScreenRect::bounding(&outline) {
                    Some(rect) => {
                        let rect = rect.scaled(scale as f64);
                        let depth = center.map_or(camera.near, |c| c.depth.max(camera.near));
                        (rect, depth, rect.intersects(viewport))
                    }
                    None => (ScreenRect::default(), center.map_or(0.0, |c| c.depth), false),
                };

                OverlayRenderItem {
                    hazard_id: hazard.id,
                    hazard_type: hazard.hazard_type,
                    severity: hazard.severity,
                    screen_rect,
                    depth,
                    visible,
                    style: OverlayStyle::for_severity(hazard.severity, scale, true),
                    accessibility_label: describe(hazard, *distance, Some(pose)),
                }
            })
            .collect()
    }

    /// Stacked banners, independent of the (unreliable) pose.
    fn layout_fallback(&self, candidates: &[(&DetectedHazard, f64)], camera: &CameraIntrinsics) -> Vec<OverlayRenderItem> {
        let layout = &self.config.fallback_layout;
        let width = (camera.viewport.width - 2.0 * layout.margin_px).max(0.0);

        candidates
            .iter()
            .enumerate()
            .map(|(i, (hazard, distance))| {
                let y = layout.margin_px + i as f64 * (layout.banner_height_px + layout.spacing_px);
                OverlayRenderItem {
                    hazard_id: hazard.id,
                    hazard_type: hazard.hazard_type,
                    severity: hazard.severity,
                    screen_rect: ScreenRect::new(layout.margin_px, y, width, layout.banner_height_px),
                    depth: *distance,
                    visible: true,
                    style: OverlayStyle::for_severity(hazard.severity, 1.0, false),
                    accessibility_label: describe(hazard, *distance, None),
                }
            })
            .collect()
    }
}

// ============================================================================
// ACCESSIBILITY
// ============================================================================

/// Screen-reader description, e.g. "Critical fall protection hazard, 3.2 meters ahead".
///
/// Without a pose (fallback mode) the direction is unknown and omitted.
/// Screen outline of a volume clipped to the near plane.
///
/// Corners in front of the plane project directly. Every corner pair that
/// crosses the plane adds its crossing point, so a volume straddling the
/// plane keeps its full on-screen extent. Empty when nothing is in front.
fn clipped_outline(
    bv: &BoundingVolume,
    view: &Matrix4<f64>,
    proj: &Matrix4<f64>,
    camera: &CameraIntrinsics,
) -> Vec<ScreenPoint> {
    let near = camera.near;
    let corners = bv.corners();
    let depths = corners.map(|c| -(view * c.push(1.0)).z);

    let mut world_points = Vec::with_capacity(corners.len() * 2);
    for i in 0..corners.len() {
        let (a, da) = (corners[i], depths[i]);
        if da >= near {
            world_points.push(a);
        }
        for j in (i + 1)..corners.len() {
            let (b, db) = (corners[j], depths[j]);
            if (da >= near) != (db >= near) {
                let t = (da - near) / (da - db);
                world_points.push(a + (b - a) * t);
            }
        }
    }

    world_points
        .iter()
        .filter_map(|p| CoordinateTransformer::world_to_screen(p, view, proj, &camera.viewport))
        .collect()
}

pub fn describe(hazard: &DetectedHazard, distance: f64, pose: Option<&CameraPose>) -> String {
    let head = format!("{} {} hazard", hazard.severity.label(), hazard.hazard_type.display_name());
    match pose {
        Some(pose) => {
            let local = CoordinateTransformer::world_to_camera(pose, &hazard.bounding_volume.center);
            format!("{head}, {distance:.1} meters {}", direction(local.x, local.z))
        }
        None => format!("{head} detected nearby"),
    }
}

/// Coarse direction from camera-space coordinates (camera looks down -Z).
fn direction(x: f64, z: f64) -> &'static str {
    if z >= 0.0 {
        return "behind you";
    }
    let angle = x.atan2(-z).to_degrees();
    if angle.abs() <= AHEAD_HALF_ANGLE_DEG {
        "ahead"
    } else if angle < 0.0 {
        "to your left"
    } else {
        "to your right"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use proptest::prelude::*;

    fn hazard(hazard_type: HazardType, severity: Severity, confidence: f32, center: Vector3<f64>) -> DetectedHazard {
        DetectedHazard {
            id: Uuid::new_v4(),
            hazard_type,
            bounding_volume: BoundingVolume::axis_aligned(center, Vector3::new(1.0, 1.0, 1.0)),
            confidence,
            severity,
            regulatory_refs: vec![],
            recommended_actions: vec![],
            anchor_id: None,
            first_seen: 0.0,
            last_confirmed: 0.0,
        }
    }

    fn snapshot(hazards: Vec<DetectedHazard>) -> HazardSnapshot {
        HazardSnapshot {
            generation: 7,
            hazards,
            as_of: 0.0,
        }
    }

    #[test]
    fn test_filter_by_severity_type_and_confidence() {
        let mut filter = FilterConfig::default();
        filter.enabled_severities.remove(&Severity::Info);
        filter.enabled_types.remove(&HazardType::Vehicle);
        let manager = OverlayManager::new(OverlayConfig {
            filter,
            ..Default::default()
        });

        let snap = snapshot(vec![
            hazard(HazardType::FallProtection, Severity::Critical, 0.9, Vector3::new(0.0, 0.0, -3.0)),
            hazard(HazardType::TripHazard, Severity::Info, 0.9, Vector3::new(0.0, 0.0, -3.0)),
            hazard(HazardType::Vehicle, Severity::Warning, 0.9, Vector3::new(0.0, 0.0, -3.0)),
            hazard(HazardType::Crane, Severity::Critical, 0.2, Vector3::new(0.0, 0.0, -3.0)),
        ]);
        let frame = manager.compute(&snap, &CameraPose::identity(0.0), &CameraIntrinsics::default(), false);
        assert_eq!(frame.items.len(), 1);
        assert_eq!(frame.items[0].hazard_type, HazardType::FallProtection);
        assert_eq!(frame.snapshot_generation, 7);
    }

    #[test]
    fn test_distance_first_ordering() {
        let manager = OverlayManager::new(OverlayConfig {
            filter: FilterConfig {
                prioritization: Prioritization::DistanceFirst,
                ..Default::default()
            },
            ..Default::default()
        });
        let snap = snapshot(vec![
            hazard(HazardType::Crane, Severity::Critical, 0.9, Vector3::new(0.0, 0.0, -12.0)),
            hazard(HazardType::TripHazard, Severity::Info, 0.6, Vector3::new(0.0, 0.0, -2.0)),
            hazard(HazardType::Vehicle, Severity::Warning, 0.7, Vector3::new(0.0, 0.0, -6.0)),
        ]);
        let frame = manager.compute(&snap, &CameraPose::identity(0.0), &CameraIntrinsics::default(), false);
        let order: Vec<HazardType> = frame.items.iter().map(|i| i.hazard_type).collect();
        assert_eq!(order, vec![HazardType::TripHazard, HazardType::Vehicle, HazardType::Crane]);
        // Nearer overlays are drawn larger
        assert!(frame.items[0].style.scale > frame.items[2].style.scale);
    }

    #[test]
    fn test_severity_first_then_confidence() {
        let manager = OverlayManager::default();
        let snap = snapshot(vec![
            hazard(HazardType::TripHazard, Severity::Info, 0.99, Vector3::new(0.0, 0.0, -2.0)),
            hazard(HazardType::Crane, Severity::Critical, 0.6, Vector3::new(0.0, 0.0, -12.0)),
            hazard(HazardType::Electrical, Severity::Critical, 0.8, Vector3::new(0.0, 0.0, -9.0)),
        ]);
        let frame = manager.compute(&snap, &CameraPose::identity(0.0), &CameraIntrinsics::default(), false);
        let order: Vec<HazardType> = frame.items.iter().map(|i| i.hazard_type).collect();
        assert_eq!(order, vec![HazardType::Electrical, HazardType::Crane, HazardType::TripHazard]);
    }

    #[test]
    fn test_behind_camera_is_not_visible() {
        let manager = OverlayManager::default();
        let snap = snapshot(vec![hazard(
            HazardType::Excavation,
            Severity::Critical,
            0.9,
            Vector3::new(0.0, 0.0, 5.0),
        )]);
        let frame = manager.compute(&snap, &CameraPose::identity(0.0), &CameraIntrinsics::default(), false);
        assert_eq!(frame.items.len(), 1);
        assert!(!frame.items[0].visible);
        assert!(frame.accessibility_descriptions().is_empty());
    }

    #[test]
    fn test_volume_straddling_near_plane_keeps_full_extent() {
        let manager = OverlayManager::default();
        let camera = CameraIntrinsics::default();
        let mut h = hazard(HazardType::FallProtection, Severity::Critical, 0.9, Vector3::new(0.0, 0.0, -0.3));
        // Thin post running from 1.3m ahead to 0.7m behind the camera
        h.bounding_volume = BoundingVolume::axis_aligned(Vector3::new(0.0, 0.0, -0.3), Vector3::new(0.2, 0.2, 2.0));

        let frame = manager.compute(&snapshot(vec![h]), &CameraPose::identity(0.0), &camera, false);
        let item = &frame.items[0];
        assert!(item.visible);
        // Far corners alone would give a rect about a third of the viewport wide
        assert!(item.screen_rect.width > camera.viewport.width);
        assert!(item.screen_rect.height > camera.viewport.height);
        let (cx, cy) = item.screen_rect.center();
        assert!((cx - camera.viewport.width / 2.0).abs() < 1.0);
        assert!((cy - camera.viewport.height / 2.0).abs() < 1.0);
        assert!((item.depth - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_volume_entirely_inside_near_plane_is_not_visible() {
        let manager = OverlayManager::default();
        let mut h = hazard(HazardType::TripHazard, Severity::Warning, 0.9, Vector3::new(0.0, 0.0, -0.02));
        h.bounding_volume = BoundingVolume::axis_aligned(Vector3::new(0.0, 0.0, -0.02), Vector3::new(0.01, 0.01, 0.01));

        let frame = manager.compute(&snapshot(vec![h]), &CameraPose::identity(0.0), &CameraIntrinsics::default(), false);
        assert!(!frame.items[0].visible);
    }

    #[test]
    fn test_in_view_hazard_is_projected_near_center() {
        let manager = OverlayManager::default();
        let camera = CameraIntrinsics::default();
        let snap = snapshot(vec![hazard(
            HazardType::FallProtection,
            Severity::Critical,
            0.9,
            Vector3::new(0.0, 0.0, -4.0),
        )]);
        let frame = manager.compute(&snap, &CameraPose::identity(0.0), &camera, false);
        let item = &frame.items[0];
        assert!(item.visible);
        let (cx, cy) = item.screen_rect.center();
        assert!((cx - camera.viewport.width / 2.0).abs() < 1.0);
        assert!((cy - camera.viewport.height / 2.0).abs() < 1.0);
        assert!((item.depth - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_accessibility_string() {
        let h = hazard(
            HazardType::FallProtection,
            Severity::Critical,
            0.9,
            Vector3::new(0.0, 0.0, -3.2),
        );
        let pose = CameraPose::identity(0.0);
        assert_eq!(
            describe(&h, 3.2, Some(&pose)),
            "Critical fall protection hazard, 3.2 meters ahead"
        );

        let left = hazard(HazardType::Crane, Severity::Warning, 0.9, Vector3::new(-5.0, 0.0, -2.0));
        assert!(describe(&left, 5.4, Some(&pose)).ends_with("to your left"));
        assert_eq!(describe(&left, 5.4, None), "Warning crane hazard detected nearby");
    }

    #[test]
    fn test_fallback_mode_stacks_banners() {
        let manager = OverlayManager::default();
        let camera = CameraIntrinsics::default();
        let snap = snapshot(vec![
            hazard(HazardType::Crane, Severity::Critical, 0.9, Vector3::new(0.0, 0.0, 30.0)),
            hazard(HazardType::Vehicle, Severity::Warning, 0.9, Vector3::new(3.0, 0.0, -1.0)),
        ]);
        let frame = manager.compute(&snap, &CameraPose::identity(0.0), &camera, true);
        assert!(frame.fallback_mode);
        assert_eq!(frame.visible_count(), 2);
        let (a, b) = (&frame.items[0].screen_rect, &frame.items[1].screen_rect);
        assert_eq!(a.x, b.x);
        assert!(b.y >= a.y + a.height);
        assert!(!frame.items[0].style.world_anchored);
    }

    proptest! {
        #[test]
        fn prop_output_never_exceeds_max_visible(
            count in 0usize..40,
            max_visible in 0usize..12,
            fallback in any::<bool>(),
        ) {
            let manager = OverlayManager::new(OverlayConfig {
                filter: FilterConfig { max_visible, min_confidence: 0.0, ..Default::default() },
                ..Default::default()
            });
            let hazards = (0..count)
                .map(|i| hazard(
                    HazardType::all()[i % 12],
                    Severity::all()[i % 3],
                    (i % 10) as f32 / 10.0,
                    Vector3::new(i as f64 - 20.0, 0.0, -(i as f64)),
                ))
                .collect();
            let frame = manager.compute(&snapshot(hazards), &CameraPose::identity(0.0), &CameraIntrinsics::default(), fallback);
            prop_assert!(frame.items.len() <= max_visible);
        }
    }
}
