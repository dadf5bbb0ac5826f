//! Spatial primitives shared by the engines: camera poses, bounding volumes,
//! viewports and screen-space rectangles.
//!
//! Conventions: right-handed world frame, meters. The camera looks down its
//! local −Z axis with +Y up; screen coordinates are pixels with a top-left
//! origin.

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

// ============================================================================
// CAMERA POSE
// ============================================================================

/// The camera's position and orientation in world space at a given time.
///
/// Immutable once created: there are no mutating methods, and a new pose is
/// built for every tracking update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    position: Vector3<f64>,
    rotation: UnitQuaternion<f64>,
    timestamp: f64,
}

impl CameraPose {
    /// Create a pose from a position, orientation and session timestamp (seconds).
    pub fn new(position: Vector3<f64>, rotation: UnitQuaternion<f64>, timestamp: f64) -> Self {
        Self {
            position,
            rotation,
            timestamp,
        }
    }

    /// Pose at the world origin looking down −Z.
    pub fn identity(timestamp: f64) -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity(), timestamp)
    }

    /// Pose at `position` whose −Z axis points at `target`.
    ///
    /// Falls back to the identity orientation when `target` coincides with
    /// `position`.
    pub fn looking_at(position: Vector3<f64>, target: Vector3<f64>, timestamp: f64) -> Self {
        let dir = target - position;
        let rotation = if dir.norm() < 1e-9 {
            UnitQuaternion::identity()
        } else {
            // face_towards aligns +Z with dir; the camera looks down −Z
            UnitQuaternion::face_towards(&-dir, &Vector3::y())
        };
        Self::new(position, rotation, timestamp)
    }

    #[inline]
    pub fn position(&self) -> Vector3<f64> {
        self.position
    }

    #[inline]
    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.rotation
    }

    #[inline]
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Camera-to-world rigid transform.
    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.rotation)
    }

    /// Unit vector the camera is looking along, in world space.
    pub fn forward(&self) -> Vector3<f64> {
        self.rotation * -Vector3::z()
    }

    /// Euclidean distance from the camera center to a world point.
    pub fn distance_to(&self, point: &Vector3<f64>) -> f64 {
        (point - self.position).norm()
    }

    /// Transform a camera-space point into world space.
    pub fn camera_to_world(&self, local: &Vector3<f64>) -> Vector3<f64> {
        self.isometry().transform_point(&Point3::from(*local)).coords
    }
}

// ============================================================================
// BOUNDING VOLUME
// ============================================================================

/// Oriented box enclosing a hazard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingVolume {
    /// Box center
    pub center: Vector3<f64>,

    /// Full extents along the box's local axes (meters)
    pub size: Vector3<f64>,

    /// Box orientation
    pub rotation: UnitQuaternion<f64>,
}

impl BoundingVolume {
    pub fn new(center: Vector3<f64>, size: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            center,
            size,
            rotation,
        }
    }

    /// Axis-aligned box of the given size.
    pub fn axis_aligned(center: Vector3<f64>, size: Vector3<f64>) -> Self {
        Self::new(center, size, UnitQuaternion::identity())
    }

    /// The eight corners in the frame the box is expressed in.
    pub fn corners(&self) -> [Vector3<f64>; 8] {
        let h = self.size * 0.5;
        let mut out = [Vector3::zeros(); 8];
        let mut i = 0;
        for sx in [-1.0, 1.0] {
            for sy in [-1.0, 1.0] {
                for sz in [-1.0, 1.0] {
                    let local = Vector3::new(sx * h.x, sy * h.y, sz * h.z);
                    out[i] = self.center + self.rotation * local;
                    i += 1;
                }
            }
        }
        out
    }

    /// Re-express a camera-space box in world space using the capture pose.
    pub fn to_world(&self, pose: &CameraPose) -> Self {
        Self {
            center: pose.camera_to_world(&self.center),
            size: self.size,
            rotation: pose.rotation() * self.rotation,
        }
    }
}

// ============================================================================
// SCREEN SPACE
// ============================================================================

/// Render target dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn aspect(&self) -> f64 {
        if self.height > 0.0 {
            self.width / self.height
        } else {
            1.0
        }
    }

    /// Whether a point lies within the viewport bounds.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        (0.0..=self.width).contains(&x) && (0.0..=self.height).contains(&y)
    }
}

/// A projected point: pixel position plus view-space depth in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenPoint {
    pub x: f64,
    pub y: f64,
    pub depth: f64,
}

impl ScreenPoint {
    pub fn new(x: f64, y: f64, depth: f64) -> Self {
        Self { x, y, depth }
    }
}

/// Axis-aligned screen rectangle (top-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScreenRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ScreenRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Smallest rectangle containing all points, or `None` for an empty set.
    pub fn bounding(points: &[ScreenPoint]) -> Option<Self> {
        let first = points.first()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Some(Self::new(min_x, min_y, max_x - min_x, max_y - min_y))
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width * 0.5, self.y + self.height * 0.5)
    }

    /// Scale about the rectangle's center.
    pub fn scaled(&self, factor: f64) -> Self {
        let (cx, cy) = self.center();
        let w = self.width * factor;
        let h = self.height * factor;
        Self::new(cx - w * 0.5, cy - h * 0.5, w, h)
    }

    /// Whether any part of the rectangle overlaps the viewport.
    pub fn intersects(&self, viewport: &Viewport) -> bool {
        self.x < viewport.width
            && self.y < viewport.height
            && self.x + self.width > 0.0
            && self.y + self.height > 0.0
    }
}

// ============================================================================
// CAMERA INTRINSICS
// ============================================================================

/// Projection parameters of the rendering camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// Vertical field of view in radians
    pub fov_y: f64,

    /// Near clip plane (meters)
    pub near: f64,

    /// Far clip plane (meters)
    pub far: f64,

    /// Render target
    pub viewport: Viewport,
}

impl Default for CameraIntrinsics {
    fn default() -> Self {
        Self {
            fov_y: 60f64.to_radians(),
            near: 0.05,
            far: 200.0,
            viewport: Viewport::new(1170.0, 2532.0),
        }
    }
}
