//! The "PROJECTION" Engine - world ⇄ screen transforms
//!
//! Pure, side-effect-free functions used by the orchestrator (placing
//! detector output in world space) and the overlay manager (projecting world
//! hazards onto the current frame).
//!
//! Matrices follow the OpenGL convention: clip-space `w` equals the
//! view-space distance in front of the camera, so `w ≤ 0` means the point
//! is behind the camera.

use crate::geometry::{CameraPose, ScreenPoint, Viewport};
use nalgebra::{Matrix4, Perspective3, Point3, Vector3, Vector4};

/// Distance thresholds (meters) and the overlay scale used up to each one.
const SCALE_STEPS: [(f64, f32); 5] = [(2.0, 1.0), (5.0, 0.8), (10.0, 0.6), (20.0, 0.4), (40.0, 0.25)];

/// Scale used beyond the last step.
const MIN_OVERLAY_SCALE: f32 = 0.1;

const MAX_OVERLAY_SCALE: f32 = 1.0;

/// Namespace for the projection math.
pub struct CoordinateTransformer;

impl CoordinateTransformer {
    /// World-to-camera matrix for a pose.
    pub fn view_matrix(pose: &CameraPose) -> Matrix4<f64> {
        pose.isometry().inverse().to_homogeneous()
    }

    /// Perspective projection matrix.
    pub fn projection_matrix(fov_y: f64, aspect: f64, near: f64, far: f64) -> Matrix4<f64> {
        Perspective3::new(aspect, fov_y, near, far).to_homogeneous()
    }

    /// Project a world point to pixel coordinates.
    ///
    /// Returns `None` when the point is behind the camera (clip-space
    /// `w ≤ 0`). Points outside the viewport are still returned; callers
    /// decide visibility.
    pub fn world_to_screen(
        world_pos: &Vector3<f64>,
        view: &Matrix4<f64>,
        proj: &Matrix4<f64>,
        viewport: &Viewport,
    ) -> Option<ScreenPoint> {
        let view_pos = view * world_pos.push(1.0);
        let clip = proj * view_pos;
        if clip.w <= 0.0 {
            return None;
        }

        let ndc_x = clip.x / clip.w;
        let ndc_y = clip.y / clip.w;

        Some(ScreenPoint {
            x: (ndc_x + 1.0) * 0.5 * viewport.width,
            y: (1.0 - ndc_y) * 0.5 * viewport.height,
            depth: -view_pos.z,
        })
    }

    /// Unproject a pixel at the given view-space depth back into world space.
    ///
    /// `depth` has the same meaning as `ScreenPoint::depth`. Returns `None`
    /// if either matrix is singular.
    pub fn screen_to_world(
        screen_point: &ScreenPoint,
        view: &Matrix4<f64>,
        proj: &Matrix4<f64>,
        viewport: &Viewport,
        depth: f64,
    ) -> Option<Vector3<f64>> {
        let inv_proj = proj.try_inverse()?;
        let inv_view = view.try_inverse()?;

        let ndc_x = screen_point.x / viewport.width * 2.0 - 1.0;
        let ndc_y = 1.0 - screen_point.y / viewport.height * 2.0;

        // Unproject the pixel on the near and far planes; both lie on the
        // viewing ray, so the requested depth is a linear interpolation.
        let near = Self::unproject_ndc(&inv_proj, ndc_x, ndc_y, -1.0)?;
        let far = Self::unproject_ndc(&inv_proj, ndc_x, ndc_y, 1.0)?;

        let (near_depth, far_depth) = (-near.z, -far.z);
        let span = far_depth - near_depth;
        if span.abs() < f64::EPSILON {
            return None;
        }
        let t = (depth - near_depth) / span;
        let view_point = near + (far - near) * t;

        let world = inv_view * view_point.push(1.0);
        Some(Vector3::new(world.x, world.y, world.z))
    }

    fn unproject_ndc(inv_proj: &Matrix4<f64>, x: f64, y: f64, z: f64) -> Option<Vector3<f64>> {
        let v = inv_proj * Vector4::new(x, y, z, 1.0);
        if v.w.abs() < f64::EPSILON {
            return None;
        }
        Some(Vector3::new(v.x / v.w, v.y / v.w, v.z / v.w))
    }

    /// Overlay scale for a hazard at `distance` meters.
    ///
    /// Monotonically non-increasing step function clamped to [0.1, 1.0].
    /// Non-finite or negative distances get full scale.
    pub fn overlay_scale(distance: f64) -> f32 {
        if !distance.is_finite() || distance < 0.0 {
            return MAX_OVERLAY_SCALE;
        }
        SCALE_STEPS
            .iter()
            .find(|(limit, _)| distance < *limit)
            .map(|(_, scale)| *scale)
            .unwrap_or(MIN_OVERLAY_SCALE)
            .clamp(MIN_OVERLAY_SCALE, MAX_OVERLAY_SCALE)
    }

    /// Place a camera-space point (detector output) into world space.
    pub fn camera_to_world(pose: &CameraPose, local: &Vector3<f64>) -> Vector3<f64> {
        pose.camera_to_world(local)
    }

    /// Express a world point in the camera frame of `pose`.
    pub fn world_to_camera(pose: &CameraPose, world: &Vector3<f64>) -> Vector3<f64> {
        pose.isometry()
            .inverse_transform_point(&Point3::from(*world))
            .coords
    }
}
