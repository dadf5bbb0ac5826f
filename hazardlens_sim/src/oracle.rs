//! Ground truth oracle for simulation.
//!
//! The Oracle holds the "God's eye view" of a construction site:
//! - True positions and extents of every hazard
//! - The walking camera trajectory
//! - The scripted platform tracking status and lighting
//!
//! It is immutable once built, so the scripted analyzer and the runner can
//! share it behind an `Arc`.

use hazardlens_core::{
    CameraPose, CoordinateTransformer, FrameMetadata, GeoLocation, HazardType, LimitedReason,
    PlatformTrackingStatus, Severity, TrackingFrame,
};
use image::{Rgb, RgbImage};
use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Synthetic frame size. Small on purpose; the privacy pipeline still runs.
const FRAME_WIDTH: u32 = 160;
const FRAME_HEIGHT: u32 = 120;

/// Eye height of the walking inspector (meters).
const EYE_HEIGHT: f64 = 1.6;

/// A ground truth hazard in the site scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthHazard {
    pub id: u64,

    pub hazard_type: HazardType,

    /// Label the detector reports for this hazard
    pub label: String,

    /// World-space center (meters)
    pub position: Vector3<f64>,

    /// Box extents (meters)
    pub size: Vector3<f64>,

    pub severity: Option<Severity>,
}

/// One scripted stretch of platform tracking status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingSegment {
    pub start_secs: f64,
    pub end_secs: f64,
    pub status: PlatformTrackingStatus,
    /// Lighting multiplier for frames in this stretch (1.0 = daylight)
    pub brightness: f32,
}

/// A hazard as seen from a pose.
#[derive(Debug, Clone)]
pub struct Sighting {
    pub hazard: GroundTruthHazard,
    /// Center in the camera's frame
    pub camera_space: Vector3<f64>,
    pub distance: f64,
}

/// The Oracle - ground truth scene, trajectory and tracking script.
pub struct Oracle {
    seed: u64,
    hazards: Vec<GroundTruthHazard>,

    /// Seconds the platform reports `Initializing` at session start
    warmup_secs: f64,

    /// Walking speed along −Z (m/s)
    walk_speed: f64,

    /// Lateral sway amplitude (meters)
    sway_m: f64,

    segments: Vec<TrackingSegment>,

    /// Furthest distance at which hazards can be detected (meters)
    sight_range_m: f64,

    fov_y: f64,
    aspect: f64,

    /// Cache of synthetic frames keyed by brightness percent
    images: Mutex<BTreeMap<u32, Arc<RgbImage>>>,
}

impl Oracle {
    /// Creates an empty scene.
    ///
    /// Note: the oracle's seed should be derived separately from the context
    /// seed so that changing jitter draws doesn't move the scene.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            hazards: Vec::new(),
            warmup_secs: 0.3,
            walk_speed: 0.8,
            sway_m: 0.15,
            segments: Vec::new(),
            sight_range_m: 12.0,
            fov_y: 60f64.to_radians(),
            aspect: 1170.0 / 2532.0,
            images: Mutex::new(BTreeMap::new()),
        }
    }

    /// A construction site with hazards scattered along a 20m walkway.
    ///
    /// Positions are jittered by up to ±0.3m from the seed.
    pub fn construction_site(seed: u64) -> Self {
        let mut oracle = Self::new(seed);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let layout: [(HazardType, &str, [f64; 3], [f64; 3], Option<Severity>); 6] = [
            (HazardType::FallProtection, "fall_hazard", [1.2, 0.0, -5.0], [2.0, 0.2, 1.0], None),
            (HazardType::Electrical, "exposed_wiring", [-1.5, 1.0, -8.0], [0.6, 0.6, 0.3], None),
            (HazardType::TripHazard, "trip_hazard", [0.4, 0.05, -10.5], [1.0, 0.1, 0.4], Some(Severity::Warning)),
            (HazardType::Excavation, "excavation", [2.5, -0.5, -14.0], [3.0, 1.0, 2.0], None),
            (HazardType::HeavyMachinery, "heavy_machinery", [-3.0, 1.2, -17.0], [4.0, 2.5, 2.5], None),
            (HazardType::MissingHardHat, "no_hard_hat", [1.0, 1.7, -20.0], [0.5, 1.8, 0.5], None),
        ];
        for (hazard_type, label, p, s, severity) in layout {
            let jitter = Vector3::new(rng.gen_range(-0.3..0.3), 0.0, rng.gen_range(-0.3..0.3));
            oracle.add_hazard(
                hazard_type,
                label,
                Vector3::new(p[0], p[1], p[2]) + jitter,
                Vector3::new(s[0], s[1], s[2]),
                severity,
            );
        }
        oracle
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Adds a hazard and returns its ID.
    pub fn add_hazard(
        &mut self,
        hazard_type: HazardType,
        label: &str,
        position: Vector3<f64>,
        size: Vector3<f64>,
        severity: Option<Severity>,
    ) -> u64 {
        let id = self.hazards.len() as u64;
        self.hazards.push(GroundTruthHazard {
            id,
            hazard_type,
            label: label.to_string(),
            position,
            size,
            severity,
        });
        id
    }

    /// Scripts a stretch of non-normal tracking.
    pub fn with_segment(mut self, start_secs: f64, end_secs: f64, status: PlatformTrackingStatus, brightness: f32) -> Self {
        self.segments.push(TrackingSegment {
            start_secs,
            end_secs,
            status,
            brightness,
        });
        self
    }

    /// Stretch of low light: the platform reports limited tracking and frames go dark.
    pub fn with_low_light(self, start_secs: f64, end_secs: f64) -> Self {
        self.with_segment(
            start_secs,
            end_secs,
            PlatformTrackingStatus::Limited(LimitedReason::InsufficientLight),
            0.15,
        )
    }

    pub fn with_walk_speed(mut self, speed: f64) -> Self {
        self.walk_speed = speed;
        self
    }

    pub fn hazards(&self) -> &[GroundTruthHazard] {
        &self.hazards
    }

    pub fn hazard(&self, id: u64) -> Option<&GroundTruthHazard> {
        self.hazards.get(id as usize)
    }

    // ========================================================================
    // TRAJECTORY
    // ========================================================================

    /// Camera pose at session time `t`: walking down the site, swaying
    /// slightly, looking a few meters ahead.
    pub fn pose_at(&self, t: f64) -> CameraPose {
        let z = -self.walk_speed * t;
        let x = self.sway_m * (t * 0.8).sin();
        let position = Vector3::new(x, EYE_HEIGHT, z);
        let target = Vector3::new(0.0, 0.8, z - 5.0);
        CameraPose::looking_at(position, target, t)
    }

    /// Scripted platform status at `t`, with the frame brightness.
    pub fn status_at(&self, t: f64) -> (PlatformTrackingStatus, f32) {
        if t < self.warmup_secs {
            return (PlatformTrackingStatus::Initializing, 1.0);
        }
        self.segments
            .iter()
            .find(|s| t >= s.start_secs && t < s.end_secs)
            .map(|s| (s.status, s.brightness))
            .unwrap_or((PlatformTrackingStatus::Normal, 1.0))
    }

    /// Platform tracking quality reported alongside a status.
    fn tracking_quality(status: PlatformTrackingStatus) -> f32 {
        match status {
            PlatformTrackingStatus::Normal => 0.9,
            PlatformTrackingStatus::Limited(_) => 0.4,
            PlatformTrackingStatus::Initializing => 0.2,
            PlatformTrackingStatus::NotAvailable => 0.0,
        }
    }

    // ========================================================================
    // SENSING
    // ========================================================================

    /// Hazards inside the camera frustum and sight range, nearest first.
    pub fn visible_from(&self, pose: &CameraPose) -> Vec<Sighting> {
        let half_v = self.fov_y / 2.0;
        let half_h = (half_v.tan() * self.aspect).atan();
        let mut sightings: Vec<Sighting> = self
            .hazards
            .iter()
            .filter_map(|h| {
                let local = CoordinateTransformer::world_to_camera(pose, &h.position);
                let depth = -local.z;
                if depth <= 0.1 {
                    return None;
                }
                let distance = local.norm();
                if distance > self.sight_range_m {
                    return None;
                }
                // Let boxes partly in view count
                let slack_x = h.size.x / 2.0 / depth;
                let slack_y = h.size.y / 2.0 / depth;
                if (local.x / depth).abs() > half_h.tan() + slack_x || (local.y / depth).abs() > half_v.tan() + slack_y {
                    return None;
                }
                Some(Sighting {
                    hazard: h.clone(),
                    camera_space: local,
                    distance,
                })
            })
            .collect();
        sightings.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        sightings
    }

    /// Distance from `position` to the nearest ground truth hazard of `hazard_type`.
    pub fn nearest_error(&self, hazard_type: HazardType, position: &Vector3<f64>) -> Option<f64> {
        self.hazards
            .iter()
            .filter(|h| h.hazard_type == hazard_type)
            .map(|h| (h.position - position).norm())
            .min_by(|a, b| a.total_cmp(b))
    }

    // ========================================================================
    // FRAMES
    // ========================================================================

    fn image(&self, brightness: f32) -> Arc<RgbImage> {
        let key = (brightness.clamp(0.0, 1.0) * 100.0).round() as u32;
        let mut cache = self.images.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(cache.entry(key).or_insert_with(|| {
            let scale = key as f32 / 100.0;
            Arc::new(RgbImage::from_fn(FRAME_WIDTH, FRAME_HEIGHT, |x, y| {
                // Sky over dirt, with a few vertical posts
                let base: [f32; 3] = if y < FRAME_HEIGHT / 3 {
                    [150.0, 180.0, 210.0]
                } else if x % 40 < 4 {
                    [90.0, 90.0, 95.0]
                } else {
                    [140.0, 115.0, 80.0]
                };
                Rgb(base.map(|c| (c * scale) as u8))
            }))
        }))
    }

    /// The frame the platform would emit at session time `t`.
    pub fn frame(&self, id: u64, t: f64, captured_at_unix_ms: u64) -> TrackingFrame {
        let (status, brightness) = self.status_at(t);
        TrackingFrame {
            id,
            pose: self.pose_at(t),
            image: self.image(brightness),
            tracking_quality: Self::tracking_quality(status),
            status,
            metadata: FrameMetadata {
                device_id: format!("sim-device-{:016x}", self.seed),
                location: Some(GeoLocation {
                    latitude: 47.6062,
                    longitude: -122.3321,
                    altitude: 56.0,
                }),
                captured_at_unix_ms,
            },
            timestamp: t,
        }
    }
}
