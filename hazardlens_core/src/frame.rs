//! Frames emitted by the platform spatial-tracking source.
//!
//! A `TrackingFrame` is created once per capture tick and is short-lived:
//! it is discarded after processing, or after `frame_ttl_secs` if it was
//! queued for analysis. Frames are never written to durable storage.

use crate::geometry::CameraPose;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Why the platform reports degraded tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitedReason {
    InsufficientLight,
    ExcessiveMotion,
    InsufficientFeatures,
    Relocalizing,
}

impl LimitedReason {
    pub fn describe(&self) -> &'static str {
        match self {
            LimitedReason::InsufficientLight => "insufficient light",
            LimitedReason::ExcessiveMotion => "excessive motion",
            LimitedReason::InsufficientFeatures => "insufficient features",
            LimitedReason::Relocalizing => "relocalizing",
        }
    }
}

/// Raw tracking status reported by the platform for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformTrackingStatus {
    NotAvailable,
    Initializing,
    Normal,
    Limited(LimitedReason),
}

/// Precise device location attached by the platform. Never leaves the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// Identifying metadata captured alongside a frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Hardware/vendor identifier of the capturing device
    pub device_id: String,

    /// Precise capture location, if the platform provides it
    pub location: Option<GeoLocation>,

    /// Wall-clock capture time (Unix milliseconds)
    pub captured_at_unix_ms: u64,
}

/// Shared, read-only reference to captured pixels.
pub type FrameImage = Arc<RgbImage>;

/// One capture tick from the platform.
#[derive(Debug, Clone)]
pub struct TrackingFrame {
    /// Monotonic frame counter
    pub id: u64,

    pub pose: CameraPose,

    pub image: FrameImage,

    /// Platform tracking quality (0.0 - 1.0)
    pub tracking_quality: f32,

    pub status: PlatformTrackingStatus,

    pub metadata: FrameMetadata,

    /// Session time in seconds
    pub timestamp: f64,
}

impl TrackingFrame {
    /// Age of the frame relative to `now` (seconds).
    pub fn age(&self, now: f64) -> f64 {
        (now - self.timestamp).max(0.0)
    }

    /// Approximate pixel buffer size in bytes.
    pub fn image_bytes(&self) -> usize {
        self.image.as_raw().len()
    }
}
