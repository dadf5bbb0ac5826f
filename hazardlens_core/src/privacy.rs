//! The "PRIVACY" Engine - frame sanitization before anything leaves the device
//!
//! Every frame sent for hazard analysis goes through `FramePrivacyProcessor`:
//!
//! 1. face-like regions are Gaussian-blurred
//! 2. text regions matching personal-identifier patterns are filled black
//! 3. precise location is dropped and the device id reduced to a salted hash
//! 4. a SHA-256 content hash of the sanitized pixels is computed
//!
//! The pipeline fails closed: a detector error or an oversized frame yields a
//! `PrivacyError` and the frame is dropped. `SanitizedFrame` has no public
//! constructor, so unsanitized pixels cannot reach the analyzer.
//!
//! This module MUST NOT store, log or transmit raw frame content.

use crate::frame::{GeoLocation, TrackingFrame};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum PrivacyError {
    #[error("frame has no pixels")]
    EmptyFrame,

    #[error("frame {width}x{height} exceeds the {max_pixels} pixel limit")]
    FrameTooLarge { width: u32, height: u32, max_pixels: u64 },

    #[error("region detector failed: {0}")]
    Detector(String),

    #[error("invalid identifier pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("sanitization worker failed: {0}")]
    Worker(String),
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Gaussian blur sigma applied to face regions (default: 12.0)
    pub blur_sigma: f32,

    /// Frames larger than this are rejected (default: 4096 x 4096)
    pub max_frame_pixels: u64,

    /// Keep a coarse location rounded to this many decimals; `None` drops it (default: None)
    pub location_precision_decimals: Option<u32>,

    /// Hex characters kept from the device-id hash (default: 12)
    pub device_hash_len: usize,

    /// Grid cell size for the skin-tone heuristic (default: 16px)
    pub face_grid_cell_px: u32,

    /// Fraction of skin-tone pixels for a cell to count (default: 0.55)
    pub skin_cell_ratio: f32,

    /// Minimum connected cells for a face-like region (default: 2)
    pub min_face_cells: usize,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            blur_sigma: 12.0,
            max_frame_pixels: 4096 * 4096,
            location_precision_decimals: None,
            device_hash_len: 12,
            face_grid_cell_px: 16,
            skin_cell_ratio: 0.55,
            min_face_cells: 2,
        }
    }
}

// ============================================================================
// REGIONS & DETECTOR SEAMS
// ============================================================================

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Clip to the image bounds. `None` if nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<PixelRect> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        (w > 0 && h > 0).then(|| PixelRect::new(self.x, self.y, w, h))
    }
}

/// A text region with the string recognized inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRegion {
    pub rect: PixelRect,
    pub text: String,
}

/// Finds face-like regions to blur.
pub trait RegionDetector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<PixelRect>, PrivacyError>;
}

/// Finds text regions (OCR is an external collaborator).
pub trait TextRegionDetector: Send + Sync {
    fn detect_text(&self, image: &RgbImage) -> Result<Vec<TextRegion>, PrivacyError>;
}

/// Text detector for platforms without OCR.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTextDetector;

impl TextRegionDetector for NoTextDetector {
    fn detect_text(&self, _image: &RgbImage) -> Result<Vec<TextRegion>, PrivacyError> {
        Ok(Vec::new())
    }
}

/// Coarse skin-tone heuristic: grid cells dominated by skin-colored pixels
/// are grouped into 4-connected components, one region per component.
#[derive(Debug, Clone)]
pub struct SkinToneRegionDetector {
    cell_px: u32,
    cell_ratio: f32,
    min_cells: usize,
}

impl SkinToneRegionDetector {
    pub fn new(cell_px: u32, cell_ratio: f32, min_cells: usize) -> Self {
        Self {
            cell_px: cell_px.max(1),
            cell_ratio,
            min_cells: min_cells.max(1),
        }
    }

    pub fn from_config(config: &PrivacyConfig) -> Self {
        Self::new(config.face_grid_cell_px, config.skin_cell_ratio, config.min_face_cells)
    }

    fn is_skin(p: &Rgb<u8>) -> bool {
        let [r, g, b] = p.0.map(i32::from);
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        r > 95 && g > 40 && b > 20 && max - min > 15 && (r - g).abs() > 15 && r > g && r > b
    }
}

impl RegionDetector for SkinToneRegionDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<PixelRect>, PrivacyError> {
        let (w, h) = image.dimensions();
        let cols = w.div_ceil(self.cell_px) as usize;
        let rows = h.div_ceil(self.cell_px) as usize;

        let mut skin = vec![false; cols * rows];
        for row in 0..rows {
            for col in 0..cols {
                let x0 = col as u32 * self.cell_px;
                let y0 = row as u32 * self.cell_px;
                let x1 = (x0 + self.cell_px).min(w);
                let y1 = (y0 + self.cell_px).min(h);
                let total = ((x1 - x0) * (y1 - y0)) as f32;
                let hits = (y0..y1)
                    .flat_map(|y| (x0..x1).map(move |x| (x, y)))
                    .filter(|&(x, y)| Self::is_skin(image.get_pixel(x, y)))
                    .count() as f32;
                skin[row * cols + col] = total > 0.0 && hits / total >= self.cell_ratio;
            }
        }

        let mut seen = vec![false; cols * rows];
        let mut regions = Vec::new();
        for start in 0..skin.len() {
            if !skin[start] || seen[start] {
                continue;
            }
            seen[start] = true;
            let mut queue = VecDeque::from([start]);
            let (mut min_c, mut min_r, mut max_c, mut max_r) = (cols, rows, 0, 0);
            let mut cells = 0;
            while let Some(idx) = queue.pop_front() {
                let (r, c) = (idx / cols, idx % cols);
                cells += 1;
                min_c = min_c.min(c);
                min_r = min_r.min(r);
                max_c = max_c.max(c);
                max_r = max_r.max(r);

                let mut neighbors = Vec::with_capacity(4);
                if r > 0 {
                    neighbors.push(idx - cols);
                }
                if r + 1 < rows {
                    neighbors.push(idx + cols);
                }
                if c > 0 {
                    neighbors.push(idx - 1);
                }
                if c + 1 < cols {
                    neighbors.push(idx + 1);
                }
                for n in neighbors {
                    if skin[n] && !seen[n] {
                        seen[n] = true;
                        queue.push_back(n);
                    }
                }
            }

            if cells >= self.min_cells {
                let rect = PixelRect::new(
                    min_c as u32 * self.cell_px,
                    min_r as u32 * self.cell_px,
                    (max_c - min_c + 1) as u32 * self.cell_px,
                    (max_r - min_r + 1) as u32 * self.cell_px,
                );
                if let Some(rect) = rect.clamp_to(w, h) {
                    regions.push(rect);
                }
            }
        }
        Ok(regions)
    }
}

// ============================================================================
// PERSONAL-IDENTIFIER PATTERNS
// ============================================================================

/// Patterns for text that identifies a person or vehicle.
#[derive(Debug, Clone)]
pub struct IdentifierPatterns {
    email: Regex,
    phone: Regex,
    id_number: Regex,
    plate: Regex,
}

impl IdentifierPatterns {
    pub fn new() -> Result<Self, PrivacyError> {
        Ok(Self {
            email: Regex::new(r"(?i)[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}")?,
            phone: Regex::new(r"\+?\d[\d\s().-]{7,}\d")?,
            id_number: Regex::new(r"\b(\d{3}-\d{2}-\d{4}|[A-Z]{1,2}\d{6,9})\b")?,
            plate: Regex::new(r"^[A-Z0-9]{2,4}[- ]?[A-Z0-9]{2,4}$")?,
        })
    }

    /// Whether `text` looks like a personal identifier.
    pub fn is_identifier(&self, text: &str) -> bool {
        let trimmed = text.trim();
        if self.email.is_match(trimmed) || self.phone.is_match(trimmed) || self.id_number.is_match(trimmed) {
            return true;
        }
        // Plates mix letters and digits; plain words like "DANGER" do not
        let upper = trimmed.to_ascii_uppercase();
        self.plate.is_match(&upper)
            && upper.chars().any(|c| c.is_ascii_digit())
            && upper.chars().any(|c| c.is_ascii_alphabetic())
    }
}

// ============================================================================
// SANITIZED OUTPUT
// ============================================================================

/// Metadata that may leave the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizedMetadata {
    /// Truncated salted SHA-256 of the device id
    pub device_hash: String,

    /// (latitude, longitude) rounded to the configured precision, if kept
    pub coarse_location: Option<(f64, f64)>,

    pub captured_at_unix_ms: u64,
}

/// What the pipeline did to a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizationReport {
    pub faces_blurred: usize,
    pub text_regions_redacted: usize,
    pub text_regions_kept: usize,
    pub location_stripped: bool,
    pub downscaled: bool,
}

/// A frame that has passed the privacy pipeline.
#[derive(Debug, Clone)]
pub struct SanitizedFrame {
    frame_id: u64,
    image: Arc<RgbImage>,
    metadata: SanitizedMetadata,
    content_hash: String,
    report: SanitizationReport,
}

impl SanitizedFrame {
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn image(&self) -> &Arc<RgbImage> {
        &self.image
    }

    pub fn metadata(&self) -> &SanitizedMetadata {
        &self.metadata
    }

    /// Hex SHA-256 of the sanitized pixels.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn report(&self) -> &SanitizationReport {
        &self.report
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

// ============================================================================
// PROCESSOR
// ============================================================================

/// The privacy pipeline. Cheap to clone; clones share the detectors.
#[derive(Clone)]
pub struct FramePrivacyProcessor {
    config: PrivacyConfig,
    face_detector: Arc<dyn RegionDetector>,
    text_detector: Arc<dyn TextRegionDetector>,
    patterns: IdentifierPatterns,
    /// Per-session salt for the device hash
    salt: String,
}

impl std::fmt::Debug for FramePrivacyProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePrivacyProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FramePrivacyProcessor {
    pub fn new(
        config: PrivacyConfig,
        face_detector: Arc<dyn RegionDetector>,
        text_detector: Arc<dyn TextRegionDetector>,
        salt: impl Into<String>,
    ) -> Result<Self, PrivacyError> {
        Ok(Self {
            config,
            face_detector,
            text_detector,
            patterns: IdentifierPatterns::new()?,
            salt: salt.into(),
        })
    }

    /// Skin-tone face heuristic, no OCR.
    pub fn with_defaults(config: PrivacyConfig, salt: impl Into<String>) -> Result<Self, PrivacyError> {
        let faces = Arc::new(SkinToneRegionDetector::from_config(&config));
        Self::new(config, faces, Arc::new(NoTextDetector), salt)
    }

    pub fn config(&self) -> &PrivacyConfig {
        &self.config
    }

    /// Run the full pipeline. The longest image side is downscaled to at
    /// most `max_dimension_px` after redaction.
    pub fn sanitize(&self, frame: &TrackingFrame, max_dimension_px: u32) -> Result<SanitizedFrame, PrivacyError> {
        let (width, height) = frame.image.dimensions();
        if width == 0 || height == 0 {
            return Err(PrivacyError::EmptyFrame);
        }
        if u64::from(width) * u64::from(height) > self.config.max_frame_pixels {
            return Err(PrivacyError::FrameTooLarge {
                width,
                height,
                max_pixels: self.config.max_frame_pixels,
            });
        }

        let mut report = SanitizationReport::default();
        let mut image: RgbImage = (*frame.image).clone();

        // 1. Faces
        let faces = self.face_detector.detect(&image)?;
        for rect in faces.iter().filter_map(|r| r.clamp_to(width, height)) {
            self.blur_region(&mut image, rect);
            report.faces_blurred += 1;
        }

        // 2. Identifying text
        let texts = self.text_detector.detect_text(&image)?;
        for region in &texts {
            if !self.patterns.is_identifier(&region.text) {
                report.text_regions_kept += 1;
                continue;
            }
            if let Some(rect) = region.rect.clamp_to(width, height) {
                Self::fill_black(&mut image, rect);
                report.text_regions_redacted += 1;
            }
        }

        // 3. Metadata
        let metadata = self.sanitize_metadata(frame, &mut report);

        if max_dimension_px > 0 && width.max(height) > max_dimension_px {
            image = Self::downscale(&image, max_dimension_px);
            report.downscaled = true;
        }

        // 4. Content hash
        let content_hash = Self::content_hash(&image);

        debug!(
            "Sanitized frame {}: {} faces blurred, {} text regions redacted",
            frame.id, report.faces_blurred, report.text_regions_redacted
        );

        Ok(SanitizedFrame {
            frame_id: frame.id,
            image: Arc::new(image),
            metadata,
            content_hash,
            report,
        })
    }

    /// Run `sanitize` on the blocking worker pool.
    pub async fn sanitize_blocking(
        &self,
        frame: TrackingFrame,
        max_dimension_px: u32,
    ) -> Result<SanitizedFrame, PrivacyError> {
        let processor = self.clone();
        tokio::task::spawn_blocking(move || processor.sanitize(&frame, max_dimension_px))
            .await
            .map_err(|e| PrivacyError::Worker(e.to_string()))?
    }

    fn blur_region(&self, image: &mut RgbImage, rect: PixelRect) {
        let patch = imageops::crop_imm(&*image, rect.x, rect.y, rect.width, rect.height).to_image();
        let blurred = imageops::blur(&patch, self.config.blur_sigma);
        imageops::replace(image, &blurred, i64::from(rect.x), i64::from(rect.y));
    }

    fn fill_black(image: &mut RgbImage, rect: PixelRect) {
        for y in rect.y..rect.y + rect.height {
            for x in rect.x..rect.x + rect.width {
                image.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
    }

    fn downscale(image: &RgbImage, max_dimension_px: u32) -> RgbImage {
        let (w, h) = image.dimensions();
        let scale = f64::from(max_dimension_px) / f64::from(w.max(h));
        let nw = ((f64::from(w) * scale).round() as u32).max(1);
        let nh = ((f64::from(h) * scale).round() as u32).max(1);
        imageops::resize(image, nw, nh, FilterType::Triangle)
    }

    fn sanitize_metadata(&self, frame: &TrackingFrame, report: &mut SanitizationReport) -> SanitizedMetadata {
        let coarse_location = match (frame.metadata.location, self.config.location_precision_decimals) {
            (Some(loc), Some(decimals)) => Some(Self::coarsen(&loc, decimals)),
            _ => None,
        };
        report.location_stripped = frame.metadata.location.is_some();

        SanitizedMetadata {
            device_hash: self.device_hash(&frame.metadata.device_id),
            coarse_location,
            captured_at_unix_ms: frame.metadata.captured_at_unix_ms,
        }
    }

    fn coarsen(loc: &GeoLocation, decimals: u32) -> (f64, f64) {
        let factor = 10f64.powi(decimals.min(6) as i32);
        (
            (loc.latitude * factor).round() / factor,
            (loc.longitude * factor).round() / factor,
        )
    }

    /// Truncated salted SHA-256 of a device identifier.
    pub fn device_hash(&self, device_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(b":");
        hasher.update(device_id.as_bytes());
        let mut hex = format!("{:x}", hasher.finalize());
        hex.truncate(self.config.device_hash_len.clamp(4, 64));
        hex
    }

    /// Hex SHA-256 over dimensions and raw pixels.
    pub fn content_hash(image: &RgbImage) -> String {
        let mut hasher = Sha256::new();
        hasher.update(image.width().to_le_bytes());
        hasher.update(image.height().to_le_bytes());
        hasher.update(image.as_raw());
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameMetadata, PlatformTrackingStatus};
    use crate::geometry::CameraPose;

    const SKIN: Rgb<u8> = Rgb([220, 170, 140]);
    const CONCRETE: Rgb<u8> = Rgb([120, 120, 125]);

    fn test_frame(image: RgbImage) -> TrackingFrame {
        TrackingFrame {
            id: 7,
            pose: CameraPose::identity(0.0),
            image: Arc::new(image),
            tracking_quality: 1.0,
            status: PlatformTrackingStatus::Normal,
            metadata: FrameMetadata {
                device_id: "iPhone15,3-A1B2C3".to_string(),
                location: Some(GeoLocation {
                    latitude: 37.774929,
                    longitude: -122.419416,
                    altitude: 12.0,
                }),
                captured_at_unix_ms: 1_700_000_000_000,
            },
            timestamp: 0.0,
        }
    }

    fn scene_with_face() -> RgbImage {
        let mut img = RgbImage::from_pixel(128, 128, CONCRETE);
        for y in 32..80 {
            for x in 48..96 {
                img.put_pixel(x, y, SKIN);
            }
        }
        // Sharp edge inside the face so the blur is observable
        for y in 50..54 {
            for x in 60..84 {
                img.put_pixel(x, y, Rgb([10, 10, 10]));
            }
        }
        img
    }

    struct FixedText(Vec<TextRegion>);

    impl TextRegionDetector for FixedText {
        fn detect_text(&self, _image: &RgbImage) -> Result<Vec<TextRegion>, PrivacyError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDetector;

    impl RegionDetector for BrokenDetector {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<PixelRect>, PrivacyError> {
            Err(PrivacyError::Detector("model unavailable".into()))
        }
    }

    #[test]
    fn test_skin_detector_finds_face_region() {
        let det = SkinToneRegionDetector::from_config(&PrivacyConfig::default());
        let regions = det.detect(&scene_with_face()).unwrap();
        assert_eq!(regions.len(), 1);
        let r = regions[0];
        assert!(r.x <= 48 && r.y <= 32);
        assert!(r.x + r.width >= 96);
    }

    #[test]
    fn test_skin_detector_ignores_plain_scene() {
        let det = SkinToneRegionDetector::from_config(&PrivacyConfig::default());
        let plain = RgbImage::from_pixel(64, 64, CONCRETE);
        assert!(det.detect(&plain).unwrap().is_empty());
    }

    #[test]
    fn test_face_region_is_blurred() {
        let processor = FramePrivacyProcessor::with_defaults(PrivacyConfig::default(), "salt").unwrap();
        let frame = test_frame(scene_with_face());
        let out = processor.sanitize(&frame, 0).unwrap();

        assert_eq!(out.report().faces_blurred, 1);
        assert_ne!(out.image().get_pixel(70, 51), &Rgb([10, 10, 10]));
        // Background untouched
        assert_eq!(out.image().get_pixel(2, 2), &CONCRETE);
    }

    #[test]
    fn test_identifier_text_is_redacted_and_signage_kept() {
        let texts = vec![
            TextRegion {
                rect: PixelRect::new(0, 0, 10, 10),
                text: "j.doe@contractor.com".into(),
            },
            TextRegion {
                rect: PixelRect::new(20, 0, 10, 10),
                text: "DANGER".into(),
            },
            TextRegion {
                rect: PixelRect::new(40, 0, 10, 10),
                text: "7ABC123".into(),
            },
        ];
        let processor = FramePrivacyProcessor::new(
            PrivacyConfig::default(),
            Arc::new(SkinToneRegionDetector::from_config(&PrivacyConfig::default())),
            Arc::new(FixedText(texts)),
            "salt",
        )
        .unwrap();
        let out = processor
            .sanitize(&test_frame(RgbImage::from_pixel(64, 64, CONCRETE)), 0)
            .unwrap();

        assert_eq!(out.report().text_regions_redacted, 2);
        assert_eq!(out.report().text_regions_kept, 1);
        assert_eq!(out.image().get_pixel(5, 5), &Rgb([0, 0, 0]));
        assert_eq!(out.image().get_pixel(25, 5), &CONCRETE);
    }

    #[test]
    fn test_identifier_patterns() {
        let p = IdentifierPatterns::new().unwrap();
        assert!(p.is_identifier("+1 (415) 555-0134"));
        assert!(p.is_identifier("123-45-6789"));
        assert!(p.is_identifier("AB1234567"));
        assert!(!p.is_identifier("HARD HAT AREA"));
        assert!(!p.is_identifier("EXIT"));
    }

    #[test]
    fn test_metadata_is_stripped() {
        let processor = FramePrivacyProcessor::with_defaults(PrivacyConfig::default(), "session-1").unwrap();
        let out = processor
            .sanitize(&test_frame(RgbImage::from_pixel(32, 32, CONCRETE)), 0)
            .unwrap();

        let meta = out.metadata();
        assert!(meta.coarse_location.is_none());
        assert!(out.report().location_stripped);
        assert_eq!(meta.device_hash.len(), 12);
        assert!(!meta.device_hash.contains("iPhone"));
    }

    #[test]
    fn test_coarse_location_when_configured() {
        let config = PrivacyConfig {
            location_precision_decimals: Some(2),
            ..Default::default()
        };
        let processor = FramePrivacyProcessor::with_defaults(config, "s").unwrap();
        let out = processor
            .sanitize(&test_frame(RgbImage::from_pixel(16, 16, CONCRETE)), 0)
            .unwrap();
        assert_eq!(out.metadata().coarse_location, Some((37.77, -122.42)));
    }

    #[test]
    fn test_device_hash_is_salted_per_session() {
        let a = FramePrivacyProcessor::with_defaults(PrivacyConfig::default(), "a").unwrap();
        let b = FramePrivacyProcessor::with_defaults(PrivacyConfig::default(), "b").unwrap();
        assert_eq!(a.device_hash("dev"), a.device_hash("dev"));
        assert_ne!(a.device_hash("dev"), b.device_hash("dev"));
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        let processor = FramePrivacyProcessor::with_defaults(PrivacyConfig::default(), "s").unwrap();
        let frame = test_frame(scene_with_face());
        let a = processor.sanitize(&frame, 0).unwrap();
        let b = processor.sanitize(&frame, 0).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn test_downscales_to_detection_resolution() {
        let processor = FramePrivacyProcessor::with_defaults(PrivacyConfig::default(), "s").unwrap();
        let out = processor
            .sanitize(&test_frame(RgbImage::from_pixel(200, 100, CONCRETE)), 64)
            .unwrap();
        assert_eq!(out.dimensions(), (64, 32));
        assert!(out.report().downscaled);
    }

    #[test]
    fn test_fails_closed_on_detector_error() {
        let processor = FramePrivacyProcessor::new(
            PrivacyConfig::default(),
            Arc::new(BrokenDetector),
            Arc::new(NoTextDetector),
            "s",
        )
        .unwrap();
        let result = processor.sanitize(&test_frame(RgbImage::from_pixel(16, 16, CONCRETE)), 0);
        assert!(matches!(result, Err(PrivacyError::Detector(_))));
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let config = PrivacyConfig {
            max_frame_pixels: 100,
            ..Default::default()
        };
        let processor = FramePrivacyProcessor::with_defaults(config, "s").unwrap();
        let result = processor.sanitize(&test_frame(RgbImage::from_pixel(20, 20, CONCRETE)), 0);
        assert!(matches!(result, Err(PrivacyError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_sanitize_on_blocking_pool() {
        let processor = FramePrivacyProcessor::with_defaults(PrivacyConfig::default(), "s").unwrap();
        let out = processor
            .sanitize_blocking(test_frame(RgbImage::from_pixel(16, 16, CONCRETE)), 0)
            .await
            .unwrap();
        assert_eq!(out.frame_id(), 7);
    }
}
