//! Hazard-analysis capability seam.
//!
//! The remote service and the local fallback detector share one contract:
//! a sanitized image plus context in, camera-space detections out.

use crate::geometry::{BoundingVolume, CameraPose};
use crate::hazard::Severity;
use crate::privacy::SanitizedFrame;
use crate::quality::QualityLevel;
use async_trait::async_trait;
use hazardlens_env::SessionId;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalyzerError {
    #[error("analysis timed out after {0}ms")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("analysis service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("analysis cancelled")]
    Cancelled,
}

impl AnalyzerError {
    /// Transient failures are retried with backoff; structural ones are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AnalyzerError::Timeout(_) | AnalyzerError::Network(_) | AnalyzerError::ServiceUnavailable(_)
        )
    }
}

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

/// Context sent alongside the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub frame_id: u64,
    pub session_id: SessionId,
    /// Pose the frame was captured at
    pub capture_pose: CameraPose,
    pub quality: QualityLevel,
    pub image_width: u32,
    pub image_height: u32,
    /// Hash of the sanitized pixels (for server-side dedup)
    pub content_hash: String,
}

/// A request can only be built from a `SanitizedFrame`.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    image: Arc<RgbImage>,
    context: AnalysisContext,
}

impl AnalysisRequest {
    pub fn new(frame: &SanitizedFrame, session_id: SessionId, capture_pose: CameraPose, quality: QualityLevel) -> Self {
        let (image_width, image_height) = frame.dimensions();
        Self {
            image: Arc::clone(frame.image()),
            context: AnalysisContext {
                frame_id: frame.frame_id(),
                session_id,
                capture_pose,
                quality,
                image_width,
                image_height,
                content_hash: frame.content_hash().to_string(),
            },
        }
    }

    pub fn image(&self) -> &Arc<RgbImage> {
        &self.image
    }

    pub fn context(&self) -> &AnalysisContext {
        &self.context
    }

    /// Structural validation; failures here are never retried.
    pub fn validate(&self) -> Result<(), AnalyzerError> {
        let ctx = &self.context;
        if ctx.image_width == 0 || ctx.image_height == 0 {
            return Err(AnalyzerError::InvalidRequest("empty image".into()));
        }
        let p = ctx.capture_pose.position();
        if !p.iter().all(|v| v.is_finite()) {
            return Err(AnalyzerError::InvalidRequest("capture pose is not finite".into()));
        }
        Ok(())
    }
}

/// One detection in the capture camera's frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    /// Detector class label, e.g. `"fall_hazard"`
    pub label: String,
    pub confidence: f32,
    /// Camera-space bounding volume
    pub bounding_volume: BoundingVolume,
    pub regulatory_code: Option<String>,
    pub severity: Option<Severity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub detections: Vec<RawDetection>,
    /// Processing latency reported by the analyzer
    pub latency_ms: f64,
}

impl AnalysisResponse {
    /// Reject responses whose geometry cannot be placed in the world.
    pub fn validate(&self) -> Result<(), AnalyzerError> {
        for d in &self.detections {
            let bv = &d.bounding_volume;
            if !bv.center.iter().chain(bv.size.iter()).all(|v| v.is_finite()) {
                return Err(AnalyzerError::MalformedResponse(format!(
                    "non-finite bounding volume for '{}'",
                    d.label
                )));
            }
            if bv.size.iter().any(|v| *v < 0.0) {
                return Err(AnalyzerError::MalformedResponse(format!("negative size for '{}'", d.label)));
            }
        }
        Ok(())
    }
}

// ============================================================================
// TRAIT
// ============================================================================

#[async_trait]
pub trait HazardAnalyzer: Send + Sync {
    /// Short name for logs ("remote", "local").
    fn name(&self) -> &str;

    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse, AnalyzerError>;
}
