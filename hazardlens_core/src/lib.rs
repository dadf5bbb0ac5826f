//! HazardLens Core - Spatially-Anchored Hazard Overlays for Handheld AR
//!
//! This library turns a live camera feed into prioritized, world-anchored
//! safety-hazard overlays under real-time and power budgets:
//! 1. **Where am I?** Pose tracking with graceful degradation (`tracking_state`)
//! 2. **What is there?** Privacy-sanitized, cancellable hazard analysis with
//!    a local fallback, merged into one deduplicated world model
//!    (`privacy`, `orchestrator`, `registry`)
//! 3. **What do I show?** Per-tick filtering, prioritization and projection
//!    (`overlay`, `coordinate_transform`)
//! 4. **Can I afford it?** Closed-loop quality and cadence control
//!    (`sampler`, `performance`, `quality`) with central error recovery
//!    (`recovery`)

pub mod analyzer;
pub mod config;
pub mod coordinate_transform;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod hazard;
pub mod orchestrator;
pub mod overlay;
pub mod performance;
pub mod privacy;
pub mod quality;
pub mod recovery;
pub mod registry;
pub mod regulatory;
pub mod sampler;
pub mod session;
pub mod telemetry;
pub mod tracking_state;

// Re-export key types for convenience
pub use analyzer::{AnalysisRequest, AnalysisResponse, AnalyzerError, HazardAnalyzer, RawDetection};
pub use config::HazardLensConfig;
pub use coordinate_transform::CoordinateTransformer;
pub use error::{ConfigError, CoreError};
pub use frame::{FrameMetadata, GeoLocation, LimitedReason, PlatformTrackingStatus, TrackingFrame};
pub use geometry::{BoundingVolume, CameraIntrinsics, CameraPose, ScreenPoint, ScreenRect, Viewport};
pub use hazard::{AnchorId, DetectedHazard, HazardType, RegulatoryRef, Severity};
pub use orchestrator::{Completion, DetectionOutcome, DetectionReport, DispatchOutcome, HazardDetectionOrchestrator};
pub use overlay::{FilterConfig, OverlayManager, OverlayRenderItem, Prioritization, RenderFrame};
pub use performance::{PerformanceMonitor, PerformanceSample, PerformanceSummary};
pub use privacy::{FramePrivacyProcessor, PrivacyError, SanitizedFrame};
pub use quality::{AdaptiveQualityController, QualityLevel, QualitySettings};
pub use recovery::{ErrorRecoveryManager, FailureKind, RecoveryAction, UserNotification};
pub use registry::{HazardRegistry, HazardSnapshot};
pub use regulatory::{RegulatoryCatalog, StaticRegulatoryCatalog};
pub use sampler::AdaptiveFrameSampler;
pub use session::{AnalysisJob, Collaborators, HazardSession, TickOutput};
pub use telemetry::TelemetryEmitter;
pub use tracking_state::{AnchorTable, TrackingState, TrackingStateManager};
