//! The "DETECTION" Engine - asynchronous, cancellable hazard analysis
//!
//! ```text
//!   dispatch ──spawn──▶ [ remote (timeout, retry w/ backoff) ]──┐
//!      │                [ local fallback after N failures   ]   │ DetectionOutcome (mpsc)
//!      │ cancel/supersede                                       ▼
//!      └──────────────────────────────────────────────────── complete ──▶ registry.merge ──▶ watch<Arc<HazardSnapshot>>
//! ```
//!
//! At most one call is in flight. Every call carries a `CancellationToken`
//! and a generation number; `complete` checks both and discards anything
//! that was cancelled or superseded, so late results never touch the hazard
//! set.

use crate::analyzer::{AnalysisRequest, AnalysisResponse, AnalyzerError, HazardAnalyzer, RawDetection};
use crate::geometry::CameraPose;
use crate::hazard::{HazardType, RegulatoryRef};
use crate::privacy::SanitizedFrame;
use crate::quality::QualityLevel;
use crate::recovery::FailureKind;
use crate::registry::{HazardCandidate, HazardRegistry, HazardSnapshot, MergeReport, RegistryConfig};
use crate::regulatory::RegulatoryCatalog;
use crate::tracking_state::AnchorTable;
use hazardlens_env::{HazardLensContext, SessionId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the outcome channel; one live call plus superseded stragglers.
const OUTCOME_CHANNEL_CAPACITY: usize = 16;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// A pending call older than this is superseded by a new frame (default: 3s)
    pub stale_after_secs: f64,

    /// Frames waiting for analysis longer than this are dropped (default: 2s)
    pub frame_ttl_secs: f64,

    /// Per-attempt timeout (default: 5000ms)
    pub request_timeout_ms: u64,

    /// Attempts per call including the first (default: 3)
    pub max_attempts: u32,

    /// First retry delay (default: 200ms)
    pub initial_backoff_ms: u64,

    /// Retry delay cap (default: 2000ms)
    pub max_backoff_ms: u64,

    /// Relative jitter applied to each delay (default: 0.2 = ±20%)
    pub backoff_jitter: f64,

    /// Consecutive remote failures before switching to the fallback (default: 5)
    pub fallback_after_failures: u32,

    /// While in fallback, every Nth call retries the remote (default: 5)
    pub remote_retry_every: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 3.0,
            frame_ttl_secs: 2.0,
            request_timeout_ms: 5000,
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2000,
            backoff_jitter: 0.2,
            fallback_after_failures: 5,
            remote_retry_every: 5,
        }
    }
}

impl OrchestratorConfig {
    /// Delay before retry `attempt` (0-based). `unit` is a uniform sample in [0, 1).
    pub fn backoff_delay(&self, attempt: u32, unit: f64) -> Duration {
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_backoff_ms) as f64;
        let jitter = 1.0 + self.backoff_jitter * (2.0 * unit.clamp(0.0, 1.0) - 1.0);
        Duration::from_secs_f64((base * jitter).max(0.0) / 1000.0)
    }
}

// ============================================================================
// JOBS & OUTCOMES
// ============================================================================

/// A sanitized frame ready for analysis.
#[derive(Debug, Clone)]
pub struct SanitizedJob {
    pub frame: SanitizedFrame,
    pub capture_pose: CameraPose,
    pub quality: QualityLevel,
    /// When the sampler approved the frame
    pub requested_at: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Started { generation: u64 },
    /// The previous call was stale; it was cancelled and replaced
    Superseded { cancelled: u64, generation: u64 },
    /// A fresh call is already in flight
    SkippedBusy,
    /// The frame outlived its TTL before dispatch
    Expired,
    /// Structural problem with the request; not retried
    Rejected(AnalyzerError),
}

/// Result of one spawned analysis call.
#[derive(Debug, Clone)]
pub struct DetectionOutcome {
    pub generation: u64,
    pub frame_id: u64,
    pub capture_pose: CameraPose,
    pub dispatched_at: f64,
    pub finished_at: f64,
    pub result: Result<AnalysisResponse, AnalyzerError>,
    pub used_fallback: bool,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionReport {
    pub generation: u64,
    pub frame_id: u64,
    pub hazards_after: usize,
    /// End-to-end latency from dispatch to completion
    pub latency_ms: f64,
    pub used_fallback: bool,
    pub merge: MergeReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    Cancelled,
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Merged(DetectionReport),
    Discarded { generation: u64, reason: DiscardReason },
    Failed { generation: u64, error: AnalyzerError, used_fallback: bool },
}

/// Failure kind for the recovery manager, if the error is one it handles.
pub fn failure_kind(error: &AnalyzerError) -> Option<FailureKind> {
    error
        .is_retryable()
        .then_some(FailureKind::DetectionServiceUnavailable)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub dispatched: u64,
    pub skipped: u64,
    pub superseded: u64,
    pub expired: u64,
    pub merged: u64,
    pub discarded: u64,
    pub failed: u64,
}

// ============================================================================
// ROUTING STATE
// ============================================================================

/// Remote/fallback routing shared with spawned calls. Not hazard state.
#[derive(Debug, Default)]
struct RouteState {
    consecutive_failures: AtomicU32,
    using_fallback: AtomicBool,
    /// Calls routed while in fallback (drives remote retries)
    fallback_calls: AtomicU64,
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
    started_at: f64,
}

struct CallParts<C: HazardLensContext> {
    ctx: Arc<C>,
    remote: Arc<dyn HazardAnalyzer>,
    fallback: Option<Arc<dyn HazardAnalyzer>>,
    route: Arc<RouteState>,
    config: OrchestratorConfig,
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct HazardDetectionOrchestrator<C: HazardLensContext> {
    config: OrchestratorConfig,
    ctx: Arc<C>,
    remote: Arc<dyn HazardAnalyzer>,
    fallback: Option<Arc<dyn HazardAnalyzer>>,
    catalog: Arc<dyn RegulatoryCatalog>,
    session_id: SessionId,

    registry: HazardRegistry,
    snapshot_tx: watch::Sender<Arc<HazardSnapshot>>,

    route: Arc<RouteState>,
    in_flight: Option<InFlight>,
    generation: u64,

    outcome_tx: mpsc::Sender<DetectionOutcome>,
    stats: OrchestratorStats,
}

impl<C: HazardLensContext> HazardDetectionOrchestrator<C> {
    /// Returns the orchestrator and the receiver its calls report on.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        registry_config: RegistryConfig,
        ctx: Arc<C>,
        remote: Arc<dyn HazardAnalyzer>,
        fallback: Option<Arc<dyn HazardAnalyzer>>,
        catalog: Arc<dyn RegulatoryCatalog>,
        session_id: SessionId,
    ) -> (Self, mpsc::Receiver<DetectionOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::channel(OUTCOME_CHANNEL_CAPACITY);
        let (snapshot_tx, _) = watch::channel(HazardSnapshot::empty());
        let orchestrator = Self {
            config,
            ctx,
            remote,
            fallback,
            catalog,
            session_id,
            registry: HazardRegistry::new(registry_config),
            snapshot_tx,
            route: Arc::new(RouteState::default()),
            in_flight: None,
            generation: 0,
            outcome_tx,
            stats: OrchestratorStats::default(),
        };
        (orchestrator, outcome_rx)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn using_fallback(&self) -> bool {
        self.route.using_fallback.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.route.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats
    }

    pub fn registry(&self) -> &HazardRegistry {
        &self.registry
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<HazardSnapshot> {
        Arc::clone(&self.snapshot_tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<HazardSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    /// Start analysis of `job` unless a fresh call is already pending.
    pub fn dispatch(&mut self, job: SanitizedJob, now: f64) -> DispatchOutcome {
        if now - job.requested_at > self.config.frame_ttl_secs {
            self.stats.expired += 1;
            return DispatchOutcome::Expired;
        }

        let mut cancelled = None;
        if let Some(current) = &self.in_flight {
            if now - current.started_at <= self.config.stale_after_secs {
                self.stats.skipped += 1;
                return DispatchOutcome::SkippedBusy;
            }
            debug!("Superseding stale analysis call #{}", current.generation);
            current.token.cancel();
            cancelled = Some(current.generation);
            self.stats.superseded += 1;
            self.in_flight = None;
        }

        let request = AnalysisRequest::new(&job.frame, self.session_id, job.capture_pose, job.quality);
        if let Err(e) = request.validate() {
            warn!("Analysis request rejected: {}", e);
            return DispatchOutcome::Rejected(e);
        }

        self.generation += 1;
        let generation = self.generation;
        let token = CancellationToken::new();
        self.in_flight = Some(InFlight {
            generation,
            token: token.clone(),
            started_at: now,
        });
        self.stats.dispatched += 1;

        let parts = CallParts {
            ctx: Arc::clone(&self.ctx),
            remote: Arc::clone(&self.remote),
            fallback: self.fallback.clone(),
            route: Arc::clone(&self.route),
            config: self.config.clone(),
        };
        let tx = self.outcome_tx.clone();
        let frame_id = job.frame.frame_id();
        let capture_pose = job.capture_pose;

        self.ctx.spawn("hazard-analysis", async move {
            let (result, used_fallback, attempts) = tokio::select! {
                biased;
                _ = token.cancelled() => (Err(AnalyzerError::Cancelled), false, 0),
                r = Self::analyze_with_policy(&parts, request) => r,
            };
            let outcome = DetectionOutcome {
                generation,
                frame_id,
                capture_pose,
                dispatched_at: now,
                finished_at: parts.ctx.now_secs(),
                result,
                used_fallback,
                attempts,
            };
            // Receiver gone means the session ended
            let _ = tx.send(outcome).await;
        });

        match cancelled {
            Some(cancelled) => DispatchOutcome::Superseded { cancelled, generation },
            None => DispatchOutcome::Started { generation },
        }
    }

    /// One attempt bounded by the request timeout.
    async fn attempt(
        ctx: &C,
        analyzer: &dyn HazardAnalyzer,
        request: AnalysisRequest,
        timeout_ms: u64,
    ) -> Result<AnalysisResponse, AnalyzerError> {
        tokio::select! {
            biased;
            r = analyzer.analyze(request) => {
                let response = r?;
                response.validate()?;
                Ok(response)
            }
            _ = ctx.sleep(Duration::from_millis(timeout_ms)) => Err(AnalyzerError::Timeout(timeout_ms)),
        }
    }

    /// Retry, fallback and remote retry policy for a single call.
    async fn analyze_with_policy(
        parts: &CallParts<C>,
        request: AnalysisRequest,
    ) -> (Result<AnalysisResponse, AnalyzerError>, bool, u32) {
        let CallParts {
            ctx,
            remote,
            fallback,
            route,
            config,
        } = parts;

        let mut attempts = 0;
        let in_fallback = fallback.is_some() && route.using_fallback.load(Ordering::SeqCst);
        let retry_remote = in_fallback && {
            let n = route.fallback_calls.fetch_add(1, Ordering::SeqCst) + 1;
            n % config.remote_retry_every.max(1) == 0
        };

        if !in_fallback || retry_remote {
            let max_attempts = if retry_remote { 1 } else { config.max_attempts.max(1) };
            let mut last_err = AnalyzerError::ServiceUnavailable("no attempt made".into());

            for attempt in 0..max_attempts {
                attempts += 1;
                match Self::attempt(ctx, remote.as_ref(), request.clone(), config.request_timeout_ms).await {
                    Ok(response) => {
                        route.consecutive_failures.store(0, Ordering::SeqCst);
                        if route.using_fallback.swap(false, Ordering::SeqCst) {
                            info!("Remote analyzer '{}' recovered; leaving fallback", remote.name());
                        }
                        return (Ok(response), false, attempts);
                    }
                    Err(e) if !e.is_retryable() => return (Err(e), false, attempts),
                    Err(e) => {
                        let failures = route.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                        debug!("Remote attempt {} failed ({} consecutive): {}", attempts, failures, e);
                        last_err = e;

                        if fallback.is_some() && failures >= config.fallback_after_failures {
                            if !route.using_fallback.swap(true, Ordering::SeqCst) {
                                route.fallback_calls.store(0, Ordering::SeqCst);
                                warn!(
                                    "{} consecutive remote failures; routing to local fallback",
                                    failures
                                );
                            }
                            break;
                        }
                        if attempt + 1 < max_attempts {
                            ctx.sleep(config.backoff_delay(attempt, ctx.random_unit())).await;
                        }
                    }
                }
            }

            if !route.using_fallback.load(Ordering::SeqCst) {
                return (Err(last_err), false, attempts);
            }
        }

        let Some(fallback) = fallback else {
            return (
                Err(AnalyzerError::ServiceUnavailable("no fallback analyzer".into())),
                false,
                attempts,
            );
        };
        attempts += 1;
        let result = Self::attempt(ctx, fallback.as_ref(), request, config.request_timeout_ms).await;
        (result, true, attempts)
    }

    // ========================================================================
    // COMPLETION
    // ========================================================================

    /// Merge a finished call, unless it was cancelled or superseded.
    pub fn complete(&mut self, outcome: DetectionOutcome, anchors: &mut AnchorTable, now: f64) -> Completion {
        let generation = outcome.generation;
        let current = match &self.in_flight {
            Some(f) if f.generation == generation => f,
            _ => {
                self.stats.discarded += 1;
                debug!("Discarding result of superseded call #{}", generation);
                return Completion::Discarded {
                    generation,
                    reason: DiscardReason::Superseded,
                };
            }
        };
        if current.token.is_cancelled() || matches!(outcome.result, Err(AnalyzerError::Cancelled)) {
            self.in_flight = None;
            self.stats.discarded += 1;
            return Completion::Discarded {
                generation,
                reason: DiscardReason::Cancelled,
            };
        }
        self.in_flight = None;

        let response = match outcome.result {
            Ok(response) => response,
            Err(error) => {
                self.stats.failed += 1;
                return Completion::Failed {
                    generation,
                    error,
                    used_fallback: outcome.used_fallback,
                };
            }
        };

        let candidates: Vec<HazardCandidate> = response
            .detections
            .iter()
            .map(|d| self.to_candidate(d, &outcome.capture_pose))
            .collect();
        let (merge, _) = self.registry.merge(candidates, anchors, now);
        let snapshot = self.registry.snapshot(now);
        let hazards_after = snapshot.len();
        self.snapshot_tx.send_replace(snapshot);
        self.stats.merged += 1;

        Completion::Merged(DetectionReport {
            generation,
            frame_id: outcome.frame_id,
            hazards_after,
            latency_ms: (outcome.finished_at - outcome.dispatched_at).max(0.0) * 1000.0,
            used_fallback: outcome.used_fallback,
            merge,
        })
    }

    /// Place a camera-space detection in the world and enrich it.
    fn to_candidate(&self, detection: &RawDetection, capture_pose: &CameraPose) -> HazardCandidate {
        let hazard_type = HazardType::from_label(&detection.label);
        let entry = self
            .catalog
            .lookup(hazard_type, detection.regulatory_code.as_deref());

        let (regulatory_refs, recommended_actions) = match (entry, &detection.regulatory_code) {
            (Some(entry), _) => (vec![entry.reference], entry.corrective_actions),
            (None, Some(code)) => (vec![RegulatoryRef::new(code.clone(), String::new())], Vec::new()),
            (None, None) => (Vec::new(), Vec::new()),
        };

        HazardCandidate {
            hazard_type,
            bounding_volume: detection.bounding_volume.to_world(capture_pose),
            confidence: detection.confidence,
            severity: detection.severity.unwrap_or_else(|| hazard_type.default_severity()),
            regulatory_refs,
            recommended_actions,
        }
    }

    /// Cancel the in-flight call (session stop / backgrounding).
    pub fn cancel_all(&mut self) {
        if let Some(current) = self.in_flight.take() {
            info!("Cancelling analysis call #{}", current.generation);
            current.token.cancel();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameMetadata, PlatformTrackingStatus, TrackingFrame};
    use crate::geometry::BoundingVolume;
    use crate::privacy::{FramePrivacyProcessor, PrivacyConfig};
    use crate::regulatory::StaticRegulatoryCatalog;
    use async_trait::async_trait;
    use hazardlens_env::TokioContext;
    use image::RgbImage;
    use nalgebra::Vector3;
    use std::sync::atomic::AtomicUsize;

    struct FixedAnalyzer {
        name: &'static str,
        delay: Duration,
        detections: Vec<RawDetection>,
        calls: AtomicUsize,
    }

    impl FixedAnalyzer {
        fn new(name: &'static str, delay_ms: u64, detections: Vec<RawDetection>) -> Arc<Self> {
            Arc::new(Self {
                name,
                delay: Duration::from_millis(delay_ms),
                detections,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HazardAnalyzer for FixedAnalyzer {
        fn name(&self) -> &str {
            self.name
        }

        async fn analyze(&self, _request: AnalysisRequest) -> Result<AnalysisResponse, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(AnalysisResponse {
                detections: self.detections.clone(),
                latency_ms: self.delay.as_secs_f64() * 1000.0,
            })
        }
    }

    fn fall_hazard() -> RawDetection {
        RawDetection {
            label: "fall_hazard".into(),
            confidence: 0.8,
            bounding_volume: BoundingVolume::axis_aligned(Vector3::new(0.0, 0.0, -4.0), Vector3::new(2.0, 0.2, 2.0)),
            regulatory_code: None,
            severity: None,
        }
    }

    fn job(id: u64, requested_at: f64) -> SanitizedJob {
        let processor = FramePrivacyProcessor::with_defaults(PrivacyConfig::default(), "test").unwrap();
        let frame = TrackingFrame {
            id,
            pose: CameraPose::identity(requested_at),
            image: Arc::new(RgbImage::from_pixel(32, 32, image::Rgb([90, 90, 90]))),
            tracking_quality: 1.0,
            status: PlatformTrackingStatus::Normal,
            metadata: FrameMetadata::default(),
            timestamp: requested_at,
        };
        SanitizedJob {
            frame: processor.sanitize(&frame, 640).unwrap(),
            capture_pose: frame.pose,
            quality: QualityLevel::High,
            requested_at,
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            request_timeout_ms: 30,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..Default::default()
        }
    }

    fn orchestrator(
        config: OrchestratorConfig,
        remote: Arc<dyn HazardAnalyzer>,
        fallback: Option<Arc<dyn HazardAnalyzer>>,
    ) -> (HazardDetectionOrchestrator<TokioContext>, mpsc::Receiver<DetectionOutcome>) {
        HazardDetectionOrchestrator::new(
            config,
            RegistryConfig::default(),
            TokioContext::shared(),
            remote,
            fallback,
            Arc::new(StaticRegulatoryCatalog::construction_defaults()),
            SessionId::from_seed(1),
        )
    }

    #[test]
    fn test_backoff_is_bounded_exponential() {
        let config = OrchestratorConfig {
            backoff_jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(0, 0.5), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(1, 0.5), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(5, 0.5), Duration::from_millis(2000));

        let jittered = OrchestratorConfig::default().backoff_delay(0, 0.0);
        assert!(jittered >= Duration::from_millis(159) && jittered <= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_successful_call_is_merged_into_world_space() {
        let remote = FixedAnalyzer::new("remote", 1, vec![fall_hazard()]);
        let (mut orch, mut rx) = orchestrator(fast_config(), remote, None);
        let mut anchors = AnchorTable::new();

        assert_eq!(orch.dispatch(job(1, 0.0), 0.0), DispatchOutcome::Started { generation: 1 });
        let outcome = rx.recv().await.unwrap();
        let Completion::Merged(report) = orch.complete(outcome, &mut anchors, 0.1) else {
            panic!("expected merge");
        };
        assert_eq!(report.hazards_after, 1);
        assert!(!report.used_fallback);

        let snapshot = orch.snapshot();
        let hazard = &snapshot.hazards[0];
        assert_eq!(hazard.hazard_type, HazardType::FallProtection);
        assert_eq!(hazard.regulatory_refs[0].code, "29 CFR 1926.501");
        assert_eq!(hazard.bounding_volume.center, Vector3::new(0.0, 0.0, -4.0));
        assert_eq!(anchors.len(), 1);
    }

    #[tokio::test]
    async fn test_second_frame_skipped_while_fresh_call_pending() {
        let remote = FixedAnalyzer::new("remote", 20, vec![]);
        let (mut orch, _rx) = orchestrator(fast_config(), remote, None);
        orch.dispatch(job(1, 0.0), 0.0);
        assert_eq!(orch.dispatch(job(2, 0.5), 0.5), DispatchOutcome::SkippedBusy);
        assert_eq!(orch.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_expired_frame_not_dispatched() {
        let remote = FixedAnalyzer::new("remote", 1, vec![]);
        let (mut orch, _rx) = orchestrator(fast_config(), remote, None);
        assert_eq!(orch.dispatch(job(1, 0.0), 5.0), DispatchOutcome::Expired);
        assert!(!orch.is_in_flight());
    }

    #[tokio::test]
    async fn test_stale_call_superseded_and_late_result_discarded() {
        let config = OrchestratorConfig {
            request_timeout_ms: 5_000,
            ..fast_config()
        };
        let remote = FixedAnalyzer::new("remote", 5, vec![fall_hazard()]);
        let (mut orch, mut rx) = orchestrator(config, remote, None);
        let mut anchors = AnchorTable::new();

        orch.dispatch(job(1, 0.0), 0.0);
        let before = orch.snapshot();

        // A newer frame arrives after the staleness threshold
        let outcome = orch.dispatch(job(2, 3.5), 3.5);
        assert_eq!(outcome, DispatchOutcome::Superseded { cancelled: 1, generation: 2 });

        // Forge a late, successful result for the cancelled call
        let late = DetectionOutcome {
            generation: 1,
            frame_id: 1,
            capture_pose: CameraPose::identity(0.0),
            dispatched_at: 0.0,
            finished_at: 4.0,
            result: Ok(AnalysisResponse {
                detections: vec![fall_hazard()],
                latency_ms: 4000.0,
            }),
            used_fallback: false,
            attempts: 1,
        };
        assert!(matches!(orch.complete(late, &mut anchors, 4.0), Completion::Discarded { .. }));
        assert_eq!(orch.snapshot(), before);
        assert!(anchors.is_empty());

        // Drain whatever the two spawned calls reported; only #2 merges
        let mut merged = 0;
        for _ in 0..2 {
            let outcome = rx.recv().await.unwrap();
            if let Completion::Merged(r) = orch.complete(outcome, &mut anchors, 4.1) {
                assert_eq!(r.generation, 2);
                merged += 1;
            }
        }
        assert_eq!(merged, 1);
    }

    #[tokio::test]
    async fn test_cancel_all_discards_pending_result() {
        let remote = FixedAnalyzer::new("remote", 50, vec![fall_hazard()]);
        let (mut orch, mut rx) = orchestrator(fast_config(), remote, None);
        let mut anchors = AnchorTable::new();

        orch.dispatch(job(1, 0.0), 0.0);
        orch.cancel_all();
        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome.result, Err(AnalyzerError::Cancelled)));
        assert!(matches!(orch.complete(outcome, &mut anchors, 1.0), Completion::Discarded { .. }));
        assert!(orch.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_five_consecutive_timeouts_engage_fallback() {
        // Remote never answers within the 30ms timeout
        let remote = FixedAnalyzer::new("remote", 10_000, vec![]);
        let fallback = FixedAnalyzer::new("local", 1, vec![fall_hazard()]);
        let (mut orch, mut rx) = orchestrator(fast_config(), remote.clone(), Some(fallback.clone()));
        let mut anchors = AnchorTable::new();

        // First call: 3 timed-out attempts
        orch.dispatch(job(1, 0.0), 0.0);
        let first = rx.recv().await.unwrap();
        assert!(matches!(first.result, Err(AnalyzerError::Timeout(_))));
        assert!(matches!(orch.complete(first, &mut anchors, 0.1), Completion::Failed { .. }));
        assert!(!orch.using_fallback());

        // Second call: 2 more timeouts reach the threshold, then the fallback answers
        orch.dispatch(job(2, 1.0), 1.0);
        let second = rx.recv().await.unwrap();
        assert!(second.used_fallback);
        assert_eq!(orch.consecutive_failures(), 5);
        assert!(orch.using_fallback());
        assert!(matches!(orch.complete(second, &mut anchors, 1.1), Completion::Merged(_)));

        // Third call goes straight to the fallback
        let remote_calls = remote.calls.load(Ordering::SeqCst);
        orch.dispatch(job(3, 2.0), 2.0);
        let third = rx.recv().await.unwrap();
        assert!(third.used_fallback);
        assert_eq!(third.attempts, 1);
        assert_eq!(remote.calls.load(Ordering::SeqCst), remote_calls);
    }

    #[tokio::test]
    async fn test_remote_retry_clears_fallback() {
        struct Flaky {
            fail_first: usize,
            calls: AtomicUsize,
        }

        #[async_trait]
        impl HazardAnalyzer for Flaky {
            fn name(&self) -> &str {
                "flaky"
            }

            async fn analyze(&self, _request: AnalysisRequest) -> Result<AnalysisResponse, AnalyzerError> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.fail_first {
                    Err(AnalyzerError::ServiceUnavailable("503".into()))
                } else {
                    Ok(AnalysisResponse {
                        detections: vec![],
                        latency_ms: 1.0,
                    })
                }
            }
        }

        let config = OrchestratorConfig {
            max_attempts: 1,
            fallback_after_failures: 2,
            remote_retry_every: 2,
            ..fast_config()
        };
        let remote = Arc::new(Flaky {
            fail_first: 2,
            calls: AtomicUsize::new(0),
        });
        let fallback = FixedAnalyzer::new("local", 1, vec![]);
        let (mut orch, mut rx) = orchestrator(config, remote, Some(fallback));
        let mut anchors = AnchorTable::new();

        let mut used = Vec::new();
        for i in 0..4 {
            let t = i as f64;
            orch.dispatch(job(i, t), t);
            let outcome = rx.recv().await.unwrap();
            used.push(outcome.used_fallback);
            orch.complete(outcome, &mut anchors, t + 0.1);
        }
        // fail, fail->fallback, fallback (retry skipped), retry succeeds
        assert_eq!(used, vec![false, true, true, false]);
        assert!(!orch.using_fallback());
        assert_eq!(orch.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_malformed_response_not_retried() {
        let mut bad = fall_hazard();
        bad.bounding_volume.size.x = f64::INFINITY;
        let remote = FixedAnalyzer::new("remote", 1, vec![bad]);
        let (mut orch, mut rx) = orchestrator(fast_config(), remote.clone(), None);

        orch.dispatch(job(1, 0.0), 0.0);
        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome.result, Err(AnalyzerError::MalformedResponse(_))));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure_kind(&AnalyzerError::MalformedResponse(String::new())), None);
    }
}
