//! Session Runtime - wires the engines into the per-tick flow.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                          HazardSession                                │
//! │                                                                       │
//! │  TrackingFrame ─▶ TRACKING ─▶ SAMPLER ──analyze?──▶ AnalysisJob        │
//! │                      │                                  │             │
//! │                      │                       PRIVACY (blocking pool)  │
//! │                      │                                  │             │
//! │                      │                         ORCHESTRATOR (task)    │
//! │                      ▼                                  │             │
//! │   snapshot ─────▶ OVERLAY ─▶ RenderFrame     DetectionOutcome ─▶ merge│
//! │                      │                                                │
//! │                PERFORMANCE ─▶ QUALITY ─▶ RECOVERY ─▶ notifications    │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The session is the single owner of all mutable engine state. Work that
//! leaves the tick (sanitization, analysis) runs on spawned tasks and comes
//! back through channels.
//!
//! # Usage
//!
//! ```ignore
//! use hazardlens_core::session::{Collaborators, HazardSession};
//! use hazardlens_env::TokioContext;
//!
//! let mut session = HazardSession::new(config, TokioContext::shared(), collaborators, SessionId::new())?;
//! session.start()?;
//! session.run(frames_rx, render_tx, shutdown).await?;
//! ```

use crate::analyzer::HazardAnalyzer;
use crate::config::HazardLensConfig;
use crate::error::CoreError;
use crate::frame::TrackingFrame;
use crate::orchestrator::{
    failure_kind, Completion, DetectionOutcome, DispatchOutcome, HazardDetectionOrchestrator, SanitizedJob,
};
use crate::overlay::{OverlayManager, RenderFrame};
use crate::performance::{PerformanceMonitor, PerformanceSample};
use crate::privacy::FramePrivacyProcessor;
use crate::quality::{AdaptiveQualityController, QualityChange, QualityChangeReason, QualitySettings};
use crate::recovery::{ErrorRecoveryManager, FailureKind, RecoveryAction, RecoveryDecision, UserNotification};
use crate::registry::HazardSnapshot;
use crate::regulatory::RegulatoryCatalog;
use crate::sampler::AdaptiveFrameSampler;
use crate::telemetry::{events, TelemetryEmitter};
use crate::tracking_state::{TrackingState, TrackingStateManager, TrackingTransition};
use hazardlens_env::{DeviceSensor, DeviceReading, EnvError, HazardLensContext, SessionId, TelemetrySink, ThermalState};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often a persisting limited-tracking condition is re-reported.
const TRACKING_REPORT_INTERVAL_SECS: f64 = 1.0;

/// Capacity of the sanitized-job channel used by `run`.
const SANITIZED_CHANNEL_CAPACITY: usize = 4;

// ============================================================================
// TYPES
// ============================================================================

/// A frame the sampler approved, with the quality it should be analyzed at.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub frame: TrackingFrame,
    pub quality: QualitySettings,
    pub requested_at: f64,
}

/// Everything one tick produced.
#[derive(Debug, Clone)]
pub struct TickOutput {
    pub render: RenderFrame,
    pub analysis: Option<AnalysisJob>,
    pub tracking_state: TrackingState,
    pub transition: Option<TrackingTransition>,
    pub quality_change: Option<QualityChange>,
    /// Notifications raised since the previous tick
    pub notifications: Vec<UserNotification>,
}

/// External collaborators a session talks to.
pub struct Collaborators<D: DeviceSensor> {
    pub device: Arc<D>,
    pub remote: Arc<dyn HazardAnalyzer>,
    pub fallback: Option<Arc<dyn HazardAnalyzer>>,
    pub catalog: Arc<dyn RegulatoryCatalog>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

// ============================================================================
// SESSION
// ============================================================================

pub struct HazardSession<C: HazardLensContext, D: DeviceSensor> {
    session_id: SessionId,
    context: Arc<C>,
    device: Arc<D>,
    config: HazardLensConfig,

    tracking: TrackingStateManager,
    sampler: AdaptiveFrameSampler,
    privacy: FramePrivacyProcessor,
    orchestrator: HazardDetectionOrchestrator<C>,
    outcome_rx: Option<mpsc::Receiver<DetectionOutcome>>,
    overlay: OverlayManager,
    performance: PerformanceMonitor,
    quality: AdaptiveQualityController,
    recovery: ErrorRecoveryManager,
    telemetry: TelemetryEmitter,

    spatial_tracking: bool,
    last_analysis_at: Option<f64>,
    last_thermal: ThermalState,
    last_tracking_report: Option<f64>,
    pending_latency_ms: Option<f64>,
    pending_notifications: Vec<UserNotification>,
    was_using_fallback: bool,
    backgrounded: bool,
    stopped: bool,
    tick_count: u64,
}

impl<C: HazardLensContext, D: DeviceSensor> HazardSession<C, D> {
    pub fn new(
        config: HazardLensConfig,
        context: Arc<C>,
        collaborators: Collaborators<D>,
        session_id: SessionId,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let Collaborators {
            device,
            remote,
            fallback,
            catalog,
            telemetry,
        } = collaborators;

        let mut recovery_config = config.recovery.clone();
        recovery_config.fallback_detector_available = fallback.is_some();

        let privacy = FramePrivacyProcessor::with_defaults(config.privacy.clone(), session_id.as_uuid().to_string())?;
        let (orchestrator, outcome_rx) = HazardDetectionOrchestrator::new(
            config.orchestrator.clone(),
            config.registry.clone(),
            Arc::clone(&context),
            remote,
            fallback,
            catalog,
            session_id,
        );

        Ok(Self {
            session_id,
            tracking: TrackingStateManager::new(config.tracking.clone()),
            sampler: AdaptiveFrameSampler::new(config.sampler.clone()),
            privacy,
            orchestrator,
            outcome_rx: Some(outcome_rx),
            overlay: OverlayManager::new(config.overlay.clone()),
            performance: PerformanceMonitor::new(config.performance.clone()),
            quality: AdaptiveQualityController::new(config.quality.clone()),
            recovery: ErrorRecoveryManager::new(recovery_config),
            telemetry: TelemetryEmitter::new(telemetry, session_id),
            spatial_tracking: true,
            last_analysis_at: None,
            last_thermal: ThermalState::Nominal,
            last_tracking_report: None,
            pending_latency_ms: None,
            pending_notifications: Vec::new(),
            was_using_fallback: false,
            backgrounded: false,
            stopped: false,
            tick_count: 0,
            context,
            device,
            config,
        })
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn now_secs(&self) -> f64 {
        self.context.now_secs()
    }

    pub fn config(&self) -> &HazardLensConfig {
        &self.config
    }

    pub fn tracking(&self) -> &TrackingStateManager {
        &self.tracking
    }

    pub fn sampler(&self) -> &AdaptiveFrameSampler {
        &self.sampler
    }

    pub fn orchestrator(&self) -> &HazardDetectionOrchestrator<C> {
        &self.orchestrator
    }

    pub fn performance(&self) -> &PerformanceMonitor {
        &self.performance
    }

    pub fn quality(&self) -> &AdaptiveQualityController {
        &self.quality
    }

    pub fn recovery(&self) -> &ErrorRecoveryManager {
        &self.recovery
    }

    pub fn snapshot(&self) -> Arc<HazardSnapshot> {
        self.orchestrator.snapshot()
    }

    pub fn subscribe_hazards(&self) -> watch::Receiver<Arc<HazardSnapshot>> {
        self.orchestrator.subscribe()
    }

    pub fn subscribe_quality(&self) -> watch::Receiver<QualitySettings> {
        self.quality.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    fn unix_ms(&self) -> u64 {
        self.context
            .system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn report(&mut self, kind: FailureKind, detail: &str, now: f64) -> RecoveryDecision {
        let mut decision = self.recovery.report(kind, detail, now);
        if let Some(notification) = decision.notification.take() {
            let record = self
                .telemetry
                .record(events::RECOVERY, self.unix_ms())
                .with_field("kind", kind.as_str())
                .with_field("blocking", notification.blocking);
            self.telemetry.emit(record);
            self.pending_notifications.push(notification);
        }
        decision
    }

    /// Carry out a recovery action the session owns. Retry and detector
    /// fallback live in the orchestrator; limited-tracking fallback is timed
    /// by the tracking manager.
    fn act(&mut self, decision: &RecoveryDecision, now: f64) -> Option<QualityChange> {
        match decision.action {
            RecoveryAction::DowngradeQuality => {
                let change = self.quality.force_downgrade(now)?;
                let record = self
                    .telemetry
                    .record(events::QUALITY_CHANGED, self.unix_ms())
                    .with_field("from", change.from.as_str())
                    .with_field("to", change.to.as_str())
                    .with_field("forced", true);
                self.telemetry.emit(record);
                Some(change)
            }
            RecoveryAction::UseOverlayFallback if decision.kind == FailureKind::UnsupportedCapability => {
                self.spatial_tracking = false;
                None
            }
            RecoveryAction::UseOverlayFallback
            | RecoveryAction::RetryThenFallbackDetector
            | RecoveryAction::PromptUser
            | RecoveryAction::Block => None,
        }
    }

    /// Shed quality when the platform starts throttling. Acts once per
    /// escalation, not on every tick the state persists.
    fn on_thermal(&mut self, thermal: ThermalState, now: f64) -> Option<QualityChange> {
        let escalated = thermal > self.last_thermal;
        self.last_thermal = thermal;
        if !(escalated && thermal.is_throttling()) {
            return None;
        }
        let detail = format!("thermal state {}", thermal.as_str());
        let decision = self.report(FailureKind::PerformanceBudgetExceeded, &detail, now);
        self.act(&decision, now)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Check device capabilities. Fails only on a blocking structural error.
    pub fn start(&mut self) -> Result<(), CoreError> {
        let now = self.now_secs();

        if let Err(EnvError::PermissionDenied(sensor)) = self.device.read() {
            let decision = self.recovery.report(FailureKind::PermissionDenied, &sensor, now);
            if let Some(notification) = decision.notification {
                return Err(CoreError::Blocked(notification));
            }
        }

        if !self.device.supports_spatial_tracking() {
            let mut decision = self
                .recovery
                .report(FailureKind::UnsupportedCapability, "spatial tracking", now);
            match decision.notification.take() {
                Some(n) if decision.policy.blocking => return Err(CoreError::Blocked(n)),
                Some(n) => self.pending_notifications.push(n),
                None => {}
            }
            self.act(&decision, now);
        }

        info!("Session {} started (spatial tracking: {})", self.session_id, self.spatial_tracking);
        Ok(())
    }

    /// App went to the background: cancel in-flight analysis immediately.
    pub fn background(&mut self) {
        self.orchestrator.cancel_all();
        self.backgrounded = true;
        info!("Session {} backgrounded", self.session_id);
    }

    pub fn foreground(&mut self) {
        self.backgrounded = false;
    }

    /// Stop the session. In-flight analysis is cancelled and anchors dropped.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        let now = self.now_secs();
        self.orchestrator.cancel_all();
        self.tracking.stop(now);
        self.stopped = true;

        let stats = self.orchestrator.stats();
        let record = self
            .telemetry
            .record(events::SESSION_STOPPED, self.unix_ms())
            .with_field("ticks", self.tick_count)
            .with_field("analyses_merged", stats.merged)
            .with_field("analyses_discarded", stats.discarded);
        self.telemetry.emit(record);
        info!("Session {} stopped after {} ticks", self.session_id, self.tick_count);
    }

    // ========================================================================
    // TICK
    // ========================================================================

    /// Process one capture tick.
    pub fn on_frame(&mut self, frame: TrackingFrame, now: f64) -> Result<TickOutput, CoreError> {
        if self.stopped {
            return Err(CoreError::SessionStopped);
        }
        self.tick_count += 1;
        let work_started = self.context.now();

        // 1. Tracking
        let transition = self
            .tracking
            .update(frame.status, frame.tracking_quality, frame.pose, now);
        if let Some(t) = transition {
            self.on_transition(t);
        }
        let state = self.tracking.state();
        if state.is_limited() {
            let due = self
                .last_tracking_report
                .map_or(true, |t| now - t >= TRACKING_REPORT_INTERVAL_SECS);
            if due {
                self.last_tracking_report = Some(now);
                let detail = match state {
                    TrackingState::Limited(reason) => reason.describe(),
                    _ => "limited",
                };
                let decision = self.report(FailureKind::TrackingLost, detail, now);
                self.act(&decision, now);
            }
        }
        self.tracking.expire_anchors(now);

        // 2. Device
        let reading = match self.device.read() {
            Ok(r) => r,
            Err(e) => {
                debug!("Device sensor read failed: {}", e);
                DeviceReading::default()
            }
        };
        let forced_change = self.on_thermal(reading.thermal_state, now);

        // 3. Sampling
        let settings = self.quality.current();
        let base_interval = self.config.sampler.base_interval_ms * settings.sampler_interval_factor;
        let approved = !self.backgrounded
            && self
                .sampler
                .should_analyze(state, reading.battery_level, self.last_analysis_at, base_interval, now);

        // 4. Overlays: this tick's pose with the latest snapshot
        let render_pose = if state.has_reliable_pose() {
            frame.pose
        } else {
            self.tracking.last_confirmed_pose().unwrap_or(frame.pose)
        };
        let fallback_mode = !self.spatial_tracking || self.tracking.fallback_mode(now);
        let snapshot = self.orchestrator.snapshot();
        let render = self
            .overlay
            .compute(&snapshot, &render_pose, &self.config.camera, fallback_mode);

        // 5. Performance: the platform's frame cost, else this tick's own work
        let frame_time_ms = reading.frame_time_ms.unwrap_or_else(|| {
            self.context.now().saturating_sub(work_started).as_secs_f64() * 1000.0
        });
        self.performance.record(PerformanceSample {
            frame_time_ms,
            detection_latency_ms: self.pending_latency_ms.take(),
            memory_bytes: reading.memory_bytes,
            battery_drain_rate: f64::from(reading.battery_drain_rate) / 100.0,
            timestamp: now,
        });

        // 6. Quality
        let quality_change = match forced_change {
            Some(change) => Some(change),
            None => {
                let change = self.quality.evaluate(now, &self.performance);
                if let Some(change) = change {
                    self.on_quality_change(change, now);
                }
                change
            }
        };

        let analysis = approved.then(|| {
            self.last_analysis_at = Some(now);
            AnalysisJob {
                frame,
                quality: settings,
                requested_at: now,
            }
        });

        Ok(TickOutput {
            render,
            analysis,
            tracking_state: state,
            transition,
            quality_change,
            notifications: std::mem::take(&mut self.pending_notifications),
        })
    }

    fn on_transition(&mut self, t: TrackingTransition) {
        if t.to == TrackingState::Tracking {
            self.recovery.resolve(FailureKind::TrackingLost);
            self.last_tracking_report = None;
        }
        let record = self
            .telemetry
            .record(events::TRACKING_TRANSITION, self.unix_ms())
            .with_field("from", t.from.name())
            .with_field("to", t.to.name());
        self.telemetry.emit(record);
    }

    fn on_quality_change(&mut self, change: QualityChange, now: f64) {
        match change.reason {
            QualityChangeReason::Recovered => self.recovery.resolve(FailureKind::PerformanceBudgetExceeded),
            QualityChangeReason::Forced => {}
            reason => {
                // The controller already stepped down; nothing left to act on
                self.report(FailureKind::PerformanceBudgetExceeded, &format!("{reason:?}"), now);
            }
        }
        let record = self
            .telemetry
            .record(events::QUALITY_CHANGED, self.unix_ms())
            .with_field("from", change.from.as_str())
            .with_field("to", change.to.as_str());
        self.telemetry.emit(record);
    }

    // ========================================================================
    // ANALYSIS
    // ========================================================================

    /// Clone of the privacy pipeline, for sanitizing off the session.
    pub fn privacy(&self) -> FramePrivacyProcessor {
        self.privacy.clone()
    }

    /// Sanitize on the blocking pool.
    pub async fn sanitize(&self, job: AnalysisJob) -> Result<SanitizedJob, CoreError> {
        sanitize_job(&self.privacy, job).await
    }

    /// Sanitize on the calling thread.
    pub fn sanitize_inline(&self, job: AnalysisJob) -> Result<SanitizedJob, CoreError> {
        let frame = self.privacy.sanitize(&job.frame, job.quality.detection_resolution_px)?;
        Ok(SanitizedJob {
            frame,
            capture_pose: job.frame.pose,
            quality: job.quality.level,
            requested_at: job.requested_at,
        })
    }

    /// Hand a sanitized frame to the orchestrator.
    pub fn dispatch(&mut self, job: SanitizedJob) -> DispatchOutcome {
        if self.stopped || self.backgrounded {
            return DispatchOutcome::SkippedBusy;
        }
        let outcome = self.orchestrator.dispatch(job, self.now_secs());
        match &outcome {
            DispatchOutcome::Superseded { cancelled, generation } => {
                debug!("Analysis #{} superseded by #{}", cancelled, generation)
            }
            DispatchOutcome::Rejected(e) => warn!("Frame rejected for analysis: {}", e),
            _ => {}
        }
        outcome
    }

    /// Merge (or discard) a finished analysis.
    pub fn on_detection(&mut self, outcome: DetectionOutcome) -> Completion {
        let now = self.now_secs();
        let completion = self
            .orchestrator
            .complete(outcome, self.tracking.anchors_mut(), now);

        match &completion {
            Completion::Merged(report) => {
                self.pending_latency_ms = Some(report.latency_ms);
                if report.used_fallback {
                    let decision = self.report(FailureKind::DetectionServiceUnavailable, "using local fallback", now);
                    self.act(&decision, now);
                } else {
                    self.recovery.resolve(FailureKind::DetectionServiceUnavailable);
                }
                let record = self
                    .telemetry
                    .record(events::DETECTION_COMPLETED, self.unix_ms())
                    .with_field("hazards", report.hazards_after)
                    .with_field("inserted", report.merge.inserted)
                    .with_field("replaced", report.merge.replaced)
                    .with_field("latency_ms", report.latency_ms)
                    .with_field("fallback", report.used_fallback);
                self.telemetry.emit(record);
            }
            Completion::Failed { error, .. } => {
                if let Some(kind) = failure_kind(error) {
                    let decision = self.report(kind, &error.to_string(), now);
                    self.act(&decision, now);
                } else {
                    warn!("Analysis failed: {}", error);
                }
                let record = self
                    .telemetry
                    .record(events::DETECTION_FAILED, self.unix_ms())
                    .with_field("error", error.to_string());
                self.telemetry.emit(record);
            }
            Completion::Discarded { generation, reason } => {
                debug!("Analysis #{} discarded ({:?})", generation, reason);
            }
        }

        let using_fallback = self.orchestrator.using_fallback();
        if using_fallback != self.was_using_fallback {
            self.was_using_fallback = using_fallback;
            let record = self
                .telemetry
                .record(events::FALLBACK_ENGAGED, self.unix_ms())
                .with_field("engaged", using_fallback);
            self.telemetry.emit(record);
        }
        completion
    }

    /// Process every outcome already waiting, without blocking.
    pub fn poll_detections(&mut self) -> Vec<Completion> {
        let mut outcomes = Vec::new();
        if let Some(rx) = self.outcome_rx.as_mut() {
            while let Ok(outcome) = rx.try_recv() {
                outcomes.push(outcome);
            }
        }
        outcomes.into_iter().map(|o| self.on_detection(o)).collect()
    }

    // ========================================================================
    // EVENT LOOP
    // ========================================================================

    /// Single-consumer loop: frames, sanitized jobs, analysis outcomes and
    /// shutdown. Stops the session on exit.
    pub async fn run(
        &mut self,
        mut frames: mpsc::Receiver<TrackingFrame>,
        render_tx: mpsc::Sender<RenderFrame>,
        shutdown: CancellationToken,
    ) -> Result<(), CoreError> {
        let mut outcome_rx = self
            .outcome_rx
            .take()
            .ok_or(CoreError::ChannelClosed("detection outcomes"))?;
        let (sanitized_tx, mut sanitized_rx) = mpsc::channel(SANITIZED_CHANNEL_CAPACITY);

        let result = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break Ok(()),

                Some(outcome) = outcome_rx.recv() => {
                    self.on_detection(outcome);
                }

                Some(sanitized) = sanitized_rx.recv() => match sanitized {
                    Ok(job) => {
                        self.dispatch(job);
                    }
                    Err(e) => warn!("Sanitization failed, frame dropped: {}", e),
                },

                frame = frames.recv() => {
                    let Some(frame) = frame else { break Ok(()) };
                    let now = self.now_secs();
                    let tick = match self.on_frame(frame, now) {
                        Ok(tick) => tick,
                        Err(e) => break Err(e),
                    };
                    if let Some(job) = tick.analysis {
                        let privacy = self.privacy.clone();
                        let tx = sanitized_tx.clone();
                        self.context.spawn("privacy-sanitize", async move {
                            let _ = tx.send(sanitize_job(&privacy, job).await).await;
                        });
                    }
                    if render_tx.send(tick.render).await.is_err() {
                        break Err(CoreError::ChannelClosed("render"));
                    }
                }
            }
        };

        self.outcome_rx = Some(outcome_rx);
        self.stop();
        result
    }
}

async fn sanitize_job(privacy: &FramePrivacyProcessor, job: AnalysisJob) -> Result<SanitizedJob, CoreError> {
    let capture_pose = job.frame.pose;
    let frame = privacy
        .sanitize_blocking(job.frame, job.quality.detection_resolution_px)
        .await?;
    Ok(SanitizedJob {
        frame,
        capture_pose,
        quality: job.quality.level,
        requested_at: job.requested_at,
    })
}

// ============================================================================
// TESTS
// ============================================================================
