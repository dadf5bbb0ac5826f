//! Scripted hazard analyzer with fault injection.
//!
//! Answers from the oracle's ground truth: every hazard visible from the
//! request's capture pose becomes a camera-space detection with Gaussian
//! position noise. Latency and faults are played out on the context clock,
//! so in simulation they cost virtual time only.

use async_trait::async_trait;
use hazardlens_core::{
    AnalysisRequest, AnalysisResponse, AnalyzerError, BoundingVolume, HazardAnalyzer, RawDetection,
};
use hazardlens_env::HazardLensContext;
use nalgebra::Vector3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::oracle::Oracle;

// ============================================================================
// FAULTS
// ============================================================================

/// Injected analyzer misbehavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Fault {
    /// Fails fast with `ServiceUnavailable`
    Outage,
    /// Never answers within any sane timeout
    Hang,
    /// Answers with geometry that cannot be placed in the world
    Malformed,
    /// Answers correctly after this many extra milliseconds
    Slow(u64),
}

/// A fault active over `[start_secs, end_secs)` of session time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaultWindow {
    pub start_secs: f64,
    pub end_secs: f64,
    pub fault: Fault,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedAnalyzerConfig {
    /// Name reported in logs (default: "remote")
    pub name: String,

    /// Mean response latency (default: 350ms)
    pub latency_ms: f64,

    /// Latency standard deviation (default: 80ms)
    pub latency_jitter_ms: f64,

    /// Position noise standard deviation per axis (default: 0.15m)
    pub position_noise_m: f64,

    /// Hazards further away are missed (default: 12m)
    pub max_range_m: f64,

    /// Multiplier on reported confidence (default: 1.0)
    pub confidence_scale: f32,

    /// Whether to forward ground-truth severities (default: true)
    pub report_severity: bool,
}

impl Default for ScriptedAnalyzerConfig {
    fn default() -> Self {
        Self {
            name: "remote".to_string(),
            latency_ms: 350.0,
            latency_jitter_ms: 80.0,
            position_noise_m: 0.15,
            max_range_m: 12.0,
            confidence_scale: 1.0,
            report_severity: true,
        }
    }
}

impl ScriptedAnalyzerConfig {
    /// On-device detector: fast, short-sighted, less confident.
    pub fn local_fallback() -> Self {
        Self {
            name: "local".to_string(),
            latency_ms: 120.0,
            latency_jitter_ms: 20.0,
            position_noise_m: 0.3,
            max_range_m: 7.0,
            confidence_scale: 0.8,
            report_severity: false,
        }
    }
}

// ============================================================================
// ANALYZER
// ============================================================================

pub struct ScriptedAnalyzer<C: HazardLensContext> {
    config: ScriptedAnalyzerConfig,
    ctx: Arc<C>,
    oracle: Arc<Oracle>,
    faults: Mutex<Vec<FaultWindow>>,
    rng: Mutex<ChaCha8Rng>,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl<C: HazardLensContext> ScriptedAnalyzer<C> {
    pub fn new(config: ScriptedAnalyzerConfig, ctx: Arc<C>, oracle: Arc<Oracle>, seed: u64) -> Self {
        Self {
            config,
            ctx,
            oracle,
            faults: Mutex::new(Vec::new()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ScriptedAnalyzerConfig {
        &self.config
    }

    /// Schedule a fault window.
    pub fn inject(&self, start_secs: f64, end_secs: f64, fault: Fault) {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(FaultWindow {
                start_secs,
                end_secs,
                fault,
            });
    }

    /// Total calls received.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls answered with an error (or left hanging).
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    fn active_fault(&self, now: f64) -> Option<Fault> {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|w| now >= w.start_secs && now < w.end_secs)
            .map(|w| w.fault)
    }

    fn sample_latency_ms(&self, rng: &mut ChaCha8Rng) -> f64 {
        let mean = self.config.latency_ms.max(0.0);
        let jitter = match Normal::new(0.0, self.config.latency_jitter_ms.max(0.0)) {
            Ok(normal) => normal.sample(rng),
            Err(_) => 0.0,
        };
        (mean + jitter).max(1.0)
    }

    /// Detections for every hazard visible from `request`'s capture pose.
    fn observe(&self, request: &AnalysisRequest, rng: &mut ChaCha8Rng) -> Vec<RawDetection> {
        let pose = request.context().capture_pose;
        let noise = Normal::new(0.0, self.config.position_noise_m.max(0.0)).ok();

        self.oracle
            .visible_from(&pose)
            .into_iter()
            .filter(|s| s.distance <= self.config.max_range_m)
            .map(|s| {
                let offset = match &noise {
                    Some(n) => Vector3::new(n.sample(rng), n.sample(rng), n.sample(rng)),
                    None => Vector3::zeros(),
                };
                // Closer hazards are recognized with more confidence
                let closeness = 1.0 - (s.distance / self.config.max_range_m).clamp(0.0, 1.0);
                let confidence = ((0.55 + 0.4 * closeness) as f32 * self.config.confidence_scale).clamp(0.0, 1.0);
                RawDetection {
                    label: s.hazard.label.clone(),
                    confidence,
                    bounding_volume: BoundingVolume::axis_aligned(s.camera_space + offset, s.hazard.size),
                    regulatory_code: None,
                    severity: if self.config.report_severity {
                        s.hazard.severity
                    } else {
                        None
                    },
                }
            })
            .collect()
    }
}

#[async_trait]
impl<C: HazardLensContext> HazardAnalyzer for ScriptedAnalyzer<C> {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse, AnalyzerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fault = self.active_fault(self.ctx.now_secs());

        // Draw everything up front so the guard is not held across awaits
        let (latency_ms, detections) = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let latency = self.sample_latency_ms(&mut rng);
            (latency, self.observe(&request, &mut rng))
        };

        match fault {
            Some(Fault::Outage) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                self.ctx.sleep(Duration::from_millis(30)).await;
                debug!("{} call #{}: injected outage", self.config.name, call);
                return Err(AnalyzerError::ServiceUnavailable("injected outage".into()));
            }
            Some(Fault::Hang) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                debug!("{} call #{}: injected hang", self.config.name, call);
                self.ctx.sleep(Duration::from_secs(3600)).await;
                return Err(AnalyzerError::Network("connection reset".into()));
            }
            _ => {}
        }

        let extra = match fault {
            Some(Fault::Slow(ms)) => ms as f64,
            _ => 0.0,
        };
        let total_ms = latency_ms + extra;
        self.ctx.sleep(Duration::from_secs_f64(total_ms / 1000.0)).await;

        if fault == Some(Fault::Malformed) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            let mut broken = detections;
            broken.push(RawDetection {
                label: "unknown".into(),
                confidence: 0.5,
                bounding_volume: BoundingVolume::axis_aligned(
                    Vector3::new(f64::NAN, 0.0, -1.0),
                    Vector3::new(1.0, 1.0, 1.0),
                ),
                regulatory_code: None,
                severity: None,
            });
            return Ok(AnalysisResponse {
                detections: broken,
                latency_ms: total_ms,
            });
        }

        Ok(AnalysisResponse {
            detections,
            latency_ms: total_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimContext;
    use hazardlens_core::{FramePrivacyProcessor, QualityLevel};
    use hazardlens_env::SessionId;

    fn request(oracle: &Oracle, t: f64) -> AnalysisRequest {
        let privacy = FramePrivacyProcessor::with_defaults(Default::default(), "salt").unwrap();
        let frame = oracle.frame(1, t, 0);
        let sanitized = privacy.sanitize(&frame, 160).unwrap();
        AnalysisRequest::new(&sanitized, SessionId::from_seed(1), frame.pose, QualityLevel::High)
    }

    async fn drive<F: std::future::Future>(ctx: &SimContext, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                out = &mut fut => return out,
                _ = tokio::task::yield_now() => ctx.advance_time(Duration::from_millis(10)),
            }
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_answers_from_ground_truth() {
        let ctx = SimContext::shared(7);
        let oracle = Arc::new(Oracle::construction_site(7));
        let analyzer = ScriptedAnalyzer::new(ScriptedAnalyzerConfig::default(), Arc::clone(&ctx), Arc::clone(&oracle), 7);

        let req = request(&oracle, 1.0);
        let response = drive(&ctx, analyzer.analyze(req)).await.unwrap();

        assert!(!response.detections.is_empty());
        assert_eq!(response.detections[0].label, "fall_hazard");
        assert!(response.validate().is_ok());
        assert!(response.detections.iter().all(|d| (0.0..=1.0).contains(&d.confidence)));
        // Latency was spent on the virtual clock
        assert!(ctx.now_secs() > 0.0);
        assert_eq!(analyzer.calls(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_outage_fails_fast() {
        let ctx = SimContext::shared(7);
        let oracle = Arc::new(Oracle::construction_site(7));
        let analyzer = ScriptedAnalyzer::new(ScriptedAnalyzerConfig::default(), Arc::clone(&ctx), Arc::clone(&oracle), 7);
        analyzer.inject(0.0, 10.0, Fault::Outage);

        let result = drive(&ctx, analyzer.analyze(request(&oracle, 1.0))).await;
        assert!(matches!(result, Err(AnalyzerError::ServiceUnavailable(_))));
        assert_eq!(analyzer.failures(), 1);
        assert!(ctx.now_secs() < 0.1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_malformed_response_fails_validation() {
        let ctx = SimContext::shared(7);
        let oracle = Arc::new(Oracle::construction_site(7));
        let analyzer = ScriptedAnalyzer::new(ScriptedAnalyzerConfig::default(), Arc::clone(&ctx), Arc::clone(&oracle), 7);
        analyzer.inject(0.0, 10.0, Fault::Malformed);

        let response = drive(&ctx, analyzer.analyze(request(&oracle, 1.0))).await.unwrap();
        assert!(matches!(response.validate(), Err(AnalyzerError::MalformedResponse(_))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_local_fallback_is_short_sighted() {
        let ctx = SimContext::shared(7);
        let oracle = Arc::new(Oracle::construction_site(7));
        let remote = ScriptedAnalyzer::new(ScriptedAnalyzerConfig::default(), Arc::clone(&ctx), Arc::clone(&oracle), 1);
        let local = ScriptedAnalyzer::new(ScriptedAnalyzerConfig::local_fallback(), Arc::clone(&ctx), Arc::clone(&oracle), 1);

        let far = drive(&ctx, remote.analyze(request(&oracle, 1.0))).await.unwrap();
        let near = drive(&ctx, local.analyze(request(&oracle, 1.0))).await.unwrap();
        assert!(near.detections.len() <= far.detections.len());
        assert!(near.detections.iter().all(|d| d.severity.is_none()));
        assert_eq!(local.name(), "local");
    }
}
