//! Scenario runner - drives a full HazardLens session on the virtual clock.
//!
//! One tick of the harness:
//!
//! ```text
//!   Oracle.frame(t) ─▶ session.on_frame ─▶ sanitize_inline ─▶ dispatch
//!                                                               │
//!   advance clock by max(frame cost, tick period) ◀── settle ◀──┘
//!                │
//!                ▼
//!   settle ─▶ session.poll_detections ─▶ metrics / export
//! ```
//!
//! Everything runs on a current-thread runtime; spawned analysis tasks only
//! make progress while the harness yields, so runs are reproducible from the
//! seed.

use crate::analyzer::{ScriptedAnalyzer, ScriptedAnalyzerConfig};
use crate::context::SimContext;
use crate::device::SimDevice;
use crate::exporter::{HazardPosition, SimExport, SimFrame};
use crate::oracle::Oracle;
use crate::scenarios::{DeviceAction, DeviceEvent, ScenarioId, ScenarioPlan};

use hazardlens_core::{
    Collaborators, Completion, CoreError, HazardAnalyzer, HazardLensConfig, HazardSession, StaticRegulatoryCatalog,
    TickOutput,
};
use hazardlens_env::{DeviceController, HazardLensContext, MemoryTelemetrySink, SessionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Scheduler passes given to spawned tasks around each clock advance.
const SETTLE_YIELDS: usize = 8;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether the scenario held its property
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    pub ticks: u64,

    /// Orchestrator counters
    pub dispatched: u64,
    pub skipped: u64,
    pub superseded: u64,
    pub expired: u64,
    pub merged: u64,
    pub discarded: u64,
    pub failed: u64,

    /// Merged results that came from the local fallback
    pub fallback_merges: u64,
    pub fallback_engaged: bool,
    /// Fallback engaged and later cleared by a remote success
    pub fallback_recovered: bool,

    pub max_hazards: usize,
    pub final_hazards: usize,
    pub max_visible_overlays: usize,
    /// Same-type hazard pairs closer than the merge distance, worst snapshot
    pub max_duplicate_pairs: usize,
    /// Placement error of the final hazard set against ground truth
    pub rms_error_m: Option<f64>,

    pub fallback_mode_ticks: u64,
    pub limited_ticks: u64,
    pub notifications: u64,

    pub quality_downgrades: u64,
    pub quality_upgrades: u64,
    pub final_quality: String,
    pub final_tracking: String,
    pub final_avg_frame_time_ms: Option<f64>,

    pub max_sampler_interval_ms: f64,
    pub max_detection_latency_ms: f64,
    pub min_battery_level: f32,
    pub telemetry_records: usize,
}

// ============================================================================
// HARNESS
// ============================================================================

/// A live session wired to simulated collaborators.
pub struct SimHarness {
    pub context: Arc<SimContext>,
    pub device: Arc<SimDevice>,
    pub oracle: Arc<Oracle>,
    pub remote: Arc<ScriptedAnalyzer<SimContext>>,
    pub local: Arc<ScriptedAnalyzer<SimContext>>,
    pub telemetry: MemoryTelemetrySink,
    pub session: HazardSession<SimContext, SimDevice>,
    frame_id: u64,
    last_frame_time: f64,
    tick_period: Duration,
    metrics: ScenarioMetrics,
    was_using_fallback: bool,
}

impl SimHarness {
    /// Build a session over `oracle` with a scripted remote analyzer and a
    /// local fallback.
    pub fn new(
        seed: u64,
        config: HazardLensConfig,
        oracle: Oracle,
        device: SimDevice,
        tick_rate_hz: u32,
    ) -> Result<Self, CoreError> {
        let context = SimContext::shared(seed);
        let device = Arc::new(device);
        let oracle = Arc::new(oracle);
        let analyzer_seed = seed.wrapping_mul(0x9e3779b97f4a7c15);
        let remote = Arc::new(ScriptedAnalyzer::new(
            ScriptedAnalyzerConfig::default(),
            Arc::clone(&context),
            Arc::clone(&oracle),
            analyzer_seed,
        ));
        let local = Arc::new(ScriptedAnalyzer::new(
            ScriptedAnalyzerConfig::local_fallback(),
            Arc::clone(&context),
            Arc::clone(&oracle),
            analyzer_seed ^ 1,
        ));
        let telemetry = MemoryTelemetrySink::new();

        let session = HazardSession::new(
            config,
            Arc::clone(&context),
            Collaborators {
                device: Arc::clone(&device),
                remote: Arc::clone(&remote) as Arc<dyn HazardAnalyzer>,
                fallback: Some(Arc::clone(&local) as Arc<dyn HazardAnalyzer>),
                catalog: Arc::new(StaticRegulatoryCatalog::construction_defaults()),
                telemetry: Arc::new(telemetry.clone()),
            },
            SessionId::from_seed(seed),
        )?;

        let tick_period = Duration::from_secs_f64(1.0 / f64::from(tick_rate_hz.max(1)));

        Ok(Self {
            context,
            device,
            oracle,
            remote,
            local,
            telemetry,
            session,
            frame_id: 0,
            last_frame_time: 0.0,
            tick_period,
            metrics: ScenarioMetrics {
                min_battery_level: 1.0,
                ..Default::default()
            },
            was_using_fallback: false,
        })
    }

    pub fn now_secs(&self) -> f64 {
        self.context.now_secs()
    }

    pub fn metrics(&self) -> &ScenarioMetrics {
        &self.metrics
    }

    /// Let spawned tasks run until they block on the clock or a channel.
    async fn settle() {
        for _ in 0..SETTLE_YIELDS {
            tokio::task::yield_now().await;
        }
    }

    /// Run one capture tick and advance the clock past it.
    pub async fn step(&mut self) -> Result<TickOutput, CoreError> {
        let t = self.now_secs();
        let unix_ms = self
            .context
            .system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.frame_id += 1;
        self.last_frame_time = t;
        let frame = self.oracle.frame(self.frame_id, t, unix_ms);

        let tick = self.session.on_frame(frame, t)?;
        self.device.set_quality(self.session.quality().level());

        if let Some(job) = tick.analysis.clone() {
            match self.session.sanitize_inline(job) {
                Ok(sanitized) => {
                    self.session.dispatch(sanitized);
                }
                Err(e) => warn!("Sanitization failed at t={:.2}s: {}", t, e),
            }
        }
        Self::settle().await;

        let cost = Duration::from_secs_f64(self.device.frame_cost_ms() / 1000.0);
        let dt = cost.max(self.tick_period);
        self.context.advance_time(dt);
        self.device.step(dt.as_secs_f64());
        Self::settle().await;

        for completion in self.session.poll_detections() {
            self.observe_completion(&completion);
        }
        self.observe_tick(&tick);
        Ok(tick)
    }

    /// Step until the clock reaches `until_secs`, applying device events on the way.
    pub async fn run_until(&mut self, until_secs: f64, events: &[DeviceEvent]) -> Result<(), CoreError> {
        let mut pending: Vec<DeviceEvent> = events.to_vec();
        pending.sort_by(|a, b| a.at_secs.total_cmp(&b.at_secs));
        let mut pending = pending.into_iter().peekable();

        while self.now_secs() < until_secs {
            while let Some(event) = pending.next_if(|e| e.at_secs <= self.now_secs()) {
                self.apply(event.action);
            }
            self.step().await?;
        }
        Ok(())
    }

    /// Apply a scripted device change.
    pub fn apply(&self, action: DeviceAction) {
        debug!("t={:.2}s device event {:?}", self.now_secs(), action);
        match action {
            DeviceAction::BatteryLevel(level) => self.device.set_battery_level(level),
            DeviceAction::DrainRate(rate) => self.device.set_drain_rate(rate),
            DeviceAction::LoadFactor(factor) => self.device.set_load_factor(factor),
            DeviceAction::Charging(charging) => self.device.set_charging(charging),
        }
    }

    fn observe_completion(&mut self, completion: &Completion) {
        if let Completion::Merged(report) = completion {
            if report.used_fallback {
                self.metrics.fallback_merges += 1;
            }
            self.metrics.max_detection_latency_ms = self.metrics.max_detection_latency_ms.max(report.latency_ms);
        }
    }

    fn observe_tick(&mut self, tick: &TickOutput) {
        let hazards = self.session.snapshot().len();
        let dups = self.duplicate_pairs();
        let m = &mut self.metrics;
        m.ticks += 1;
        m.max_visible_overlays = m.max_visible_overlays.max(tick.render.visible_count());
        if tick.render.fallback_mode {
            m.fallback_mode_ticks += 1;
        }
        if tick.tracking_state.is_limited() {
            m.limited_ticks += 1;
        }
        m.notifications += tick.notifications.len() as u64;
        if let Some(change) = tick.quality_change {
            if change.to < change.from {
                m.quality_downgrades += 1;
            } else {
                m.quality_upgrades += 1;
            }
        }
        m.max_sampler_interval_ms = m.max_sampler_interval_ms.max(self.session.sampler().current_interval_ms());
        m.min_battery_level = m.min_battery_level.min(self.device.battery_level());

        let using_fallback = self.session.orchestrator().using_fallback();
        if using_fallback && !self.was_using_fallback {
            m.fallback_engaged = true;
        } else if !using_fallback && self.was_using_fallback {
            m.fallback_recovered = true;
        }
        self.was_using_fallback = using_fallback;

        m.max_hazards = m.max_hazards.max(hazards);
        m.max_duplicate_pairs = m.max_duplicate_pairs.max(dups);
    }

    /// Same-type hazard pairs closer than the merge distance.
    pub fn duplicate_pairs(&self) -> usize {
        let snapshot = self.session.snapshot();
        let merge = self.session.config().registry.merge_distance_m;
        let hazards = &snapshot.hazards;
        let mut pairs = 0;
        for (i, a) in hazards.iter().enumerate() {
            for b in &hazards[i + 1..] {
                if a.hazard_type == b.hazard_type
                    && (a.bounding_volume.center - b.bounding_volume.center).norm() < merge
                {
                    pairs += 1;
                }
            }
        }
        pairs
    }

    /// RMS distance from each registered hazard to its ground truth.
    pub fn ground_truth_error(&self) -> Option<f64> {
        let snapshot = self.session.snapshot();
        let errors: Vec<f64> = snapshot
            .hazards
            .iter()
            .filter_map(|h| self.oracle.nearest_error(h.hazard_type, &h.bounding_volume.center))
            .collect();
        if errors.is_empty() {
            return None;
        }
        Some((errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt())
    }

    /// Current frame contents for the JSON export.
    pub fn export_frame(&self, tick: &TickOutput) -> SimFrame {
        let snapshot = self.session.snapshot();
        SimFrame {
            time_sec: self.now_secs(),
            camera: HazardPosition::from_vector(None, self.oracle.pose_at(self.last_frame_time).position()),
            ground_truth: self
                .oracle
                .hazards()
                .iter()
                .map(|h| HazardPosition::from_vector(Some(format!("{:?}", h.hazard_type)), h.position))
                .collect(),
            hazards: snapshot
                .hazards
                .iter()
                .map(|h| HazardPosition::from_vector(Some(format!("{:?}", h.hazard_type)), h.bounding_volume.center))
                .collect(),
            overlays: tick
                .render
                .items
                .iter()
                .filter(|i| i.visible)
                .map(|i| i.accessibility_label.clone())
                .collect(),
            tracking: tick.tracking_state.name().to_string(),
            quality: self.session.quality().level().as_str().to_string(),
            fallback_mode: tick.render.fallback_mode,
            events: tick.notifications.iter().map(|n| n.message.clone()).collect(),
        }
    }

    /// Fill in the end-of-run metrics.
    pub fn finish(&mut self) -> ScenarioMetrics {
        let stats = self.session.orchestrator().stats();
        let now = self.now_secs();
        let window = self.session.config().quality.window_secs;
        let summary = self.session.performance().summary(now, window);

        let final_hazards = self.session.snapshot().len();
        let rms_error_m = self.ground_truth_error();
        let m = &mut self.metrics;
        m.dispatched = stats.dispatched;
        m.skipped = stats.skipped;
        m.superseded = stats.superseded;
        m.expired = stats.expired;
        m.merged = stats.merged;
        m.discarded = stats.discarded;
        m.failed = stats.failed;
        m.final_hazards = final_hazards;
        m.rms_error_m = rms_error_m;
        m.final_quality = self.session.quality().level().as_str().to_string();
        m.final_tracking = self.session.tracking().state().name().to_string();
        m.final_avg_frame_time_ms = (summary.sample_count > 0).then_some(summary.avg_frame_time_ms);
        m.telemetry_records = self.telemetry.records().len();
        m.clone()
    }
}

// ============================================================================
// RUNNER
// ============================================================================

/// Runs chaos scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Overrides each scenario's own duration
    duration_secs: Option<f64>,

    /// Record one export frame every this many ticks (0 = no export)
    export_interval: u64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tick_rate_hz: 30,
            duration_secs: None,
            export_interval: 0,
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz;
        self
    }

    /// Sets the run duration for every scenario.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    /// Records export frames every `ticks` ticks.
    pub fn with_export_interval(mut self, ticks: u64) -> Self {
        self.export_interval = ticks;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_with_export(scenario).0
    }

    /// Runs a scenario, also returning the recorded frames.
    pub fn run_with_export(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        let mut export = SimExport::new(scenario.name(), self.seed);

        let runtime = match tokio::runtime::Builder::new_current_thread().build() {
            Ok(rt) => rt,
            Err(e) => return (self.failed(scenario, format!("runtime: {}", e)), export),
        };

        let result = runtime.block_on(self.execute(scenario, &mut export));
        export.finalize(result.passed);
        (result, export)
    }

    fn failed(&self, scenario: ScenarioId, reason: String) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }

    async fn execute(&self, scenario: ScenarioId, export: &mut SimExport) -> ScenarioResult {
        let ScenarioPlan {
            duration_secs,
            config,
            oracle,
            faults,
            device_events,
        } = scenario.plan(self.seed);
        let duration = self.duration_secs.unwrap_or(duration_secs);

        let mut harness = match SimHarness::new(self.seed, config.clone(), oracle, SimDevice::new(), self.tick_rate_hz)
        {
            Ok(h) => h,
            Err(e) => return self.failed(scenario, format!("session setup: {}", e)),
        };
        for w in &faults {
            harness.remote.inject(w.start_secs, w.end_secs, w.fault);
        }
        if let Err(e) = harness.session.start() {
            return self.failed(scenario, format!("session start: {}", e));
        }

        let mut events = device_events.into_iter().peekable();
        while harness.now_secs() < duration {
            while let Some(event) = events.next_if(|e| e.at_secs <= harness.now_secs()) {
                harness.apply(event.action);
            }
            let tick = match harness.step().await {
                Ok(tick) => tick,
                Err(e) => return self.failed(scenario, format!("tick failed: {}", e)),
            };

            let ticks = harness.metrics().ticks;
            if self.export_interval > 0 && ticks % self.export_interval == 0 {
                export.add_frame(harness.export_frame(&tick));
            }
            if ticks % 30 == 0 {
                debug!(
                    "  t={:.1}s | hazards={} | quality={} | tracking={}",
                    harness.now_secs(),
                    harness.session.snapshot().len(),
                    harness.session.quality().level().as_str(),
                    tick.tracking_state.name()
                );
            }
        }

        let final_time_secs = harness.now_secs();
        let metrics = harness.finish();
        harness.session.stop();

        let verdict = scenario.verify(&metrics, &config);
        match &verdict {
            Ok(()) => info!("Scenario {} passed", scenario.name()),
            Err(reason) => warn!("Scenario {} failed: {}", scenario.name(), reason),
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: verdict.is_ok(),
            total_ticks: metrics.ticks,
            final_time_secs,
            failure_reason: verdict.err(),
            metrics,
        }
    }
}
