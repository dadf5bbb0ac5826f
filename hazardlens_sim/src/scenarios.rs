//! Chaos engineering scenarios for DST.
//!
//! Each scenario is a plan (scene, tracking script, device events, injected
//! analyzer faults, config overrides) plus one property the run must hold.

use crate::analyzer::{Fault, FaultWindow};
use crate::oracle::Oracle;
use crate::runner::ScenarioMetrics;
use hazardlens_core::{HazardLensConfig, LimitedReason, PlatformTrackingStatus};
use serde::{Deserialize, Serialize};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioId {
    /// HL-001: Baseline walk, dedup and world placement must hold
    SteadyWalk,

    /// HL-002: Light drops mid-walk, tracking degrades to limited
    LowLight,

    /// HL-003: Battery crosses the low threshold
    BatteryDrain,

    /// HL-004: Remote analyzer goes down, then comes back
    ServiceOutage,

    /// HL-005: Remote answers slower than the stale threshold
    StaleResults,

    /// HL-006: Device heats up, frames get expensive
    ThermalThrottle,

    /// HL-007: Platform loses tracking entirely for several seconds
    TrackingLoss,
}

/// A device condition change at a point in session time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceAction {
    BatteryLevel(f32),
    DrainRate(f32),
    LoadFactor(f64),
    Charging(bool),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceEvent {
    pub at_secs: f64,
    pub action: DeviceAction,
}

/// Everything needed to run one scenario.
pub struct ScenarioPlan {
    pub duration_secs: f64,
    pub config: HazardLensConfig,
    pub oracle: Oracle,
    pub faults: Vec<FaultWindow>,
    pub device_events: Vec<DeviceEvent>,
}

impl ScenarioPlan {
    fn base(seed: u64, duration_secs: f64) -> Self {
        Self {
            duration_secs,
            config: HazardLensConfig::default(),
            oracle: Oracle::construction_site(seed),
            faults: Vec::new(),
            device_events: Vec::new(),
        }
    }

    fn fault(mut self, start_secs: f64, end_secs: f64, fault: Fault) -> Self {
        self.faults.push(FaultWindow {
            start_secs,
            end_secs,
            fault,
        });
        self
    }

    fn at(mut self, at_secs: f64, action: DeviceAction) -> Self {
        self.device_events.push(DeviceEvent { at_secs, action });
        self
    }
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyWalk,
            ScenarioId::LowLight,
            ScenarioId::BatteryDrain,
            ScenarioId::ServiceOutage,
            ScenarioId::StaleResults,
            ScenarioId::ThermalThrottle,
            ScenarioId::TrackingLoss,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyWalk => "steady_walk",
            ScenarioId::LowLight => "low_light",
            ScenarioId::BatteryDrain => "battery_drain",
            ScenarioId::ServiceOutage => "service_outage",
            ScenarioId::StaleResults => "stale_results",
            ScenarioId::ThermalThrottle => "thermal_throttle",
            ScenarioId::TrackingLoss => "tracking_loss",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyWalk => "20s walk past six hazards; one overlay per hazard, placed within 1m",
            ScenarioId::LowLight => "Light drops for 7s; sampling backs off and overlays fall back to 2D",
            ScenarioId::BatteryDrain => "Battery dips below 20%; the analysis interval widens within one cycle",
            ScenarioId::ServiceOutage => "Remote analyzer down for 9s; local fallback engages, then remote recovers",
            ScenarioId::StaleResults => "Remote answers in 4.5s; stale calls are superseded and their results dropped",
            ScenarioId::ThermalThrottle => "Frame cost rises 60%; quality steps down until frames fit the budget",
            ScenarioId::TrackingLoss => "Tracking lost for 5s; 2D fallback mode entered, tracking restored",
        }
    }

    /// Default run length in seconds.
    pub fn default_duration_secs(&self) -> f64 {
        self.plan(0).duration_secs
    }

    /// Build the run plan for `seed`.
    pub fn plan(&self, seed: u64) -> ScenarioPlan {
        match self {
            ScenarioId::SteadyWalk => ScenarioPlan::base(seed, 20.0),

            ScenarioId::LowLight => {
                let mut plan = ScenarioPlan::base(seed, 20.0);
                plan.oracle = Oracle::construction_site(seed).with_low_light(5.0, 12.0);
                plan
            }

            ScenarioId::BatteryDrain => ScenarioPlan::base(seed, 15.0)
                .at(0.0, DeviceAction::BatteryLevel(0.23))
                .at(5.0, DeviceAction::BatteryLevel(0.19))
                .at(5.0, DeviceAction::DrainRate(30.0)),

            ScenarioId::ServiceOutage => ScenarioPlan::base(seed, 25.0).fault(3.0, 12.0, Fault::Outage),

            ScenarioId::StaleResults => ScenarioPlan::base(seed, 20.0).fault(2.0, 12.0, Fault::Slow(4500)),

            ScenarioId::ThermalThrottle => ScenarioPlan::base(seed, 20.0).at(3.0, DeviceAction::LoadFactor(1.6)),

            ScenarioId::TrackingLoss => {
                let mut plan = ScenarioPlan::base(seed, 15.0);
                plan.oracle = Oracle::construction_site(seed)
                    .with_segment(5.0, 5.03, PlatformTrackingStatus::Initializing, 1.0)
                    .with_segment(5.03, 10.0, PlatformTrackingStatus::Limited(LimitedReason::Relocalizing), 1.0);
                plan
            }
        }
    }

    /// The property this scenario must hold.
    pub fn verify(&self, m: &ScenarioMetrics, config: &HazardLensConfig) -> Result<(), String> {
        let max_visible = config.overlay.filter.max_visible;
        if m.max_visible_overlays > max_visible {
            return Err(format!("{} overlays visible, limit is {}", m.max_visible_overlays, max_visible));
        }
        if m.max_duplicate_pairs > 0 {
            return Err(format!("{} duplicate hazard pairs in one snapshot", m.max_duplicate_pairs));
        }

        match self {
            ScenarioId::SteadyWalk => {
                if m.max_hazards < 4 {
                    return Err(format!("only {} hazards ever registered", m.max_hazards));
                }
                match m.rms_error_m {
                    Some(e) if e < 1.0 => Ok(()),
                    Some(e) => Err(format!("RMS placement error {:.2}m exceeds 1.0m", e)),
                    None => Err("no hazards to score".to_string()),
                }
            }

            ScenarioId::LowLight => {
                if m.fallback_mode_ticks == 0 {
                    return Err("overlays never entered 2D fallback mode".to_string());
                }
                if m.max_sampler_interval_ms <= config.sampler.base_interval_ms {
                    return Err("sampler never backed off while limited".to_string());
                }
                if m.final_tracking != "tracking" {
                    return Err(format!("tracking ended {}", m.final_tracking));
                }
                Ok(())
            }

            ScenarioId::BatteryDrain => {
                if m.max_sampler_interval_ms <= config.sampler.base_interval_ms {
                    return Err("sampler interval never widened on low battery".to_string());
                }
                Ok(())
            }

            ScenarioId::ServiceOutage => {
                if !m.fallback_engaged {
                    return Err("fallback never engaged".to_string());
                }
                if m.fallback_merges == 0 {
                    return Err("no fallback result was merged".to_string());
                }
                if !m.fallback_recovered {
                    return Err("remote never recovered from fallback".to_string());
                }
                Ok(())
            }

            ScenarioId::StaleResults => {
                if m.superseded == 0 {
                    return Err("no stale call was superseded".to_string());
                }
                if m.discarded == 0 {
                    return Err("no superseded result was discarded".to_string());
                }
                if m.merged == 0 {
                    return Err("nothing merged after the slow window".to_string());
                }
                Ok(())
            }

            ScenarioId::ThermalThrottle => {
                if m.quality_downgrades == 0 {
                    return Err("quality never downgraded".to_string());
                }
                if m.final_quality == "high" {
                    return Err("quality back at high while still throttled".to_string());
                }
                match m.final_avg_frame_time_ms {
                    Some(ms) if ms <= config.quality.budget.max_frame_time_ms => Ok(()),
                    Some(ms) => Err(format!("frames still over budget at {:.1}ms", ms)),
                    None => Err("no frame time samples".to_string()),
                }
            }

            ScenarioId::TrackingLoss => {
                if m.fallback_mode_ticks == 0 {
                    return Err("2D fallback mode never entered".to_string());
                }
                if m.final_tracking != "tracking" {
                    return Err(format!("tracking ended {}", m.final_tracking));
                }
                if m.final_hazards == 0 {
                    return Err("hazards were lost with tracking".to_string());
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady_walk" | "steadywalk" | "hl-001" => Ok(ScenarioId::SteadyWalk),
            "low_light" | "lowlight" | "hl-002" => Ok(ScenarioId::LowLight),
            "battery_drain" | "batterydrain" | "hl-003" => Ok(ScenarioId::BatteryDrain),
            "service_outage" | "serviceoutage" | "hl-004" => Ok(ScenarioId::ServiceOutage),
            "stale_results" | "staleresults" | "hl-005" => Ok(ScenarioId::StaleResults),
            "thermal_throttle" | "thermalthrottle" | "hl-006" => Ok(ScenarioId::ThermalThrottle),
            "tracking_loss" | "trackingloss" | "hl-007" => Ok(ScenarioId::TrackingLoss),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
