//! Full scenario runs against the simulated world.

use hazardlens_core::HazardLensConfig;
use hazardlens_sim::{Fault, Oracle, ScenarioId, ScenarioRunner, SimDevice, SimHarness};
use proptest::prelude::*;

fn assert_passes(scenario: ScenarioId, seed: u64) {
    let result = ScenarioRunner::new(seed).run(scenario);
    assert!(
        result.passed,
        "{} (seed={}) failed: {:?}\nmetrics: {:#?}",
        scenario,
        seed,
        result.failure_reason,
        result.metrics
    );
}

#[test]
fn test_steady_walk_passes() {
    assert_passes(ScenarioId::SteadyWalk, 42);
}

#[test]
fn test_low_light_passes() {
    assert_passes(ScenarioId::LowLight, 42);
}

#[test]
fn test_battery_drain_passes() {
    assert_passes(ScenarioId::BatteryDrain, 42);
}

#[test]
fn test_service_outage_passes() {
    assert_passes(ScenarioId::ServiceOutage, 42);
}

#[test]
fn test_stale_results_passes() {
    assert_passes(ScenarioId::StaleResults, 42);
}

#[test]
fn test_thermal_throttle_passes() {
    assert_passes(ScenarioId::ThermalThrottle, 42);
}

#[test]
fn test_tracking_loss_passes() {
    assert_passes(ScenarioId::TrackingLoss, 42);
}

#[test]
fn test_steady_walk_at_native_cadence_holds_high_quality() {
    let result = ScenarioRunner::new(42).run(ScenarioId::SteadyWalk);
    let m = &result.metrics;

    assert_eq!(m.quality_downgrades, 0, "metrics: {:#?}", m);
    assert_eq!(m.final_quality, "high");
    let avg = m.final_avg_frame_time_ms.unwrap();
    assert!(avg < HazardLensConfig::default().quality.budget.max_frame_time_ms, "avg frame time {}", avg);
}

#[test]
fn test_same_seed_same_run() {
    let a = ScenarioRunner::new(7).with_duration(8.0).run(ScenarioId::SteadyWalk);
    let b = ScenarioRunner::new(7).with_duration(8.0).run(ScenarioId::SteadyWalk);

    let a = serde_json::to_value(&a.metrics).unwrap();
    let b = serde_json::to_value(&b.metrics).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_export_samples_frames() {
    let (result, export) = ScenarioRunner::new(3)
        .with_duration(2.0)
        .with_export_interval(10)
        .run_with_export(ScenarioId::SteadyWalk);

    assert_eq!(export.scenario, "steady_walk");
    assert_eq!(export.passed, result.passed);
    assert_eq!(export.frames.len() as u64, result.total_ticks / 10);
    assert_eq!(export.frames[0].ground_truth.len(), 6);
}

#[tokio::test(flavor = "current_thread")]
async fn test_five_timeouts_switch_to_fallback() {
    let mut config = HazardLensConfig::default();
    config.orchestrator.request_timeout_ms = 500;

    let mut harness = SimHarness::new(11, config, Oracle::construction_site(11), SimDevice::new(), 30).unwrap();
    harness.remote.inject(0.0, f64::MAX, Fault::Hang);
    harness.session.start().unwrap();

    harness.run_until(8.0, &[]).await.unwrap();

    assert!(harness.session.orchestrator().using_fallback());
    assert!(harness.remote.failures() >= 5);
    assert!(harness.local.calls() > 0);

    let metrics = harness.finish();
    assert!(metrics.fallback_engaged);
    assert!(metrics.fallback_merges > 0);
    assert!(metrics.final_hazards > 0);
    harness.session.stop();
}

proptest! {
    #[test]
    fn test_sightings_sorted_and_in_range(t in 0.0f64..25.0, seed in 0u64..1000) {
        let oracle = Oracle::construction_site(seed);
        let sightings = oracle.visible_from(&oracle.pose_at(t));
        for pair in sightings.windows(2) {
            prop_assert!(pair[0].distance <= pair[1].distance);
        }
        for s in &sightings {
            prop_assert!(s.distance <= 12.0);
            prop_assert!(s.camera_space.z < 0.0);
        }
    }

    #[test]
    fn test_battery_never_rises_while_discharging(steps in proptest::collection::vec(0.0f64..120.0, 1..20)) {
        let device = SimDevice::new();
        let mut last = device.battery_level();
        for dt in steps {
            device.step(dt);
            let level = device.battery_level();
            prop_assert!(level <= last);
            prop_assert!(level >= 0.0);
            last = level;
        }
    }
}
