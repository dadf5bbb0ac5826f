//! JSON exporter for offline inspection of a run.
//!
//! Exports sampled frames (camera, ground truth, registered hazards, visible
//! overlays) so a run can be plotted or diffed between seeds.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    pub camera: HazardPosition,

    /// Ground truth hazard positions
    pub ground_truth: Vec<HazardPosition>,

    /// Hazards in the published snapshot
    pub hazards: Vec<HazardPosition>,

    /// Accessibility labels of visible overlays
    pub overlays: Vec<String>,

    pub tracking: String,

    pub quality: String,

    pub fallback_mode: bool,

    /// User notifications raised this tick
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<String>,
}

/// A labelled world position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HazardPosition {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub kind: Option<String>,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl HazardPosition {
    pub fn from_vector(kind: Option<String>, pos: Vector3<f64>) -> Self {
        Self {
            kind,
            x: pos.x,
            y: pos.y,
            z: pos.z,
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool) {
        self.passed = passed;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_tracks_duration_and_serializes() {
        let mut export = SimExport::new("steady_walk", 42);
        export.add_frame(SimFrame {
            time_sec: 1.5,
            camera: HazardPosition::from_vector(None, Vector3::new(0.0, 1.6, -1.2)),
            ground_truth: vec![HazardPosition::from_vector(Some("Crane".into()), Vector3::new(1.0, 2.0, -9.0))],
            hazards: Vec::new(),
            overlays: vec!["Critical crane hazard, 7.9 meters ahead".into()],
            tracking: "tracking".into(),
            quality: "high".into(),
            fallback_mode: false,
            events: Vec::new(),
        });
        export.finalize(true);
        assert_eq!(export.duration_sec, 1.5);

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["scenario"], "steady_walk");
        assert_eq!(json["frames"][0]["ground_truth"][0]["kind"], "Crane");
        assert!(json["frames"][0]["camera"].get("kind").is_none());
        assert!(json["frames"][0].get("events").is_none());
    }
}
