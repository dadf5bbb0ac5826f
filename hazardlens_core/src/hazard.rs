//! Hazard data model: types, severities, regulatory references and the
//! merged `DetectedHazard` record.

use crate::geometry::BoundingVolume;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a tracking anchor (see `tracking_state::AnchorTable`).
///
/// Hazards refer to anchors by id only; the anchor table owns the anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnchorId(pub Uuid);

impl AnchorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AnchorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

// ============================================================================
// HAZARD TYPE
// ============================================================================

/// Construction-site hazard classes reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HazardType {
    FallProtection,
    Electrical,
    MissingHardHat,
    MissingSafetyVest,
    HeavyMachinery,
    Crane,
    Excavation,
    Vehicle,
    TripHazard,
    FireHazard,
    Chemical,
    Other,
}

impl HazardType {
    pub fn all() -> [HazardType; 12] {
        [
            HazardType::FallProtection,
            HazardType::Electrical,
            HazardType::MissingHardHat,
            HazardType::MissingSafetyVest,
            HazardType::HeavyMachinery,
            HazardType::Crane,
            HazardType::Excavation,
            HazardType::Vehicle,
            HazardType::TripHazard,
            HazardType::FireHazard,
            HazardType::Chemical,
            HazardType::Other,
        ]
    }

    /// Map a detector label to a hazard type. Unknown labels become `Other`.
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or(HazardType::Other)
    }

    /// Human-readable name used in overlays and accessibility strings.
    pub fn display_name(&self) -> &'static str {
        match self {
            HazardType::FallProtection => "fall protection",
            HazardType::Electrical => "electrical",
            HazardType::MissingHardHat => "missing hard hat",
            HazardType::MissingSafetyVest => "missing safety vest",
            HazardType::HeavyMachinery => "heavy machinery",
            HazardType::Crane => "crane",
            HazardType::Excavation => "excavation",
            HazardType::Vehicle => "vehicle",
            HazardType::TripHazard => "trip",
            HazardType::FireHazard => "fire",
            HazardType::Chemical => "chemical",
            HazardType::Other => "general",
        }
    }

    /// Severity assumed when the detector does not report one.
    pub fn default_severity(&self) -> Severity {
        match self {
            HazardType::FallProtection
            | HazardType::Electrical
            | HazardType::Crane
            | HazardType::Excavation
            | HazardType::FireHazard => Severity::Critical,
            HazardType::MissingHardHat
            | HazardType::MissingSafetyVest
            | HazardType::HeavyMachinery
            | HazardType::Vehicle
            | HazardType::Chemical => Severity::Warning,
            HazardType::TripHazard | HazardType::Other => Severity::Info,
        }
    }
}

impl FromStr for HazardType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "fall_hazard" | "fall_protection" | "fallprotection" | "unprotected_edge" => {
                Ok(HazardType::FallProtection)
            }
            "electrical_hazard" | "electrical" | "exposed_wiring" => Ok(HazardType::Electrical),
            "no_hard_hat" | "missing_hard_hat" | "no_helmet" => Ok(HazardType::MissingHardHat),
            "no_safety_vest" | "missing_safety_vest" | "no_vest" => Ok(HazardType::MissingSafetyVest),
            "machinery" | "heavy_machinery" => Ok(HazardType::HeavyMachinery),
            "crane" => Ok(HazardType::Crane),
            "excavator" | "excavation" | "trench" => Ok(HazardType::Excavation),
            "truck" | "vehicle" | "forklift" => Ok(HazardType::Vehicle),
            "trip_hazard" | "trip" | "debris" => Ok(HazardType::TripHazard),
            "fire_hazard" | "fire" | "hot_work" => Ok(HazardType::FireHazard),
            "chemical" | "chemical_hazard" => Ok(HazardType::Chemical),
            "other" => Ok(HazardType::Other),
            other => Err(format!("unknown hazard label: {other}")),
        }
    }
}

impl fmt::Display for HazardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

// ============================================================================
// SEVERITY
// ============================================================================

/// Hazard severity. Ordered so that `Critical > Warning > Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn all() -> [Severity; 3] {
        [Severity::Critical, Severity::Warning, Severity::Info]
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Critical => "Critical",
            Severity::Warning => "Warning",
            Severity::Info => "Info",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "high" => Ok(Severity::Critical),
            "warning" | "medium" => Ok(Severity::Warning),
            "info" | "low" => Ok(Severity::Info),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

// ============================================================================
// REGULATORY REFERENCE
// ============================================================================

/// Citation into the externally-owned regulatory catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegulatoryRef {
    /// Code as cited, e.g. `"29 CFR 1926.501"`
    pub code: String,

    /// Short title of the rule
    pub title: String,
}

impl RegulatoryRef {
    pub fn new(code: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            title: title.into(),
        }
    }
}

// ============================================================================
// DETECTED HAZARD
// ============================================================================

/// A hazard in the merged world model.
///
/// Created by the orchestrator on a successful analysis, refreshed when a
/// later analysis yields a spatially/type-matching result, and removed when
/// its anchor expires or no confirming detection arrives within the
/// staleness window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedHazard {
    pub id: Uuid,

    pub hazard_type: HazardType,

    /// World-space bounding volume
    pub bounding_volume: BoundingVolume,

    /// Detector confidence, always within [0, 1]
    pub confidence: f32,

    pub severity: Severity,

    pub regulatory_refs: Vec<RegulatoryRef>,

    pub recommended_actions: Vec<String>,

    /// Anchor keeping this hazard in place as the camera moves
    pub anchor_id: Option<AnchorId>,

    /// Session time of the first detection (seconds)
    pub first_seen: f64,

    /// Session time of the last confirming detection (seconds)
    pub last_confirmed: f64,
}

impl DetectedHazard {
    /// Clamp a raw confidence into [0, 1]. NaN is rejected.
    pub fn normalize_confidence(raw: f32) -> Option<f32> {
        if raw.is_nan() {
            None
        } else {
            Some(raw.clamp(0.0, 1.0))
        }
    }
}
