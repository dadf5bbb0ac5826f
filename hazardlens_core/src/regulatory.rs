//! Regulatory reference catalog seam.
//!
//! The catalog content is owned externally; the core only needs a lookup
//! from hazard type (and optionally a detector-supplied code) to a citation
//! and corrective actions.

use crate::hazard::{HazardType, RegulatoryRef};
use std::collections::HashMap;

/// A catalog hit.
#[derive(Debug, Clone, PartialEq)]
pub struct RegulatoryEntry {
    pub reference: RegulatoryRef,
    pub corrective_actions: Vec<String>,
}

pub trait RegulatoryCatalog: Send + Sync {
    /// Look up by explicit code first, then by hazard type.
    fn lookup(&self, hazard_type: HazardType, code: Option<&str>) -> Option<RegulatoryEntry>;
}

/// In-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticRegulatoryCatalog {
    by_code: HashMap<String, RegulatoryEntry>,
    by_type: HashMap<HazardType, String>,
}

impl StaticRegulatoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry and make it the default for `hazard_type`.
    pub fn insert(&mut self, hazard_type: HazardType, entry: RegulatoryEntry) {
        let code = entry.reference.code.clone();
        self.by_type.entry(hazard_type).or_insert_with(|| code.clone());
        self.by_code.insert(code, entry);
    }

    pub fn with_entry(mut self, hazard_type: HazardType, code: &str, title: &str, actions: &[&str]) -> Self {
        self.insert(
            hazard_type,
            RegulatoryEntry {
                reference: RegulatoryRef::new(code, title),
                corrective_actions: actions.iter().map(|a| a.to_string()).collect(),
            },
        );
        self
    }

    /// A small construction-site catalog used by the simulator and tests.
    pub fn construction_defaults() -> Self {
        Self::new()
            .with_entry(
                HazardType::FallProtection,
                "29 CFR 1926.501",
                "Duty to have fall protection",
                &["Install guardrails or a personal fall arrest system", "Keep clear of the unprotected edge"],
            )
            .with_entry(
                HazardType::Electrical,
                "29 CFR 1926.405",
                "Wiring methods, components, and equipment",
                &["De-energize and lock out the circuit", "Keep a safe distance from exposed conductors"],
            )
            .with_entry(
                HazardType::MissingHardHat,
                "29 CFR 1926.100",
                "Head protection",
                &["Wear a hard hat in designated areas"],
            )
            .with_entry(
                HazardType::MissingSafetyVest,
                "29 CFR 1926.201",
                "Signaling",
                &["Wear high-visibility apparel near traffic"],
            )
            .with_entry(
                HazardType::Crane,
                "29 CFR 1926.1400",
                "Cranes and derricks in construction",
                &["Stay outside the swing radius", "Never stand under a suspended load"],
            )
            .with_entry(
                HazardType::Excavation,
                "29 CFR 1926.651",
                "Specific excavation requirements",
                &["Provide shoring or sloping", "Keep spoil piles 2 feet from the edge"],
            )
            .with_entry(
                HazardType::Vehicle,
                "29 CFR 1926.601",
                "Motor vehicles",
                &["Make eye contact with the operator", "Stay out of blind spots"],
            )
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

impl RegulatoryCatalog for StaticRegulatoryCatalog {
    fn lookup(&self, hazard_type: HazardType, code: Option<&str>) -> Option<RegulatoryEntry> {
        code.and_then(|c| self.by_code.get(c.trim()))
            .or_else(|| self.by_type.get(&hazard_type).and_then(|c| self.by_code.get(c)))
            .cloned()
    }
}
