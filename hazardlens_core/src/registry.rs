//! The "REGISTRY" Engine - hazard merge and deduplication
//!
//! Maintains the session's world model of hazards. Each analysis cycle runs
//! a three-stage pipeline:
//! 1. Pruning (missing anchors, staleness window)
//! 2. Association (voxel neighborhood + same type + center distance)
//! 3. Consolidation (collapse same-type pairs that drifted together)
//!
//! The registry is owned by the orchestrator. Readers only ever see
//! immutable `HazardSnapshot`s.

use crate::geometry::BoundingVolume;
use crate::hazard::{DetectedHazard, HazardType, RegulatoryRef, Severity};
use crate::tracking_state::AnchorTable;
use nalgebra::{Isometry3, Translation3, Vector3};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the HazardRegistry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Center distance under which same-type hazards are one hazard (default: 1.5m)
    pub merge_distance_m: f64,

    /// Hazards not reconfirmed within this window are pruned (default: 30s)
    pub staleness_window_secs: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            merge_distance_m: 1.5,
            staleness_window_secs: 30.0,
        }
    }
}

// ============================================================================
// INPUT / OUTPUT
// ============================================================================

/// A detection already placed in world space, ready to merge.
#[derive(Debug, Clone, PartialEq)]
pub struct HazardCandidate {
    pub hazard_type: HazardType,
    pub bounding_volume: BoundingVolume,
    /// Raw detector confidence; clamped on merge, NaN rejected
    pub confidence: f32,
    pub severity: Severity,
    pub regulatory_refs: Vec<RegulatoryRef>,
    pub recommended_actions: Vec<String>,
}

/// What happened to one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted(Uuid),
    Replaced(Uuid),
    /// Lower confidence than the matching hazard; discarded
    Duplicate(Uuid),
    Rejected,
}

/// Summary of one merge cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub replaced: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub pruned: usize,
    pub consolidated: usize,
}

/// Immutable view of the hazard set, shared with renderers via `Arc`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HazardSnapshot {
    /// Increments on every publish
    pub generation: u64,

    pub hazards: Vec<DetectedHazard>,

    /// Session time of the merge that produced this snapshot
    pub as_of: f64,
}

impl HazardSnapshot {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.hazards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hazards.is_empty()
    }
}

// ============================================================================
// SPATIAL INDEX
// ============================================================================

/// Voxel key; the voxel edge equals the merge distance, so every hazard
/// within merge distance lies in the 27-voxel neighborhood.
type Voxel = (i64, i64, i64);

// ============================================================================
// HAZARD REGISTRY
// ============================================================================

pub struct HazardRegistry {
    /// Live hazards keyed by id
    hazards: HashMap<Uuid, DetectedHazard>,

    /// Voxel → hazard ids
    spatial_index: HashMap<Voxel, HashSet<Uuid>>,

    config: RegistryConfig,

    generation: u64,
}

impl HazardRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            hazards: HashMap::new(),
            spatial_index: HashMap::new(),
            config,
            generation: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RegistryConfig::default())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // ========================================================================
    // SPATIAL INDEX OPERATIONS
    // ========================================================================

    fn voxel_of(&self, p: &Vector3<f64>) -> Voxel {
        let cell = self.config.merge_distance_m.max(1e-3);
        (
            (p.x / cell).floor() as i64,
            (p.y / cell).floor() as i64,
            (p.z / cell).floor() as i64,
        )
    }

    fn spatial_index_insert(&mut self, voxel: Voxel, id: Uuid) {
        self.spatial_index.entry(voxel).or_default().insert(id);
    }

    fn spatial_index_remove(&mut self, voxel: Voxel, id: Uuid) {
        if let Some(set) = self.spatial_index.get_mut(&voxel) {
            set.remove(&id);
            if set.is_empty() {
                self.spatial_index.remove(&voxel);
            }
        }
    }

    /// Hazard ids in the voxel containing `p` and its 26 neighbors.
    fn spatial_query(&self, p: &Vector3<f64>) -> Vec<Uuid> {
        let (vx, vy, vz) = self.voxel_of(p);
        let mut out = Vec::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    if let Some(ids) = self.spatial_index.get(&(vx + dx, vy + dy, vz + dz)) {
                        out.extend(ids.iter().copied());
                    }
                }
            }
        }
        out
    }

    /// Nearest same-type hazard within merge distance of `center`.
    fn find_match(&self, hazard_type: HazardType, center: &Vector3<f64>, exclude: Option<Uuid>) -> Option<Uuid> {
        self.spatial_query(center)
            .into_iter()
            .filter(|id| Some(*id) != exclude)
            .filter_map(|id| self.hazards.get(&id))
            .filter(|h| h.hazard_type == hazard_type)
            .map(|h| (h.id, (h.bounding_volume.center - center).norm()))
            .filter(|(_, d)| *d <= self.config.merge_distance_m)
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)))
            .map(|(id, _)| id)
    }

    fn remove_hazard(&mut self, id: &Uuid, anchors: &mut AnchorTable) -> Option<DetectedHazard> {
        let hazard = self.hazards.remove(id)?;
        let voxel = self.voxel_of(&hazard.bounding_volume.center);
        self.spatial_index_remove(voxel, hazard.id);
        if let Some(anchor) = hazard.anchor_id {
            anchors.remove(&anchor);
        }
        Some(hazard)
    }

    fn anchor_pose(volume: &BoundingVolume) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(volume.center), volume.rotation)
    }

    // ========================================================================
    // MERGE PIPELINE
    // ========================================================================

    /// Stage 1: drop hazards whose anchor is gone or stale.
    pub fn prune(&mut self, anchors: &mut AnchorTable, now: f64) -> usize {
        let window = self.config.staleness_window_secs;
        let to_remove: Vec<Uuid> = self
            .hazards
            .values()
            .filter(|h| {
                let anchor_confirmed = match h.anchor_id {
                    Some(anchor) => match anchors.get(&anchor) {
                        Some(a) => a.last_confirmed_at,
                        None => return true,
                    },
                    None => h.last_confirmed,
                };
                now - anchor_confirmed.max(h.last_confirmed) > window
            })
            .map(|h| h.id)
            .collect();

        for id in &to_remove {
            self.remove_hazard(id, anchors);
        }
        if !to_remove.is_empty() {
            debug!("Pruned {} stale hazards", to_remove.len());
        }
        to_remove.len()
    }

    /// Stage 2: associate one candidate.
    fn merge_candidate(&mut self, candidate: HazardCandidate, anchors: &mut AnchorTable, now: f64) -> MergeOutcome {
        let Some(confidence) = DetectedHazard::normalize_confidence(candidate.confidence) else {
            return MergeOutcome::Rejected;
        };
        let center = candidate.bounding_volume.center;
        if !center.iter().all(|v| v.is_finite()) {
            return MergeOutcome::Rejected;
        }

        match self.find_match(candidate.hazard_type, &center, None) {
            Some(id) => {
                let old_voxel = self.hazards.get(&id).map(|h| self.voxel_of(&h.bounding_volume.center));
                let new_voxel = self.voxel_of(&center);
                let Some(existing) = self.hazards.get_mut(&id) else {
                    return MergeOutcome::Rejected;
                };

                if confidence >= existing.confidence {
                    existing.bounding_volume = candidate.bounding_volume;
                    existing.confidence = confidence;
                    existing.severity = candidate.severity;
                    existing.regulatory_refs = candidate.regulatory_refs;
                    existing.recommended_actions = candidate.recommended_actions;
                    existing.last_confirmed = now;
                    let anchor = existing.anchor_id;
                    let pose = Self::anchor_pose(&existing.bounding_volume);

                    // Re-anchor if the anchor vanished under us
                    let anchored = anchor.map(|a| anchors.confirm(a, now, Some(pose))).unwrap_or(false);
                    if !anchored {
                        existing.anchor_id = Some(anchors.create(pose, now));
                    }

                    if let Some(old) = old_voxel {
                        if old != new_voxel {
                            self.spatial_index_remove(old, id);
                            self.spatial_index_insert(new_voxel, id);
                        }
                    }
                    MergeOutcome::Replaced(id)
                } else {
                    existing.last_confirmed = now;
                    if let Some(anchor) = existing.anchor_id {
                        anchors.confirm(anchor, now, None);
                    }
                    MergeOutcome::Duplicate(id)
                }
            }
            None => {
                let id = Uuid::new_v4();
                let anchor_id = anchors.create(Self::anchor_pose(&candidate.bounding_volume), now);
                let hazard = DetectedHazard {
                    id,
                    hazard_type: candidate.hazard_type,
                    bounding_volume: candidate.bounding_volume,
                    confidence,
                    severity: candidate.severity,
                    regulatory_refs: candidate.regulatory_refs,
                    recommended_actions: candidate.recommended_actions,
                    anchor_id: Some(anchor_id),
                    first_seen: now,
                    last_confirmed: now,
                };
                let voxel = self.voxel_of(&center);
                self.spatial_index_insert(voxel, id);
                self.hazards.insert(id, hazard);
                MergeOutcome::Inserted(id)
            }
        }
    }

    /// Stage 3: enforce one hazard per (type, cluster).
    ///
    /// Higher confidence wins; ties go to the older hazard.
    fn consolidate(&mut self, anchors: &mut AnchorTable) -> usize {
        let mut order: Vec<(Uuid, f32, f64)> = self
            .hazards
            .values()
            .map(|h| (h.id, h.confidence, h.first_seen))
            .collect();
        order.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.2.partial_cmp(&b.2).unwrap_or(Ordering::Equal))
                .then(a.0.cmp(&b.0))
        });

        let mut removed = 0;
        for (id, _, _) in order {
            let Some(survivor) = self.hazards.get(&id) else {
                continue;
            };
            let (hazard_type, center) = (survivor.hazard_type, survivor.bounding_volume.center);
            while let Some(loser) = self.find_match(hazard_type, &center, Some(id)) {
                self.remove_hazard(&loser, anchors);
                removed += 1;
            }
        }
        removed
    }

    /// Run a full merge cycle for one analysis result.
    pub fn merge(&mut self, candidates: Vec<HazardCandidate>, anchors: &mut AnchorTable, now: f64) -> (MergeReport, Vec<MergeOutcome>) {
        let mut report = MergeReport {
            pruned: self.prune(anchors, now),
            ..Default::default()
        };

        let mut outcomes = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let outcome = self.merge_candidate(candidate, anchors, now);
            match outcome {
                MergeOutcome::Inserted(_) => report.inserted += 1,
                MergeOutcome::Replaced(_) => report.replaced += 1,
                MergeOutcome::Duplicate(_) => report.duplicates += 1,
                MergeOutcome::Rejected => report.rejected += 1,
            }
            outcomes.push(outcome);
        }

        report.consolidated = self.consolidate(anchors);
        debug!(
            "Merge: +{} ~{} dup {} rej {} pruned {} consolidated {} ({} live)",
            report.inserted,
            report.replaced,
            report.duplicates,
            report.rejected,
            report.pruned,
            report.consolidated,
            self.hazards.len()
        );
        (report, outcomes)
    }

    /// Build the next immutable snapshot.
    pub fn snapshot(&mut self, now: f64) -> Arc<HazardSnapshot> {
        self.generation += 1;
        let mut hazards: Vec<DetectedHazard> = self.hazards.values().cloned().collect();
        hazards.sort_by(|a, b| {
            a.first_seen
                .partial_cmp(&b.first_seen)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        Arc::new(HazardSnapshot {
            generation: self.generation,
            hazards,
            as_of: now,
        })
    }

    pub fn clear(&mut self, anchors: &mut AnchorTable) {
        for hazard in self.hazards.values() {
            if let Some(anchor) = hazard.anchor_id {
                anchors.remove(&anchor);
            }
        }
        self.hazards.clear();
        self.spatial_index.clear();
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get(&self, id: &Uuid) -> Option<&DetectedHazard> {
        self.hazards.get(id)
    }

    pub fn hazards(&self) -> impl Iterator<Item = &DetectedHazard> {
        self.hazards.values()
    }

    pub fn len(&self) -> usize {
        self.hazards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hazards.is_empty()
    }

    /// Number of occupied voxels.
    pub fn occupied_voxels(&self) -> usize {
        self.spatial_index.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
