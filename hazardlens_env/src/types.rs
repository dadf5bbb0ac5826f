//! Common types for the HazardLens environment abstraction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for an AR capture session.
///
/// Uses UUID v4 so telemetry can be correlated within a session without
/// identifying the device or the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a new random SessionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a SessionId from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a deterministic SessionId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// An anonymized telemetry record.
///
/// Records never carry personally-identifying fields; the core's
/// `TelemetryEmitter` strips deny-listed keys before a record reaches a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Event name, e.g. `"detection_completed"`
    pub event_type: String,

    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,

    /// Session the event belongs to
    pub session_id: SessionId,

    /// Free-form, non-identifying payload
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl TelemetryRecord {
    /// Creates an empty record.
    pub fn new(event_type: impl Into<String>, timestamp_ms: u64, session_id: SessionId) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp_ms,
            session_id,
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field, returning the record for chaining.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}
