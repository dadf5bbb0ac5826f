//! Anonymized session telemetry.
//!
//! Every record passes through `TelemetryEmitter`, which drops deny-listed
//! keys before the sink sees them.

use hazardlens_env::{SessionId, TelemetryRecord, TelemetrySink};
use std::sync::Arc;
use tracing::debug;

/// Keys that may identify a person or device.
pub const PII_DENY_LIST: [&str; 8] = [
    "device_id",
    "location",
    "latitude",
    "longitude",
    "email",
    "name",
    "phone",
    "ip",
];

/// Event names emitted by the session.
pub mod events {
    pub const TRACKING_TRANSITION: &str = "tracking_transition";
    pub const DETECTION_COMPLETED: &str = "detection_completed";
    pub const DETECTION_FAILED: &str = "detection_failed";
    pub const FALLBACK_ENGAGED: &str = "fallback_engaged";
    pub const QUALITY_CHANGED: &str = "quality_changed";
    pub const RECOVERY: &str = "recovery";
    pub const SESSION_STOPPED: &str = "session_stopped";
}

fn is_denied(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    PII_DENY_LIST.contains(&key.as_str())
}

#[derive(Clone)]
pub struct TelemetryEmitter {
    sink: Arc<dyn TelemetrySink>,
    session_id: SessionId,
}

impl TelemetryEmitter {
    pub fn new(sink: Arc<dyn TelemetrySink>, session_id: SessionId) -> Self {
        Self { sink, session_id }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Strip deny-listed fields and forward.
    pub fn emit(&self, mut record: TelemetryRecord) {
        let before = record.fields.len();
        record.fields.retain(|k, _| !is_denied(k));
        if record.fields.len() != before {
            debug!(
                "Dropped {} identifying field(s) from '{}'",
                before - record.fields.len(),
                record.event_type
            );
        }
        record.session_id = self.session_id;
        self.sink.record(record);
    }

    /// Start a record for this session.
    pub fn record(&self, event_type: &str, timestamp_ms: u64) -> TelemetryRecord {
        TelemetryRecord::new(event_type, timestamp_ms, self.session_id)
    }
}

impl std::fmt::Debug for TelemetryEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryEmitter")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
