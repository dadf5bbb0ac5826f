//! Telemetry sink abstraction for anonymized session events.

use crate::types::TelemetryRecord;
use std::sync::{Arc, Mutex};

/// Destination for anonymized telemetry records.
///
/// # Implementations
///
/// - **Production**: forwards to the product's analytics pipeline
/// - **Local**: `TracingTelemetrySink` writes records to the log
/// - **Tests/Simulation**: `MemoryTelemetrySink` keeps them for inspection
///
/// Sinks must not block: `record` is called from the tracking loop.
pub trait TelemetrySink: Send + Sync + 'static {
    /// Accepts one record.
    fn record(&self, record: TelemetryRecord);
}

/// Writes every record to the `tracing` log at debug level.
#[derive(Debug, Clone, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn record(&self, record: TelemetryRecord) {
        tracing::debug!(
            event = %record.event_type,
            session = %record.session_id,
            fields = ?record.fields,
            "telemetry"
        );
    }
}

/// Keeps records in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryTelemetrySink {
    records: Arc<Mutex<Vec<TelemetryRecord>>>,
}

impl MemoryTelemetrySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded events.
    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Returns how many records of the given type were seen.
    pub fn count(&self, event_type: &str) -> usize {
        self.records
            .lock()
            .map(|records| records.iter().filter(|r| r.event_type == event_type).count())
            .unwrap_or(0)
    }
}

impl TelemetrySink for MemoryTelemetrySink {
    fn record(&self, record: TelemetryRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;

    #[test]
    fn test_memory_sink_counts_by_type() {
        let sink = MemoryTelemetrySink::new();
        let session = SessionId::from_seed(3);
        sink.record(TelemetryRecord::new("a", 1, session));
        sink.record(TelemetryRecord::new("b", 2, session));
        sink.record(TelemetryRecord::new("a", 3, session));

        assert_eq!(sink.records().len(), 3);
        assert_eq!(sink.count("a"), 2);
        assert_eq!(sink.count("missing"), 0);
    }

    #[test]
    fn test_memory_sink_clones_share_storage() {
        let sink = MemoryTelemetrySink::new();
        let clone = sink.clone();
        clone.record(TelemetryRecord::new("x", 0, SessionId::from_seed(1)));
        assert_eq!(sink.count("x"), 1);
    }
}
