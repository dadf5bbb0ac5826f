//! Performance telemetry ring buffer.
//!
//! The session loop is the only writer; the quality controller reads
//! summaries through `&self`. Capacity is fixed so memory stays bounded no
//! matter how long the session runs.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Configuration for the PerformanceMonitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Ring buffer capacity (default: 900 = 30s at 30Hz)
    pub capacity: usize,

    /// Window used for rolling averages (default: 5s)
    pub summary_window_secs: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            capacity: 900,
            summary_window_secs: 5.0,
        }
    }
}

/// One render tick worth of telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    /// Wall time spent on the tick
    pub frame_time_ms: f64,

    /// Latency of a detection that completed since the previous sample
    pub detection_latency_ms: Option<f64>,

    pub memory_bytes: u64,

    /// Battery fraction consumed per hour
    pub battery_drain_rate: f64,

    /// Session time (seconds)
    pub timestamp: f64,
}

/// Rolling statistics over a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub avg_frame_time_ms: f64,
    pub p95_frame_time_ms: f64,
    /// `None` when no detection completed in the window
    pub avg_detection_latency_ms: Option<f64>,
    pub peak_memory_bytes: u64,
    pub avg_battery_drain_rate: f64,
    pub sample_count: usize,
}

#[derive(Debug)]
pub struct PerformanceMonitor {
    samples: VecDeque<PerformanceSample>,
    config: PerformanceConfig,
    total_recorded: u64,
}

impl PerformanceMonitor {
    pub fn new(config: PerformanceConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            config: PerformanceConfig { capacity, ..config },
            total_recorded: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PerformanceConfig::default())
    }

    pub fn config(&self) -> &PerformanceConfig {
        &self.config
    }

    /// Append a sample, evicting the oldest when full.
    pub fn record(&mut self, sample: PerformanceSample) {
        if self.samples.len() == self.config.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.total_recorded += 1;
    }

    pub fn latest(&self) -> Option<&PerformanceSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Samples ever recorded, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    /// Statistics over samples with `timestamp >= now - window_secs`.
    pub fn summary(&self, now: f64, window_secs: f64) -> PerformanceSummary {
        let since = now - window_secs;
        let window: Vec<&PerformanceSample> = self
            .samples
            .iter()
            .rev()
            .take_while(|s| s.timestamp >= since)
            .collect();

        if window.is_empty() {
            return PerformanceSummary::default();
        }

        let n = window.len() as f64;
        let mut frame_times: Vec<f64> = window.iter().map(|s| s.frame_time_ms).collect();
        frame_times.sort_by(|a, b| a.total_cmp(b));
        let p95_idx = ((frame_times.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);

        let latencies: Vec<f64> = window.iter().filter_map(|s| s.detection_latency_ms).collect();
        let avg_detection_latency_ms =
            (!latencies.is_empty()).then(|| latencies.iter().sum::<f64>() / latencies.len() as f64);

        PerformanceSummary {
            avg_frame_time_ms: frame_times.iter().sum::<f64>() / n,
            p95_frame_time_ms: frame_times[p95_idx.min(frame_times.len() - 1)],
            avg_detection_latency_ms,
            peak_memory_bytes: window.iter().map(|s| s.memory_bytes).max().unwrap_or(0),
            avg_battery_drain_rate: window.iter().map(|s| s.battery_drain_rate).sum::<f64>() / n,
            sample_count: window.len(),
        }
    }

    /// Summary over the configured window.
    pub fn rolling_summary(&self, now: f64) -> PerformanceSummary {
        self.summary(now, self.config.summary_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(t: f64, frame_ms: f64) -> PerformanceSample {
        PerformanceSample {
            frame_time_ms: frame_ms,
            detection_latency_ms: None,
            memory_bytes: 100,
            battery_drain_rate: 0.1,
            timestamp: t,
        }
    }

    #[test]
    fn test_ring_buffer_is_bounded() {
        let mut m = PerformanceMonitor::new(PerformanceConfig {
            capacity: 10,
            ..Default::default()
        });
        for i in 0..25 {
            m.record(sample(i as f64, 16.0));
        }
        assert_eq!(m.len(), 10);
        assert_eq!(m.total_recorded(), 25);
        assert_eq!(m.latest().unwrap().timestamp, 24.0);
    }

    #[test]
    fn test_summary_window() {
        let mut m = PerformanceMonitor::with_defaults();
        m.record(sample(0.0, 100.0));
        for i in 1..=10 {
            m.record(sample(10.0 + i as f64 * 0.1, 20.0));
        }
        let s = m.summary(11.0, 2.0);
        assert_eq!(s.sample_count, 10);
        assert_relative_eq!(s.avg_frame_time_ms, 20.0);
        assert!(s.avg_detection_latency_ms.is_none());
    }

    #[test]
    fn test_p95_and_latency() {
        let mut m = PerformanceMonitor::with_defaults();
        for i in 0..20 {
            let mut s = sample(i as f64 * 0.01, if i == 19 { 90.0 } else { 10.0 });
            if i % 5 == 0 {
                s.detection_latency_ms = Some(400.0 + i as f64);
            }
            s.memory_bytes = 1000 + i;
            m.record(s);
        }
        let s = m.summary(1.0, 5.0);
        assert_eq!(s.p95_frame_time_ms, 10.0);
        assert_relative_eq!(s.avg_detection_latency_ms.unwrap(), 407.5);
        assert_eq!(s.peak_memory_bytes, 1019);
    }

    #[test]
    fn test_empty_summary() {
        let m = PerformanceMonitor::with_defaults();
        assert_eq!(m.summary(5.0, 1.0), PerformanceSummary::default());
    }
}
