//! On-device implementation of HazardLensContext using Tokio.

use crate::HazardLensContext;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Context for a live inspection session on the handheld.
///
/// The session clock starts at zero when the context is created and runs on
/// the monotonic clock, so frame timestamps, anchor ages and backoff delays
/// never jump when the user's wall clock is adjusted. Telemetry timestamps
/// are the session start's wall time plus the monotonic elapsed time.
/// Backoff jitter comes from the thread RNG.
pub struct TokioContext {
    /// Monotonic origin of the session clock
    origin: Instant,

    /// Wall time at `origin`
    started_at: SystemTime,
}

impl TokioContext {
    /// Starts a session clock now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            started_at: SystemTime::now(),
        }
    }

    /// Arc-wrapped context, shared between the session and its analysis tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Wall time the session clock started at.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HazardLensContext for TokioContext {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.started_at + self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.to_string();
        tokio::spawn(async move {
            tracing::trace!(task = %name, "task started");
            future.await;
        });
    }

    fn random_unit(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }

    fn seed(&self) -> u64 {
        // Live sessions are not replayable
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_clock_advances_with_sleep() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[test]
    fn test_telemetry_time_tracks_session_clock() {
        let ctx = TokioContext::new();
        let wall = ctx.system_time();
        let since_start = wall.duration_since(ctx.started_at()).unwrap();
        assert!(since_start <= ctx.now());
    }

    #[test]
    fn test_jitter_in_unit_range() {
        let ctx = TokioContext::new();
        for _ in 0..100 {
            let v = ctx.random_unit();
            assert!((0.0..1.0).contains(&v));
        }
        assert_eq!(ctx.seed(), 0);
    }
}
