//! Core environment context trait for HazardLens sessions.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that HazardLens engines can run
/// both on a device (tokio) and inside the deterministic simulation harness.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, thread RNG
/// - **Simulation**: `SimContext` - virtual clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// For simulation, all methods that would normally introduce non-determinism
/// (time, randomness) are controlled by the implementation.
#[async_trait]
pub trait HazardLensContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// This is the session clock: frame timestamps, anchor confirmation
    /// times and performance samples are all expressed against it.
    fn now(&self) -> Duration;

    /// Returns the session clock in seconds.
    fn now_secs(&self) -> f64 {
        self.now().as_secs_f64()
    }

    /// Returns the wall-clock time for telemetry timestamps.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: resolves once the virtual clock has advanced
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns a uniformly distributed value in `[0, 1)`.
    ///
    /// Used for retry backoff jitter so that simulated runs stay
    /// reproducible from their seed.
    fn random_unit(&self) -> f64;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
