//! Simulation context implementing HazardLensContext for deterministic testing.

use async_trait::async_trait;
use hazardlens_env::HazardLensContext;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Simulation context backed by deterministic time and RNG.
///
/// This implements `HazardLensContext` using:
/// - A virtual clock that only moves when the runner advances it
/// - A seeded ChaCha8 RNG for backoff jitter
/// - Sleeps that resolve once the virtual clock reaches their deadline
///
/// Because sleeps wait on virtual time, a detector timeout raced against a
/// slow scripted analyzer fires at the same virtual instant on every run.
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    clock: Arc<watch::Sender<u64>>,

    /// Deterministic RNG for jitter
    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        let (clock, _) = watch::channel(0u64);
        Self {
            seed,
            clock: Arc::new(clock),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time, waking every sleeper whose deadline has passed.
    pub fn advance_time(&self, duration: Duration) {
        let delta = duration.as_nanos() as u64;
        self.clock.send_modify(|t| *t = t.saturating_add(delta));
    }

    /// Sets the virtual time to a specific value. Time never moves backwards.
    pub fn set_time(&self, time_ns: u64) {
        self.clock.send_modify(|t| *t = (*t).max(time_ns));
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.clock.borrow()
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            clock: Arc::clone(&self.clock),
            rng: Arc::clone(&self.rng),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl HazardLensContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.time_ns().saturating_add(duration.as_nanos() as u64);
        let mut rx = self.clock.subscribe();
        // The sender lives as long as `self`, so this only returns at the deadline.
        let _ = rx.wait_for(|t| *t >= deadline).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.to_string();
        tokio::spawn(async move {
            tracing::trace!(task = %name, "sim task started");
            future.await;
        });
    }

    fn random_unit(&self) -> f64 {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen::<f64>()
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
        assert_eq!(ctx.now_secs(), 1.5);
    }

    #[test]
    fn test_sim_context_random_is_seeded() {
        let a = SimContext::new(42);
        let b = SimContext::new(42);
        let c = SimContext::new(43);

        let seq_a: Vec<f64> = (0..5).map(|_| a.random_unit()).collect();
        let seq_b: Vec<f64> = (0..5).map(|_| b.random_unit()).collect();
        let seq_c: Vec<f64> = (0..5).map(|_| c.random_unit()).collect();

        assert_eq!(seq_a, seq_b);
        assert_ne!(seq_a, seq_c);
        assert!(seq_a.iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn test_sim_context_seed() {
        let ctx = SimContext::new(12345);
        assert_eq!(ctx.seed(), 12345);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));

        assert_eq!(ctx1.now(), ctx2.now());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_sleep_waits_for_virtual_time() {
        let ctx = SimContext::shared(1);
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let sleeper = {
            let ctx = Arc::clone(&ctx);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                ctx.sleep(Duration::from_millis(100)).await;
                done.store(true, std::sync::atomic::Ordering::SeqCst);
            })
        };

        tokio::task::yield_now().await;
        ctx.advance_time(Duration::from_millis(60));
        tokio::task::yield_now().await;
        assert!(!done.load(std::sync::atomic::Ordering::SeqCst));

        ctx.advance_time(Duration::from_millis(40));
        sleeper.await.unwrap();
        assert!(done.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(ctx.now(), Duration::from_millis(100));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_zero_sleep_returns_immediately() {
        let ctx = SimContext::new(1);
        ctx.sleep(Duration::ZERO).await;
        assert_eq!(ctx.now(), Duration::ZERO);
    }
}
