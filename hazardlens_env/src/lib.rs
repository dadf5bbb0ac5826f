//! HazardLens Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing HazardLens engines
//! to run both on a handheld device (tokio) and inside the deterministic
//! simulation harness.
//!
//! # Core Concept: The Reactor Pattern
//!
//! For deterministic simulation we intercept everything the session reads
//! from the outside world:
//! - Time (`now()`, `sleep()`)
//! - Device state (`DeviceSensor::read()`: battery, memory, thermal, frame cost)
//! - Randomness (`random_unit()` for backoff jitter)
//! - Telemetry output (`TelemetrySink`)
//!
//! By deriving all entropy from a single 64-bit seed, any bug becomes
//! reproducible via its seed number.
//!
//! # Example
//!
//! ```ignore
//! use hazardlens_env::{DeviceSensor, EnvError, HazardLensContext};
//!
//! async fn tracking_loop<Ctx: HazardLensContext, Dev: DeviceSensor>(
//!     ctx: &Ctx,
//!     device: &Dev,
//!     mut frames: tokio::sync::mpsc::Receiver<TrackingFrame>,
//! ) -> Result<(), EnvError> {
//!     while let Some(frame) = frames.recv().await {
//!         let reading = device.read()?;
//!         session.on_frame(frame, reading, ctx.now_secs());
//!     }
//!     Ok(())
//! }
//! ```

mod context;
mod device;
mod error;
mod telemetry;
mod tokio_impl;
mod types;

pub use context::HazardLensContext;
pub use device::{DeviceController, DeviceSensor, DeviceReading, FixedDeviceSensor, ThermalState};
pub use error::EnvError;
pub use telemetry::{MemoryTelemetrySink, TelemetrySink, TracingTelemetrySink};
pub use tokio_impl::TokioContext;
pub use types::{SessionId, TelemetryRecord};
