//! HazardLens Deterministic Simulation Testing (DST) Harness
//!
//! This crate runs a full hazard session against a scripted world, so
//! chaos scenarios replay identically for the same seed.
//!
//! # Core Principle: Everything Is Injected
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock that moves only when the harness advances it
//! - **Analyzers**: Scripted remote and local analyzers with fault windows
//! - **Randomness**: All entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          SimHarness                          │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ SimContext (virtual clock + seeded RNG)                │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │        │ frames                     │ jobs                   │
//! │  ┌─────▼──────┐   detections   ┌────▼─────────────┐          │
//! │  │  Hazard    │◄───────────────│ ScriptedAnalyzer │          │
//! │  │  Session   │                │ (remote / local) │          │
//! │  └─────▲──────┘                └────▲─────────────┘          │
//! │        │ battery, load              │ visible hazards        │
//! │  ┌─────┴──────┐               ┌─────┴────────────┐           │
//! │  │ SimDevice  │               │      Oracle      │           │
//! │  └────────────┘               │  (ground truth)  │           │
//! │                               └──────────────────┘           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use hazardlens_sim::{ScenarioRunner, ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::ServiceOutage);
//! assert!(result.passed, "{:?}", result.failure_reason);
//! ```

pub mod analyzer;
mod context;
mod device;
mod exporter;
pub mod oracle;
mod runner;
pub mod scenarios;

pub use analyzer::{Fault, FaultWindow, ScriptedAnalyzer, ScriptedAnalyzerConfig};
pub use context::SimContext;
pub use device::{base_frame_cost_ms, SimDevice};
pub use exporter::{HazardPosition, SimExport, SimFrame};
pub use oracle::{GroundTruthHazard, Oracle, Sighting, TrackingSegment};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SimHarness};
pub use scenarios::{DeviceAction, DeviceEvent, ScenarioId, ScenarioPlan};
