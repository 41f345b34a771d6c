pub mod cadence;
pub mod config;
pub mod context;
pub mod derive;
pub mod engine;
pub mod error;
pub mod events;
#[cfg(not(target_arch = "wasm32"))]
pub mod logging;
pub mod overrides;
pub mod phase;
pub mod quality;
pub mod resonance;
pub mod sanitize;
pub mod scheduler;
pub mod topology;
/// The `lumen_core` crate is the orchestration core of the Lumen procedural simulation.
/// It drives a bounded sequence of phases, morphs a discrete topology selector smoothly,
/// adapts a quality tier to observed frame cost, arbitrates user overrides and derives a
/// finite, range-checked parameter bag every tick for an external renderer.
///
/// Key components:
/// - **Traits**: `Scalar` (numeric guard abstraction), `ThresholdPredicate` (phase gating).
/// - **Controllers**: `QualityController`, `TopologyMorphController`, `PhaseController`.
/// - **Derivation**: `derive` turns tier, phase blend and morph into a `ParameterBag`.
/// - **Engine**: `Engine` sequences one tick and owns the control surface.
pub mod traits;

pub use engine::{Engine, TickInput, TickOutput};
pub use error::EngineError;
