//! Driver Wellness - Closed-loop driver wellness and emergency escalation engine
//!
//! The engine fuses cabin-camera and vehicle-telemetry features into a
//! wellness state through a deterministic per-cycle pipeline: normalization
//! → fusion against a personal baseline → risk classification → escalation
//! and intervention selection → status encoding.
//!
//! ## Modules
//!
//! - **Decision loop**: [`pipeline::WellnessEngine`] runs one cycle at a time on an explicit clock
//! - **Escalation**: emergency case state machine, data package and case archive
//! - **Runtime**: tokio driver that dispatches commands to async collaborators

pub mod baseline;
pub mod classifier;
pub mod config;
pub mod encoder;
pub mod error;
pub mod escalation;
pub mod fusion;
pub mod intervention;
pub mod normalizer;
pub mod pipeline;
pub mod runtime;
pub mod schema;
pub mod telemetry;
pub mod types;

pub use baseline::{BaselineStore, DriverBaseline};
pub use config::EngineConfig;
pub use encoder::{StatusEncoder, StatusEvent};
pub use error::{EngineError, Fault};
pub use escalation::{EmergencyDataPackage, EscalationPhase, SessionProfile};
pub use pipeline::{CycleOutput, EngineHandle, SessionContext, WellnessEngine};
pub use runtime::{EmergencyChannel, Runtime, StatusPublisher, VehicleActuator};

// Schema exports
pub use schema::{ReplayAdapter, ReplayEvent, ReplayRecord, REPLAY_SCHEMA_VERSION};

/// Engine version embedded in all status events
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for status events
pub const PRODUCER_NAME: &str = "driver-wellness";
