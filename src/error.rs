//! Error types for the wellness engine
//!
//! Two families live here. [`EngineError`] is returned by the APIs that sit
//! outside the decision loop (configuration, persistence, replay parsing).
//! [`Fault`] is the non-fatal taxonomy that the decision loop reports as
//! status fields; it is never propagated as an `Err`.

use crate::types::{SignalKind, SignalOrigin};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur outside the decision loop
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    #[error("Replay error: {0}")]
    Replay(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

/// Non-fatal conditions surfaced in the cycle's status event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum Fault {
    /// Too few fresh signals to produce a composite score
    DegradedInput,
    /// A signal kind exceeded its staleness threshold and was excluded
    StaleSignal { kind: SignalKind },
    /// A sample was out of range or malformed and was dropped
    InvalidSample { kind: SignalKind, reason: String },
    /// Emergency package transmission failed after all retries
    CommFailure { case_id: Uuid, attempts: u32 },
    /// An escalation phase overran its budget
    PhaseDeadlineMissed { case_id: Uuid, phase: String },
    /// The vehicle-control actuator rejected or could not apply a command
    ActuatorUnavailable { command: String },
    /// A producer stopped delivering samples entirely
    SourceOffline { origin: SignalOrigin },
}

impl Fault {
    /// Short machine-readable code, used for log fields and CLI summaries
    pub fn code(&self) -> &'static str {
        match self {
            Fault::DegradedInput => "DEGRADED",
            Fault::StaleSignal { .. } => "STALE_SIGNAL",
            Fault::InvalidSample { .. } => "INVALID_SAMPLE",
            Fault::CommFailure { .. } => "COMM_FAILED",
            Fault::PhaseDeadlineMissed { .. } => "PHASE_DEADLINE_MISSED",
            Fault::ActuatorUnavailable { .. } => "ACTUATOR_UNAVAILABLE",
            Fault::SourceOffline { .. } => "SOURCE_OFFLINE",
        }
    }
}
