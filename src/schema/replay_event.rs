//! wellness.replay.v1 schema definition
//!
//! A replay file is a time-ordered stream of everything the engine would
//! receive during a drive:
//! - Feature samples from the cabin camera and vehicle telemetry
//! - Raw vehicle state and traffic context
//! - Collision sensor reports
//! - Driver responses and external responder acknowledgements

use crate::normalizer::validate_sample;
use crate::telemetry::{TrafficContext, VehicleState};
use crate::types::{DriverResponse, SignalSample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Current replay schema version
pub const REPLAY_SCHEMA_VERSION: &str = "wellness.replay.v1";

/// One line of a replay stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEvent {
    pub schema_version: String,
    /// When the record reaches the engine
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: ReplayRecord,
}

/// Payload of a replay line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum ReplayRecord {
    Sample { sample: SignalSample },
    VehicleState { state: VehicleState },
    Traffic { traffic: TrafficContext },
    /// Collision sensor report, e.g. actor type `vehicle.audi.a2`
    Collision {
        actor_type_id: String,
        source_id: String,
    },
    Driver { response: DriverResponse },
    ResponderAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        case_id: Option<Uuid>,
    },
}

impl ReplayRecord {
    pub fn type_name(&self) -> &'static str {
        match self {
            ReplayRecord::Sample { .. } => "sample",
            ReplayRecord::VehicleState { .. } => "vehicle_state",
            ReplayRecord::Traffic { .. } => "traffic",
            ReplayRecord::Collision { .. } => "collision",
            ReplayRecord::Driver { .. } => "driver",
            ReplayRecord::ResponderAck { .. } => "responder_ack",
        }
    }
}

impl ReplayEvent {
    pub fn new(at: DateTime<Utc>, record: ReplayRecord) -> Self {
        Self {
            schema_version: REPLAY_SCHEMA_VERSION.to_string(),
            at,
            record,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.schema_version != REPLAY_SCHEMA_VERSION {
            return Err(ValidationError::InvalidSchemaVersion {
                expected: REPLAY_SCHEMA_VERSION.to_string(),
                actual: self.schema_version.clone(),
            });
        }

        match &self.record {
            ReplayRecord::Sample { sample } => {
                validate_sample(sample).map_err(|reason| ValidationError::InvalidSample {
                    kind: sample.kind.to_string(),
                    reason,
                })
            }
            ReplayRecord::VehicleState { state } => {
                if !state.speed_kmh.is_finite() || state.speed_kmh < 0.0 {
                    return Err(ValidationError::InvalidField {
                        record: self.record.type_name(),
                        field: "speed_kmh",
                    });
                }
                Ok(())
            }
            ReplayRecord::Collision {
                actor_type_id,
                source_id,
            } => {
                if actor_type_id.trim().is_empty() {
                    return Err(ValidationError::InvalidField {
                        record: self.record.type_name(),
                        field: "actor_type_id",
                    });
                }
                if source_id.trim().is_empty() {
                    return Err(ValidationError::InvalidField {
                        record: self.record.type_name(),
                        field: "source_id",
                    });
                }
                Ok(())
            }
            ReplayRecord::Traffic { .. }
            | ReplayRecord::Driver { .. }
            | ReplayRecord::ResponderAck { .. } => Ok(()),
        }
    }
}

/// Validation errors for replay records
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid schema version: expected {expected}, got {actual}")]
    InvalidSchemaVersion { expected: String, actual: String },

    #[error("Invalid {kind} sample: {reason}")]
    InvalidSample { kind: String, reason: String },

    #[error("Invalid {field} in {record} record")]
    InvalidField {
        record: &'static str,
        field: &'static str,
    },

    #[error("Out of order: {at} is earlier than the previous record at {previous}")]
    OutOfOrder {
        at: DateTime<Utc>,
        previous: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OverrideMethod, SignalKind};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_sample_line() {
        let json = r#"{
            "schema_version": "wellness.replay.v1",
            "at": "2024-03-01T08:00:00Z",
            "record": "sample",
            "sample": {
                "kind": "eye_closure",
                "value": 0.3,
                "confidence": 0.95,
                "timestamp": "2024-03-01T08:00:00Z",
                "source_id": "cabin_cam"
            }
        }"#;

        let event: ReplayEvent = serde_json::from_str(json).unwrap();
        assert!(event.validate().is_ok());
        match event.record {
            ReplayRecord::Sample { sample } => {
                assert_eq!(sample.kind, SignalKind::EyeClosure);
                assert_eq!(sample.as_scalar(), Some(0.3));
            }
            other => panic!("Expected sample record, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_driver_record_wire_format() {
        let event = ReplayEvent::new(
            t0(),
            ReplayRecord::Driver {
                response: DriverResponse::cancel(OverrideMethod::Voice, t0()),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["record"], "driver");
        assert_eq!(value["response"]["response"], "cancel");

        let parsed: ReplayEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_invalid_schema_version() {
        let mut event = ReplayEvent::new(t0(), ReplayRecord::ResponderAck { case_id: None });
        event.schema_version = "wellness.replay.v0".to_string();
        assert!(matches!(
            event.validate(),
            Err(ValidationError::InvalidSchemaVersion { .. })
        ));
    }

    #[test]
    fn test_out_of_range_sample_rejected() {
        let event = ReplayEvent::new(
            t0(),
            ReplayRecord::Sample {
                sample: SignalSample::scalar(SignalKind::HeartRate, 400.0, t0(), "cam"),
            },
        );
        let err = event.validate().unwrap_err();
        assert!(err.to_string().contains("heart_rate"));
    }

    #[test]
    fn test_collision_requires_actor() {
        let event = ReplayEvent::new(
            t0(),
            ReplayRecord::Collision {
                actor_type_id: " ".to_string(),
                source_id: "collision_sensor".to_string(),
            },
        );
        assert!(matches!(
            event.validate(),
            Err(ValidationError::InvalidField { field: "actor_type_id", .. })
        ));
    }
}
