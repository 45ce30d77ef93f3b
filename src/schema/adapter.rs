//! Replay stream parsing and validation

use super::replay_event::{ReplayEvent, ValidationError};
use crate::error::EngineError;

/// Parses replay streams
pub struct ReplayAdapter;

impl ReplayAdapter {
    /// Parse a JSON array of ReplayEvents
    pub fn parse_array(json: &str) -> Result<Vec<ReplayEvent>, EngineError> {
        let events: Vec<ReplayEvent> = serde_json::from_str(json)?;
        Ok(events)
    }

    /// Parse NDJSON (newline-delimited JSON) containing ReplayEvents
    pub fn parse_ndjson(ndjson: &str) -> Result<Vec<ReplayEvent>, EngineError> {
        let mut events = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event = serde_json::from_str::<ReplayEvent>(trimmed).map_err(|e| {
                EngineError::Replay(format!("Failed to parse line {}: {}", line_num + 1, e))
            })?;
            events.push(event);
        }
        Ok(events)
    }

    /// Validate every record and the stream ordering; only failures are returned
    pub fn validate_events(events: &[ReplayEvent]) -> Vec<ValidationResult> {
        let mut previous = None;
        let mut failures = Vec::new();
        for (index, event) in events.iter().enumerate() {
            let result = match previous {
                Some(prev) if event.at < prev => Some(ValidationError::OutOfOrder {
                    at: event.at,
                    previous: prev,
                }),
                _ => event.validate().err(),
            };
            previous = Some(previous.map_or(event.at, |p| event.at.max(p)));
            if let Some(error) = result {
                failures.push(ValidationResult {
                    index,
                    record: event.record.type_name(),
                    error,
                });
            }
        }
        failures
    }
}

/// A record that failed validation
#[derive(Debug)]
pub struct ValidationResult {
    pub index: usize,
    pub record: &'static str,
    pub error: ValidationError,
}
