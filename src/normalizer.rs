//! Signal normalization
//!
//! Producers push samples at their own cadence into a [`SignalBuffer`] that
//! keeps the latest sample per kind. The decision loop takes a
//! [`SignalSnapshot`] once per cycle:
//! - Each kind is reported with its age and a staleness flag
//! - Low-confidence samples stay in the ledger but are not usable for fusion
//! - Critical events are queued so none are lost between two cycles
//! - Invalid samples are dropped and counted

use crate::config::NormalizerConfig;
use crate::error::{EngineError, Fault};
use crate::telemetry::{TrafficContext, VehicleState};
use crate::types::{SignalKind, SignalOrigin, SignalSample, SignalValue};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Latest-value buffer shared between producers and the decision loop.
///
/// Each kind has a single writer and the loop is the single reader. The lock
/// is held only for a map insert or a clone, so neither side waits on the
/// other in any meaningful way.
#[derive(Debug)]
pub struct SignalBuffer {
    inner: Mutex<BufferState>,
    max_pending_events: usize,
}

#[derive(Debug, Default)]
struct BufferState {
    slots: HashMap<SignalKind, SignalSample>,
    pending_events: VecDeque<SignalSample>,
    last_seen: HashMap<SignalOrigin, DateTime<Utc>>,
    rejected: Vec<Fault>,
    invalid_total: u64,
    vehicle: Option<VehicleState>,
    traffic: Option<TrafficContext>,
}

impl SignalBuffer {
    pub fn new(max_pending_events: usize) -> Self {
        Self {
            inner: Mutex::new(BufferState::default()),
            max_pending_events: max_pending_events.max(1),
        }
    }

    /// Record a sample. Invalid samples are counted and rejected.
    pub fn push(&self, sample: SignalSample) -> Result<(), EngineError> {
        if let Err(reason) = validate_sample(&sample) {
            tracing::warn!(kind = %sample.kind, source = %sample.source_id, %reason, "Dropping invalid sample");
            let mut state = self.inner.lock();
            state.invalid_total += 1;
            state.rejected.push(Fault::InvalidSample {
                kind: sample.kind,
                reason: reason.clone(),
            });
            return Err(EngineError::InvalidSample(reason));
        }

        let mut state = self.inner.lock();
        let origin = sample.kind.origin();
        let seen = state.last_seen.entry(origin).or_insert(sample.timestamp);
        if sample.timestamp > *seen {
            *seen = sample.timestamp;
        }

        if sample.kind == SignalKind::CriticalEvent {
            if state.pending_events.len() >= self.max_pending_events {
                state.pending_events.pop_front();
            }
            state.pending_events.push_back(sample.clone());
        }

        // Out-of-order arrivals never replace a newer sample
        match state.slots.get(&sample.kind) {
            Some(held) if held.timestamp > sample.timestamp => {}
            _ => {
                state.slots.insert(sample.kind, sample);
            }
        }
        Ok(())
    }

    pub fn push_vehicle_state(&self, vehicle: VehicleState) {
        let mut state = self.inner.lock();
        let seen = state
            .last_seen
            .entry(SignalOrigin::Telemetry)
            .or_insert(vehicle.timestamp);
        if vehicle.timestamp > *seen {
            *seen = vehicle.timestamp;
        }
        state.vehicle = Some(vehicle);
    }

    pub fn push_traffic(&self, traffic: TrafficContext) {
        self.inner.lock().traffic = Some(traffic);
    }

    /// Total invalid samples rejected since creation
    pub fn invalid_total(&self) -> u64 {
        self.inner.lock().invalid_total
    }
}

/// Check range and kind/value consistency of a sample
pub fn validate_sample(sample: &SignalSample) -> Result<(), String> {
    if !sample.confidence.is_finite() || !(0.0..=1.0).contains(&sample.confidence) {
        return Err(format!("confidence {} outside 0-1", sample.confidence));
    }
    if sample.source_id.trim().is_empty() {
        return Err("empty source_id".to_string());
    }

    let scalar_range = |lo: f64, hi: f64| -> Result<(), String> {
        match sample.value {
            SignalValue::Scalar(v) if v.is_finite() && (lo..=hi).contains(&v) => Ok(()),
            SignalValue::Scalar(v) => Err(format!("{} value {} outside {}-{}", sample.kind, v, lo, hi)),
            other => Err(format!("{} expects a number, got {:?}", sample.kind, other)),
        }
    };

    match (sample.kind, &sample.value) {
        (SignalKind::EyeClosure, _) => scalar_range(0.0, 1.0),
        (SignalKind::BlinkRate, _) => scalar_range(0.0, 120.0),
        (SignalKind::HeartRate, _) => scalar_range(20.0, 250.0),
        (SignalKind::SteeringStability, _)
        | (SignalKind::SpeedConsistency, _)
        | (SignalKind::LaneDeviation, _) => scalar_range(0.0, 1.0),
        (SignalKind::Yawn, SignalValue::Flag(_)) => Ok(()),
        (SignalKind::HeadPose, SignalValue::HeadPose(_)) => Ok(()),
        (SignalKind::Gaze, SignalValue::Gaze(_)) => Ok(()),
        (SignalKind::Emotion, SignalValue::Emotion(_)) => Ok(()),
        (SignalKind::CriticalEvent, SignalValue::Critical(_)) => Ok(()),
        (kind, value) => Err(format!("{kind} cannot carry {value:?}")),
    }
}

/// A kind's latest sample as seen at snapshot time
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub sample: SignalSample,
    pub age: Duration,
    pub stale: bool,
    /// Confidence at or above the floor
    pub usable: bool,
}

/// Uniform view of all producers at one instant
#[derive(Debug, Clone)]
pub struct SignalSnapshot {
    pub at: DateTime<Utc>,
    pub entries: BTreeMap<SignalKind, SnapshotEntry>,
    /// Critical events that arrived since the previous snapshot
    pub new_events: Vec<SignalSample>,
    pub faults: Vec<Fault>,
    pub vehicle: Option<VehicleState>,
    pub traffic: Option<TrafficContext>,
    pub invalid_total: u64,
}

impl SignalSnapshot {
    /// The sample for `kind` if it is fresh and confident enough to fuse
    pub fn fresh(&self, kind: SignalKind) -> Option<&SignalSample> {
        self.entries
            .get(&kind)
            .filter(|e| !e.stale && e.usable)
            .map(|e| &e.sample)
    }

    pub fn stale_kinds(&self) -> Vec<SignalKind> {
        self.entries
            .iter()
            .filter(|(_, e)| e.stale)
            .map(|(k, _)| *k)
            .collect()
    }

    /// Most recent fusable sample, used as the audit trigger of transitions
    pub fn latest_fresh(&self) -> Option<&SignalSample> {
        self.entries
            .values()
            .filter(|e| !e.stale && e.usable && e.sample.kind != SignalKind::CriticalEvent)
            .map(|e| &e.sample)
            .max_by_key(|s| s.timestamp)
    }
}

/// Turns the shared buffer into per-cycle snapshots
pub struct Normalizer {
    config: NormalizerConfig,
    stale: BTreeSet<SignalKind>,
    offline: BTreeSet<SignalOrigin>,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self {
            config,
            stale: BTreeSet::new(),
            offline: BTreeSet::new(),
        }
    }

    /// Take a snapshot of the buffer at `now`
    pub fn snapshot(&mut self, buffer: &SignalBuffer, now: DateTime<Utc>) -> SignalSnapshot {
        let (slots, pending, last_seen, rejected, invalid_total, vehicle, traffic) = {
            let mut state = buffer.inner.lock();
            (
                state.slots.clone(),
                state.pending_events.drain(..).collect::<Vec<_>>(),
                state.last_seen.clone(),
                std::mem::take(&mut state.rejected),
                state.invalid_total,
                state.vehicle.clone(),
                state.traffic,
            )
        };

        let mut faults = rejected;
        let mut entries = BTreeMap::new();

        for (kind, sample) in slots {
            let age = (now - sample.timestamp).max(Duration::zero());
            let stale = age > self.config.staleness_for(kind.origin());
            let usable = sample.confidence >= self.config.confidence_floor;

            if kind != SignalKind::CriticalEvent {
                if stale {
                    if self.stale.insert(kind) {
                        tracing::warn!(kind = %kind, age_ms = age.num_milliseconds(), "Signal went stale");
                    }
                    faults.push(Fault::StaleSignal { kind });
                } else if self.stale.remove(&kind) {
                    tracing::info!(kind = %kind, "Signal fresh again");
                }
            }

            entries.insert(
                kind,
                SnapshotEntry {
                    sample,
                    age,
                    stale,
                    usable,
                },
            );
        }

        let event_limit = self.config.staleness_for(SignalOrigin::Event);
        let mut new_events = Vec::with_capacity(pending.len());
        for event in pending {
            if now - event.timestamp > event_limit {
                tracing::warn!(source = %event.source_id, "Discarding stale critical event");
                faults.push(Fault::StaleSignal {
                    kind: SignalKind::CriticalEvent,
                });
            } else {
                new_events.push(event);
            }
        }

        // Raw vehicle state and traffic age out with the telemetry threshold
        let context_limit = self.config.staleness_for(SignalOrigin::Telemetry);
        let vehicle = vehicle.filter(|v| {
            let fresh = now - v.timestamp <= context_limit;
            if !fresh {
                tracing::debug!(age_ms = (now - v.timestamp).num_milliseconds(), "Vehicle state stale, omitted");
            }
            fresh
        });
        let traffic = traffic.filter(|t| {
            let fresh = now - t.timestamp <= context_limit;
            if !fresh {
                tracing::debug!(age_ms = (now - t.timestamp).num_milliseconds(), "Traffic context stale, omitted");
            }
            fresh
        });

        let watchdog = crate::config::ms(self.config.watchdog_ms);
        for origin in [SignalOrigin::Vision, SignalOrigin::Telemetry] {
            let silent = last_seen
                .get(&origin)
                .map(|seen| now - *seen > watchdog)
                .unwrap_or(false);
            if silent {
                if self.offline.insert(origin) {
                    tracing::warn!(origin = origin.as_str(), "Producer not responding");
                }
                faults.push(Fault::SourceOffline { origin });
            } else if self.offline.remove(&origin) {
                tracing::info!(origin = origin.as_str(), "Producer back online");
            }
        }

        SignalSnapshot {
            at: now,
            entries,
            new_events,
            faults,
            vehicle,
            traffic,
            invalid_total,
        }
    }
}
