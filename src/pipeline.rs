//! Pipeline orchestration
//!
//! [`WellnessEngine`] owns one driver session and runs the decision loop
//! one cycle at a time: drain inbound messages, snapshot the signal buffer,
//! fuse, classify, step the escalation machine, select interventions and
//! encode the status event. A cycle never blocks and never fails; problems
//! are reported as faults in the status event.
//!
//! Producers and collaborators talk to the engine through a cloneable
//! [`EngineHandle`], which may be used from any thread at any time.

use crate::baseline::DriverBaseline;
use crate::classifier::{RiskClassifier, ScoreReading};
use crate::config::EngineConfig;
use crate::encoder::{CycleView, StatusEncoder, StatusEvent};
use crate::error::{EngineError, Fault};
use crate::escalation::{
    EscalationCase, EscalationInput, EscalationMachine, EscalationPhase, SessionProfile,
};
use crate::fusion::FusionEngine;
use crate::intervention::{InterventionSelector, SelectionContext};
use crate::normalizer::{Normalizer, SignalBuffer};
use crate::telemetry::{
    collision_sample, derive_samples, detect_anomaly, StressContext, TrafficContext, VehicleState,
    VehicleStatus,
};
use crate::types::{
    Command, DriverResponse, FusionStatus, Inbound, InterventionRecord, ResponseKind, RiskTier,
    SignalSample, TierTransition, WellnessState,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

/// Explicitly owned per-session context
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub profile: SessionProfile,
    pub baseline: DriverBaseline,
}

impl SessionContext {
    pub fn new(profile: SessionProfile, baseline: DriverBaseline) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            profile,
            baseline,
        }
    }
}

/// Cloneable entry point for producers and collaborators
#[derive(Clone)]
pub struct EngineHandle {
    buffer: Arc<SignalBuffer>,
    inbox: Arc<Mutex<VecDeque<Inbound>>>,
    telemetry: crate::config::TelemetryConfig,
}

impl EngineHandle {
    /// Push a feature sample. Invalid samples are counted and rejected.
    pub fn push_sample(&self, sample: SignalSample) -> Result<(), EngineError> {
        self.buffer.push(sample)
    }

    /// Push raw vehicle state; a rollover becomes a critical event
    pub fn push_vehicle_state(&self, state: VehicleState) {
        for sample in derive_samples(&state, &self.telemetry) {
            if let Err(e) = self.buffer.push(sample) {
                tracing::warn!(error = %e, "Derived sample rejected");
            }
        }
        self.buffer.push_vehicle_state(state);
    }

    /// Push a collision sensor report, e.g. actor type `vehicle.audi.a2`
    pub fn push_collision(
        &self,
        actor_type_id: &str,
        timestamp: DateTime<Utc>,
        source_id: &str,
    ) -> Result<(), EngineError> {
        self.buffer
            .push(collision_sample(actor_type_id, timestamp, source_id))
    }

    pub fn push_traffic(&self, traffic: TrafficContext) {
        self.buffer.push_traffic(traffic);
    }

    /// Deliver a driver response or collaborator report; applied next cycle
    pub fn send(&self, message: Inbound) {
        self.inbox.lock().push_back(message);
    }

    pub fn driver_response(&self, response: DriverResponse) {
        self.send(Inbound::Driver(response));
    }

    fn drain(&self) -> Vec<Inbound> {
        self.inbox.lock().drain(..).collect()
    }
}

/// Result of one decision cycle
#[derive(Debug, Clone)]
pub struct CycleOutput {
    pub status: StatusEvent,
    pub transition: Option<TierTransition>,
    pub issued: Vec<InterventionRecord>,
    /// Work for the actuator and the emergency channel
    pub commands: Vec<Command>,
    /// Escalation case resolved this cycle
    pub archived: Option<EscalationCase>,
}

/// Decision loop for one driver session
pub struct WellnessEngine {
    config: EngineConfig,
    handle: EngineHandle,
    normalizer: Normalizer,
    fusion: FusionEngine,
    classifier: RiskClassifier,
    selector: InterventionSelector,
    escalation: EscalationMachine,
    encoder: StatusEncoder,
    session: SessionContext,
    state: WellnessState,
    cycle: u64,
}

impl WellnessEngine {
    pub fn new(config: EngineConfig, session: SessionContext) -> Result<Self, EngineError> {
        config.validate()?;
        let handle = EngineHandle {
            buffer: Arc::new(SignalBuffer::new(config.normalizer.max_pending_events)),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            telemetry: config.telemetry.clone(),
        };
        tracing::info!(
            session_id = %session.session_id,
            driver_id = %session.profile.driver_id,
            cycle_ms = config.cycle_ms,
            "Wellness session started"
        );
        Ok(Self {
            normalizer: Normalizer::new(config.normalizer.clone()),
            fusion: FusionEngine::new(config.fusion.clone(), config.baseline.clone()),
            classifier: RiskClassifier::new(config.classifier.clone()),
            selector: InterventionSelector::new(config.intervention.clone()),
            escalation: EscalationMachine::new(
                config.escalation.clone(),
                config.classifier.breakpoints.critical,
            ),
            encoder: StatusEncoder::new(),
            handle,
            session,
            state: WellnessState::default(),
            cycle: 0,
            config,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &WellnessState {
        &self.state
    }

    pub fn tier(&self) -> RiskTier {
        self.classifier.tier()
    }

    pub fn escalation_phase(&self) -> EscalationPhase {
        self.escalation.phase()
    }

    pub fn selector(&self) -> &InterventionSelector {
        &self.selector
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// End the session and hand the context back, baseline included
    pub fn finish(self) -> SessionContext {
        tracing::info!(
            session_id = %self.session.session_id,
            cycles = self.cycle,
            "Wellness session finished"
        );
        self.session
    }

    /// Run one decision cycle at `now`
    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleOutput {
        let inbound = self.handle.drain();
        for message in &inbound {
            if let Inbound::Driver(DriverResponse {
                kind: ResponseKind::Acknowledge { category },
                ..
            }) = message
            {
                self.selector.acknowledge(*category, now);
            }
        }

        let snapshot = self.normalizer.snapshot(&self.handle.buffer, now);

        let fused = self
            .fusion
            .fuse(&snapshot, &self.state, &self.session.baseline, now);
        if let Some(observation) = &fused.observation {
            self.session
                .baseline
                .observe(observation, &self.config.baseline, now);
        }
        self.state = fused.state;

        let reading = self.state.composite.map(|score| ScoreReading {
            score,
            trend: self.state.composite_trend,
        });
        let transition = self.classifier.update(
            now,
            reading,
            &snapshot.new_events,
            snapshot.latest_fresh(),
        );

        let escalation = self.escalation.step(&EscalationInput {
            now,
            tier: self.classifier.tier(),
            score: self.state.composite,
            events: &snapshot.new_events,
            inbound: &inbound,
            vehicle: snapshot.vehicle.as_ref(),
            profile: &self.session.profile,
        });

        let context = SelectionContext {
            tier: self.classifier.tier(),
            dominant: self.state.dominant(),
            stress_context: snapshot
                .traffic
                .map(|t| t.stress_context(&self.config.telemetry))
                .unwrap_or(StressContext::Unknown),
            escalation_active: self.escalation.is_active(),
        };
        let issued = self.selector.on_cycle(now, &context, transition.as_ref());

        let mut faults = snapshot.faults;
        if self.state.status == FusionStatus::Degraded {
            faults.push(Fault::DegradedInput);
        }
        faults.extend(escalation.faults);

        let vehicle = snapshot.vehicle.as_ref().map(|v| VehicleStatus {
            speed_kmh: v.speed_kmh,
            anomaly: detect_anomaly(v, &self.config.telemetry),
            location: v.location,
            nearby_vehicles: snapshot.traffic.map(|t| t.nearby_vehicles),
        });

        let status = self.encoder.encode(CycleView {
            session_id: self.session.session_id,
            driver_id: &self.session.profile.driver_id,
            cycle: self.cycle,
            at: now,
            state: &self.state,
            tier: self.classifier.tier(),
            tier_entered_at: self.classifier.entered_at(),
            interventions: self.selector.open_records().cloned().collect(),
            escalation: self.escalation.case(),
            faults,
            invalid_samples: snapshot.invalid_total,
            vehicle,
        });
        tracing::debug!(
            cycle = self.cycle,
            composite = ?self.state.composite,
            tier = %status.tier,
            phase = %self.escalation.phase(),
            "Cycle complete"
        );
        self.cycle += 1;

        CycleOutput {
            status,
            transition,
            issued,
            commands: escalation.commands,
            archived: escalation.archived,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierConfig, InterventionConfig};
    use crate::fusion::tests::healthy_samples;
    use crate::types::{
        EmotionClass, GazeClass, HeadPoseClass, InterventionCategory, OverrideMethod,
        SignalKind, SignalValue, VehicleCommand,
    };
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn at(cycle: i64) -> DateTime<Utc> {
        t0() + Duration::milliseconds(cycle * 100)
    }

    fn engine() -> WellnessEngine {
        let baseline = DriverBaseline::population("driver-1", t0());
        let profile = SessionProfile {
            driver_id: "driver-1".to_string(),
            ..SessionProfile::default()
        };
        WellnessEngine::new(EngineConfig::default(), SessionContext::new(profile, baseline)).unwrap()
    }

    fn push_all(handle: &EngineHandle, samples: Vec<SignalSample>) {
        for sample in samples {
            handle.push_sample(sample).unwrap();
        }
    }

    /// Eyes closing, yawning and nodding, still looking at the road
    fn drowsy_samples(at: DateTime<Utc>) -> Vec<SignalSample> {
        vec![
            SignalSample::scalar(SignalKind::EyeClosure, 0.5, at, "cam"),
            SignalSample::scalar(SignalKind::BlinkRate, 17.0, at, "cam"),
            SignalSample::new(SignalKind::Yawn, SignalValue::Flag(true), at, "cam"),
            SignalSample::new(SignalKind::HeadPose, SignalValue::HeadPose(HeadPoseClass::Nodding), at, "cam"),
            SignalSample::new(SignalKind::Gaze, SignalValue::Gaze(GazeClass::Road), at, "cam"),
            SignalSample::new(SignalKind::Emotion, SignalValue::Emotion(EmotionClass::Neutral), at, "cam"),
            SignalSample::scalar(SignalKind::HeartRate, 72.0, at, "cam"),
            SignalSample::scalar(SignalKind::SteeringStability, 0.85, at, "can"),
            SignalSample::scalar(SignalKind::SpeedConsistency, 0.85, at, "can"),
            SignalSample::scalar(SignalKind::LaneDeviation, 0.10, at, "can"),
        ]
    }

    #[test]
    fn test_steady_healthy_driver_stays_nominal() {
        let mut engine = engine();
        let handle = engine.handle();
        for cycle in 0..300 {
            push_all(&handle, healthy_samples(at(cycle)));
            let out = engine.run_cycle(at(cycle));
            assert_eq!(out.transition, None);
            assert!(out.issued.is_empty());
            assert_eq!(out.status.tier, RiskTier::Nominal);
            assert!(!out.status.is_degraded());
        }
        assert_eq!(engine.escalation_phase(), EscalationPhase::Idle);
        // Normal-band readings were folded into the baseline
        assert_eq!(engine.session().baseline.observations, 300);
    }

    #[test]
    fn test_descent_through_tiers_issues_one_break_suggestion() {
        // 90 -> 45 over 5 s, then held for a minute
        let mut classifier = RiskClassifier::new(ClassifierConfig::default());
        let mut selector = InterventionSelector::new(InterventionConfig::default());
        let mut history: VecDeque<(DateTime<Utc>, f64)> = VecDeque::new();
        let mut tiers = vec![classifier.tier()];
        let mut issued = Vec::new();

        for cycle in 0..=650 {
            let now = at(cycle);
            let score = if cycle <= 50 { 90.0 - 0.9 * cycle as f64 } else { 45.0 };
            history.push_back((now, score));
            while history.front().is_some_and(|(t, _)| *t < now - Duration::seconds(5)) {
                history.pop_front();
            }
            let trend = history.front().map(|(_, oldest)| score - oldest);

            let transition = classifier.update(now, Some(ScoreReading { score, trend }), &[], None);
            if let Some(t) = &transition {
                tiers.push(t.to);
            }
            let context = SelectionContext {
                tier: classifier.tier(),
                dominant: None,
                stress_context: StressContext::Unknown,
                escalation_active: false,
            };
            issued.extend(selector.on_cycle(now, &context, transition.as_ref()));
        }

        let reached = *tiers.iter().max().unwrap();
        assert!(reached == RiskTier::Medium || reached == RiskTier::High);
        // Never back to Low once the descent passed it
        let first_medium = tiers.iter().position(|t| *t >= RiskTier::Medium).unwrap();
        assert!(tiers[first_medium..].iter().all(|t| *t >= RiskTier::Medium));
        let breaks = issued
            .iter()
            .filter(|r| r.category == InterventionCategory::BreakSuggestion)
            .count();
        assert_eq!(breaks, 1);
    }

    #[test]
    fn test_drowsy_driver_gets_break_suggestion() {
        let mut engine = engine();
        let handle = engine.handle();
        let mut issued = Vec::new();
        let mut max_tier = RiskTier::Nominal;

        for cycle in 0..600 {
            let samples = if cycle < 100 { healthy_samples(at(cycle)) } else { drowsy_samples(at(cycle)) };
            push_all(&handle, samples);
            let out = engine.run_cycle(at(cycle));
            max_tier = max_tier.max(out.status.tier);
            issued.extend(out.issued);
        }

        assert!(max_tier >= RiskTier::Medium);
        assert!(max_tier < RiskTier::Critical);
        let breaks = issued
            .iter()
            .filter(|r| r.category == InterventionCategory::BreakSuggestion)
            .count();
        assert_eq!(breaks, 1);
        assert_eq!(engine.escalation_phase(), EscalationPhase::Idle);
    }

    #[test]
    fn test_no_signals_is_degraded_not_fatal() {
        let mut engine = engine();
        for cycle in 0..20 {
            let out = engine.run_cycle(at(cycle));
            assert!(out.status.is_degraded());
            assert!(out.status.faults.contains(&Fault::DegradedInput));
            assert_eq!(out.status.tier, RiskTier::Nominal);
        }
    }

    #[test]
    fn test_collision_escalates_and_suppresses_interventions() {
        let mut engine = engine();
        let handle = engine.handle();
        for cycle in 0..10 {
            push_all(&handle, healthy_samples(at(cycle)));
            engine.run_cycle(at(cycle));
        }

        handle.push_collision("static.pole", at(10), "collision_sensor").unwrap();
        handle.push_collision("static.pole", at(10), "imu").unwrap();
        push_all(&handle, healthy_samples(at(10)));
        let out = engine.run_cycle(at(10));

        assert_eq!(out.transition.map(|t| t.to), Some(RiskTier::Critical));
        assert_eq!(engine.escalation_phase(), EscalationPhase::Securing);
        assert!(out.commands.contains(&Command::Vehicle {
            command: VehicleCommand::HazardLights { on: true }
        }));
        assert!(out.issued.is_empty());
        let escalation = out.status.escalation.unwrap();
        assert_eq!(escalation.phase, EscalationPhase::Securing);
    }

    #[test]
    fn test_single_collision_sensor_secures_vehicle() {
        let mut engine = engine();
        let handle = engine.handle();
        for cycle in 0..10 {
            push_all(&handle, healthy_samples(at(cycle)));
            engine.run_cycle(at(cycle));
        }

        handle.push_collision("static.pole", at(10), "collision_sensor").unwrap();
        let mut commands = Vec::new();
        for cycle in 10..30 {
            push_all(&handle, healthy_samples(at(cycle)));
            commands.extend(engine.run_cycle(at(cycle)).commands);
        }

        assert_eq!(engine.escalation_phase(), EscalationPhase::Securing);
        assert!(commands.contains(&Command::Vehicle {
            command: VehicleCommand::HazardLights { on: true }
        }));
    }

    #[test]
    fn test_override_through_handle_cancels_before_calling() {
        let mut engine = engine();
        let handle = engine.handle();
        handle.push_collision("vehicle.tesla.model3", at(0), "collision_sensor").unwrap();
        handle.push_collision("vehicle.tesla.model3", at(0), "imu").unwrap();

        let mut commands = Vec::new();
        let mut archived = None;
        for cycle in 0..150 {
            push_all(&handle, healthy_samples(at(cycle)));
            if cycle == 40 {
                handle.driver_response(DriverResponse::cancel(OverrideMethod::Manual, at(40)));
            }
            let out = engine.run_cycle(at(cycle));
            commands.extend(out.commands);
            if out.archived.is_some() {
                archived = out.archived;
            }
        }

        let case = archived.unwrap();
        assert!(matches!(
            case.resolution,
            Some(crate::escalation::CaseResolution::FalseAlarm { .. })
        ));
        assert!(!commands
            .iter()
            .any(|c| matches!(c, Command::TransmitPackage { .. })));
        assert_eq!(engine.escalation_phase(), EscalationPhase::Idle);
    }

    #[test]
    fn test_acknowledge_closes_open_intervention() {
        let mut engine = engine();
        let handle = engine.handle();
        let mut cycle = 0;
        while engine.selector().open_records().count() == 0 && cycle < 600 {
            push_all(&handle, drowsy_samples(at(cycle)));
            engine.run_cycle(at(cycle));
            cycle += 1;
        }
        assert!(engine.selector().open_records().count() > 0);

        handle.driver_response(DriverResponse::acknowledge(None, at(cycle)));
        push_all(&handle, drowsy_samples(at(cycle)));
        let out = engine.run_cycle(at(cycle));
        assert!(out.status.interventions.is_empty());
    }

    #[test]
    fn test_rollover_from_vehicle_state() {
        let mut engine = engine();
        let handle = engine.handle();
        push_all(&handle, healthy_samples(at(0)));
        handle.push_vehicle_state(VehicleState {
            timestamp: at(0),
            speed_kmh: 35.0,
            acceleration: 0.0,
            gear: 3,
            rpm: 2000.0,
            throttle: 0.2,
            brake: 0.0,
            location: None,
            rotation: crate::telemetry::Rotation { pitch: 0.0, yaw: 10.0, roll: 95.0 },
        });
        let out = engine.run_cycle(at(0));
        assert_eq!(out.status.tier, RiskTier::Critical);
        assert_eq!(engine.escalation_phase(), EscalationPhase::Assessing);
        assert_eq!(out.status.vehicle.map(|v| v.speed_kmh), Some(35.0));
    }

    #[test]
    fn test_invalid_samples_reported_in_status() {
        let mut engine = engine();
        let handle = engine.handle();
        assert!(handle
            .push_sample(SignalSample::scalar(SignalKind::HeartRate, 900.0, at(0), "cam"))
            .is_err());
        let out = engine.run_cycle(at(0));
        assert_eq!(out.status.invalid_samples, 1);
        assert!(out
            .status
            .faults
            .iter()
            .any(|f| matches!(f, Fault::InvalidSample { kind: SignalKind::HeartRate, .. })));
    }
}
