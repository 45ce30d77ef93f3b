use super::{
    CaseResolution, CauseKind, CommState, EmergencyDataPackage, EscalationCase, EscalationCause,
    EscalationPhase, SessionProfile,
};
use crate::config::{ms, EscalationConfig};
use crate::error::Fault;
use crate::telemetry::VehicleState;
use crate::types::{
    ActuatorReport, Command, DecelerationProfile, DeliveryReport, DriverResponse, Inbound,
    OverrideMethod, ResponseKind, RiskTier, SignalSample, VehicleCommand,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Everything the machine looks at in one cycle
#[derive(Debug, Clone, Copy)]
pub struct EscalationInput<'a> {
    pub now: DateTime<Utc>,
    pub tier: RiskTier,
    /// Composite score, `None` while fusion is degraded
    pub score: Option<f64>,
    /// Critical-event samples that arrived this cycle
    pub events: &'a [SignalSample],
    /// Driver responses and collaborator reports received since the last cycle
    pub inbound: &'a [Inbound],
    pub vehicle: Option<&'a VehicleState>,
    pub profile: &'a SessionProfile,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct EscalationOutput {
    pub commands: Vec<Command>,
    pub faults: Vec<Fault>,
    /// Case resolved this cycle, ready for the case log
    pub archived: Option<EscalationCase>,
}

pub struct EscalationMachine {
    config: EscalationConfig,
    /// Composite scores below this qualify as Critical
    critical_below: f64,
    case: Option<EscalationCase>,
    /// After a driver cancel, score-only triggers wait for one healthy reading
    rearm_required: bool,
}

/// Most severe critical event among the samples, as a case cause
fn most_severe(events: &[SignalSample]) -> Option<EscalationCause> {
    events
        .iter()
        .filter_map(|s| s.as_critical().map(|e| (s, e)))
        .max_by_key(|(_, e)| CauseKind::from(e.event))
        .map(|(sample, event)| EscalationCause {
            kind: event.event.into(),
            detected_at: sample.timestamp,
            source_id: Some(sample.source_id.clone()),
            collided_with: event.collided_with,
            score: None,
        })
}

fn securement_commands(cause: CauseKind) -> [VehicleCommand; 3] {
    let profile = match cause {
        CauseKind::Collision | CauseKind::Rollover => DecelerationProfile::Firm,
        CauseKind::CriticalTier | CauseKind::NoResponse => DecelerationProfile::Controlled,
    };
    [
        VehicleCommand::HazardLights { on: true },
        VehicleCommand::Decelerate { profile },
        VehicleCommand::LaneHold { engage: true },
    ]
}

const RELEASE_COMMANDS: [VehicleCommand; 3] = [
    VehicleCommand::HazardLights { on: false },
    VehicleCommand::CancelDeceleration,
    VehicleCommand::LaneHold { engage: false },
];

enum DriverAction {
    Revert,
    FalseAlarm(OverrideMethod),
    None,
}

impl EscalationMachine {
    pub fn new(config: EscalationConfig, critical_below: f64) -> Self {
        Self {
            config,
            critical_below,
            case: None,
            rearm_required: false,
        }
    }

    pub fn case(&self) -> Option<&EscalationCase> {
        self.case.as_ref()
    }

    pub fn phase(&self) -> EscalationPhase {
        self.case
            .as_ref()
            .map(|c| c.phase)
            .unwrap_or(EscalationPhase::Idle)
    }

    /// A case is open past Idle
    pub fn is_active(&self) -> bool {
        self.case.is_some()
    }

    /// Advance one decision cycle
    pub fn step(&mut self, input: &EscalationInput<'_>) -> EscalationOutput {
        let mut out = EscalationOutput::default();

        for message in input.inbound {
            match message {
                Inbound::Driver(response) => self.on_driver(response, input.now, &mut out),
                Inbound::Delivery(report) => self.on_delivery(report, input.now, &mut out),
                Inbound::Actuator(report) => self.on_actuator(report, &mut out),
                Inbound::ResponderAck { case_id, .. } => {
                    self.on_responder_ack(*case_id, input.now, &mut out)
                }
            }
        }

        let qualifying = input.score.map(|s| s < self.critical_below);
        if qualifying == Some(false) {
            self.rearm_required = false;
        }

        if self.case.is_none() {
            self.maybe_open(input, qualifying);
        } else {
            self.maybe_supersede(input, &mut out);
        }
        self.count_samples(input, qualifying);
        self.advance(input, &mut out);
        out
    }

    fn maybe_open(&mut self, input: &EscalationInput<'_>, qualifying: Option<bool>) {
        let cause = match most_severe(input.events) {
            Some(cause) => cause,
            None if input.tier == RiskTier::Critical
                && qualifying == Some(true)
                && !self.rearm_required =>
            {
                EscalationCause {
                    kind: CauseKind::CriticalTier,
                    detected_at: input.now,
                    source_id: None,
                    collided_with: None,
                    score: input.score,
                }
            }
            None => return,
        };

        let mut case = EscalationCase {
            id: Uuid::new_v4(),
            cause,
            phase: EscalationPhase::Assessing,
            phase_deadline: input.now + ms(self.config.assessing_budget_ms),
            override_count: 0,
            data_package: None,
            comm: CommState::NotStarted,
            opened_at: input.now,
            timeline: Vec::new(),
            resolution: None,
            secure_by: None,
            override_until: None,
            call_at: None,
            driver_responsive: false,
            confirmations: 0,
            sources: BTreeSet::new(),
            awaiting_actuator: Vec::new(),
        };
        case.record(input.now, format!("opened: {}", case.cause.kind.incident_type()));
        tracing::warn!(
            case_id = %case.id,
            cause = ?case.cause.kind,
            tier = %input.tier,
            "Escalation case opened"
        );
        self.case = Some(case);
    }

    /// A strictly more severe cause updates the open case instead of
    /// opening a second one.
    fn maybe_supersede(&mut self, input: &EscalationInput<'_>, out: &mut EscalationOutput) {
        let Some(case) = self.case.as_mut() else {
            return;
        };
        let Some(cause) = most_severe(input.events).filter(|c| c.kind > case.cause.kind) else {
            return;
        };

        tracing::warn!(
            case_id = %case.id,
            from = ?case.cause.kind,
            to = ?cause.kind,
            "Escalation cause superseded"
        );
        let note = format!("superseded by {}", cause.kind.incident_type());
        case.cause = cause;
        case.confirmations = 0;
        case.sources.clear();
        if case.phase == EscalationPhase::Assessing {
            case.phase_deadline = input.now + ms(self.config.assessing_budget_ms);
            case.record(input.now, note);
        } else {
            case.record(input.now, note);
            enter_securing(&self.config, case, input.now, out);
        }
    }

    /// Count critical-qualifying samples toward confirmation
    fn count_samples(&mut self, input: &EscalationInput<'_>, qualifying: Option<bool>) {
        let Some(case) = self.case.as_mut() else {
            return;
        };
        if case.phase != EscalationPhase::Assessing {
            return;
        }
        if case.cause.kind.is_event() {
            let mut counted = false;
            for sample in input.events.iter().filter(|s| s.as_critical().is_some()) {
                case.confirmations += 1;
                case.sources.insert(sample.source_id.clone());
                counted = true;
            }
            // A cycle the classifier still reads as Critical is a further
            // qualifying sample, so a single-sensor event confirms on the next cycle
            if !counted && input.tier == RiskTier::Critical {
                case.confirmations += 1;
            }
        } else {
            match qualifying {
                Some(true) => case.confirmations += 1,
                // A non-qualifying reading breaks the run
                Some(false) => case.confirmations = 0,
                None => {}
            }
        }
    }

    fn advance(&mut self, input: &EscalationInput<'_>, out: &mut EscalationOutput) {
        let now = input.now;
        let config = &self.config;
        let Some(case) = self.case.as_mut() else {
            return;
        };

        check_securement(case, now, out);

        let mut resolution = None;
        match case.phase {
            EscalationPhase::Assessing => {
                let corroborated = case.sources.len() >= config.corroboration_sources;
                if corroborated || case.confirmations >= config.required_consecutive {
                    case.record(
                        now,
                        format!(
                            "confirmed: {} samples from {} sources",
                            case.confirmations,
                            case.sources.len()
                        ),
                    );
                    enter_securing(config, case, now, out);
                } else if now >= case.phase_deadline {
                    tracing::info!(
                        case_id = %case.id,
                        confirmations = case.confirmations,
                        "Assessment not confirmed, reverting to idle"
                    );
                    self.case = None;
                    return;
                }
            }
            EscalationPhase::Securing => {
                if case.call_at.is_some_and(|at| now >= at) {
                    match case.comm {
                        CommState::NotStarted => {
                            enter_calling(config, case, input, out);
                        }
                        CommState::InFlight { .. } | CommState::RetryPending { .. } => {
                            case.phase = EscalationPhase::Calling;
                            case.phase_deadline = now + ms(config.calling_budget_ms);
                            case.record(now, "calling resumed");
                        }
                        CommState::Delivered { .. }
                        | CommState::Failed { .. }
                        | CommState::Suppressed => enter_monitoring(config, case, now),
                    }
                }
            }
            EscalationPhase::Calling => {
                retry_if_due(case, now, out);
                if !matches!(case.comm, CommState::Delivered { .. }) && now >= case.phase_deadline {
                    tracing::warn!(case_id = %case.id, comm = case.comm.label(), "Calling deadline missed");
                    out.faults.push(Fault::PhaseDeadlineMissed {
                        case_id: case.id,
                        phase: EscalationPhase::Calling.to_string(),
                    });
                    enter_monitoring(config, case, now);
                }
            }
            EscalationPhase::Monitoring => {
                retry_if_due(case, now, out);
                let recovered = input.score.is_some_and(|s| s >= config.recovery_score);
                if case.driver_responsive && recovered {
                    resolution = Some(CaseResolution::Recovered);
                } else if now >= case.phase_deadline {
                    resolution = Some(CaseResolution::MonitoringTimeout);
                }
            }
            EscalationPhase::Idle | EscalationPhase::Resolved => {}
        }

        if let Some(resolution) = resolution {
            self.resolve(resolution, now, out);
        }
    }

    fn on_driver(&mut self, response: &DriverResponse, now: DateTime<Utc>, out: &mut EscalationOutput) {
        let action = {
            let Some(case) = self.case.as_mut() else {
                return;
            };
            case.driver_responsive = true;
            match response.kind {
                ResponseKind::Cancel { method } => {
                    case.override_count += 1;
                    let in_window = case.override_until.is_some_and(|until| response.at <= until);
                    match case.phase {
                        EscalationPhase::Assessing => DriverAction::Revert,
                        // The window holds whatever phase the case reached meanwhile
                        _ if in_window => DriverAction::FalseAlarm(method),
                        _ => {
                            tracing::info!(case_id = %case.id, ?method, "Override after window, driver marked responsive");
                            case.record(now, format!("late override ({method:?})"));
                            DriverAction::None
                        }
                    }
                }
                ResponseKind::Acknowledge { .. } => DriverAction::None,
            }
        };

        match action {
            DriverAction::Revert => {
                if let Some(case) = self.case.take() {
                    tracing::info!(case_id = %case.id, "Driver cancelled during assessment");
                }
                self.rearm_required = true;
            }
            DriverAction::FalseAlarm(method) => {
                if let Some(case) = self.case.as_mut() {
                    if matches!(case.comm, CommState::InFlight { .. }) {
                        out.commands.push(Command::AbortTransmission { case_id: case.id });
                    }
                    if !matches!(case.comm, CommState::Delivered { .. } | CommState::Failed { .. }) {
                        case.comm = CommState::Suppressed;
                    }
                    case.awaiting_actuator.clear();
                    out.commands.extend(
                        RELEASE_COMMANDS
                            .iter()
                            .map(|command| Command::Vehicle { command: *command }),
                    );
                }
                self.rearm_required = true;
                self.resolve(CaseResolution::FalseAlarm { method }, now, out);
            }
            DriverAction::None => {}
        }
    }

    fn on_delivery(&mut self, report: &DeliveryReport, now: DateTime<Utc>, out: &mut EscalationOutput) {
        let config = &self.config;
        let Some(case) = self.case.as_mut().filter(|c| c.id == report.case_id) else {
            tracing::debug!(case_id = %report.case_id, "Delivery report for a closed case");
            return;
        };
        match case.comm {
            CommState::InFlight { attempt } if attempt == report.attempt => {}
            _ => return,
        }

        if report.delivered {
            tracing::info!(case_id = %case.id, attempt = report.attempt, "Emergency package delivered");
            case.comm = CommState::Delivered { attempt: report.attempt };
            case.record(now, format!("package delivered on attempt {}", report.attempt));
            if case.phase == EscalationPhase::Calling {
                enter_monitoring(config, case, now);
            }
        } else if report.attempt < config.max_transmit_attempts {
            tracing::warn!(
                case_id = %case.id,
                attempt = report.attempt,
                error = report.error.as_deref().unwrap_or("unknown"),
                "Emergency package transmission failed, retrying"
            );
            case.comm = CommState::RetryPending {
                next_attempt: report.attempt + 1,
                at: now + ms(config.retry_backoff_ms),
            };
        } else {
            tracing::error!(
                case_id = %case.id,
                attempts = report.attempt,
                "Emergency package could not be delivered"
            );
            case.comm = CommState::Failed { attempts: report.attempt };
            case.record(now, "comm failed");
            out.faults.push(Fault::CommFailure {
                case_id: case.id,
                attempts: report.attempt,
            });
            if case.phase == EscalationPhase::Calling {
                enter_monitoring(config, case, now);
            }
        }
    }

    fn on_actuator(&mut self, report: &ActuatorReport, out: &mut EscalationOutput) {
        if let Some(case) = self.case.as_mut() {
            case.awaiting_actuator.retain(|c| *c != report.command);
        }
        if !report.applied {
            tracing::warn!(
                command = %report.command.label(),
                error = report.error.as_deref().unwrap_or("unknown"),
                "Vehicle command not applied"
            );
            out.faults.push(Fault::ActuatorUnavailable {
                command: report.command.label(),
            });
        }
    }

    fn on_responder_ack(&mut self, case_id: Option<Uuid>, now: DateTime<Utc>, out: &mut EscalationOutput) {
        let matches = self.case.as_ref().is_some_and(|case| {
            case_id.map_or(true, |id| id == case.id)
                && matches!(case.phase, EscalationPhase::Calling | EscalationPhase::Monitoring)
        });
        if matches {
            self.resolve(CaseResolution::ResponderAcknowledged, now, out);
        }
    }

    fn resolve(&mut self, resolution: CaseResolution, now: DateTime<Utc>, out: &mut EscalationOutput) {
        let Some(mut case) = self.case.take() else {
            return;
        };
        case.phase = EscalationPhase::Resolved;
        case.phase_deadline = now;
        case.resolution = Some(resolution);
        case.record(now, format!("resolved: {resolution:?}"));
        tracing::info!(
            case_id = %case.id,
            ?resolution,
            overrides = case.override_count,
            comm = case.comm.label(),
            "Escalation case resolved"
        );
        out.archived = Some(case);
    }
}

fn enter_securing(config: &EscalationConfig, case: &mut EscalationCase, now: DateTime<Utc>, out: &mut EscalationOutput) {
    case.phase = EscalationPhase::Securing;
    case.phase_deadline = now + ms(config.securing_budget_ms);
    case.override_until = Some(now + ms(config.override_window_ms));
    if case.comm == CommState::NotStarted {
        case.call_at = Some(now + ms(config.calling_delay_ms));
    }

    if case.secure_by.is_none() {
        case.secure_by = Some(now + ms(config.securing_budget_ms));
        let commands = securement_commands(case.cause.kind);
        case.awaiting_actuator = commands.to_vec();
        out.commands
            .extend(commands.iter().map(|command| Command::Vehicle { command: *command }));
    }
    case.record(now, "securing");
    tracing::warn!(case_id = %case.id, cause = ?case.cause.kind, "Securing vehicle");
}

fn enter_calling(config: &EscalationConfig, case: &mut EscalationCase, input: &EscalationInput<'_>, out: &mut EscalationOutput) {
    case.phase = EscalationPhase::Calling;
    case.phase_deadline = input.now + ms(config.calling_budget_ms);
    case.data_package = Some(EmergencyDataPackage::assemble(
        case.id,
        &case.cause,
        input.profile,
        input.vehicle,
        input.now,
    ));
    case.record(input.now, "calling");
    tracing::warn!(case_id = %case.id, "Transmitting emergency data package");
    transmit(case, 1, out);
}

fn enter_monitoring(config: &EscalationConfig, case: &mut EscalationCase, now: DateTime<Utc>) {
    case.phase = EscalationPhase::Monitoring;
    case.phase_deadline = now + ms(config.monitoring_budget_ms);
    case.record(now, "monitoring");
    tracing::info!(case_id = %case.id, comm = case.comm.label(), "Monitoring driver");
}

fn transmit(case: &mut EscalationCase, attempt: u32, out: &mut EscalationOutput) {
    if let Some(package) = case.data_package.clone() {
        case.comm = CommState::InFlight { attempt };
        out.commands.push(Command::TransmitPackage {
            case_id: case.id,
            attempt,
            package,
        });
    }
}

fn retry_if_due(case: &mut EscalationCase, now: DateTime<Utc>, out: &mut EscalationOutput) {
    if let CommState::RetryPending { next_attempt, at } = case.comm {
        if now >= at {
            transmit(case, next_attempt, out);
        }
    }
}

/// Report securement commands the actuator never confirmed
fn check_securement(case: &mut EscalationCase, now: DateTime<Utc>, out: &mut EscalationOutput) {
    if case.awaiting_actuator.is_empty() || !case.secure_by.is_some_and(|by| now >= by) {
        return;
    }
    tracing::warn!(
        case_id = %case.id,
        unconfirmed = case.awaiting_actuator.len(),
        "Securement not confirmed in time"
    );
    case.awaiting_actuator.clear();
    out.faults.push(Fault::PhaseDeadlineMissed {
        case_id: case.id,
        phase: EscalationPhase::Securing.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::CaseLog;
    use crate::types::CriticalEventKind;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn at(cycle: i64) -> DateTime<Utc> {
        t0() + Duration::milliseconds(cycle * 100)
    }

    fn machine() -> EscalationMachine {
        EscalationMachine::new(EscalationConfig::default(), 30.0)
    }

    struct Cycle<'a> {
        tier: RiskTier,
        score: Option<f64>,
        events: &'a [SignalSample],
        inbound: &'a [Inbound],
    }

    fn quiet(tier: RiskTier) -> Cycle<'static> {
        Cycle { tier, score: Some(60.0), events: &[], inbound: &[] }
    }

    fn step(machine: &mut EscalationMachine, cycle: i64, c: Cycle<'_>) -> EscalationOutput {
        let profile = SessionProfile::default();
        machine.step(&EscalationInput {
            now: at(cycle),
            tier: c.tier,
            score: c.score,
            events: c.events,
            inbound: c.inbound,
            vehicle: None,
            profile: &profile,
        })
    }

    fn collision(cycle: i64, source: &str) -> SignalSample {
        SignalSample::critical(CriticalEventKind::Collision, at(cycle), source)
    }

    fn vehicle_commands(out: &EscalationOutput) -> Vec<VehicleCommand> {
        out.commands
            .iter()
            .filter_map(|c| match c {
                Command::Vehicle { command } => Some(*command),
                _ => None,
            })
            .collect()
    }

    fn transmissions(out: &EscalationOutput) -> Vec<u32> {
        out.commands
            .iter()
            .filter_map(|c| match c {
                Command::TransmitPackage { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect()
    }

    /// Open a collision case and confirm it with corroboration on cycle 0
    fn secured(machine: &mut EscalationMachine) -> EscalationOutput {
        let events = [collision(0, "imu"), collision(0, "airbag")];
        step(machine, 0, Cycle { tier: RiskTier::Critical, score: Some(90.0), events: &events, inbound: &[] })
    }

    #[test]
    fn test_corroborated_event_secures_immediately() {
        let mut m = machine();
        let out = secured(&mut m);
        assert_eq!(m.phase(), EscalationPhase::Securing);
        assert!(vehicle_commands(&out).contains(&VehicleCommand::HazardLights { on: true }));
        assert!(vehicle_commands(&out).contains(&VehicleCommand::LaneHold { engage: true }));
    }

    #[test]
    fn test_single_sensor_collision_secures_within_budget() {
        let mut m = machine();
        let events = [collision(0, "collision_sensor")];
        let mut commands = step(&mut m, 0, Cycle { tier: RiskTier::Critical, score: Some(90.0), events: &events, inbound: &[] }).commands;
        assert_eq!(m.phase(), EscalationPhase::Assessing);

        for cycle in 1..=20 {
            let mut held = quiet(RiskTier::Critical);
            held.score = Some(90.0);
            commands.extend(step(&mut m, cycle, held).commands);
        }
        assert_eq!(m.phase(), EscalationPhase::Securing);
        assert!(commands.contains(&Command::Vehicle {
            command: VehicleCommand::HazardLights { on: true }
        }));
        let case = m.case().unwrap();
        let secured_at = case.timeline.iter().find(|e| e.note == "securing").unwrap().at;
        assert!(secured_at - case.opened_at <= Duration::seconds(2));
    }

    #[test]
    fn test_repeated_event_from_one_source_confirms() {
        let mut m = machine();
        let first = [collision(0, "imu")];
        step(&mut m, 0, Cycle { tier: RiskTier::Critical, score: Some(90.0), events: &first, inbound: &[] });
        assert_eq!(m.phase(), EscalationPhase::Assessing);

        for cycle in 1..3 {
            step(&mut m, cycle, quiet(RiskTier::High));
        }
        assert_eq!(m.phase(), EscalationPhase::Assessing);
        let second = [collision(3, "imu")];
        let out = step(&mut m, 3, Cycle { tier: RiskTier::Critical, score: Some(90.0), events: &second, inbound: &[] });
        assert_eq!(m.phase(), EscalationPhase::Securing);
        assert!(vehicle_commands(&out).contains(&VehicleCommand::HazardLights { on: true }));
    }

    #[test]
    fn test_event_the_classifier_drops_reverts() {
        let mut m = machine();
        let events = [collision(0, "imu")];
        let mut commands = step(&mut m, 0, Cycle { tier: RiskTier::Critical, score: Some(90.0), events: &events, inbound: &[] }).commands;
        for cycle in 1..=25 {
            commands.extend(step(&mut m, cycle, quiet(RiskTier::Nominal)).commands);
        }
        assert_eq!(m.phase(), EscalationPhase::Idle);
        assert!(commands.is_empty());
    }

    #[test]
    fn test_single_critical_reading_does_not_escalate() {
        let mut m = machine();
        step(&mut m, 0, Cycle { tier: RiskTier::Critical, score: Some(25.0), events: &[], inbound: &[] });
        assert_eq!(m.phase(), EscalationPhase::Assessing);
        step(&mut m, 1, Cycle { tier: RiskTier::Critical, score: Some(40.0), events: &[], inbound: &[] });
        step(&mut m, 2, Cycle { tier: RiskTier::Critical, score: Some(25.0), events: &[], inbound: &[] });
        assert_eq!(m.phase(), EscalationPhase::Assessing);

        let out = step(&mut m, 3, Cycle { tier: RiskTier::Critical, score: Some(24.0), events: &[], inbound: &[] });
        assert_eq!(m.phase(), EscalationPhase::Securing);
        assert_eq!(vehicle_commands(&out)[1], VehicleCommand::Decelerate { profile: DecelerationProfile::Controlled });
    }

    #[test]
    fn test_override_during_securing_is_false_alarm() {
        let mut m = machine();
        secured(&mut m);
        let mut sent = Vec::new();
        for cycle in 1..40 {
            sent.extend(transmissions(&step(&mut m, cycle, quiet(RiskTier::Critical))));
        }

        let cancel = [Inbound::Driver(DriverResponse::cancel(OverrideMethod::Voice, at(40)))];
        let out = step(&mut m, 40, Cycle { tier: RiskTier::Critical, score: Some(60.0), events: &[], inbound: &cancel });
        let case = out.archived.clone().unwrap();
        assert_eq!(case.resolution, Some(CaseResolution::FalseAlarm { method: OverrideMethod::Voice }));
        assert_eq!(case.comm, CommState::Suppressed);
        assert_eq!(vehicle_commands(&out), RELEASE_COMMANDS.to_vec());
        assert_eq!(m.phase(), EscalationPhase::Idle);

        for cycle in 41..200 {
            sent.extend(transmissions(&step(&mut m, cycle, quiet(RiskTier::Critical))));
        }
        assert!(sent.is_empty());
    }

    #[test]
    fn test_override_aborts_inflight_transmission() {
        let mut m = machine();
        secured(&mut m);
        let mut sent = Vec::new();
        for cycle in 1..=60 {
            sent.extend(transmissions(&step(&mut m, cycle, quiet(RiskTier::Critical))));
        }
        assert_eq!(sent, vec![1]);
        assert_eq!(m.phase(), EscalationPhase::Calling);

        let cancel = [Inbound::Driver(DriverResponse::cancel(OverrideMethod::Manual, at(61)))];
        let out = step(&mut m, 61, Cycle { tier: RiskTier::Critical, score: Some(60.0), events: &[], inbound: &cancel });
        let case_id = out.archived.as_ref().unwrap().id;
        assert!(out.commands.contains(&Command::AbortTransmission { case_id }));
    }

    #[test]
    fn test_comm_failure_after_three_attempts() {
        let mut m = machine();
        secured(&mut m);
        let mut attempts = Vec::new();
        let mut faults = Vec::new();
        let mut released = false;
        let mut pending: Option<(i64, u32)> = None;

        for cycle in 1..=120 {
            let mut inbound = Vec::new();
            if let Some((due, attempt)) = pending {
                if cycle == due {
                    let case_id = m.case().unwrap().id;
                    inbound.push(Inbound::Delivery(DeliveryReport {
                        case_id,
                        attempt,
                        delivered: false,
                        error: Some("network unreachable".into()),
                        at: at(cycle),
                    }));
                    pending = None;
                }
            }
            let out = step(&mut m, cycle, Cycle { tier: RiskTier::Critical, score: Some(20.0), events: &[], inbound: &inbound });
            for attempt in transmissions(&out) {
                attempts.push(attempt);
                pending = Some((cycle + 1, attempt));
            }
            released |= vehicle_commands(&out).contains(&VehicleCommand::CancelDeceleration);
            faults.extend(out.faults);
        }

        assert_eq!(attempts, vec![1, 2, 3]);
        let case = m.case().unwrap();
        assert!(faults.contains(&Fault::CommFailure { case_id: case.id, attempts: 3 }));
        assert_eq!(case.comm, CommState::Failed { attempts: 3 });
        assert_eq!(case.phase, EscalationPhase::Monitoring);
        assert!(!released);
    }

    #[test]
    fn test_override_in_window_after_fast_delivery_is_false_alarm() {
        let mut m = machine();
        secured(&mut m);
        for cycle in 1..=50 {
            step(&mut m, cycle, quiet(RiskTier::Critical));
        }
        let case_id = m.case().unwrap().id;
        let delivered = [Inbound::Delivery(DeliveryReport { case_id, attempt: 1, delivered: true, error: None, at: at(51) })];
        step(&mut m, 51, Cycle { tier: RiskTier::Critical, score: Some(40.0), events: &[], inbound: &delivered });
        assert_eq!(m.phase(), EscalationPhase::Monitoring);
        for cycle in 52..70 {
            step(&mut m, cycle, quiet(RiskTier::Critical));
        }

        let cancel = [Inbound::Driver(DriverResponse::cancel(OverrideMethod::Manual, at(70)))];
        let out = step(&mut m, 70, Cycle { tier: RiskTier::Critical, score: Some(40.0), events: &[], inbound: &cancel });
        let case = out.archived.clone().unwrap();
        assert_eq!(case.resolution, Some(CaseResolution::FalseAlarm { method: OverrideMethod::Manual }));
        // Already delivered, so nothing is left to suppress
        assert_eq!(case.comm, CommState::Delivered { attempt: 1 });
        assert_eq!(vehicle_commands(&out), RELEASE_COMMANDS.to_vec());
        assert_eq!(m.phase(), EscalationPhase::Idle);
    }

    #[test]
    fn test_late_override_marks_responsive_then_recovers() {
        let mut m = machine();
        secured(&mut m);
        for cycle in 1..=60 {
            step(&mut m, cycle, quiet(RiskTier::Critical));
        }
        let case_id = m.case().unwrap().id;
        let delivered = [Inbound::Delivery(DeliveryReport { case_id, attempt: 1, delivered: true, error: None, at: at(61) })];
        step(&mut m, 61, Cycle { tier: RiskTier::Critical, score: Some(40.0), events: &[], inbound: &delivered });
        assert_eq!(m.phase(), EscalationPhase::Monitoring);

        let cancel = [Inbound::Driver(DriverResponse::cancel(OverrideMethod::Biometric, at(120)))];
        let out = step(&mut m, 120, Cycle { tier: RiskTier::High, score: Some(40.0), events: &[], inbound: &cancel });
        assert!(out.archived.is_none());
        assert_eq!(m.case().unwrap().override_count, 1);

        let out = step(&mut m, 121, Cycle { tier: RiskTier::Low, score: Some(75.0), events: &[], inbound: &[] });
        assert_eq!(out.archived.unwrap().resolution, Some(CaseResolution::Recovered));
    }

    #[test]
    fn test_more_severe_cause_supersedes_without_resending() {
        let mut m = machine();
        secured(&mut m);
        let mut sent = Vec::new();
        for cycle in 1..=60 {
            sent.extend(transmissions(&step(&mut m, cycle, quiet(RiskTier::Critical))));
        }
        let case_id = m.case().unwrap().id;
        let delivered = [Inbound::Delivery(DeliveryReport { case_id, attempt: 1, delivered: true, error: None, at: at(61) })];
        step(&mut m, 61, Cycle { tier: RiskTier::Critical, score: Some(40.0), events: &[], inbound: &delivered });

        let rollover = [SignalSample::critical(CriticalEventKind::Rollover, at(70), "vehicle_state")];
        step(&mut m, 70, Cycle { tier: RiskTier::Critical, score: Some(40.0), events: &rollover, inbound: &[] });
        let case = m.case().unwrap();
        assert_eq!(case.id, case_id);
        assert_eq!(case.cause.kind, CauseKind::Rollover);

        for cycle in 71..200 {
            sent.extend(transmissions(&step(&mut m, cycle, quiet(RiskTier::Critical))));
        }
        assert_eq!(sent, vec![1]);
        assert_eq!(m.phase(), EscalationPhase::Monitoring);
    }

    #[test]
    fn test_responder_ack_resolves() {
        let mut m = machine();
        secured(&mut m);
        for cycle in 1..=55 {
            step(&mut m, cycle, quiet(RiskTier::Critical));
        }
        let ack = [Inbound::ResponderAck { case_id: None, at: at(56) }];
        let out = step(&mut m, 56, Cycle { tier: RiskTier::Critical, score: Some(20.0), events: &[], inbound: &ack });
        assert_eq!(out.archived.unwrap().resolution, Some(CaseResolution::ResponderAcknowledged));
    }

    #[test]
    fn test_unconfirmed_securement_reported() {
        let mut m = machine();
        secured(&mut m);
        let applied = [Inbound::Actuator(ActuatorReport {
            command: VehicleCommand::HazardLights { on: true },
            applied: true,
            error: None,
            at: at(1),
        })];
        step(&mut m, 1, Cycle { tier: RiskTier::Critical, score: Some(60.0), events: &[], inbound: &applied });

        let mut faults = Vec::new();
        for cycle in 2..=90 {
            faults.extend(step(&mut m, cycle, quiet(RiskTier::Critical)).faults);
        }
        let missed: Vec<_> = faults
            .iter()
            .filter(|f| matches!(f, Fault::PhaseDeadlineMissed { phase, .. } if phase == "securing"))
            .collect();
        assert_eq!(missed.len(), 1);
    }

    #[test]
    fn test_cancel_rearms_score_trigger() {
        let mut m = machine();
        step(&mut m, 0, Cycle { tier: RiskTier::Critical, score: Some(20.0), events: &[], inbound: &[] });
        let cancel = [Inbound::Driver(DriverResponse::cancel(OverrideMethod::Manual, at(1)))];
        step(&mut m, 1, Cycle { tier: RiskTier::Critical, score: Some(20.0), events: &[], inbound: &cancel });
        assert_eq!(m.phase(), EscalationPhase::Idle);

        step(&mut m, 2, Cycle { tier: RiskTier::Critical, score: Some(20.0), events: &[], inbound: &[] });
        assert_eq!(m.phase(), EscalationPhase::Idle);

        step(&mut m, 3, Cycle { tier: RiskTier::Critical, score: Some(45.0), events: &[], inbound: &[] });
        step(&mut m, 4, Cycle { tier: RiskTier::Critical, score: Some(20.0), events: &[], inbound: &[] });
        assert_eq!(m.phase(), EscalationPhase::Assessing);
    }

    #[test]
    fn test_archived_case_round_trips_through_log() {
        let mut m = machine();
        secured(&mut m);
        let cancel = [Inbound::Driver(DriverResponse::cancel(OverrideMethod::Voice, at(5)))];
        let out = step(&mut m, 5, Cycle { tier: RiskTier::Critical, score: Some(60.0), events: &[], inbound: &cancel });
        let case = out.archived.unwrap();

        let path = std::env::temp_dir().join(format!("wellness-cases-{}.ndjson", Uuid::new_v4()));
        let log = CaseLog::new(&path);
        log.append(&case).unwrap();
        let restored = log.read_all().unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id, case.id);
        assert_eq!(restored[0].timeline, case.timeline);
    }

    proptest! {
        #[test]
        fn prop_override_in_window_is_false_alarm(cancel_cycle in 1i64..100) {
            let mut m = machine();
            secured(&mut m);
            for cycle in 1..cancel_cycle {
                step(&mut m, cycle, quiet(RiskTier::Critical));
            }
            let cancel = [Inbound::Driver(DriverResponse::cancel(OverrideMethod::Manual, at(cancel_cycle)))];
            let out = step(&mut m, cancel_cycle, Cycle { tier: RiskTier::Critical, score: Some(60.0), events: &[], inbound: &cancel });

            let case = out.archived.clone().unwrap();
            prop_assert_eq!(case.resolution, Some(CaseResolution::FalseAlarm { method: OverrideMethod::Manual }));
            prop_assert!(transmissions(&out).is_empty());
            prop_assert_eq!(case.comm, CommState::Suppressed);
        }
    }
}
