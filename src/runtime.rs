//! Async runtime
//!
//! Drives [`WellnessEngine`] on a fixed tokio interval and carries out the
//! engine's commands against async collaborators. Collaborator calls run
//! in spawned tasks that report back through the engine's inbox, so a slow
//! actuator or emergency channel never delays a cycle. In-flight package
//! transmissions are tracked per case so an override can abort them.
//! Archived cases are written to the case log on the blocking pool.

use crate::error::EngineError;
use crate::escalation::{CaseLog, EmergencyDataPackage, EscalationCase};
use crate::encoder::StatusEvent;
use crate::pipeline::{EngineHandle, SessionContext, WellnessEngine};
use crate::types::{ActuatorReport, Command, DeliveryReport, Inbound, VehicleCommand};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// Vehicle-control collaborator
#[async_trait]
pub trait VehicleActuator: Send + Sync {
    async fn apply(&self, command: VehicleCommand) -> Result<(), EngineError>;
}

/// Emergency-communication collaborator
#[async_trait]
pub trait EmergencyChannel: Send + Sync {
    async fn transmit(&self, package: &EmergencyDataPackage) -> Result<(), EngineError>;
}

/// Presentation/telemetry stream
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, event: &StatusEvent) -> Result<(), EngineError>;
}

/// Wall-clock time derived from the tokio clock, so paused-time tests
/// observe deadlines the same way production does
#[derive(Debug, Clone, Copy)]
pub struct EngineClock {
    started_at: DateTime<Utc>,
    origin: Instant,
}

impl EngineClock {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            origin: Instant::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.started_at + elapsed
    }
}

/// Carries out engine commands without blocking the decision loop
pub struct Dispatcher {
    handle: EngineHandle,
    clock: EngineClock,
    actuator: Arc<dyn VehicleActuator>,
    channel: Arc<dyn EmergencyChannel>,
    publisher: Arc<dyn StatusPublisher>,
    transmissions: HashMap<Uuid, JoinHandle<()>>,
    publishing: Option<JoinHandle<()>>,
    skipped_publishes: u64,
    case_log: Option<CaseLog>,
    /// Latest archive write; each write waits for the one before it
    archiving: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(
        handle: EngineHandle,
        clock: EngineClock,
        actuator: Arc<dyn VehicleActuator>,
        channel: Arc<dyn EmergencyChannel>,
        publisher: Arc<dyn StatusPublisher>,
    ) -> Self {
        Self {
            handle,
            clock,
            actuator,
            channel,
            publisher,
            transmissions: HashMap::new(),
            publishing: None,
            skipped_publishes: 0,
            case_log: None,
            archiving: None,
        }
    }

    pub fn with_case_log(mut self, log: CaseLog) -> Self {
        self.case_log = Some(log);
        self
    }

    pub fn dispatch(&mut self, commands: Vec<Command>) {
        self.transmissions.retain(|_, task| !task.is_finished());

        for command in commands {
            match command {
                Command::Vehicle { command } => {
                    let actuator = Arc::clone(&self.actuator);
                    let handle = self.handle.clone();
                    let clock = self.clock;
                    tokio::spawn(async move {
                        let result = actuator.apply(command).await;
                        handle.send(Inbound::Actuator(ActuatorReport {
                            command,
                            applied: result.is_ok(),
                            error: result.err().map(|e| e.to_string()),
                            at: clock.now(),
                        }));
                    });
                }
                Command::TransmitPackage {
                    case_id,
                    attempt,
                    package,
                } => {
                    let channel = Arc::clone(&self.channel);
                    let handle = self.handle.clone();
                    let clock = self.clock;
                    tracing::info!(case_id = %case_id, attempt, "Dispatching emergency package");
                    let task = tokio::spawn(async move {
                        let result = channel.transmit(&package).await;
                        handle.send(Inbound::Delivery(DeliveryReport {
                            case_id,
                            attempt,
                            delivered: result.is_ok(),
                            error: result.err().map(|e| e.to_string()),
                            at: clock.now(),
                        }));
                    });
                    if let Some(previous) = self.transmissions.insert(case_id, task) {
                        previous.abort();
                    }
                }
                Command::AbortTransmission { case_id } => {
                    if let Some(task) = self.transmissions.remove(&case_id) {
                        tracing::info!(case_id = %case_id, "Aborting in-flight transmission");
                        task.abort();
                    }
                }
            }
        }
    }

    /// Publish a status event unless the previous push is still pending
    pub fn publish(&mut self, event: StatusEvent) {
        if self.publishing.as_ref().is_some_and(|task| !task.is_finished()) {
            self.skipped_publishes += 1;
            tracing::debug!(cycle = event.cycle, "Previous status push still pending, skipping");
            return;
        }
        let publisher = Arc::clone(&self.publisher);
        self.publishing = Some(tokio::spawn(async move {
            if let Err(e) = publisher.publish(&event).await {
                tracing::warn!(cycle = event.cycle, error = %e, "Status publish failed");
            }
        }));
    }

    pub fn skipped_publishes(&self) -> u64 {
        self.skipped_publishes
    }

    /// Append a resolved case to the case log without blocking the loop
    pub fn archive(&mut self, case: EscalationCase) {
        let Some(log) = self.case_log.clone() else {
            return;
        };
        let previous = self.archiving.take();
        self.archiving = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let case_id = case.id;
            match tokio::task::spawn_blocking(move || log.append(&case)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(case_id = %case_id, error = %e, "Failed to archive escalation case")
                }
                Err(e) => {
                    tracing::error!(case_id = %case_id, error = %e, "Case archive task did not complete")
                }
            }
        }));
    }

    /// Wait for pending case-log writes
    async fn flush_archive(&mut self) {
        if let Some(task) = self.archiving.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Case archive task did not complete");
            }
        }
    }

    fn shutdown(&mut self) {
        for (case_id, task) in self.transmissions.drain() {
            tracing::warn!(case_id = %case_id, "Abandoning transmission at shutdown");
            task.abort();
        }
    }
}

/// Owns the engine and its collaborators for one session
pub struct Runtime {
    engine: WellnessEngine,
    dispatcher: Dispatcher,
    clock: EngineClock,
}

impl Runtime {
    pub fn new(
        engine: WellnessEngine,
        actuator: Arc<dyn VehicleActuator>,
        channel: Arc<dyn EmergencyChannel>,
        publisher: Arc<dyn StatusPublisher>,
    ) -> Self {
        let clock = EngineClock::start();
        let dispatcher = Dispatcher::new(engine.handle(), clock, actuator, channel, publisher);
        Self {
            engine,
            dispatcher,
            clock,
        }
    }

    pub fn with_case_log(mut self, log: CaseLog) -> Self {
        self.dispatcher = self.dispatcher.with_case_log(log);
        self
    }

    pub fn handle(&self) -> EngineHandle {
        self.engine.handle()
    }

    pub fn clock(&self) -> EngineClock {
        self.clock
    }

    /// Run cycles until `shutdown` completes, then hand the session back
    pub async fn run_until<F>(mut self, shutdown: F) -> SessionContext
    where
        F: Future<Output = ()>,
    {
        let period = Duration::from_millis(self.engine.config().cycle_ms);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.tick(),
            }
        }

        self.dispatcher.shutdown();
        self.dispatcher.flush_archive().await;
        if self.dispatcher.skipped_publishes() > 0 {
            tracing::info!(skipped = self.dispatcher.skipped_publishes(), "Status pushes skipped while a push was pending");
        }
        self.engine.finish()
    }

    fn tick(&mut self) {
        let output = self.engine.run_cycle(self.clock.now());
        if let Some(case) = output.archived {
            self.dispatcher.archive(case);
        }
        self.dispatcher.dispatch(output.commands);
        self.dispatcher.publish(output.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::DriverBaseline;
    use crate::config::EngineConfig;
    use crate::error::Fault;
    use crate::escalation::SessionProfile;
    use crate::types::{DriverResponse, OverrideMethod};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingActuator {
        applied: Mutex<Vec<VehicleCommand>>,
    }

    #[async_trait]
    impl VehicleActuator for RecordingActuator {
        async fn apply(&self, command: VehicleCommand) -> Result<(), EngineError> {
            self.applied.lock().push(command);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingChannel {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl EmergencyChannel for FailingChannel {
        async fn transmit(&self, _package: &EmergencyDataPackage) -> Result<(), EngineError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Collaborator("network unreachable".into()))
        }
    }

    /// Never completes; records when the transmission future is dropped
    #[derive(Default)]
    struct HangingChannel {
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EmergencyChannel for HangingChannel {
        async fn transmit(&self, _package: &EmergencyDataPackage) -> Result<(), EngineError> {
            let _flag = DropFlag(Arc::clone(&self.dropped));
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingPublisher {
        events: Mutex<Vec<StatusEvent>>,
    }

    #[async_trait]
    impl StatusPublisher for CollectingPublisher {
        async fn publish(&self, event: &StatusEvent) -> Result<(), EngineError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    fn engine() -> WellnessEngine {
        let now = Utc::now();
        let session = SessionContext::new(SessionProfile::default(), DriverBaseline::population("anonymous", now));
        WellnessEngine::new(EngineConfig::default(), session).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_comm_failure_retries_then_flags() {
        let actuator = Arc::new(RecordingActuator::default());
        let channel = Arc::new(FailingChannel::default());
        let publisher = Arc::new(CollectingPublisher::default());
        let runtime = Runtime::new(engine(), actuator.clone(), channel.clone(), publisher.clone());

        let handle = runtime.handle();
        let started = runtime.clock().started_at();
        handle.push_collision("vehicle.audi.a2", started, "collision_sensor").unwrap();
        handle.push_collision("vehicle.audi.a2", started, "imu").unwrap();

        runtime.run_until(tokio::time::sleep(Duration::from_secs(9))).await;

        assert_eq!(channel.attempts.load(Ordering::SeqCst), 3);
        assert!(actuator
            .applied
            .lock()
            .contains(&VehicleCommand::HazardLights { on: true }));
        let events = publisher.events.lock();
        assert!(events
            .iter()
            .flat_map(|e| e.faults.iter())
            .any(|f| matches!(f, Fault::CommFailure { attempts: 3, .. })));
        // Securement is never released by a comm failure
        assert!(!actuator.applied.lock().contains(&VehicleCommand::CancelDeceleration));
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_aborts_transmission() {
        let actuator = Arc::new(RecordingActuator::default());
        let channel = Arc::new(HangingChannel::default());
        let dropped = Arc::clone(&channel.dropped);
        let publisher = Arc::new(CollectingPublisher::default());
        let runtime = Runtime::new(engine(), actuator.clone(), channel, publisher);

        let handle = runtime.handle();
        let clock = runtime.clock();
        handle.push_collision("static.pole", clock.started_at(), "collision_sensor").unwrap();
        handle.push_collision("static.pole", clock.started_at(), "imu").unwrap();

        let responder = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(7_000)).await;
            responder.driver_response(DriverResponse::cancel(OverrideMethod::Voice, clock.now()));
        });

        let session = runtime.run_until(tokio::time::sleep(Duration::from_secs(9))).await;
        tokio::task::yield_now().await;

        assert!(dropped.load(Ordering::SeqCst));
        assert!(actuator.applied.lock().contains(&VehicleCommand::CancelDeceleration));
        assert_eq!(session.profile.driver_id, "anonymous");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_sensor_case_archived_off_loop() {
        let actuator = Arc::new(RecordingActuator::default());
        let channel = Arc::new(HangingChannel::default());
        let publisher = Arc::new(CollectingPublisher::default());
        let path = std::env::temp_dir().join(format!("wellness-runtime-cases-{}.ndjson", Uuid::new_v4()));
        let runtime = Runtime::new(engine(), actuator.clone(), channel, publisher)
            .with_case_log(CaseLog::new(&path));

        let handle = runtime.handle();
        let clock = runtime.clock();
        handle.push_collision("static.pole", clock.started_at(), "collision_sensor").unwrap();

        let responder = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3_000)).await;
            responder.driver_response(DriverResponse::cancel(OverrideMethod::Manual, clock.now()));
        });

        runtime.run_until(tokio::time::sleep(Duration::from_secs(5))).await;

        assert!(actuator.applied.lock().contains(&VehicleCommand::HazardLights { on: true }));
        let cases = CaseLog::new(&path).read_all().unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(cases.len(), 1);
        assert!(matches!(
            cases[0].resolution,
            Some(crate::escalation::CaseResolution::FalseAlarm { method: OverrideMethod::Manual })
        ));
    }
}
