//! Wellness CLI - Command-line interface for the driver wellness engine
//!
//! Commands:
//! - replay: Drive the engine over a recorded session on a simulated clock
//! - validate: Validate replay record schema
//! - doctor: Diagnose configuration, baselines and case log
//! - schema: Describe the input and output schemas

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use driver_wellness::escalation::CaseLog;
use driver_wellness::schema::{ReplayAdapter, ReplayEvent, ReplayRecord, REPLAY_SCHEMA_VERSION};
use driver_wellness::encoder::{StatusEvent, STATUS_SCHEMA};
use driver_wellness::types::{ActuatorReport, Command, DeliveryReport, Inbound};
use driver_wellness::{
    BaselineStore, EngineConfig, EngineError, SessionContext, SessionProfile, WellnessEngine,
    ENGINE_VERSION, PRODUCER_NAME,
};

/// Wellness - Closed-loop driver wellness and emergency escalation engine
#[derive(Parser)]
#[command(name = "wellness")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Fuse driver signals into wellness status, interventions and escalations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded session through the engine (simulated clock)
    Replay {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        /// Engine configuration (JSON); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Session profile (JSON): driver, vehicle, occupants, medical history
        #[arg(long)]
        profile: Option<PathBuf>,

        /// Baseline store; loaded before and saved after the session
        #[arg(long)]
        baselines: Option<PathBuf>,

        /// Append archived escalation cases to this NDJSON file
        #[arg(long)]
        case_log: Option<PathBuf>,

        /// Number of package transmissions the simulated channel fails
        #[arg(long, default_value = "0")]
        comm_failures: u32,

        /// Keep cycling this long after the last record (seconds)
        #[arg(long, default_value = "30")]
        tail_secs: u64,

        /// Emit every Nth status event (transitions and escalations are always emitted)
        #[arg(long, default_value = "1")]
        every: u64,
    },

    /// Validate replay record schema
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration, baselines and case log
    Doctor {
        /// Check engine configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Check baselines file
        #[arg(long)]
        baselines: Option<PathBuf>,

        /// Check case log file
        #[arg(long)]
        case_log: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print schema information
    Schema {
        /// Schema to print (input or output)
        #[arg(value_enum)]
        schema_type: SchemaType,

        /// Output as JSON schema
        #[arg(long)]
        json_schema: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one record per line)
    Ndjson,
    /// JSON array of records
    Json,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one status event per line)
    Ndjson,
    /// JSON array of status events
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

#[derive(Clone, ValueEnum)]
enum SchemaType {
    /// Input schema (wellness.replay.v1)
    Input,
    /// Output schema (wellness.status.v1)
    Output,
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so NDJSON on stdout stays clean
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), WellnessCliError> {
    match cli.command {
        Commands::Replay {
            input,
            output,
            input_format,
            output_format,
            config,
            profile,
            baselines,
            case_log,
            comm_failures,
            tail_secs,
            every,
        } => cmd_replay(ReplayOptions {
            input,
            output,
            input_format,
            output_format,
            config,
            profile,
            baselines,
            case_log,
            comm_failures,
            tail: Duration::seconds(tail_secs as i64),
            every: every.max(1),
        }),

        Commands::Validate {
            input,
            input_format,
            json,
        } => cmd_validate(&input, input_format, json),

        Commands::Doctor {
            config,
            baselines,
            case_log,
            json,
        } => cmd_doctor(config.as_deref(), baselines.as_deref(), case_log.as_deref(), json),

        Commands::Schema { schema_type, json_schema } => cmd_schema(schema_type, json_schema),
    }
}

struct ReplayOptions {
    input: PathBuf,
    output: PathBuf,
    input_format: InputFormat,
    output_format: OutputFormat,
    config: Option<PathBuf>,
    profile: Option<PathBuf>,
    baselines: Option<PathBuf>,
    case_log: Option<PathBuf>,
    comm_failures: u32,
    tail: Duration,
    every: u64,
}

fn cmd_replay(options: ReplayOptions) -> Result<(), WellnessCliError> {
    let events = read_events(&options.input, &options.input_format)?;
    let failures = ReplayAdapter::validate_events(&events);
    if !failures.is_empty() {
        for failure in &failures {
            tracing::error!(index = failure.index, record = failure.record, error = %failure.error, "Invalid replay record");
        }
        return Err(WellnessCliError::ValidationFailed(failures.len()));
    }
    let (Some(first), Some(last)) = (events.first(), events.last()) else {
        return Err(WellnessCliError::NoEvents);
    };
    let (start, end) = (first.at, last.at + options.tail);

    let config = match &options.config {
        Some(path) => EngineConfig::from_json(&fs::read_to_string(path)?)?,
        None => EngineConfig::default(),
    };
    let profile = match &options.profile {
        Some(path) => SessionProfile::from_json(&fs::read_to_string(path)?)?,
        None => SessionProfile::default(),
    };
    let mut store = match &options.baselines {
        Some(path) => BaselineStore::load(path)?,
        None => BaselineStore::new(),
    };
    let baseline = store.session_for(&profile.driver_id, start, &config.baseline);
    let case_log = options.case_log.as_ref().map(CaseLog::new);

    let cycle = Duration::milliseconds(config.cycle_ms as i64);
    let mut engine = WellnessEngine::new(config, SessionContext::new(profile, baseline))?;
    let handle = engine.handle();
    let mut channel = SimulatedChannel {
        failures_left: options.comm_failures,
    };

    let mut statuses: Vec<StatusEvent> = Vec::new();
    let mut pending = events.into_iter().peekable();
    let mut now = start;
    let mut index: u64 = 0;

    while now <= end {
        while let Some(event) = pending.next_if(|e| e.at <= now) {
            deliver(&handle, event);
        }

        let out = engine.run_cycle(now);
        if let (Some(case), Some(log)) = (&out.archived, &case_log) {
            log.append(case)?;
        }
        for report in channel.carry_out(out.commands, now) {
            handle.send(report);
        }

        let notable = out.transition.is_some() || !out.issued.is_empty() || out.status.escalation.is_some();
        if notable || index % options.every == 0 {
            statuses.push(out.status);
        }

        index += 1;
        now += cycle;
    }

    let session = engine.finish();
    if let Some(path) = &options.baselines {
        store.store(session.baseline);
        store.save(path)?;
    }
    tracing::info!(cycles = index, emitted = statuses.len(), "Replay finished");

    let output_data = format_output(&statuses, &options.output_format)?;
    if options.output.to_string_lossy() == "-" {
        let mut stdout = io::stdout();
        write!(stdout, "{}", output_data)?;
        stdout.flush()?;
    } else {
        fs::write(&options.output, output_data)?;
    }

    Ok(())
}

fn deliver(handle: &driver_wellness::EngineHandle, event: ReplayEvent) {
    let result = match event.record {
        ReplayRecord::Sample { sample } => handle.push_sample(sample),
        ReplayRecord::VehicleState { state } => {
            handle.push_vehicle_state(state);
            Ok(())
        }
        ReplayRecord::Traffic { traffic } => {
            handle.push_traffic(traffic);
            Ok(())
        }
        ReplayRecord::Collision {
            actor_type_id,
            source_id,
        } => handle.push_collision(&actor_type_id, event.at, &source_id),
        ReplayRecord::Driver { response } => {
            handle.driver_response(response);
            Ok(())
        }
        ReplayRecord::ResponderAck { case_id } => {
            handle.send(Inbound::ResponderAck { case_id, at: event.at });
            Ok(())
        }
    };
    if let Err(e) = result {
        tracing::warn!(at = %event.at, error = %e, "Replay record rejected");
    }
}

/// Stand-in for the actuator and emergency channel during replay
struct SimulatedChannel {
    failures_left: u32,
}

impl SimulatedChannel {
    /// Every command completes by the next cycle
    fn carry_out(&mut self, commands: Vec<Command>, now: DateTime<Utc>) -> Vec<Inbound> {
        let mut reports = Vec::new();
        for command in commands {
            match command {
                Command::Vehicle { command } => {
                    tracing::info!(command = %command.label(), "Actuator applied");
                    reports.push(Inbound::Actuator(ActuatorReport {
                        command,
                        applied: true,
                        error: None,
                        at: now,
                    }));
                }
                Command::TransmitPackage { case_id, attempt, package } => {
                    let delivered = self.failures_left == 0;
                    if !delivered {
                        self.failures_left -= 1;
                    }
                    tracing::info!(
                        case_id = %case_id,
                        attempt,
                        incident = %package.incident_type,
                        delivered,
                        "Emergency package transmitted"
                    );
                    reports.push(Inbound::Delivery(DeliveryReport {
                        case_id,
                        attempt,
                        delivered,
                        error: (!delivered).then(|| "simulated network failure".to_string()),
                        at: now,
                    }));
                }
                Command::AbortTransmission { case_id } => {
                    tracing::info!(case_id = %case_id, "Transmission aborted");
                }
            }
        }
        reports
    }
}

fn cmd_validate(input: &Path, input_format: InputFormat, json: bool) -> Result<(), WellnessCliError> {
    let events = read_events(input, &input_format)?;
    let results = ReplayAdapter::validate_events(&events);

    let report = ValidationReport {
        total_records: events.len(),
        valid_records: events.len() - results.len(),
        invalid_records: results.len(),
        errors: results
            .iter()
            .map(|r| ValidationErrorDetail {
                index: r.index,
                record: r.record.to_string(),
                error: r.error.to_string(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total records:   {}", report.total_records);
        println!("Valid records:   {}", report.valid_records);
        println!("Invalid records: {}", report.invalid_records);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!("  - {} record (index {}): {}", err.record, err.index, err.error);
            }
        }
    }

    if report.invalid_records > 0 {
        Err(WellnessCliError::ValidationFailed(report.invalid_records))
    } else {
        Ok(())
    }
}

fn cmd_doctor(
    config: Option<&Path>,
    baselines: Option<&Path>,
    case_log: Option<&Path>,
    json: bool,
) -> Result<(), WellnessCliError> {
    let mut checks = vec![
        DoctorCheck {
            name: "engine_version".to_string(),
            status: CheckStatus::Ok,
            message: format!("Engine version {}", ENGINE_VERSION),
        },
        DoctorCheck {
            name: "schema_version".to_string(),
            status: CheckStatus::Ok,
            message: format!("Input schema: {}, output schema: {}", REPLAY_SCHEMA_VERSION, STATUS_SCHEMA),
        },
    ];

    if let Some(path) = config {
        let check = match fs::read_to_string(path).map_err(EngineError::from).and_then(|c| EngineConfig::from_json(&c)) {
            Ok(config) => DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Ok,
                message: format!("Configuration valid (cycle {} ms)", config.cycle_ms),
            },
            Err(e) => DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Error,
                message: format!("Invalid configuration: {}", e),
            },
        };
        checks.push(check);
    }

    if let Some(path) = baselines {
        let check = if !path.exists() {
            DoctorCheck {
                name: "baselines".to_string(),
                status: CheckStatus::Warning,
                message: "Baselines file does not exist (population baseline will be used)".to_string(),
            }
        } else {
            match BaselineStore::load(path) {
                Ok(store) => DoctorCheck {
                    name: "baselines".to_string(),
                    status: CheckStatus::Ok,
                    message: format!("Baselines file valid ({} drivers)", store.driver_count()),
                },
                Err(e) => DoctorCheck {
                    name: "baselines".to_string(),
                    status: CheckStatus::Error,
                    message: format!("Cannot load baselines: {}", e),
                },
            }
        };
        checks.push(check);
    }

    if let Some(path) = case_log {
        let check = match CaseLog::new(path).read_all() {
            Ok(cases) => DoctorCheck {
                name: "case_log".to_string(),
                status: CheckStatus::Ok,
                message: format!("Case log readable ({} archived cases)", cases.len()),
            },
            Err(e) => DoctorCheck {
                name: "case_log".to_string(),
                status: CheckStatus::Error,
                message: format!("Cannot read case log: {}", e),
            },
        };
        checks.push(check);
    }

    // Check stdin is available (for piped replay)
    let stdin_message = if atty::is(atty::Stream::Stdin) {
        "stdin is a TTY (interactive mode)"
    } else {
        "stdin is a pipe (replay from stdin ready)"
    };
    checks.push(DoctorCheck {
        name: "stdin".to_string(),
        status: CheckStatus::Ok,
        message: stdin_message.to_string(),
    });

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: ENGINE_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Wellness Doctor Report");
        println!("======================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(WellnessCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn cmd_schema(schema_type: SchemaType, json_schema: bool) -> Result<(), WellnessCliError> {
    match schema_type {
        SchemaType::Input => {
            if json_schema {
                println!("{}", get_input_json_schema());
            } else {
                println!("Input Schema: {}", REPLAY_SCHEMA_VERSION);
                println!();
                println!("Each line carries schema_version, at (delivery time) and a record type:");
                println!();
                println!("1. sample - One feature sample {{ kind, value, confidence, timestamp, source_id }}");
                println!("   - eye_closure, blink_rate, yawn, head_pose, gaze, emotion, heart_rate");
                println!("   - steering_stability, speed_consistency, lane_deviation, critical_event");
                println!();
                println!("2. vehicle_state - Raw telemetry {{ speed_kmh, throttle, brake, location, rotation, ... }}");
                println!("3. traffic - Nearby vehicle count {{ timestamp, nearby_vehicles, radius_m? }}");
                println!("4. collision - Collision sensor report {{ actor_type_id, source_id }}");
                println!("5. driver - Driver response {{ response: cancel|acknowledge, ... }}");
                println!("6. responder_ack - External responder acknowledged {{ case_id? }}");
            }
        }
        SchemaType::Output => {
            if json_schema {
                println!("{}", get_output_json_schema());
            } else {
                println!("Output Schema: {}", STATUS_SCHEMA);
                println!();
                println!("One status event per decision cycle:");
                println!();
                println!("- producer: {{ name, version, instance_id }}");
                println!("- session_id, driver_id, cycle, at");
                println!("- fusion: {{ status, composite, composite_trend, fatigue, stress, attention }}");
                println!("- tier, tier_entered_at");
                println!("- interventions: open intervention records");
                println!("- escalation: {{ case_id, phase, cause, phase_deadline, override_until, comm }} or null");
                println!("- stale, faults, invalid_samples");
                println!("- vehicle: {{ speed_kmh, anomaly, location, nearby_vehicles }} when known");
            }
        }
    }

    Ok(())
}

// Helper functions

fn read_events(input: &Path, format: &InputFormat) -> Result<Vec<ReplayEvent>, WellnessCliError> {
    let input_data = if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(input)?
    };

    let events = match format {
        InputFormat::Ndjson => ReplayAdapter::parse_ndjson(&input_data)?,
        InputFormat::Json => ReplayAdapter::parse_array(&input_data)?,
    };
    Ok(events)
}

fn format_output(statuses: &[StatusEvent], format: &OutputFormat) -> Result<String, WellnessCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut lines: Vec<String> = Vec::new();
            for status in statuses {
                lines.push(serde_json::to_string(status)?);
            }
            Ok(lines.join("\n") + "\n")
        }
        OutputFormat::Json => Ok(serde_json::to_string(statuses)?),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(statuses)?),
    }
}

fn get_input_json_schema() -> String {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": REPLAY_SCHEMA_VERSION,
        "description": "Recorded driver session for replay",
        "type": "object",
        "required": ["schema_version", "at", "record"],
        "properties": {
            "schema_version": { "type": "string", "const": REPLAY_SCHEMA_VERSION },
            "at": { "type": "string", "format": "date-time" },
            "record": {
                "type": "string",
                "enum": ["sample", "vehicle_state", "traffic", "collision", "driver", "responder_ack"]
            },
            "sample": {
                "type": "object",
                "required": ["kind", "value", "confidence", "timestamp", "source_id"]
            },
            "state": { "type": "object", "required": ["timestamp", "speed_kmh"] },
            "traffic": { "type": "object", "required": ["timestamp", "nearby_vehicles"] },
            "actor_type_id": { "type": "string" },
            "source_id": { "type": "string" },
            "response": { "type": "object", "required": ["response", "at"] },
            "case_id": { "type": "string", "format": "uuid" }
        }
    })
    .to_string()
}

fn get_output_json_schema() -> String {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": STATUS_SCHEMA,
        "description": "Driver wellness status event",
        "type": "object",
        "required": ["schema", "producer", "session_id", "cycle", "at", "fusion", "tier", "faults"],
        "properties": {
            "schema": { "type": "string", "const": STATUS_SCHEMA },
            "producer": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "version": { "type": "string" },
                    "instance_id": { "type": "string" }
                }
            },
            "fusion": {
                "type": "object",
                "properties": {
                    "status": { "type": "string", "enum": ["OK", "DEGRADED"] },
                    "composite": { "type": ["number", "null"] },
                    "composite_trend": { "type": ["number", "null"] }
                }
            },
            "tier": { "type": "string", "enum": ["nominal", "low", "medium", "high", "critical"] },
            "interventions": { "type": "array", "items": { "type": "object" } },
            "escalation": { "type": ["object", "null"] },
            "faults": { "type": "array", "items": { "type": "object" } }
        }
    })
    .to_string()
}

// Error types

#[derive(Debug)]
enum WellnessCliError {
    Io(io::Error),
    Engine(EngineError),
    Json(serde_json::Error),
    NoEvents,
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for WellnessCliError {
    fn from(e: io::Error) -> Self {
        WellnessCliError::Io(e)
    }
}

impl From<EngineError> for WellnessCliError {
    fn from(e: EngineError) -> Self {
        WellnessCliError::Engine(e)
    }
}

impl From<serde_json::Error> for WellnessCliError {
    fn from(e: serde_json::Error) -> Self {
        WellnessCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<WellnessCliError> for CliError {
    fn from(e: WellnessCliError) -> Self {
        match e {
            WellnessCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            WellnessCliError::Engine(EngineError::Config(msg)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: msg,
                hint: Some("Run 'wellness doctor --config <path>' for details".to_string()),
            },
            WellnessCliError::Engine(e) => CliError {
                code: "ENGINE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some(format!("Ensure input matches {} schema", REPLAY_SCHEMA_VERSION)),
            },
            WellnessCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            WellnessCliError::NoEvents => CliError {
                code: "NO_EVENTS".to_string(),
                message: "No replay records found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            WellnessCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} records failed validation", count),
                hint: Some("Run 'wellness validate' for details".to_string()),
            },
            WellnessCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    total_records: usize,
    valid_records: usize,
    invalid_records: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    index: usize,
    record: String,
    error: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
