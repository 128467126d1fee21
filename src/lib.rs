pub mod app;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use uuid::Uuid;

use app::adb::bridge::AdbBridge;
use app::adb::locator::{resolve_adb_program, validate_adb_program};
use app::adb::runner::{CommandRunner, SystemCommandRunner};
use app::config::{apply_property_overrides, config_path, load_config_from_path, validate_config, RunConfig};
use app::devices::{AdbDeviceBackend, DeviceRegistry, DeviceSelector, RegistryTimeouts};
use app::dispatcher::{do_with_devices, DeviceJob, DeviceJobDispatcher, DispatchSummary};
use app::error::AppError;
use app::jobs::deploy::{DeployJob, UndeployJob};
use app::jobs::devices::DevicesJob;
use app::jobs::instrument::{should_run_tests, InstrumentJob};
use app::jobs::monkey::{should_run_monkey, MonkeyJob};
use app::jobs::uiautomator::{should_run_uiautomator, UiAutomatorJob};
use app::jobs::TestJobRunner;
use app::logging::init_logging;

const USAGE: &str = "Usage: droidrun <instrument|uiautomator|monkey|deploy <apk>|undeploy <package>|devices> [--config PATH] [--device SERIAL]... [--device-threads N] [--target DIR] [--ignore-failures] [--json] [-Dkey=value]...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Instrument,
    UiAutomator,
    Monkey,
    Deploy(PathBuf),
    Undeploy(String),
    Devices,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    pub command: Command,
    pub config_path: Option<PathBuf>,
    pub devices: Vec<String>,
    pub device_threads: Option<usize>,
    pub target_dir: Option<String>,
    pub ignore_failures: bool,
    pub json: bool,
    /// `-Dkey=value` pairs, applied like flat properties in the config file.
    pub properties: serde_json::Map<String, serde_json::Value>,
}

pub fn parse_args<I>(args: I) -> Result<CliArgs, String>
where
    I: IntoIterator<Item = String>,
{
    let mut command: Option<Command> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut devices = Vec::new();
    let mut device_threads: Option<usize> = None;
    let mut target_dir: Option<String> = None;
    let mut ignore_failures = false;
    let mut json = false;
    let mut properties = serde_json::Map::new();

    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--config requires a value".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            "--device" => {
                let value = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| "--device requires a value".to_string())?;
                devices.push(value);
            }
            "--device-threads" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--device-threads requires a value".to_string())?;
                let threads = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| format!("--device-threads expects a number, got '{value}'"))?;
                device_threads = Some(threads);
            }
            "--target" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--target requires a value".to_string())?;
                target_dir = Some(value);
            }
            "--ignore-failures" => {
                ignore_failures = true;
            }
            "--json" => {
                json = true;
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other if other.starts_with("-D") => {
                let body = &other[2..];
                let (key, value) = body.split_once('=').unwrap_or((body, ""));
                if key.trim().is_empty() {
                    return Err(format!("Invalid property: {other}"));
                }
                properties.insert(
                    key.trim().to_string(),
                    serde_json::Value::String(value.to_string()),
                );
            }
            other if other.starts_with('-') => return Err(format!("Unknown arg: {other}")),
            other if command.is_none() => {
                command = Some(match other {
                    "instrument" => Command::Instrument,
                    "uiautomator" => Command::UiAutomator,
                    "monkey" => Command::Monkey,
                    "devices" => Command::Devices,
                    "deploy" => {
                        let apk = it
                            .next()
                            .ok_or_else(|| "deploy requires an APK path".to_string())?;
                        Command::Deploy(PathBuf::from(apk))
                    }
                    "undeploy" => {
                        let package = it
                            .next()
                            .ok_or_else(|| "undeploy requires a package name".to_string())?;
                        Command::Undeploy(package)
                    }
                    unknown => return Err(format!("Unknown command: {unknown}\n{USAGE}")),
                });
            }
            other => return Err(format!("Unexpected argument: {other}")),
        }
    }

    let command = command.ok_or_else(|| USAGE.to_string())?;
    Ok(CliArgs {
        command,
        config_path,
        devices,
        device_threads,
        target_dir,
        ignore_failures,
        json,
        properties,
    })
}

/// Config file first, then `-D` properties, then dedicated flags.
pub fn resolve_config(args: &CliArgs, trace_id: &str) -> Result<RunConfig, AppError> {
    let path = args.config_path.clone().unwrap_or_else(config_path);
    let mut config = load_config_from_path(&path, trace_id)?;
    if !args.properties.is_empty() {
        config = apply_property_overrides(config, &serde_json::Value::Object(args.properties.clone()));
    }
    if !args.devices.is_empty() {
        config.device.devices = args.devices.clone();
    }
    if let Some(threads) = args.device_threads {
        config.device.device_threads = threads;
    }
    if let Some(target) = &args.target_dir {
        config.target_dir = target.clone();
    }
    if args.ignore_failures {
        config.ignore.test_failures = true;
        config.ignore.test_errors = true;
    }
    Ok(validate_config(config))
}

fn should_run(command: &Command, config: &RunConfig, trace_id: &str) -> Result<bool, AppError> {
    match command {
        Command::Instrument => should_run_tests(config, trace_id),
        Command::UiAutomator => Ok(should_run_uiautomator(config)),
        Command::Monkey => Ok(should_run_monkey(config)),
        Command::Deploy(_) | Command::Undeploy(_) | Command::Devices => Ok(true),
    }
}

fn build_job(
    command: &Command,
    config: &RunConfig,
    runner: Arc<TestJobRunner>,
    trace_id: &str,
) -> Result<Arc<dyn DeviceJob>, AppError> {
    let job: Arc<dyn DeviceJob> = match command {
        Command::Instrument => Arc::new(InstrumentJob::from_config(config, runner, trace_id)?),
        Command::UiAutomator => Arc::new(UiAutomatorJob::from_config(config, runner, trace_id)?),
        Command::Monkey => Arc::new(MonkeyJob::from_config(config, runner)),
        Command::Deploy(apk) => Arc::new(DeployJob::new(runner, apk.as_path(), trace_id)?),
        Command::Undeploy(package) => Arc::new(UndeployJob::new(runner, package, trace_id)?),
        Command::Devices => Arc::new(DevicesJob),
    };
    Ok(job)
}

/// Runs one command against the connected devices. `Ok(None)` when the command is skipped.
pub fn execute(
    args: &CliArgs,
    config: &RunConfig,
    runner: Arc<dyn CommandRunner>,
    adb_program: &str,
    trace_id: &str,
) -> Result<Option<DispatchSummary>, AppError> {
    if !should_run(&args.command, config, trace_id)? {
        info!(trace_id = %trace_id, command = ?args.command, "skipping, disabled by configuration");
        return Ok(None);
    }

    let job_runner = Arc::new(TestJobRunner::new(runner.clone(), adb_program, config));
    let job = build_job(&args.command, config, job_runner, trace_id)?;

    let backend = AdbDeviceBackend::new(
        runner,
        adb_program,
        AdbBridge::shared(),
        Duration::from_millis(config.adb.connection_timeout_ms),
    );
    let registry = DeviceRegistry::new(
        Arc::new(backend),
        RegistryTimeouts {
            initial_list_timeout: Duration::from_millis(config.adb.initial_device_list_timeout_ms),
            ..RegistryTimeouts::default()
        },
    );
    let selector = DeviceSelector::from_values(&config.device.devices);
    let dispatcher = DeviceJobDispatcher::new(config.device.device_threads);

    let summary = do_with_devices(&registry, &selector, &dispatcher, job, trace_id)?;
    summary.log_summary(trace_id);
    Ok(Some(summary))
}

fn print_summary(summary: &DispatchSummary) {
    match serde_json::to_string_pretty(summary) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("Failed to serialize summary: {err}"),
    }
}

fn run_with(args: CliArgs) -> Result<(), AppError> {
    let trace_id = Uuid::new_v4().to_string();
    let config = resolve_config(&args, &trace_id)?;
    init_logging(&config.log_level);
    let config_file = args.config_path.clone().unwrap_or_else(config_path);
    info!(
        trace_id = %trace_id,
        command = ?args.command,
        config = %config_file.display(),
        "droidrun starting"
    );

    let adb_program = resolve_adb_program(&config.adb.command_path);
    validate_adb_program(&adb_program, &trace_id)?;
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);

    let Some(summary) = execute(&args, &config, runner, &adb_program, &trace_id)? else {
        return Ok(());
    };
    if args.json {
        print_summary(&summary);
    }
    summary.into_result(&trace_id).map(|_| ())
}

/// Process entry point; returns the exit code.
pub fn run() -> i32 {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            return 2;
        }
    };
    match run_with(args) {
        Ok(()) => 0,
        Err(err) => {
            error!(trace_id = %err.trace_id, code = %err.code, "{}", err.error);
            eprintln!("{err}");
            1
        }
    }
}
