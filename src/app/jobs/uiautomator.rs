use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::app::config::{RunConfig, UiAutomatorSettings};
use crate::app::devices::log_prefix;
use crate::app::dispatcher::DeviceJob;
use crate::app::error::{AppError, JobFailure};
use crate::app::instrumentation::InstrumentationResultParser;
use crate::app::jobs::{shell_quote, RunSettings, TestJobRunner, VerdictPolicy};
use crate::app::models::Device;
use crate::app::protocol::{Metrics, TestIdentifier, TestRunListener};

pub const UIAUTOMATOR_RUN_NAME: &str = "ui uiautomator tests";
const SCREENSHOT_SUFFIX: &str = "_screenshot.png";

pub fn should_run_uiautomator(config: &RunConfig) -> bool {
    !config.uiautomator.skip
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiAutomatorCommand {
    pub jar_file: String,
    pub test_class_or_methods: Vec<String>,
    pub no_hup: bool,
    pub debug: bool,
}

impl UiAutomatorCommand {
    pub fn from_settings(settings: &UiAutomatorSettings, trace_id: &str) -> Result<Self, AppError> {
        let jar_file = settings.jar_file.trim();
        if jar_file.is_empty() {
            return Err(AppError::validation(
                "No uiautomator jar configured (uiautomator.jar_file)",
                trace_id,
            ));
        }
        Ok(Self {
            jar_file: jar_file.to_string(),
            test_class_or_methods: settings
                .test_class_or_methods
                .iter()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect(),
            no_hup: settings.no_hup,
            debug: settings.debug,
        })
    }

    pub fn shell_command(&self) -> String {
        let mut command = format!("uiautomator runtest {}", shell_quote(&self.jar_file));
        for class_or_method in &self.test_class_or_methods {
            command.push_str(" -c ");
            command.push_str(&shell_quote(class_or_method));
        }
        if self.no_hup {
            command.push_str(" --nohup");
        }
        if self.debug {
            command.push_str(" -e debug true");
        }
        command
    }
}

/// Captures the screen on the device whenever a test fails.
pub struct ScreenshotListener<'a> {
    runner: &'a TestJobRunner,
    device: &'a Device,
    directory: String,
    trace_id: &'a str,
    saved: Vec<String>,
}

impl<'a> ScreenshotListener<'a> {
    pub fn new(runner: &'a TestJobRunner, device: &'a Device, directory: &str, trace_id: &'a str) -> Self {
        Self {
            runner,
            device,
            directory: directory.trim_end_matches('/').to_string(),
            trace_id,
            saved: Vec::new(),
        }
    }

    pub fn saved(&self) -> &[String] {
        &self.saved
    }

    fn shell(&self, command: &str) -> bool {
        match self.runner.shell(self.device, command, self.trace_id) {
            Ok(_) => true,
            Err(err) => {
                warn!(
                    trace_id = %self.trace_id,
                    serial = %self.device.serial,
                    error = %err,
                    "{}screenshot command failed: {command}",
                    log_prefix(self.device)
                );
                false
            }
        }
    }

    fn capture(&mut self, test: &TestIdentifier, kind: &str) {
        let file_name = format!("{}_{kind}{SCREENSHOT_SUFFIX}", test.test_name);
        let path = format!("{}/{file_name}", self.directory);
        if self.shell(&format!("screencap -p {}", shell_quote(&path))) {
            info!(
                trace_id = %self.trace_id,
                serial = %self.device.serial,
                "{}    {file_name} saved.",
                log_prefix(self.device)
            );
            self.saved.push(path);
        }
    }
}

impl TestRunListener for ScreenshotListener<'_> {
    fn run_started(&mut self, _run_name: &str, _test_count: usize) {
        // Stale shots from a previous run would be confused with this one.
        self.shell(&format!("rm -f {}/*screenshot.png", self.directory));
        self.shell(&format!("mkdir {}", shell_quote(&self.directory)));
    }

    fn test_started(&mut self, _test: &TestIdentifier) {}

    fn test_failed(&mut self, test: &TestIdentifier, _trace: &str) {
        self.capture(test, "error");
    }

    fn test_assumption_failed(&mut self, test: &TestIdentifier, _trace: &str) {
        self.capture(test, "failure");
    }

    fn test_ignored(&mut self, _test: &TestIdentifier) {}

    fn test_ended(&mut self, _test: &TestIdentifier, _metrics: &Metrics) {}

    fn run_failed(&mut self, _message: &str) {}

    fn run_ended(&mut self, _elapsed_ms: u64, _metrics: &Metrics) {}
}

pub struct UiAutomatorJob {
    runner: Arc<TestJobRunner>,
    command: UiAutomatorCommand,
    settings: RunSettings,
    screenshots: Option<String>,
}

impl UiAutomatorJob {
    pub fn from_config(
        config: &RunConfig,
        runner: Arc<TestJobRunner>,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let settings = &config.uiautomator;
        Ok(Self {
            runner,
            command: UiAutomatorCommand::from_settings(settings, trace_id)?,
            settings: RunSettings {
                create_report: settings.create_report,
                target_dir: PathBuf::from(&config.target_dir),
                suffix: settings.report_suffix.clone(),
                verdict: VerdictPolicy::ignoring_test_failures(config),
            },
            screenshots: settings
                .take_screenshot_on_failure
                .then(|| settings.screenshots_path_on_device.clone()),
        })
    }

    pub fn command(&self) -> &UiAutomatorCommand {
        &self.command
    }
}

impl DeviceJob for UiAutomatorJob {
    fn name(&self) -> &str {
        "uiautomator"
    }

    fn do_with_device(&self, device: &Device, trace_id: &str) -> Result<(), JobFailure> {
        info!(
            trace_id = %trace_id,
            serial = %device.serial,
            "{}Running ui uiautomator tests in {}",
            log_prefix(device),
            self.command.jar_file
        );
        let mut parser = InstrumentationResultParser::new(UIAUTOMATOR_RUN_NAME);
        let command = self.command.shell_command();
        match &self.screenshots {
            Some(directory) => {
                let mut screenshots = ScreenshotListener::new(&self.runner, device, directory, trace_id);
                self.runner.run_shell_test(
                    device,
                    &command,
                    &mut parser,
                    &self.settings,
                    Some(&mut screenshots),
                    trace_id,
                )
            }
            None => self
                .runner
                .run_shell_test(device, &command, &mut parser, &self.settings, None, trace_id),
        }
    }
}
