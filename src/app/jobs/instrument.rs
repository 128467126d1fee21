use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::app::config::{RunConfig, TestSkip};
use crate::app::dispatcher::DeviceJob;
use crate::app::error::{AppError, JobFailure};
use crate::app::instrumentation::InstrumentationResultParser;
use crate::app::jobs::{shell_quote, RunSettings, TestJobRunner, VerdictPolicy};
use crate::app::models::Device;

pub const DEFAULT_INSTRUMENTATION_RUNNER: &str = "androidx.test.runner.AndroidJUnitRunner";

/// Resolves the skip setting. `auto` runs when there is something to instrument.
pub fn should_run_tests(config: &RunConfig, trace_id: &str) -> Result<bool, AppError> {
    match TestSkip::parse(&config.test.skip) {
        Some(TestSkip::Skip) => Ok(false),
        Some(TestSkip::Run) => Ok(true),
        Some(TestSkip::Auto) => Ok(!config.test.instrumentation_package.trim().is_empty()),
        None => Err(AppError::validation(
            format!(
                "android.test.skip must be configured as 'true', 'false' or 'auto', got '{}'",
                config.test.skip
            ),
            trace_id,
        )),
    }
}

/// `am instrument -r -w` invocation for one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationCommand {
    pub package: String,
    pub runner: String,
    /// Ordered `-e key value` pairs.
    pub args: Vec<(String, String)>,
}

impl InstrumentationCommand {
    pub fn from_config(config: &RunConfig, trace_id: &str) -> Result<Self, AppError> {
        let test = &config.test;
        let package = test.instrumentation_package.trim();
        if package.is_empty() {
            return Err(AppError::validation(
                "No instrumentation package configured (test.instrumentation_package)",
                trace_id,
            ));
        }
        if !test.classes.is_empty() && !test.packages.is_empty() {
            return Err(AppError::validation(
                "test.classes and test.packages are mutually exclusive. They cannot be specified at the same time. Please specify either classes or packages. For details, see http://developer.android.com/guide/developing/testing/testing_otheride.html",
                trace_id,
            ));
        }
        let runner = if test.instrumentation_runner.trim().is_empty() {
            DEFAULT_INSTRUMENTATION_RUNNER.to_string()
        } else {
            test.instrumentation_runner.trim().to_string()
        };

        let mut args: Vec<(String, String)> = Vec::new();
        if !test.classes.is_empty() {
            args.push(("class".to_string(), test.classes.join(",")));
        }
        if !test.packages.is_empty() {
            args.push(("package".to_string(), test.packages.join(",")));
        }
        if !test.annotations.is_empty() {
            args.push(("annotation".to_string(), test.annotations.join(",")));
        }
        if !test.exclude_annotations.is_empty() {
            args.push(("notAnnotation".to_string(), test.exclude_annotations.join(",")));
        }
        if !test.test_size.trim().is_empty() {
            let size = test.test_size.trim().to_lowercase();
            if !matches!(size.as_str(), "small" | "medium" | "large") {
                return Err(AppError::validation(
                    format!("test.test_size must be small, medium or large, got '{}'", test.test_size),
                    trace_id,
                ));
            }
            args.push(("size".to_string(), size));
        }
        if test.debug {
            args.push(("debug".to_string(), "true".to_string()));
        }
        if test.coverage {
            args.push(("coverage".to_string(), "true".to_string()));
            if !test.coverage_file.trim().is_empty() {
                args.push(("coverageFile".to_string(), test.coverage_file.trim().to_string()));
            }
        }
        if test.log_only {
            args.push(("log".to_string(), "true".to_string()));
        }
        for raw in &test.instrumentation_args {
            let Some((key, value)) = raw.trim().split_once(' ') else {
                return Err(AppError::validation(
                    format!("Instrumentation argument '{raw}' must be of the form 'key value'"),
                    trace_id,
                ));
            };
            args.push((key.to_string(), value.trim().to_string()));
        }

        Ok(Self {
            package: package.to_string(),
            runner,
            args,
        })
    }

    pub fn shell_command(&self) -> String {
        let mut command = String::from("am instrument -r -w");
        for (key, value) in &self.args {
            command.push_str(" -e ");
            command.push_str(&shell_quote(key));
            command.push(' ');
            command.push_str(&shell_quote(value));
        }
        command.push(' ');
        command.push_str(&shell_quote(&format!("{}/{}", self.package, self.runner)));
        command
    }
}

pub struct InstrumentJob {
    runner: Arc<TestJobRunner>,
    command: InstrumentationCommand,
    settings: RunSettings,
}

impl InstrumentJob {
    pub fn from_config(
        config: &RunConfig,
        runner: Arc<TestJobRunner>,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        Ok(Self {
            runner,
            command: InstrumentationCommand::from_config(config, trace_id)?,
            settings: RunSettings {
                create_report: config.test.create_report,
                target_dir: PathBuf::from(&config.target_dir),
                suffix: config.test.report_suffix.clone(),
                verdict: VerdictPolicy::instrumentation(config),
            },
        })
    }

    pub fn command(&self) -> &InstrumentationCommand {
        &self.command
    }
}

impl DeviceJob for InstrumentJob {
    fn name(&self) -> &str {
        "instrument"
    }

    fn do_with_device(&self, device: &Device, trace_id: &str) -> Result<(), JobFailure> {
        info!(
            trace_id = %trace_id,
            serial = %device.serial,
            package = %self.command.package,
            runner = %self.command.runner,
            "running instrumentation tests"
        );
        let mut parser = InstrumentationResultParser::new(&self.command.package);
        self.runner.run_shell_test(
            device,
            &self.command.shell_command(),
            &mut parser,
            &self.settings,
            None,
            trace_id,
        )
    }
}
