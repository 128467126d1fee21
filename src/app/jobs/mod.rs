use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::runner::{CommandError, CommandRequest, CommandRunner};
use crate::app::config::{IgnoreSettings, RunConfig};
use crate::app::devices::log_prefix;
use crate::app::error::JobFailure;
use crate::app::models::Device;
use crate::app::protocol::{Fanout, ShellOutputParser, TestRunListener};
use crate::app::recorder::ResultRecorder;
use crate::app::report::{host_properties, report_path, ReportWriter};

pub mod deploy;
pub mod devices;
pub mod instrument;
pub mod monkey;
pub mod uiautomator;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub create_report: bool,
    pub target_dir: PathBuf,
    pub suffix: String,
    pub verdict: VerdictPolicy,
}

/// Which outcomes of a finished run are tolerated instead of failing the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerdictPolicy {
    pub tolerate_test_failures: bool,
    pub tolerate_run_failure: bool,
    pub tolerate_exceptions: bool,
}

impl VerdictPolicy {
    /// `test.fail_safe` covers every check of an instrumentation run.
    pub fn instrumentation(config: &RunConfig) -> Self {
        let fail_safe = config.test.fail_safe;
        Self {
            tolerate_test_failures: fail_safe,
            tolerate_run_failure: fail_safe,
            tolerate_exceptions: fail_safe,
        }
    }

    /// Monkey and uiautomator runs honour the ignore flag, but an incomplete run always fails.
    pub fn ignoring_test_failures(config: &RunConfig) -> Self {
        let ignore = config.ignore.test_failures;
        Self {
            tolerate_test_failures: ignore,
            tolerate_run_failure: false,
            tolerate_exceptions: ignore,
        }
    }
}

/// Device-side plumbing shared by every job kind: runs commands over adb, feeds test output
/// through a parser into a recorder, writes the report and turns the run into a verdict.
pub struct TestJobRunner {
    runner: Arc<dyn CommandRunner>,
    adb_program: String,
    command_timeout: Option<Duration>,
    query_timeout: Duration,
    ignore: IgnoreSettings,
    host_properties: BTreeMap<String, String>,
    writer: ReportWriter,
}

impl TestJobRunner {
    pub fn new(runner: Arc<dyn CommandRunner>, adb_program: impl Into<String>, config: &RunConfig) -> Self {
        Self {
            runner,
            adb_program: adb_program.into(),
            command_timeout: Some(Duration::from_secs(config.adb.command_timeout_secs))
                .filter(|timeout| !timeout.is_zero()),
            query_timeout: Duration::from_millis(config.adb.connection_timeout_ms),
            ignore: config.ignore,
            host_properties: host_properties(),
            writer: ReportWriter,
        }
    }

    pub fn with_host_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.host_properties = properties;
        self
    }

    pub fn adb_program(&self) -> &str {
        &self.adb_program
    }

    /// `adb -s <serial> <args>` bounded by the job timeout, e.g. `install`.
    pub fn adb(&self, device: &Device, args: &[&str], trace_id: &str) -> Result<String, CommandError> {
        let request = CommandRequest::adb(&self.adb_program, &device.serial, args)
            .with_timeout(self.command_timeout);
        self.runner
            .execute(&request, trace_id)
            .map(|output| output.stdout)
    }

    /// Short shell query bounded by the connection timeout.
    pub fn shell(&self, device: &Device, command: &str, trace_id: &str) -> Result<String, CommandError> {
        let request = CommandRequest::adb_shell(&self.adb_program, &device.serial, command)
            .with_timeout(Some(self.query_timeout));
        self.runner
            .execute(&request, trace_id)
            .map(|output| output.stdout)
    }

    /// Streams `command` through `parser` into a fresh recorder (plus `extra`, if given) and
    /// reports the verdict. Command errors win over test results; the report is written
    /// either way.
    pub fn run_shell_test(
        &self,
        device: &Device,
        command: &str,
        parser: &mut dyn ShellOutputParser,
        settings: &RunSettings,
        extra: Option<&mut dyn TestRunListener>,
        trace_id: &str,
    ) -> Result<(), JobFailure> {
        let prefix = log_prefix(device);
        info!(trace_id = %trace_id, serial = %device.serial, "{prefix}Running {command}");

        let mut recorder = ResultRecorder::new(device, self.ignore, trace_id);
        let request = CommandRequest::adb_shell(&self.adb_program, &device.serial, command)
            .with_timeout(self.command_timeout);

        let command_error = {
            let mut listeners: Vec<&mut dyn TestRunListener> = Vec::with_capacity(2);
            listeners.push(&mut recorder);
            if let Some(extra) = extra {
                listeners.push(extra);
            }
            let mut fanout = Fanout::new(listeners);
            let result = self.runner.execute_streaming(
                &request,
                &mut |line| parser.process_line(line, &mut fanout),
                trace_id,
            );
            let command_error = result.err();
            if let Some(err) = &command_error {
                warn!(trace_id = %trace_id, serial = %device.serial, error = %err, "{prefix}test command failed");
                parser.handle_run_failed(&err.to_string(), &mut fanout);
            }
            parser.done(&mut fanout);
            command_error
        };

        if settings.create_report {
            let document = recorder.build_report_document(&self.host_properties);
            let path = report_path(&settings.target_dir, recorder.descriptive_name(), &settings.suffix);
            if let Err(err) = self.writer.write(&document, &path, trace_id) {
                recorder.record_exception(format!("Failed to write test report: {}", err.error));
            }
        }

        if let Some(err) = command_error {
            return Err(err.into_job_failure(&device.serial));
        }
        verdict(device, &recorder, settings.verdict)
    }
}

fn verdict(device: &Device, recorder: &ResultRecorder, policy: VerdictPolicy) -> Result<(), JobFailure> {
    let prefix = log_prefix(device);
    if recorder.has_failures_or_errors() && !policy.tolerate_test_failures {
        return Err(JobFailure::test_failure(
            &device.serial,
            format!("{prefix}Tests failed on device."),
        ));
    }
    if let Some(cause) = recorder.run_failure_cause() {
        if !policy.tolerate_run_failure {
            return Err(JobFailure::test_run_incomplete(
                &device.serial,
                format!("{prefix}Test run failed to complete: {cause}"),
            ));
        }
    }
    if recorder.threw_exception() && !policy.tolerate_exceptions {
        return Err(JobFailure::io(
            &device.serial,
            format!("{prefix}{}", recorder.exception_messages().join("; ")),
        ));
    }
    Ok(())
}

/// Quotes `value` for the device shell unless it is made of safe characters only.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "._-/#,:=@%+".contains(ch));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}
