use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::app::config::{MonkeySettings, RunConfig};
use crate::app::devices::log_prefix;
use crate::app::dispatcher::DeviceJob;
use crate::app::error::JobFailure;
use crate::app::jobs::{shell_quote, RunSettings, TestJobRunner, VerdictPolicy};
use crate::app::models::Device;
use crate::app::monkey::MonkeyResultParser;

pub fn should_run_monkey(config: &RunConfig) -> bool {
    !config.monkey.skip
}

/// `monkey -v -v -v [options] <count>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonkeyCommand {
    pub event_count: u32,
    args: Vec<String>,
    flags: Vec<&'static str>,
}

impl MonkeyCommand {
    pub fn from_settings(settings: &MonkeySettings) -> Self {
        let mut args = Vec::new();
        if let Some(seed) = settings.seed {
            args.push(format!("-s {seed}"));
        }
        if let Some(throttle) = settings.throttle {
            args.push(format!("--throttle {throttle}"));
        }
        let percentages = [
            ("--pct-touch", settings.percent_touch),
            ("--pct-motion", settings.percent_motion),
            ("--pct-trackball", settings.percent_trackball),
            ("--pct-nav", settings.percent_nav),
            ("--pct-majornav", settings.percent_major_nav),
            ("--pct-syskeys", settings.percent_syskeys),
            ("--pct-appswitch", settings.percent_appswitch),
            ("--pct-anyevent", settings.percent_anyevent),
        ];
        for (name, value) in percentages {
            if let Some(value) = value {
                args.push(format!("{name} {value}"));
            }
        }
        for package in settings.packages.iter().filter(|p| !p.trim().is_empty()) {
            args.push(format!("-p {}", shell_quote(package.trim())));
        }
        for category in settings.categories.iter().filter(|c| !c.trim().is_empty()) {
            args.push(format!("-c {}", shell_quote(category.trim())));
        }

        let mut flags = Vec::new();
        let switches = [
            (settings.debug_no_events, "--dbg-no-events"),
            (settings.hprof, "--hprof"),
            (settings.ignore_crashes, "--ignore-crashes"),
            (settings.ignore_timeouts, "--ignore-timeouts"),
            (settings.ignore_security_exceptions, "--ignore-security-exceptions"),
            (settings.kill_process_after_error, "--kill-process-after-error"),
            (settings.monitor_native_crashes, "--monitor-native-crashes"),
        ];
        for (enabled, flag) in switches {
            if enabled {
                flags.push(flag);
            }
        }

        Self {
            event_count: settings.event_count,
            args,
            flags,
        }
    }

    pub fn shell_command(&self) -> String {
        let mut parts: Vec<String> = vec!["monkey -v -v -v".to_string()];
        parts.extend(self.args.iter().cloned());
        parts.extend(self.flags.iter().map(|flag| flag.to_string()));
        parts.push(self.event_count.to_string());
        parts.join(" ")
    }
}

pub struct MonkeyJob {
    runner: Arc<TestJobRunner>,
    command: MonkeyCommand,
    settings: RunSettings,
}

impl MonkeyJob {
    pub fn from_config(config: &RunConfig, runner: Arc<TestJobRunner>) -> Self {
        Self {
            runner,
            command: MonkeyCommand::from_settings(&config.monkey),
            settings: RunSettings {
                create_report: config.monkey.create_report,
                target_dir: PathBuf::from(&config.target_dir),
                suffix: String::new(),
                verdict: VerdictPolicy::ignoring_test_failures(config),
            },
        }
    }

    pub fn command(&self) -> &MonkeyCommand {
        &self.command
    }
}

impl DeviceJob for MonkeyJob {
    fn name(&self) -> &str {
        "monkey"
    }

    fn do_with_device(&self, device: &Device, trace_id: &str) -> Result<(), JobFailure> {
        info!(trace_id = %trace_id, serial = %device.serial, "{}Running ui monkey tests", log_prefix(device));
        let mut parser = MonkeyResultParser::new(self.command.event_count as usize);
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
