use std::time::Instant;

use tracing::debug;

use crate::app::protocol::{Metrics, ShellOutputParser, TestIdentifier, TestRunListener};

pub const MONKEY_RUN_NAME: &str = "ui monkey tests";
pub const MONKEY_TEST_CLASS: &str = "MonkeyTest";

const CRASH_KEY: &str = "// CRASH:";
const BUILD_TIME_KEY: &str = "// Build Time:";
const EMPTY_KEY: &str = "//";
const SENDING_KEY: &str = ":Sending";
const SWITCHING_KEY: &str = ":Switch";
const MONKEY_KEY: &str = ":Monkey:";
const METRIC_KEYS: [(&str, &str); 5] = [
    ("// Short Msg:", "ShortMsg"),
    ("// Long Msg:", "LongMsg"),
    ("// Build Label:", "BuildLabel"),
    ("// Build Changelist:", "BuildChangeList"),
    (BUILD_TIME_KEY, "BuildTime"),
];

#[derive(Debug)]
enum CrashState {
    None,
    Header,
    Stack(Vec<String>),
}

/// Parses verbose `monkey -v -v -v` output. Every injected event or activity switch is a test
/// case; a crash report fails the current one.
pub struct MonkeyResultParser {
    event_count: usize,
    run_started_at: Option<Instant>,
    current: Option<TestIdentifier>,
    crash: CrashState,
    metrics: Metrics,
    finished: bool,
}

impl MonkeyResultParser {
    pub fn new(event_count: usize) -> Self {
        Self {
            event_count,
            run_started_at: None,
            current: None,
            crash: CrashState::None,
            metrics: Metrics::new(),
            finished: false,
        }
    }

    fn ensure_run_started(&mut self, listener: &mut dyn TestRunListener) {
        if self.run_started_at.is_none() {
            self.run_started_at = Some(Instant::now());
            listener.run_started(MONKEY_RUN_NAME, self.event_count);
        }
    }

    fn end_current(&mut self, listener: &mut dyn TestRunListener) {
        if let Some(test) = self.current.take() {
            listener.test_ended(&test, &Metrics::new());
        }
    }

    fn start_test(&mut self, line: &str, listener: &mut dyn TestRunListener) {
        self.ensure_run_started(listener);
        let test = TestIdentifier::new(MONKEY_TEST_CLASS, line);
        listener.test_started(&test);
        self.current = Some(test);
    }

    fn record_metric(&mut self, line: &str) {
        for (prefix, name) in METRIC_KEYS {
            if let Some(value) = line.strip_prefix(prefix) {
                self.metrics.insert(name.to_string(), value.trim().to_string());
            }
        }
    }

    fn finish_crash(&mut self, stack: Vec<String>, listener: &mut dyn TestRunListener) {
        let trace = stack.join("\r\n");
        if self.current.is_none() {
            self.start_test(CRASH_KEY, listener);
        }
        if let Some(test) = self.current.clone() {
            listener.test_failed(&test, &trace);
        }
        self.end_current(listener);
    }
}

impl ShellOutputParser for MonkeyResultParser {
    fn process_line(&mut self, line: &str, listener: &mut dyn TestRunListener) {
        debug!(line = %line, "monkey output");
        self.record_metric(line);

        match std::mem::replace(&mut self.crash, CrashState::None) {
            CrashState::Header => {
                self.crash = if line.starts_with(BUILD_TIME_KEY) {
                    CrashState::Stack(Vec::new())
                } else {
                    CrashState::Header
                };
                return;
            }
            CrashState::Stack(mut stack) => {
                if line == EMPTY_KEY {
                    self.finish_crash(stack, listener);
                } else {
                    let frame = line.strip_prefix(EMPTY_KEY).unwrap_or(line).trim_start();
                    stack.push(frame.to_string());
                    self.crash = CrashState::Stack(stack);
                }
                return;
            }
            CrashState::None => {}
        }

        if line.starts_with(MONKEY_KEY) {
            self.ensure_run_started(listener);
        }
        if line.starts_with(SENDING_KEY) || line.starts_with(SWITCHING_KEY) {
            self.end_current(listener);
            self.start_test(line, listener);
        }
        if line.starts_with(CRASH_KEY) {
            self.ensure_run_started(listener);
            self.crash = CrashState::Header;
        }
    }

    fn handle_run_failed(&mut self, message: &str, listener: &mut dyn TestRunListener) {
        self.ensure_run_started(listener);
        listener.run_failed(message);
    }

    fn done(&mut self, listener: &mut dyn TestRunListener) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let CrashState::Stack(stack) = std::mem::replace(&mut self.crash, CrashState::None) {
            self.finish_crash(stack, listener);
        }
        self.end_current(listener);
        self.ensure_run_started(listener);
        let elapsed_ms = self
            .run_started_at
            .map(|start| start.elapsed().as_millis() as u64)
            .unwrap_or(0);
        listener.run_ended(elapsed_ms, &self.metrics);
    }
}
