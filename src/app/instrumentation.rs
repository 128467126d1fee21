use tracing::warn;

use crate::app::protocol::{Metrics, ShellOutputParser, TestIdentifier, TestRunListener};

const STATUS_PREFIX: &str = "INSTRUMENTATION_STATUS: ";
const STATUS_CODE_PREFIX: &str = "INSTRUMENTATION_STATUS_CODE: ";
const RESULT_PREFIX: &str = "INSTRUMENTATION_RESULT: ";
const CODE_PREFIX: &str = "INSTRUMENTATION_CODE: ";
const FAILED_PREFIX: &str = "INSTRUMENTATION_FAILED: ";
const TIME_PREFIX: &str = "Time: ";

const KEY_TEST: &str = "test";
const KEY_CLASS: &str = "class";
const KEY_STACK: &str = "stack";
const KEY_NUM_TESTS: &str = "numtests";
const KEY_SHORT_MSG: &str = "shortMsg";
const KEY_STREAM: &str = "stream";
const BOOKKEEPING_KEYS: [&str; 7] = [KEY_TEST, KEY_CLASS, KEY_STACK, KEY_NUM_TESTS, "current", "id", KEY_STREAM];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusCode {
    Start,
    InProgress,
    Ok,
    Error,
    Failure,
    Ignored,
    AssumptionFailure,
}

impl StatusCode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().parse::<i32>().ok()? {
            1 => Some(StatusCode::Start),
            2 => Some(StatusCode::InProgress),
            0 => Some(StatusCode::Ok),
            -1 => Some(StatusCode::Error),
            -2 => Some(StatusCode::Failure),
            -3 => Some(StatusCode::Ignored),
            -4 => Some(StatusCode::AssumptionFailure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Status,
    Result,
}

/// Parses `am instrument -r -w` raw output.
pub struct InstrumentationResultParser {
    run_name: String,
    status: Metrics,
    result: Metrics,
    pending: Option<(Section, String, String)>,
    expected_tests: Option<usize>,
    tests_started: usize,
    run_started: bool,
    open_test: Option<TestIdentifier>,
    run_failure: Option<String>,
    run_failure_reported: bool,
    result_code: Option<i32>,
    elapsed_ms: u64,
    finished: bool,
}

impl InstrumentationResultParser {
    pub fn new(run_name: impl Into<String>) -> Self {
        Self {
            run_name: run_name.into(),
            status: Metrics::new(),
            result: Metrics::new(),
            pending: None,
            expected_tests: None,
            tests_started: 0,
            run_started: false,
            open_test: None,
            run_failure: None,
            run_failure_reported: false,
            result_code: None,
            elapsed_ms: 0,
            finished: false,
        }
    }

    fn flush_pending(&mut self) {
        if let Some((section, key, value)) = self.pending.take() {
            match section {
                Section::Status => {
                    self.status.insert(key, value);
                }
                Section::Result => {
                    self.result.insert(key, value);
                }
            }
        }
    }

    fn begin_value(&mut self, section: Section, body: &str) {
        self.flush_pending();
        match body.split_once('=') {
            Some((key, value)) => {
                self.pending = Some((section, key.trim().to_string(), value.to_string()));
            }
            None => warn!(line = %body, "instrumentation line without key=value"),
        }
    }

    fn ensure_run_started(&mut self, listener: &mut dyn TestRunListener) {
        if !self.run_started {
            self.run_started = true;
            listener.run_started(&self.run_name, self.expected_tests.unwrap_or(0));
        }
    }

    fn status_identifier(&self) -> Option<TestIdentifier> {
        let class_name = self.status.get(KEY_CLASS)?;
        let test_name = self.status.get(KEY_TEST)?;
        Some(TestIdentifier::new(class_name.clone(), test_name.clone()))
    }

    fn status_metrics(&self) -> Metrics {
        self.status
            .iter()
            .filter(|(key, _)| !BOOKKEEPING_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn handle_status_code(&mut self, raw: &str, listener: &mut dyn TestRunListener) {
        self.flush_pending();
        if self.expected_tests.is_none() {
            self.expected_tests = self
                .status
                .get(KEY_NUM_TESTS)
                .and_then(|value| value.trim().parse::<usize>().ok());
        }

        match StatusCode::parse(raw) {
            None => warn!(code = %raw.trim(), "unknown instrumentation status code"),
            Some(StatusCode::InProgress) => {}
            Some(StatusCode::Start) => {
                self.ensure_run_started(listener);
                if let Some(test) = self.status_identifier() {
                    self.tests_started += 1;
                    listener.test_started(&test);
                    self.open_test = Some(test);
                }
            }
            Some(code) => {
                self.ensure_run_started(listener);
                let test = self.status_identifier().or_else(|| self.open_test.clone());
                if let Some(test) = test {
                    let stack = self.status.get(KEY_STACK).cloned().unwrap_or_default();
                    match code {
                        StatusCode::Error | StatusCode::Failure => listener.test_failed(&test, &stack),
                        StatusCode::Ignored => listener.test_ignored(&test),
                        StatusCode::AssumptionFailure => listener.test_assumption_failed(&test, &stack),
                        _ => {}
                    }
                    listener.test_ended(&test, &self.status_metrics());
                    self.open_test = None;
                }
            }
        }
        self.status.clear();
    }

    fn handle_result_code(&mut self, raw: &str) {
        self.flush_pending();
        self.result_code = raw.trim().parse::<i32>().ok();
        if let Some(short_msg) = self.result.get(KEY_SHORT_MSG) {
            self.run_failure = Some(format!("Instrumentation run failed due to '{short_msg}'"));
        }
    }
}

impl ShellOutputParser for InstrumentationResultParser {
    fn process_line(&mut self, line: &str, listener: &mut dyn TestRunListener) {
        if let Some(raw) = line.strip_prefix(STATUS_CODE_PREFIX) {
            self.handle_status_code(raw, listener);
        } else if let Some(body) = line.strip_prefix(STATUS_PREFIX) {
            self.begin_value(Section::Status, body);
        } else if let Some(body) = line.strip_prefix(RESULT_PREFIX) {
            self.begin_value(Section::Result, body);
        } else if let Some(raw) = line.strip_prefix(CODE_PREFIX) {
            self.handle_result_code(raw);
        } else if let Some(message) = line.strip_prefix(FAILED_PREFIX) {
            self.flush_pending();
            self.run_failure = Some(message.trim().to_string());
        } else if let Some(raw) = line.strip_prefix(TIME_PREFIX) {
            self.flush_pending();
            if let Ok(seconds) = raw.trim().replace(',', "").parse::<f64>() {
                self.elapsed_ms = (seconds * 1000.0).round() as u64;
            }
        } else if let Some((_, _, value)) = self.pending.as_mut() {
            value.push_str("\r\n");
            value.push_str(line);
        }
    }

    fn handle_run_failed(&mut self, message: &str, listener: &mut dyn TestRunListener) {
        if self.finished || self.run_failure_reported {
            return;
        }
        self.flush_pending();
        self.ensure_run_started(listener);
        if let Some(test) = self.open_test.take() {
            listener.test_failed(
                &test,
                &format!(
                    "Test failed to run to completion. Reason: '{message}'. Check device logcat for details"
                ),
            );
            listener.test_ended(&test, &Metrics::new());
        }
        self.run_failure_reported = true;
        listener.run_failed(message);
    }

    fn done(&mut self, listener: &mut dyn TestRunListener) {
        if self.finished {
            return;
        }
        self.flush_pending();

        let failure = if let Some(failure) = self.run_failure.clone() {
            Some(failure)
        } else if self.result_code.is_none() {
            Some("Instrumentation run did not report a result code".to_string())
        } else {
            self.expected_tests
                .filter(|expected| self.tests_started < *expected)
                .map(|expected| {
                    format!(
                        "Test run incomplete. Expected {expected} tests, received {}",
                        self.tests_started
                    )
                })
        };
        if let Some(failure) = failure {
            self.handle_run_failed(&failure, listener);
        }
        self.ensure_run_started(listener);

        let metrics: Metrics = self
            .result
            .iter()
            .filter(|(key, _)| key.as_str() != KEY_STREAM)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        listener.run_ended(self.elapsed_ms, &metrics);
        self.finished = true;
    }
}
