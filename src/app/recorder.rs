use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, error, info};

use crate::app::config::IgnoreSettings;
use crate::app::devices::{descriptive_name, log_prefix};
use crate::app::models::{Device, FailureDetail, RunCounts, TestCase, TestOutcome, TestRun};
use crate::app::protocol::{
    parse_trace_exception, parse_trace_message, Metrics, TestEvent, TestIdentifier,
    TestRunListener,
};
use crate::app::report::{ProblemKind, ProblemNode, ReportDocument, TestCaseNode, TestSuiteNode};

const INDENT: &str = "  ";

struct OpenCase {
    case: TestCase,
    started: Instant,
}

/// Accumulates one device's run. Owned by the worker driving that device.
pub struct ResultRecorder {
    device: Device,
    descriptive_name: String,
    log_prefix: String,
    ignore: IgnoreSettings,
    trace_id: String,
    run: TestRun,
    open: Option<OpenCase>,
    exception_messages: Vec<String>,
}

impl ResultRecorder {
    pub fn new(device: &Device, ignore: IgnoreSettings, trace_id: impl Into<String>) -> Self {
        Self {
            device: device.clone(),
            descriptive_name: descriptive_name(device),
            log_prefix: log_prefix(device),
            ignore,
            trace_id: trace_id.into(),
            run: TestRun::default(),
            open: None,
            exception_messages: Vec::new(),
        }
    }

    pub fn on_event(&mut self, event: &TestEvent) {
        event.deliver(self);
    }

    pub fn run(&self) -> &TestRun {
        &self.run
    }

    pub fn counts(&self) -> RunCounts {
        self.run.counts
    }

    pub fn descriptive_name(&self) -> &str {
        &self.descriptive_name
    }

    pub fn has_failures_or_errors(&self) -> bool {
        let counts = self.run.counts;
        (!self.ignore.test_errors && counts.errored > 0)
            || (!self.ignore.test_failures && counts.failed > 0)
    }

    pub fn run_failure_cause(&self) -> Option<&str> {
        self.run.run_failure_cause.as_deref()
    }

    /// Records an infrastructure problem (report I/O, device control) on this run.
    pub fn record_exception(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(
            trace_id = %self.trace_id,
            serial = %self.device.serial,
            "{}{INDENT}{message}",
            self.log_prefix
        );
        self.exception_messages.push(message);
    }

    pub fn threw_exception(&self) -> bool {
        !self.exception_messages.is_empty()
    }

    pub fn exception_messages(&self) -> &[String] {
        &self.exception_messages
    }

    /// Same run state in, same document out. Properties are sorted by name with device
    /// properties overriding host ones.
    pub fn build_report_document(&self, host_properties: &BTreeMap<String, String>) -> ReportDocument {
        let mut properties = host_properties.clone();
        for (key, value) in &self.device.properties {
            properties.insert(key.clone(), value.clone());
        }
        let timestamp = self
            .run
            .ended_at
            .or(self.run.started_at)
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string());

        let cases = self
            .run
            .cases
            .iter()
            .map(|case| TestCaseNode {
                class_name: case.class_name.clone(),
                name: case.method_name.clone(),
                time_secs: case.elapsed_ms as f64 / 1000.0,
                problem: match &case.outcome {
                    TestOutcome::Error(detail) => Some(problem(ProblemKind::Error, detail)),
                    TestOutcome::Failed(detail) => Some(problem(ProblemKind::Failure, detail)),
                    TestOutcome::Passed | TestOutcome::Ignored => None,
                },
            })
            .collect();

        ReportDocument {
            suite: TestSuiteNode {
                name: self.run.run_name.clone(),
                hostname: self.descriptive_name.clone(),
                tests: self.run.expected_count,
                failures: self.run.counts.failed,
                errors: self.run.counts.errored,
                ignored: self.run.counts.ignored,
                time_secs: self.run.elapsed_ms as f64 / 1000.0,
                timestamp,
                properties: properties.into_iter().collect(),
                cases,
            },
        }
    }

    fn log(&self, message: &str) {
        info!(
            trace_id = %self.trace_id,
            serial = %self.device.serial,
            "{}{message}",
            self.log_prefix
        );
    }

    fn log_metrics(&self, metrics: &Metrics) {
        for (key, value) in metrics {
            debug!(
                trace_id = %self.trace_id,
                serial = %self.device.serial,
                "{}{INDENT}{INDENT}{key}: {value}",
                self.log_prefix
            );
        }
    }

    fn close_open_case(&mut self) {
        if let Some(open) = self.open.take() {
            let mut case = open.case;
            case.elapsed_ms = open.started.elapsed().as_millis() as u64;
            self.run.cases.push(case);
        }
    }

    fn open_case_for(&mut self, test: &TestIdentifier) -> &mut TestCase {
        let matches = self.open.as_ref().is_some_and(|open| {
            open.case.class_name == test.class_name && open.case.method_name == test.test_name
        });
        if !matches {
            self.close_open_case();
        }
        let open = self.open.get_or_insert_with(|| OpenCase {
            case: TestCase {
                class_name: test.class_name.clone(),
                method_name: test.test_name.clone(),
                started_at: Utc::now(),
                elapsed_ms: 0,
                outcome: TestOutcome::Passed,
            },
            started: Instant::now(),
        });
        &mut open.case
    }

    fn record_problem(&mut self, test: &TestIdentifier, trace: &str, as_error: bool) {
        let detail = FailureDetail {
            trace: trace.to_string(),
            message: parse_trace_message(trace),
            exception_type: parse_trace_exception(trace),
        };
        let case = self.open_case_for(test);
        if case.outcome == TestOutcome::Passed {
            case.outcome = if as_error {
                TestOutcome::Error(detail)
            } else {
                TestOutcome::Failed(detail)
            };
        }
        self.log(&format!("{INDENT}{INDENT}{test}"));
        self.log(&format!("{INDENT}{INDENT}{trace}"));
    }
}

fn problem(kind: ProblemKind, detail: &FailureDetail) -> ProblemNode {
    ProblemNode {
        kind,
        message: detail.message.clone(),
        exception_type: detail.exception_type.clone(),
        trace: detail.trace.clone(),
    }
}

impl TestRunListener for ResultRecorder {
    fn run_started(&mut self, run_name: &str, test_count: usize) {
        self.run.run_name = run_name.to_string();
        self.run.expected_count = test_count;
        self.run.started_at = Some(Utc::now());
        self.log(&format!("{INDENT}Run started: {run_name}, {test_count} tests:"));
    }

    fn test_started(&mut self, test: &TestIdentifier) {
        self.close_open_case();
        self.run.counts.ran += 1;
        self.open_case_for(test);
        self.log(&format!(
            "{INDENT}{INDENT}Start [{}/{}]: {test}",
            self.run.counts.ran, self.run.expected_count
        ));
    }

    fn test_failed(&mut self, test: &TestIdentifier, trace: &str) {
        self.run.counts.errored += 1;
        self.record_problem(test, trace, true);
    }

    fn test_assumption_failed(&mut self, test: &TestIdentifier, trace: &str) {
        self.run.counts.failed += 1;
        self.record_problem(test, trace, false);
    }

    fn test_ignored(&mut self, test: &TestIdentifier) {
        self.run.counts.ignored += 1;
        let case = self.open_case_for(test);
        if case.outcome == TestOutcome::Passed {
            case.outcome = TestOutcome::Ignored;
        }
        self.log(&format!("{INDENT}{INDENT}{test}"));
    }

    fn test_ended(&mut self, test: &TestIdentifier, metrics: &Metrics) {
        self.open_case_for(test);
        self.close_open_case();
        self.log(&format!(
            "{INDENT}{INDENT}End [{}/{}]: {test}",
            self.run.counts.ran, self.run.expected_count
        ));
        self.log_metrics(metrics);
    }

    fn run_failed(&mut self, message: &str) {
        self.run.run_failure_cause = Some(message.to_string());
        self.log(&format!("{INDENT}Run failed: {message}"));
    }

    fn run_stopped(&mut self, elapsed_ms: u64) {
        self.log(&format!("{INDENT}Run stopped:{elapsed_ms}"));
    }

    fn run_ended(&mut self, elapsed_ms: u64, metrics: &Metrics) {
        self.close_open_case();
        self.run.elapsed_ms = elapsed_ms;
        self.run.ended_at = Some(Utc::now());
        for (key, value) in metrics {
            self.run.run_metrics.insert(key.clone(), value.clone());
        }

        self.log(&format!("{INDENT}Run ended: {elapsed_ms} ms"));
        if self.has_failures_or_errors() {
            error!(
                trace_id = %self.trace_id,
                serial = %self.device.serial,
                "{}{INDENT}FAILURES!!!",
                self.log_prefix
            );
        }
        let counts = self.run.counts;
        let of_expected = if counts.ran < self.run.expected_count {
            format!(" (of {})", self.run.expected_count)
        } else {
            String::new()
        };
        info!(
            trace_id = %self.trace_id,
            serial = %self.device.serial,
            "{INDENT}Tests run: {}{of_expected},  Failures: {},  Errors: {},  Ignored: {}",
            counts.ran,
            counts.failed,
            counts.errored,
            counts.ignored
        );
        self.log_metrics(metrics);
    }
}
