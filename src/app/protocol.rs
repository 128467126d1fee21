use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type Metrics = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestIdentifier {
    pub class_name: String,
    pub test_name: String,
}

impl TestIdentifier {
    pub fn new(class_name: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            test_name: test_name.into(),
        }
    }
}

impl fmt::Display for TestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class_name, self.test_name)
    }
}

/// Lifecycle callbacks of one remote test run, delivered in order:
/// `run_started`, then test events, then `run_ended`. `run_failed` may arrive at any point
/// after `run_started` and means the run infrastructure broke rather than a test.
pub trait TestRunListener {
    fn run_started(&mut self, run_name: &str, test_count: usize);

    fn test_started(&mut self, test: &TestIdentifier);

    /// An error or assertion failure raised by the test.
    fn test_failed(&mut self, test: &TestIdentifier, trace: &str);

    /// A violated assumption. Counted as a failure, never as an error.
    fn test_assumption_failed(&mut self, test: &TestIdentifier, trace: &str);

    fn test_ignored(&mut self, test: &TestIdentifier);

    fn test_ended(&mut self, test: &TestIdentifier, metrics: &Metrics);

    fn run_failed(&mut self, message: &str);

    fn run_stopped(&mut self, _elapsed_ms: u64) {}

    fn run_ended(&mut self, elapsed_ms: u64, metrics: &Metrics);
}

/// Owned form of a listener callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestEvent {
    RunStarted { run_name: String, test_count: usize },
    TestStarted(TestIdentifier),
    TestFailed { test: TestIdentifier, trace: String },
    TestAssumptionFailed { test: TestIdentifier, trace: String },
    TestIgnored(TestIdentifier),
    TestEnded { test: TestIdentifier, metrics: Metrics },
    RunFailed(String),
    RunStopped(u64),
    RunEnded { elapsed_ms: u64, metrics: Metrics },
}

impl TestEvent {
    pub fn deliver(&self, listener: &mut dyn TestRunListener) {
        match self {
            TestEvent::RunStarted { run_name, test_count } => {
                listener.run_started(run_name, *test_count)
            }
            TestEvent::TestStarted(test) => listener.test_started(test),
            TestEvent::TestFailed { test, trace } => listener.test_failed(test, trace),
            TestEvent::TestAssumptionFailed { test, trace } => {
                listener.test_assumption_failed(test, trace)
            }
            TestEvent::TestIgnored(test) => listener.test_ignored(test),
            TestEvent::TestEnded { test, metrics } => listener.test_ended(test, metrics),
            TestEvent::RunFailed(message) => listener.run_failed(message),
            TestEvent::RunStopped(elapsed_ms) => listener.run_stopped(*elapsed_ms),
            TestEvent::RunEnded { elapsed_ms, metrics } => listener.run_ended(*elapsed_ms, metrics),
        }
    }
}

/// Forwards every callback to each listener in order.
pub struct Fanout<'a> {
    listeners: Vec<&'a mut dyn TestRunListener>,
}

impl<'a> Fanout<'a> {
    pub fn new(listeners: Vec<&'a mut dyn TestRunListener>) -> Self {
        Self { listeners }
    }
}

impl TestRunListener for Fanout<'_> {
    fn run_started(&mut self, run_name: &str, test_count: usize) {
        for listener in self.listeners.iter_mut() {
            listener.run_started(run_name, test_count);
        }
    }

    fn test_started(&mut self, test: &TestIdentifier) {
        for listener in self.listeners.iter_mut() {
            listener.test_started(test);
        }
    }

    fn test_failed(&mut self, test: &TestIdentifier, trace: &str) {
        for listener in self.listeners.iter_mut() {
            listener.test_failed(test, trace);
        }
    }

    fn test_assumption_failed(&mut self, test: &TestIdentifier, trace: &str) {
        for listener in self.listeners.iter_mut() {
            listener.test_assumption_failed(test, trace);
        }
    }

    fn test_ignored(&mut self, test: &TestIdentifier) {
        for listener in self.listeners.iter_mut() {
            listener.test_ignored(test);
        }
    }

    fn test_ended(&mut self, test: &TestIdentifier, metrics: &Metrics) {
        for listener in self.listeners.iter_mut() {
            listener.test_ended(test, metrics);
        }
    }

    fn run_failed(&mut self, message: &str) {
        for listener in self.listeners.iter_mut() {
            listener.run_failed(message);
        }
    }

    fn run_stopped(&mut self, elapsed_ms: u64) {
        for listener in self.listeners.iter_mut() {
            listener.run_stopped(elapsed_ms);
        }
    }

    fn run_ended(&mut self, elapsed_ms: u64, metrics: &Metrics) {
        for listener in self.listeners.iter_mut() {
            listener.run_ended(elapsed_ms, metrics);
        }
    }
}

/// Turns a device's shell output, line by line, into listener callbacks.
pub trait ShellOutputParser {
    fn process_line(&mut self, line: &str, listener: &mut dyn TestRunListener);

    /// The command driving the run broke before the output was complete.
    fn handle_run_failed(&mut self, message: &str, listener: &mut dyn TestRunListener);

    /// End of output. Closes whatever the stream left open.
    fn done(&mut self, listener: &mut dyn TestRunListener);
}

const TRACE_NEWLINE: &str = "\r\n";

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index.min(text.len())
}

/// Exception label of a raw trace: the text before the first `:` of its first line. A
/// multi-line trace whose first line has no `:` (`junit.framework.AssertionFailedError\r\nat ..`)
/// yields that whole line.
pub fn parse_trace_exception(trace: &str) -> String {
    if trace.trim().is_empty() {
        return String::new();
    }
    let (first_line, multi_line) = match trace.find(TRACE_NEWLINE) {
        Some(end) => (&trace[..end], true),
        None => (trace, false),
    };
    match first_line.find(':') {
        Some(colon) => first_line[..colon].to_string(),
        None if multi_line => first_line.to_string(),
        None => String::new(),
    }
}

/// Short message of a raw trace: the text between `": "` and the first line break. Traces
/// starting with `junit.` and single-line traces carry no message.
pub fn parse_trace_message(trace: &str) -> String {
    if trace.trim().is_empty() || trace.starts_with("junit.") {
        return String::new();
    }
    let first_break = match trace.find(TRACE_NEWLINE) {
        Some(index) if index > 0 => index,
        _ => return String::new(),
    };

    // A missing ':' lands one byte in, like an index of -1 plus two.
    let mut start = trace.find(':').map_or(1, |colon| colon + 2);
    let mut end = first_break;
    if start > end {
        // The ':' belongs to the stack trace; end the message where the frames begin.
        match trace.find("\r\nat") {
            Some(frames) if start <= frames => end = frames,
            Some(frames) => {
                end = frames;
                start = 0;
            }
            None => start = 0,
        }
    }
    let start = ceil_char_boundary(trace, start).min(end);
    trace[start..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Log(Vec<String>);

    impl TestRunListener for Log {
        fn run_started(&mut self, run_name: &str, test_count: usize) {
            self.0.push(format!("start {run_name} {test_count}"));
        }
        fn test_started(&mut self, test: &TestIdentifier) {
            self.0.push(format!("test {test}"));
        }
        fn test_failed(&mut self, test: &TestIdentifier, _trace: &str) {
            self.0.push(format!("failed {test}"));
        }
        fn test_assumption_failed(&mut self, test: &TestIdentifier, _trace: &str) {
            self.0.push(format!("assumption {test}"));
        }
        fn test_ignored(&mut self, test: &TestIdentifier) {
            self.0.push(format!("ignored {test}"));
        }
        fn test_ended(&mut self, test: &TestIdentifier, _metrics: &Metrics) {
            self.0.push(format!("ended {test}"));
        }
        fn run_failed(&mut self, message: &str) {
            self.0.push(format!("run failed {message}"));
        }
        fn run_ended(&mut self, elapsed_ms: u64, _metrics: &Metrics) {
            self.0.push(format!("run ended {elapsed_ms}"));
        }
    }

    #[test]
    fn parses_assertion_trace() {
        let trace = "java.lang.AssertionError: expected foo\r\nat com.Foo.bar";
        assert_eq!(parse_trace_exception(trace), "java.lang.AssertionError");
        assert_eq!(parse_trace_message(trace), "expected foo");
    }

    #[test]
    fn junit_traces_have_no_message() {
        let trace = "junit.framework.AssertionFailedError\r\nat ...";
        assert_eq!(parse_trace_exception(trace), "junit.framework.AssertionFailedError");
        assert_eq!(parse_trace_message(trace), "");
    }

    #[test]
    fn blank_trace_is_empty() {
        assert_eq!(parse_trace_exception(""), "");
        assert_eq!(parse_trace_message(""), "");
        assert_eq!(parse_trace_exception("  \r\n "), "");
        assert_eq!(parse_trace_message("  \r\n "), "");
    }

    #[test]
    fn colon_only_in_stack_frames_falls_back_to_offset_zero() {
        let trace = "java.lang.NullPointerException\r\nat com.Foo.bar(Foo.java:10)";
        assert_eq!(parse_trace_exception(trace), "java.lang.NullPointerException");
        assert_eq!(parse_trace_message(trace), "java.lang.NullPointerException");
    }

    #[test]
    fn colon_in_stack_without_frame_marker_uses_first_line() {
        let trace = "java.lang.IllegalStateException\r\n\tat com.Foo.bar(Foo.java:10)";
        assert_eq!(parse_trace_message(trace), "java.lang.IllegalStateException");
    }

    #[test]
    fn single_line_trace_has_type_but_no_message() {
        assert_eq!(parse_trace_exception("java.lang.Error: boom"), "java.lang.Error");
        assert_eq!(parse_trace_message("java.lang.Error: boom"), "");
        assert_eq!(parse_trace_exception("boom"), "");
    }

    #[test]
    fn multibyte_after_colon_stays_on_char_boundary() {
        let trace = "java.lang.Error:é détail\r\nat com.Foo";
        assert_eq!(parse_trace_message(trace), " détail");
    }

    #[test]
    fn fanout_and_events_preserve_order() {
        let mut first = Log::default();
        let mut second = Log::default();
        let test = TestIdentifier::new("com.Foo", "bar");
        let events = vec![
            TestEvent::RunStarted {
                run_name: "suite".to_string(),
                test_count: 1,
            },
            TestEvent::TestStarted(test.clone()),
            TestEvent::TestFailed {
                test: test.clone(),
                trace: "x".to_string(),
            },
            TestEvent::TestEnded {
                test,
                metrics: Metrics::new(),
            },
            TestEvent::RunEnded {
                elapsed_ms: 12,
                metrics: Metrics::new(),
            },
        ];
        {
            let mut fanout = Fanout::new(vec![&mut first, &mut second]);
            for event in &events {
                event.deliver(&mut fanout);
            }
        }
        let expected = vec![
            "start suite 1",
            "test com.Foo#bar",
            "failed com.Foo#bar",
            "ended com.Foo#bar",
            "run ended 12",
        ];
        assert_eq!(first.0, expected);
        assert_eq!(second.0, expected);
    }
}
