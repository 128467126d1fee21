use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::info;

use crate::app::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemKind {
    Error,
    Failure,
}

impl ProblemKind {
    fn tag(&self) -> &'static str {
        match self {
            ProblemKind::Error => "error",
            ProblemKind::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProblemNode {
    pub kind: ProblemKind,
    pub message: String,
    pub exception_type: String,
    pub trace: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestCaseNode {
    pub class_name: String,
    pub name: String,
    pub time_secs: f64,
    pub problem: Option<ProblemNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestSuiteNode {
    pub name: String,
    pub hostname: String,
    pub tests: usize,
    pub failures: usize,
    pub errors: usize,
    pub ignored: usize,
    pub time_secs: f64,
    pub timestamp: String,
    /// Written in order; callers sort for reproducible output.
    pub properties: Vec<(String, String)>,
    pub cases: Vec<TestCaseNode>,
}

/// JUnit-style `testsuites` tree for one device run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportDocument {
    pub suite: TestSuiteNode,
}

fn escape_xml(input: &str, attribute: bool) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' if attribute => escaped.push_str("&quot;"),
            '\r' => escaped.push_str("&#13;"),
            '\n' if attribute => escaped.push_str("&#10;"),
            '\t' if attribute => escaped.push_str("&#9;"),
            '\n' | '\t' => escaped.push(ch),
            // Not representable in XML 1.0.
            c if (c as u32) < 0x20 => escaped.push('\u{FFFD}'),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn attr(value: &str) -> String {
    escape_xml(value, true)
}

pub fn format_seconds(seconds: f64) -> String {
    format!("{seconds:.4}")
}

impl ReportDocument {
    pub fn to_xml(&self) -> String {
        let suite = &self.suite;
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<testsuites>\n");
        let _ = writeln!(
            out,
            "  <testsuite name=\"{}\" hostname=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" ignored=\"{}\" time=\"{}\" timestamp=\"{}\">",
            attr(&suite.name),
            attr(&suite.hostname),
            suite.tests,
            suite.failures,
            suite.errors,
            suite.ignored,
            format_seconds(suite.time_secs),
            attr(&suite.timestamp),
        );
        out.push_str("    <properties>\n");
        for (name, value) in &suite.properties {
            let _ = writeln!(
                out,
                "      <property name=\"{}\" value=\"{}\"/>",
                attr(name),
                attr(value)
            );
        }
        out.push_str("    </properties>\n");
        for case in &suite.cases {
            let _ = write!(
                out,
                "    <testcase classname=\"{}\" name=\"{}\" time=\"{}\"",
                attr(&case.class_name),
                attr(&case.name),
                format_seconds(case.time_secs)
            );
            match &case.problem {
                None => out.push_str("/>\n"),
                Some(problem) => {
                    out.push_str(">\n");
                    let _ = writeln!(
                        out,
                        "      <{tag} message=\"{}\" type=\"{}\">{}</{tag}>",
                        attr(&problem.message),
                        attr(&problem.exception_type),
                        escape_xml(&problem.trace, false),
                        tag = problem.kind.tag(),
                    );
                    out.push_str("    </testcase>\n");
                }
            }
        }
        out.push_str("  </testsuite>\n");
        out.push_str("</testsuites>\n");
        out
    }
}

/// Properties of the orchestrating host, reported next to the device's own.
pub fn host_properties() -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    props.insert("os.name".to_string(), std::env::consts::OS.to_string());
    props.insert("os.arch".to_string(), std::env::consts::ARCH.to_string());
    props.insert("os.family".to_string(), std::env::consts::FAMILY.to_string());
    props.insert(
        "droidrun.version".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    if let Ok(dir) = std::env::current_dir() {
        props.insert("user.dir".to_string(), dir.to_string_lossy().to_string());
    }
    if let Some(user) = ["USER", "USERNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok())
    {
        props.insert("user.name".to_string(), user);
    }
    props
}

/// `{target}/surefire-reports/TEST-{name}{suffix}.xml`; path separators are dropped from the
/// suffix.
pub fn report_path(target_dir: &Path, descriptive_name: &str, suffix: &str) -> PathBuf {
    let suffix: String = suffix.chars().filter(|ch| *ch != '/' && *ch != '\\').collect();
    target_dir
        .join("surefire-reports")
        .join(format!("TEST-{descriptive_name}{suffix}.xml"))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReportWriter;

impl ReportWriter {
    /// Writes the whole document or nothing: the XML lands in a sibling temp file first and is
    /// renamed over `path`.
    pub fn write(&self, document: &ReportDocument, path: &Path, trace_id: &str) -> Result<(), AppError> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|err| {
            AppError::system(
                format!("Failed to create report directory {}: {err}", parent.display()),
                trace_id,
            )
        })?;
        let mut file = NamedTempFile::new_in(parent).map_err(|err| {
            AppError::system(format!("Failed to create report file: {err}"), trace_id)
        })?;
        file.write_all(document.to_xml().as_bytes()).map_err(|err| {
            AppError::system(format!("Failed to write report: {err}"), trace_id)
        })?;
        file.persist(path).map_err(|err| {
            AppError::system(
                format!("Failed to persist report {}: {}", path.display(), err.error),
                trace_id,
            )
        })?;
        info!(trace_id = %trace_id, path = %path.display(), "report written");
        Ok(())
    }
}
