use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_VALIDATION", message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_DEPENDENCY", message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_SYSTEM", message, trace_id)
    }

    pub fn no_device(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_NO_DEVICE", message, trace_id)
    }

    pub fn job(failure: &JobFailure, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_JOB", failure.to_string(), trace_id)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}

/// Classification of a single device's failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFailureKind {
    DeviceRejected,
    Timeout,
    IoError,
    TestFailure,
    TestRunIncomplete,
    Panicked,
}

impl JobFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobFailureKind::DeviceRejected => "device_rejected",
            JobFailureKind::Timeout => "timeout",
            JobFailureKind::IoError => "io_error",
            JobFailureKind::TestFailure => "test_failure",
            JobFailureKind::TestRunIncomplete => "test_run_incomplete",
            JobFailureKind::Panicked => "panicked",
        }
    }
}

impl fmt::Display for JobFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub serial: String,
    pub kind: JobFailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(serial: impl Into<String>, kind: JobFailureKind, message: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn device_rejected(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(serial, JobFailureKind::DeviceRejected, message)
    }

    pub fn timeout(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(serial, JobFailureKind::Timeout, message)
    }

    pub fn io(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(serial, JobFailureKind::IoError, message)
    }

    pub fn test_failure(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(serial, JobFailureKind::TestFailure, message)
    }

    pub fn test_run_incomplete(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(serial, JobFailureKind::TestRunIncomplete, message)
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] ({})", self.message, self.serial, self.kind)
    }
}

impl std::error::Error for JobFailure {}
