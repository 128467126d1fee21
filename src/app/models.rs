use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row of `adb devices -l`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
    pub device: Option<String>,
    pub transport_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Online,
    Offline,
    Unauthorized,
    Unknown(String),
}

impl DeviceState {
    pub fn from_adb(state: &str) -> Self {
        match state.trim() {
            "device" => DeviceState::Online,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            other => DeviceState::Unknown(other.to_string()),
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, DeviceState::Online)
    }

    pub fn label(&self) -> &str {
        match self {
            DeviceState::Online => "Online",
            DeviceState::Offline => "Offline",
            DeviceState::Unauthorized | DeviceState::Unknown(_) => "Unknown",
        }
    }
}

/// A connected emulator or physical unit, as seen at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub serial: String,
    pub state: DeviceState,
    pub is_emulator: bool,
    pub avd_name: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Device {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureDetail {
    pub trace: String,
    pub message: String,
    pub exception_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed(FailureDetail),
    Error(FailureDetail),
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestCase {
    pub class_name: String,
    pub method_name: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub outcome: TestOutcome,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunCounts {
    pub ran: usize,
    pub failed: usize,
    pub errored: usize,
    pub ignored: usize,
}

/// One logical test execution on one device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestRun {
    pub run_name: String,
    pub expected_count: usize,
    pub cases: Vec<TestCase>,
    pub counts: RunCounts,
    pub run_failure_cause: Option<String>,
    pub elapsed_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_metrics: BTreeMap<String, String>,
}
