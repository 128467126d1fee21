use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::error::AppError;

pub const DEFAULT_INITIAL_DEVICE_LIST_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_SCREENSHOTS_PATH_ON_DEVICE: &str = "/sdcard/uiautomator-screenshots/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdbSettings {
    pub command_path: String,
    /// Timeout for short device queries (`getprop`, `emu avd name`, install).
    pub connection_timeout_ms: u64,
    pub initial_device_list_timeout_ms: u64,
    /// Per device job; 0 disables the limit.
    pub command_timeout_secs: u64,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
            connection_timeout_ms: 5_000,
            initial_device_list_timeout_ms: DEFAULT_INITIAL_DEVICE_LIST_TIMEOUT_MS,
            command_timeout_secs: 1_800,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    /// Serials, avd names, `usb` or `emulator`. Empty selects every attached device.
    pub devices: Vec<String>,
    /// 0 runs one thread per selected device.
    pub device_threads: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestSkip {
    Skip,
    Run,
    Auto,
}

impl TestSkip {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "true" => Some(TestSkip::Skip),
            "false" => Some(TestSkip::Run),
            "" | "auto" => Some(TestSkip::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestSettings {
    pub skip: String,
    pub instrumentation_package: String,
    pub instrumentation_runner: String,
    pub classes: Vec<String>,
    pub packages: Vec<String>,
    pub annotations: Vec<String>,
    pub exclude_annotations: Vec<String>,
    pub test_size: String,
    pub coverage: bool,
    pub coverage_file: String,
    pub debug: bool,
    pub log_only: bool,
    pub create_report: bool,
    pub report_suffix: String,
    /// Each entry is `"key value"`.
    pub instrumentation_args: Vec<String>,
    pub fail_safe: bool,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            skip: "auto".to_string(),
            instrumentation_package: String::new(),
            instrumentation_runner: String::new(),
            classes: Vec::new(),
            packages: Vec::new(),
            annotations: Vec::new(),
            exclude_annotations: Vec::new(),
            test_size: String::new(),
            coverage: false,
            coverage_file: String::new(),
            debug: false,
            log_only: false,
            create_report: true,
            report_suffix: String::new(),
            instrumentation_args: Vec::new(),
            fail_safe: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IgnoreSettings {
    pub test_failures: bool,
    pub test_errors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonkeySettings {
    pub skip: bool,
    pub event_count: u32,
    pub seed: Option<i64>,
    pub throttle: Option<u64>,
    pub percent_touch: Option<u8>,
    pub percent_motion: Option<u8>,
    pub percent_trackball: Option<u8>,
    pub percent_nav: Option<u8>,
    pub percent_major_nav: Option<u8>,
    pub percent_syskeys: Option<u8>,
    pub percent_appswitch: Option<u8>,
    pub percent_anyevent: Option<u8>,
    pub packages: Vec<String>,
    pub categories: Vec<String>,
    pub debug_no_events: bool,
    pub hprof: bool,
    pub ignore_crashes: bool,
    pub ignore_timeouts: bool,
    pub ignore_security_exceptions: bool,
    pub kill_process_after_error: bool,
    pub monitor_native_crashes: bool,
    pub create_report: bool,
}

impl Default for MonkeySettings {
    fn default() -> Self {
        Self {
            skip: false,
            event_count: 1000,
            seed: None,
            throttle: None,
            percent_touch: None,
            percent_motion: None,
            percent_trackball: None,
            percent_nav: None,
            percent_major_nav: None,
            percent_syskeys: None,
            percent_appswitch: None,
            percent_anyevent: None,
            packages: Vec::new(),
            categories: Vec::new(),
            debug_no_events: false,
            hprof: false,
            ignore_crashes: false,
            ignore_timeouts: false,
            ignore_security_exceptions: false,
            kill_process_after_error: false,
            monitor_native_crashes: false,
            create_report: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UiAutomatorSettings {
    pub skip: bool,
    pub jar_file: String,
    pub test_class_or_methods: Vec<String>,
    pub no_hup: bool,
    pub debug: bool,
    pub create_report: bool,
    pub report_suffix: String,
    pub take_screenshot_on_failure: bool,
    pub screenshots_path_on_device: String,
}

impl Default for UiAutomatorSettings {
    fn default() -> Self {
        Self {
            skip: false,
            jar_file: String::new(),
            test_class_or_methods: Vec::new(),
            no_hup: false,
            debug: false,
            create_report: false,
            report_suffix: String::new(),
            take_screenshot_on_failure: false,
            screenshots_path_on_device: DEFAULT_SCREENSHOTS_PATH_ON_DEVICE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub test: TestSettings,
    #[serde(default)]
    pub ignore: IgnoreSettings,
    #[serde(default)]
    pub monkey: MonkeySettings,
    #[serde(default)]
    pub uiautomator: UiAutomatorSettings,
    #[serde(default = "default_target_dir")]
    pub target_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_target_dir() -> String {
    "target".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            adb: AdbSettings::default(),
            device: DeviceSettings::default(),
            test: TestSettings::default(),
            ignore: IgnoreSettings::default(),
            monkey: MonkeySettings::default(),
            uiautomator: UiAutomatorSettings::default(),
            target_dir: default_target_dir(),
            log_level: default_log_level(),
        }
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DROIDRUN_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from("droidrun.json")
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<RunConfig, AppError> {
    if !path.exists() {
        return Ok(RunConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("Failed to parse config: {err}"), trace_id))?;
    let config: RunConfig = serde_json::from_value(value.clone()).map_err(|err| {
        AppError::validation(format!("Config has an unexpected shape: {err}"), trace_id)
    })?;
    let config = apply_property_overrides(config, &value);
    Ok(validate_config(config))
}

/// Applies flat `android.*` style properties, either from the top level of the config file or
/// from `-Dkey=value` command line arguments.
pub fn apply_property_overrides(mut config: RunConfig, value: &serde_json::Value) -> RunConfig {
    let Some(props) = value.as_object() else {
        return config;
    };
    for (key, raw) in props {
        match key.as_str() {
            "android.device" | "android.devices" => {
                config.device.devices = value_as_list(raw);
            }
            "android.deviceThreads" => {
                if let Some(threads) = value_as_u64(raw) {
                    config.device.device_threads = threads as usize;
                }
            }
            "android.test.skip" => {
                if let Some(skip) = value_as_string(raw) {
                    config.test.skip = skip;
                }
            }
            "android.test.instrumentationPackage" => {
                if let Some(package) = value_as_string(raw) {
                    config.test.instrumentation_package = package;
                }
            }
            "android.test.instrumentationRunner" => {
                if let Some(runner) = value_as_string(raw) {
                    config.test.instrumentation_runner = runner;
                }
            }
            "android.test.classes" => config.test.classes = value_as_list(raw),
            "android.test.packages" => config.test.packages = value_as_list(raw),
            "android.test.annotations" => config.test.annotations = value_as_list(raw),
            "android.test.excludeAnnotations" => {
                config.test.exclude_annotations = value_as_list(raw)
            }
            "android.test.testSize" => {
                if let Some(size) = value_as_string(raw) {
                    config.test.test_size = size;
                }
            }
            "android.test.createReport" => {
                if let Some(flag) = value_as_bool(raw) {
                    config.test.create_report = flag;
                }
            }
            "android.test.failsafe" => {
                if let Some(flag) = value_as_bool(raw) {
                    config.test.fail_safe = flag;
                }
            }
            "maven.test.failure.ignore" | "testFailureIgnore" => {
                if let Some(flag) = value_as_bool(raw) {
                    config.ignore.test_failures = flag;
                    config.ignore.test_errors = flag;
                }
            }
            "android.monkey.eventCount" => {
                if let Some(count) = value_as_u64(raw) {
                    config.monkey.event_count = count.min(u32::MAX as u64) as u32;
                }
            }
            "android.monkey.seed" => {
                if let Some(seed) = value_as_string(raw).and_then(|v| v.parse::<i64>().ok()) {
                    config.monkey.seed = Some(seed);
                }
            }
            "android.monkey.throttle" => {
                if let Some(throttle) = value_as_u64(raw) {
                    config.monkey.throttle = Some(throttle);
                }
            }
            "android.monkey.packages" => config.monkey.packages = value_as_list(raw),
            "android.monkey.categories" => config.monkey.categories = value_as_list(raw),
            "android.monkey.ignoreCrashes" => {
                if let Some(flag) = value_as_bool(raw) {
                    config.monkey.ignore_crashes = flag;
                }
            }
            "android.monkey.createReport" => {
                if let Some(flag) = value_as_bool(raw) {
                    config.monkey.create_report = flag;
                }
            }
            "android.uiautomator.jarFile" => {
                if let Some(jar) = value_as_string(raw) {
                    config.uiautomator.jar_file = jar;
                }
            }
            "android.uiautomator.testClassOrMethod" => {
                config.uiautomator.test_class_or_methods = value_as_list(raw)
            }
            "android.uiautomator.createReport" => {
                if let Some(flag) = value_as_bool(raw) {
                    config.uiautomator.create_report = flag;
                }
            }
            "android.uiautomator.takeScreenshotOnFailure" => {
                if let Some(flag) = value_as_bool(raw) {
                    config.uiautomator.take_screenshot_on_failure = flag;
                }
            }
            _ => {}
        }
    }
    config
}

fn value_as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) => Some(text.trim().to_string()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        serde_json::Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn value_as_bool(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(flag) => Some(*flag),
        serde_json::Value::String(text) => match text.trim().to_lowercase().as_str() {
            "true" | "" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn value_as_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(number) => number.as_u64(),
        serde_json::Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn value_as_list(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(value_as_string)
            .filter(|item| !item.is_empty())
            .collect(),
        serde_json::Value::String(text) => text
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

pub fn validate_config(mut config: RunConfig) -> RunConfig {
    if config.adb.initial_device_list_timeout_ms == 0 {
        config.adb.initial_device_list_timeout_ms = DEFAULT_INITIAL_DEVICE_LIST_TIMEOUT_MS;
    }
    if config.adb.connection_timeout_ms == 0 {
        config.adb.connection_timeout_ms = AdbSettings::default().connection_timeout_ms;
    }
    if config.monkey.event_count == 0 {
        config.monkey.event_count = MonkeySettings::default().event_count;
    }
    let monkey = &mut config.monkey;
    for percent in [
        &mut monkey.percent_touch,
        &mut monkey.percent_motion,
        &mut monkey.percent_trackball,
        &mut monkey.percent_nav,
        &mut monkey.percent_major_nav,
        &mut monkey.percent_syskeys,
        &mut monkey.percent_appswitch,
        &mut monkey.percent_anyevent,
    ] {
        if percent.is_some_and(|value| value > 100) {
            *percent = None;
        }
    }
    if config.uiautomator.screenshots_path_on_device.trim().is_empty() {
        config.uiautomator.screenshots_path_on_device =
            DEFAULT_SCREENSHOTS_PATH_ON_DEVICE.to_string();
    }
    if config.target_dir.trim().is_empty() {
        config.target_dir = default_target_dir();
    }
    config
}
