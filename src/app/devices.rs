use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::app::adb::bridge::AdbBridge;
use crate::app::adb::parse::{
    has_device_list_header, parse_adb_devices, parse_emulator_avd_name, parse_getprop_map,
};
use crate::app::adb::runner::{CommandRequest, CommandRunner};
use crate::app::error::AppError;
use crate::app::models::{Device, DeviceState};

const MANUFACTURER_PROPERTY: &str = "ro.product.manufacturer";
const MODEL_PROPERTY: &str = "ro.product.model";

/// Live source of attached devices.
pub trait DeviceBackend: Send + Sync {
    fn connect(&self, trace_id: &str) -> Result<(), AppError>;

    fn is_connected(&self) -> bool;

    /// `Ok(None)` while the backend has not reported its first device list.
    fn device_list(&self, trace_id: &str) -> Result<Option<Vec<Device>>, AppError>;
}

pub struct AdbDeviceBackend {
    runner: Arc<dyn CommandRunner>,
    adb_program: String,
    bridge: Arc<AdbBridge>,
    query_timeout: Duration,
}

impl AdbDeviceBackend {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        adb_program: impl Into<String>,
        bridge: Arc<AdbBridge>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            adb_program: adb_program.into(),
            bridge,
            query_timeout,
        }
    }

    fn describe(&self, serial: String, state: DeviceState, model: Option<String>, trace_id: &str) -> Device {
        let is_emulator = serial.starts_with("emulator-");
        let mut device = Device {
            serial,
            state,
            is_emulator,
            avd_name: None,
            model,
            properties: Default::default(),
        };
        if !device.state.is_online() {
            return device;
        }

        let getprop = CommandRequest::adb_shell(&self.adb_program, &device.serial, "getprop")
            .with_timeout(Some(self.query_timeout));
        match self.runner.execute(&getprop, trace_id) {
            Ok(output) => device.properties = parse_getprop_map(&output.stdout),
            Err(err) => warn!(
                trace_id = %trace_id,
                serial = %device.serial,
                error = %err,
                "failed to read device properties"
            ),
        }
        if device.model.is_none() {
            device.model = device.property(MODEL_PROPERTY).map(str::to_string);
        }

        if device.is_emulator {
            let avd = CommandRequest::adb(&self.adb_program, &device.serial, &["emu", "avd", "name"])
                .with_timeout(Some(self.query_timeout));
            match self.runner.execute(&avd, trace_id) {
                Ok(output) => device.avd_name = parse_emulator_avd_name(&output.stdout),
                Err(err) => warn!(
                    trace_id = %trace_id,
                    serial = %device.serial,
                    error = %err,
                    "failed to read emulator avd name"
                ),
            }
        }
        device
    }
}

impl DeviceBackend for AdbDeviceBackend {
    fn connect(&self, trace_id: &str) -> Result<(), AppError> {
        self.bridge.ensure_initialized(|| {
            let request = CommandRequest::new(&self.adb_program, vec!["start-server".to_string()])
                .with_timeout(Some(self.query_timeout));
            self.runner
                .execute(&request, trace_id)
                .map(|_| ())
                .map_err(|err| {
                    AppError::dependency(format!("Failed to start adb server: {err}"), trace_id)
                })
        })
    }

    fn is_connected(&self) -> bool {
        self.bridge.is_initialized()
    }

    fn device_list(&self, trace_id: &str) -> Result<Option<Vec<Device>>, AppError> {
        let request = CommandRequest::new(&self.adb_program, vec!["devices".to_string(), "-l".to_string()])
            .with_timeout(Some(self.query_timeout));
        let output = match self.runner.execute(&request, trace_id) {
            Ok(output) => output,
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "adb devices failed");
                return Ok(None);
            }
        };
        if !has_device_list_header(&output.stdout) {
            return Ok(None);
        }
        let devices = parse_adb_devices(&output.stdout)
            .into_iter()
            .map(|summary| {
                let state = DeviceState::from_adb(&summary.state);
                self.describe(summary.serial, state, summary.model, trace_id)
            })
            .collect();
        Ok(Some(devices))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryTimeouts {
    pub connect_trials: u32,
    pub connect_poll: Duration,
    pub initial_list_timeout: Duration,
    pub initial_list_poll: Duration,
}

impl Default for RegistryTimeouts {
    fn default() -> Self {
        Self {
            connect_trials: 10,
            connect_poll: Duration::from_millis(50),
            initial_list_timeout: Duration::from_secs(60),
            initial_list_poll: Duration::from_secs(1),
        }
    }
}

pub struct DeviceRegistry {
    backend: Arc<dyn DeviceBackend>,
    timeouts: RegistryTimeouts,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn DeviceBackend>, timeouts: RegistryTimeouts) -> Self {
        Self { backend, timeouts }
    }

    /// Fails when the backend cannot be reached. A backend that never reports its first list
    /// is logged and treated as having no devices.
    pub fn list_connected_devices(&self, trace_id: &str) -> Result<Vec<Device>, AppError> {
        self.backend.connect(trace_id)?;
        self.wait_until_connected(trace_id)?;

        let start = Instant::now();
        loop {
            if let Some(devices) = self.backend.device_list(trace_id)? {
                return Ok(devices);
            }
            if start.elapsed() >= self.timeouts.initial_list_timeout {
                error!(trace_id = %trace_id, "Timeout getting device list!");
                return Ok(Vec::new());
            }
            std::thread::sleep(self.timeouts.initial_list_poll);
        }
    }

    fn wait_until_connected(&self, trace_id: &str) -> Result<(), AppError> {
        for _ in 0..self.timeouts.connect_trials.max(1) {
            if self.backend.is_connected() {
                return Ok(());
            }
            std::thread::sleep(self.timeouts.connect_poll);
        }
        if self.backend.is_connected() {
            return Ok(());
        }
        Err(AppError::dependency(
            "Android Debug Bridge is not connected.",
            trace_id,
        ))
    }
}

/// Configured device criteria. Empty selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSelector {
    criteria: Vec<String>,
}

impl DeviceSelector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn emulators() -> Self {
        Self::from_values(["emulator"])
    }

    pub fn physical() -> Self {
        Self::from_values(["usb"])
    }

    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let criteria = values
            .into_iter()
            .map(|value| value.as_ref().trim().to_string())
            .filter(|value| !value.is_empty())
            .collect();
        Self { criteria }
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn matches(&self, device: &Device) -> bool {
        if self.criteria.is_empty() {
            return true;
        }
        self.criteria.iter().any(|criterion| {
            if criterion == "usb" {
                !device.is_emulator
            } else if criterion == "emulator" {
                device.is_emulator
            } else if device.is_emulator {
                device
                    .avd_name
                    .as_deref()
                    .is_some_and(|avd| avd.eq_ignore_ascii_case(criterion))
            } else {
                device.serial.eq_ignore_ascii_case(criterion)
            }
        })
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.criteria.join(", "))
    }
}

/// Devices matching `selector`, in connection order. A non-empty selector matching nothing is
/// an error.
pub fn select(
    devices: &[Device],
    selector: &DeviceSelector,
    trace_id: &str,
) -> Result<Vec<Device>, AppError> {
    let selected: Vec<Device> = devices
        .iter()
        .filter(|device| selector.matches(device))
        .cloned()
        .collect();

    for device in &selected {
        let kind = if device.is_emulator { "Emulator" } else { "Device" };
        info!(
            trace_id = %trace_id,
            serial = %device.serial,
            "{kind} {} found.",
            descriptive_name_with_status(device)
        );
    }

    if selected.is_empty() && !selector.is_empty() {
        return Err(AppError::no_device(
            format!("No device found for devices={selector}"),
            trace_id,
        ));
    }
    Ok(selected)
}

fn fix_file_name(name: &str) -> String {
    name.chars()
        .map(|ch| match ch {
            '/' | '\n' | '\r' | '\t' | '\0' | '\u{c}' | '`' | '?' | '*' | '\\' | '<' | '>' | '|'
            | '"' | ':' => '_',
            other => other,
        })
        .collect()
}

fn property_without_whitespace(device: &Device, key: &str) -> Option<String> {
    device
        .property(key)
        .map(|value| value.chars().filter(|ch| !ch.is_whitespace()).collect::<String>())
        .filter(|value| !value.is_empty())
}

/// `serial[_avd][_manufacturer][_model]`, safe for file names.
pub fn descriptive_name(device: &Device) -> String {
    let mut name = device.serial.clone();
    if let Some(avd) = device.avd_name.as_deref() {
        name.push('_');
        name.push_str(avd);
    }
    for key in [MANUFACTURER_PROPERTY, MODEL_PROPERTY] {
        if let Some(value) = property_without_whitespace(device, key) {
            name.push('_');
            name.push_str(&value);
        }
    }
    fix_file_name(&name)
}

pub fn descriptive_name_with_status(device: &Device) -> String {
    format!("{} {}", descriptive_name(device), device.state.label())
}

pub fn log_prefix(device: &Device) -> String {
    format!("{} :   ", descriptive_name(device))
}
