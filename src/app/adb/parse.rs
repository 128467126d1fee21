use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::app::models::DeviceSummary;

/// `adb devices` always prints this header once the server answered, even with no devices.
pub fn has_device_list_header(output: &str) -> bool {
    output
        .lines()
        .any(|line| line.to_lowercase().contains("list of devices"))
}

pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let serial = tokens.next()?.to_string();
            let state = tokens.next()?.to_string();
            let mut summary = DeviceSummary {
                serial,
                state,
                model: None,
                product: None,
                device: None,
                transport_id: None,
            };
            for token in tokens {
                if let Some(value) = token.strip_prefix("model:") {
                    summary.model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("product:") {
                    summary.product = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("device:") {
                    summary.device = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("transport_id:") {
                    summary.transport_id = Some(value.to_string());
                }
            }
            Some(summary)
        })
        .collect()
}

pub fn parse_getprop_map(output: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('[') {
            continue;
        }
        let Some((key_part, value_part)) = trimmed.split_once("]: [") else {
            continue;
        };
        let key = key_part.trim_start_matches('[').trim();
        let value = value_part.trim_end_matches(']').trim();
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

/// Output of `adb -s emulator-XXXX emu avd name`: the name, then `OK`.
pub fn parse_emulator_avd_name(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .take_while(|line| *line != "OK")
        .find(|line| !line.is_empty())
        .filter(|line| !line.starts_with("KO"))
        .map(str::to_string)
}

fn install_failure_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Failure\s*\[([^\]]*)\]").ok())
        .as_ref()
}

/// `Ok(())` on `Success`, the bracketed reason on `Failure [...]`.
pub fn parse_install_output(output: &str) -> Result<(), String> {
    for line in output.lines().map(str::trim) {
        if line.starts_with("Success") {
            return Ok(());
        }
        if line.starts_with("Failure") {
            let reason = install_failure_regex()
                .and_then(|re| re.captures(line))
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|reason| !reason.is_empty());
            return Err(reason.unwrap_or_else(|| "Failure".to_string()));
        }
    }
    Err(format!("unexpected install output: {}", output.trim()))
}
