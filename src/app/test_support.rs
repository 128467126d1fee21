use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::app::adb::runner::{CommandError, CommandOutput, CommandRequest, CommandRunner};
use crate::app::models::{Device, DeviceState};

pub fn physical(serial: &str) -> Device {
    Device {
        serial: serial.to_string(),
        state: DeviceState::Online,
        is_emulator: false,
        avd_name: None,
        model: None,
        properties: BTreeMap::new(),
    }
}

pub fn emulator(serial: &str, avd_name: &str) -> Device {
    Device {
        serial: serial.to_string(),
        state: DeviceState::Online,
        is_emulator: true,
        avd_name: Some(avd_name.to_string()),
        model: None,
        properties: BTreeMap::new(),
    }
}

struct Rule {
    needle: String,
    result: Result<String, CommandError>,
}

/// Answers commands by the first rule whose needle occurs in the command line. Anything
/// unmatched succeeds with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, stdout: &str) -> Self {
        self.rules.lock().expect("rules").push(Rule {
            needle: needle.to_string(),
            result: Ok(stdout.to_string()),
        });
        self
    }

    pub fn fail(self, needle: &str, err: CommandError) -> Self {
        self.rules.lock().expect("rules").push(Rule {
            needle: needle.to_string(),
            result: Err(err),
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    fn answer(&self, request: &CommandRequest) -> Result<String, CommandError> {
        let line = request.display_line();
        self.calls.lock().expect("calls").push(line.clone());
        let rules = self.rules.lock().expect("rules");
        rules
            .iter()
            .find(|rule| line.contains(&rule.needle))
            .map(|rule| rule.result.clone())
            .unwrap_or_else(|| Ok(String::new()))
    }
}

impl CommandRunner for ScriptedRunner {
    fn execute(
        &self,
        request: &CommandRequest,
        _trace_id: &str,
    ) -> Result<CommandOutput, CommandError> {
        self.answer(request).map(|stdout| CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    fn execute_streaming(
        &self,
        request: &CommandRequest,
        on_line: &mut dyn FnMut(&str),
        _trace_id: &str,
    ) -> Result<CommandOutput, CommandError> {
        let stdout = self.answer(request)?;
        for line in stdout.lines() {
            on_line(line.trim_end_matches('\r'));
        }
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }
}
