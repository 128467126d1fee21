use std::fmt;
use std::path::PathBuf;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::app::error::JobFailure;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    /// Treat any stderr output as a rejection even when the exit code is zero.
    pub fail_on_stderr: bool,
    /// `None` inherits the current directory.
    pub working_dir: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl CommandRequest {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Some(Duration::from_secs(10)),
            fail_on_stderr: false,
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// `adb -s <serial> <args...>`
    pub fn adb(program: &str, serial: &str, args: &[&str]) -> Self {
        let mut full = vec!["-s".to_string(), serial.to_string()];
        full.extend(args.iter().map(|arg| arg.to_string()));
        Self::new(program, full)
    }

    /// `adb -s <serial> shell <command>`
    pub fn adb_shell(program: &str, serial: &str, command: &str) -> Self {
        Self::adb(program, serial, &["shell", command])
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|value| !value.is_zero());
        self
    }

    pub fn failing_on_stderr(mut self) -> Self {
        self.fail_on_stderr = true;
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Spawn(String),
    Timeout(Duration),
    Io(String),
    NonZeroExit { code: Option<i32>, stderr: String },
    Stderr(String),
}

impl CommandError {
    pub fn into_job_failure(self, serial: &str) -> JobFailure {
        match self {
            CommandError::Timeout(_) => JobFailure::timeout(serial, "timeout"),
            CommandError::NonZeroExit { .. } | CommandError::Stderr(_) => {
                JobFailure::device_rejected(serial, format!("adb command rejected: {self}"))
            }
            CommandError::Spawn(_) | CommandError::Io(_) => {
                JobFailure::io(serial, format!("IO problem: {self}"))
            }
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Spawn(err) => write!(f, "failed to spawn command: {err}"),
            CommandError::Timeout(after) => write!(f, "command timed out after {}ms", after.as_millis()),
            CommandError::Io(err) => write!(f, "command io failed: {err}"),
            CommandError::NonZeroExit { code, stderr } => {
                let code = code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string());
                if stderr.trim().is_empty() {
                    write!(f, "exit code {code}")
                } else {
                    write!(f, "exit code {code}: {}", stderr.trim())
                }
            }
            CommandError::Stderr(stderr) => write!(f, "{}", stderr.trim()),
        }
    }
}

impl std::error::Error for CommandError {}

/// Seam between orchestration and the host's process table.
pub trait CommandRunner: Send + Sync {
    fn execute(&self, request: &CommandRequest, trace_id: &str)
        -> Result<CommandOutput, CommandError>;

    /// Delivers stdout one line at a time, in order, while the process runs. The returned
    /// output carries stderr and the exit code; stdout has already been handed to `on_line`.
    fn execute_streaming(
        &self,
        request: &CommandRequest,
        on_line: &mut dyn FnMut(&str),
        trace_id: &str,
    ) -> Result<CommandOutput, CommandError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn execute(
        &self,
        request: &CommandRequest,
        trace_id: &str,
    ) -> Result<CommandOutput, CommandError> {
        debug!(trace_id = %trace_id, command = %request.display_line(), "executing command");
        let output = run_command_with_timeout(request)?;
        check_output(request, output)
    }

    fn execute_streaming(
        &self,
        request: &CommandRequest,
        on_line: &mut dyn FnMut(&str),
        trace_id: &str,
    ) -> Result<CommandOutput, CommandError> {
        debug!(trace_id = %trace_id, command = %request.display_line(), "streaming command");
        let output = run_streaming(request, on_line)?;
        check_output(request, output)
    }
}

fn check_output(request: &CommandRequest, output: CommandOutput) -> Result<CommandOutput, CommandError> {
    if output.exit_code != Some(0) {
        return Err(CommandError::NonZeroExit {
            code: output.exit_code,
            stderr: output.stderr,
        });
    }
    if request.fail_on_stderr && !output.stderr.trim().is_empty() {
        return Err(CommandError::Stderr(output.stderr));
    }
    Ok(output)
}

fn spawn_piped(request: &CommandRequest) -> Result<Child, CommandError> {
    let mut command = Command::new(&request.program);
    command.args(&request.args).envs(request.env.iter().map(|(key, value)| (key, value)));
    if let Some(dir) = &request.working_dir {
        command.current_dir(dir);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| CommandError::Spawn(err.to_string()))
}

// A chatty child blocks once the pipe buffer fills, so both streams are drained on their own
// threads.
fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

fn timed_out(start: Instant, timeout: Option<Duration>) -> bool {
    timeout.is_some_and(|limit| start.elapsed() > limit)
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

pub fn run_command_with_timeout(request: &CommandRequest) -> Result<CommandOutput, CommandError> {
    let timeout = request.timeout;
    let mut child = spawn_piped(request)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CommandError::Io("failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| CommandError::Io("failed to capture stderr".to_string()))?;
    let stdout_handle = drain(stdout);
    let stderr_handle = drain(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if timed_out(start, timeout) {
                    kill(&mut child);
                    return Err(CommandError::Timeout(start.elapsed()));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                kill(&mut child);
                return Err(CommandError::Io(err.to_string()));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

/// Splits stdout into lines without the trailing `\n` / `\r\n`.
pub fn run_streaming(
    request: &CommandRequest,
    on_line: &mut dyn FnMut(&str),
) -> Result<CommandOutput, CommandError> {
    let timeout = request.timeout;
    let mut child = spawn_piped(request)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CommandError::Io("failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| CommandError::Io("failed to capture stderr".to_string()))?;
    let stderr_handle = drain(stderr);

    let (sender, receiver) = mpsc::channel::<String>();
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut buffer = Vec::<u8>::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {
                    let mut line = String::from_utf8_lossy(&buffer).to_string();
                    while line.ends_with('\n') || line.ends_with('\r') {
                        line.pop();
                    }
                    if sender.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let start = Instant::now();
    loop {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(line) => on_line(&line),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if timed_out(start, timeout) {
            kill(&mut child);
            return Err(CommandError::Timeout(start.elapsed()));
        }
    }

    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if timed_out(start, timeout) {
                    kill(&mut child);
                    return Err(CommandError::Timeout(start.elapsed()));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                kill(&mut child);
                return Err(CommandError::Io(err.to_string()));
            }
        }
    };
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::new(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}
