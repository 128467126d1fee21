use std::path::{Path, PathBuf};

use crate::app::error::AppError;

const SDK_ENV_VARS: [&str; 2] = ["ANDROID_HOME", "ANDROID_SDK_ROOT"];

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

fn adb_file_name() -> &'static str {
    if cfg!(windows) {
        "adb.exe"
    } else {
        "adb"
    }
}

/// `<sdk>/platform-tools/adb` for the first SDK root that has one.
pub fn sdk_adb_path(sdk_roots: &[PathBuf]) -> Option<PathBuf> {
    sdk_roots
        .iter()
        .map(|root| root.join("platform-tools").join(adb_file_name()))
        .find(|candidate| candidate.is_file())
}

/// Configured path first, then the SDK from the environment, then `adb` on `PATH`.
pub fn resolve_adb_program(config_command_path: &str) -> String {
    let sdk_roots: Vec<PathBuf> = SDK_ENV_VARS
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .collect();
    resolve_adb_program_with(config_command_path, &sdk_roots)
}

pub fn resolve_adb_program_with(config_command_path: &str, sdk_roots: &[PathBuf]) -> String {
    let normalized = normalize_command_path(config_command_path);
    if !normalized.is_empty() {
        return normalized;
    }
    sdk_adb_path(sdk_roots)
        .map(|path| path.to_string_lossy().to_string())
        .unwrap_or_else(|| "adb".to_string())
}

pub fn validate_adb_program(program: &str, trace_id: &str) -> Result<(), AppError> {
    if program.trim().is_empty() {
        return Err(AppError::validation("ADB command is empty", trace_id));
    }
    if program == "adb" {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err(AppError::validation(
            "ADB path must point to an executable file",
            trace_id,
        ));
    }
    if !path.exists() {
        return Err(AppError::dependency(
            format!("ADB executable not found at {program}"),
            trace_id,
        ));
    }
    Ok(())
}
