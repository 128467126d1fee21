use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::app::adb::parse::parse_install_output;
use crate::app::devices::log_prefix;
use crate::app::dispatcher::DeviceJob;
use crate::app::error::{AppError, JobFailure};
use crate::app::jobs::TestJobRunner;
use crate::app::models::Device;

/// `adb install -r <apk>` on every device.
pub struct DeployJob {
    runner: Arc<TestJobRunner>,
    apk: PathBuf,
}

impl DeployJob {
    pub fn new(runner: Arc<TestJobRunner>, apk: impl Into<PathBuf>, trace_id: &str) -> Result<Self, AppError> {
        let apk = apk.into();
        if !apk.is_file() {
            return Err(AppError::validation(
                format!("APK not found: {}", apk.display()),
                trace_id,
            ));
        }
        Ok(Self { runner, apk })
    }
}

impl DeviceJob for DeployJob {
    fn name(&self) -> &str {
        "deploy"
    }

    fn do_with_device(&self, device: &Device, trace_id: &str) -> Result<(), JobFailure> {
        let prefix = log_prefix(device);
        let apk = self.apk.to_string_lossy().to_string();
        let output = self
            .runner
            .adb(device, &["install", "-r", apk.as_str()], trace_id)
            .map_err(|err| err.into_job_failure(&device.serial))?;
        match parse_install_output(&output) {
            Ok(()) => {
                info!(trace_id = %trace_id, serial = %device.serial, "{prefix}Successfully installed {apk}");
                Ok(())
            }
            Err(reason) => Err(JobFailure::device_rejected(
                &device.serial,
                format!("{prefix}Install of {apk} failed - [{reason}]"),
            )),
        }
    }
}

/// `adb uninstall <package>`. A device that refuses is logged and skipped.
pub struct UndeployJob {
    runner: Arc<TestJobRunner>,
    package: String,
}

impl UndeployJob {
    pub fn new(runner: Arc<TestJobRunner>, package: &str, trace_id: &str) -> Result<Self, AppError> {
        let package = package.trim();
        if package.is_empty() {
            return Err(AppError::validation("Package name is required", trace_id));
        }
        Ok(Self {
            runner,
            package: package.to_string(),
        })
    }
}

impl DeviceJob for UndeployJob {
    fn name(&self) -> &str {
        "undeploy"
    }

    fn do_with_device(&self, device: &Device, trace_id: &str) -> Result<(), JobFailure> {
        let prefix = log_prefix(device);
        let outcome = self
            .runner
            .adb(device, &["uninstall", self.package.as_str()], trace_id)
            .map_err(|err| err.to_string())
            .and_then(|output| parse_install_output(&output));
        match outcome {
            Ok(()) => info!(
                trace_id = %trace_id,
                serial = %device.serial,
                "{prefix}Successfully uninstalled {}",
                self.package
            ),
            Err(reason) => warn!(
                trace_id = %trace_id,
                serial = %device.serial,
                "{prefix}Uninstall of {} failed: {reason}",
                self.package
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::runner::CommandError;
    use crate::app::config::RunConfig;
    use crate::app::error::JobFailureKind;
    use crate::app::test_support::{physical, ScriptedRunner};
    use tempfile::TempDir;

    fn job_runner(scripted: Arc<ScriptedRunner>) -> Arc<TestJobRunner> {
        Arc::new(TestJobRunner::new(scripted, "adb", &RunConfig::default()))
    }

    #[test]
    fn deploy_installs_with_replace() {
        let dir = TempDir::new().expect("tmp");
        let apk = dir.path().join("app.apk");
        std::fs::write(&apk, b"apk").expect("apk");
        let scripted = Arc::new(ScriptedRunner::new().on("install -r", "Performing Streamed Install\nSuccess\n"));
        let job = DeployJob::new(job_runner(scripted.clone()), &apk, "trace").expect("job");

        job.do_with_device(&physical("SER1"), "trace").expect("installed");
        assert_eq!(
            scripted.calls(),
            vec![format!("adb -s SER1 install -r {}", apk.display())]
        );
    }

    #[test]
    fn deploy_reports_install_failure_reason() {
        let dir = TempDir::new().expect("tmp");
        let apk = dir.path().join("app.apk");
        std::fs::write(&apk, b"apk").expect("apk");
        let scripted = Arc::new(
            ScriptedRunner::new().on("install -r", "Failure [INSTALL_FAILED_VERSION_DOWNGRADE]\n"),
        );
        let job = DeployJob::new(job_runner(scripted), &apk, "trace").expect("job");

        let failure = job.do_with_device(&physical("SER1"), "trace").expect_err("rejected");
        assert_eq!(failure.kind, JobFailureKind::DeviceRejected);
        assert!(failure.message.contains("INSTALL_FAILED_VERSION_DOWNGRADE"));
    }

    #[test]
    fn deploy_requires_existing_apk() {
        let scripted = Arc::new(ScriptedRunner::new());
        let err = DeployJob::new(job_runner(scripted), "/nonexistent/app.apk", "trace")
            .err()
            .expect("missing apk");
        assert_eq!(err.code, "ERR_VALIDATION");
    }

    #[test]
    fn undeploy_failure_is_not_fatal() {
        let scripted = Arc::new(ScriptedRunner::new().fail(
            "uninstall",
            CommandError::NonZeroExit {
                code: Some(1),
                stderr: "device offline".to_string(),
            },
        ));
        let job = UndeployJob::new(job_runner(scripted.clone()), "com.example", "trace").expect("job");
        job.do_with_device(&physical("SER1"), "trace").expect("non fatal");
        assert_eq!(scripted.calls(), vec!["adb -s SER1 uninstall com.example".to_string()]);
    }
}
