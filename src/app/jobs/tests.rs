use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::instrument::InstrumentJob;
use super::monkey::MonkeyJob;
use super::uiautomator::UiAutomatorJob;
use super::TestJobRunner;
use crate::app::adb::bridge::AdbBridge;
use crate::app::adb::runner::CommandError;
use crate::app::config::RunConfig;
use crate::app::devices::{AdbDeviceBackend, DeviceRegistry, DeviceSelector, RegistryTimeouts};
use crate::app::dispatcher::{do_with_devices, DeviceJob, DeviceJobDispatcher, DispatchSummary};
use crate::app::error::JobFailureKind;
use crate::app::test_support::ScriptedRunner;

const DEVICES: &str = "List of devices attached\nUSB1\tdevice\nUSB2\tdevice\nemulator-5554\tdevice\n";

const PASSING_RUN: &str = "\
INSTRUMENTATION_STATUS: class=com.example.FooTest
INSTRUMENTATION_STATUS: test=testBar
INSTRUMENTATION_STATUS: numtests=1
INSTRUMENTATION_STATUS: current=1
INSTRUMENTATION_STATUS_CODE: 1
INSTRUMENTATION_STATUS: class=com.example.FooTest
INSTRUMENTATION_STATUS: test=testBar
INSTRUMENTATION_STATUS_CODE: 0
INSTRUMENTATION_RESULT: stream=
OK (1 test)
Time: 0.5
INSTRUMENTATION_CODE: -1
";

const FAILING_RUN: &str = "\
INSTRUMENTATION_STATUS: class=com.example.FooTest
INSTRUMENTATION_STATUS: test=testBar
INSTRUMENTATION_STATUS: numtests=1
INSTRUMENTATION_STATUS: current=1
INSTRUMENTATION_STATUS_CODE: 1
INSTRUMENTATION_STATUS: class=com.example.FooTest
INSTRUMENTATION_STATUS: test=testBar
INSTRUMENTATION_STATUS: stack=java.lang.AssertionError: expected:<1> but was:<2>
at com.example.FooTest.testBar(FooTest.java:12)
INSTRUMENTATION_STATUS_CODE: -2
INSTRUMENTATION_RESULT: stream=
FAILURES!!!
Time: 0.7
INSTRUMENTATION_CODE: -1
";

struct Harness {
    target: TempDir,
    config: RunConfig,
    registry: DeviceRegistry,
    runner: Arc<TestJobRunner>,
    scripted: Arc<ScriptedRunner>,
}

fn harness(scripted: ScriptedRunner) -> Harness {
    let target = TempDir::new().expect("tmp");
    let mut config = RunConfig::default();
    config.target_dir = target.path().to_string_lossy().to_string();
    config.test.instrumentation_package = "com.example.test".to_string();
    config.monkey.create_report = true;

    let scripted = Arc::new(scripted);
    let backend = AdbDeviceBackend::new(
        scripted.clone(),
        "adb",
        Arc::new(AdbBridge::new()),
        Duration::from_secs(1),
    );
    let registry = DeviceRegistry::new(
        Arc::new(backend),
        RegistryTimeouts {
            connect_trials: 2,
            connect_poll: Duration::from_millis(5),
            initial_list_timeout: Duration::from_millis(50),
            initial_list_poll: Duration::from_millis(5),
        },
    );
    let runner = Arc::new(
        TestJobRunner::new(scripted.clone(), "adb", &config).with_host_properties(BTreeMap::new()),
    );
    Harness {
        target,
        config,
        registry,
        runner,
        scripted,
    }
}

const FAILED_TO_START: &str = "\
INSTRUMENTATION_FAILED: com.example.test/x
INSTRUMENTATION_CODE: 0
";

/// Rebuilds the shared runner after a test changed the ignore flags.
fn refresh_runner(harness: &mut Harness) {
    harness.runner = Arc::new(
        TestJobRunner::new(harness.scripted.clone(), "adb", &harness.config)
            .with_host_properties(BTreeMap::new()),
    );
}

fn run_on_usb1(harness: &Harness, job: Arc<dyn DeviceJob>) -> DispatchSummary {
    do_with_devices(
        &harness.registry,
        &DeviceSelector::from_values(["USB1"]),
        &DeviceJobDispatcher::new(0),
        job,
        "trace",
    )
    .expect("dispatch")
}

fn report(harness: &Harness, name: &str) -> Option<String> {
    fs::read_to_string(
        harness
            .target
            .path()
            .join("surefire-reports")
            .join(format!("TEST-{name}.xml")),
    )
    .ok()
}

#[test]
fn instrumentation_runs_on_selected_usb_devices() {
    let harness = harness(
        ScriptedRunner::new()
            .on("devices -l", DEVICES)
            .on("emu avd name", "Pixel_7\nOK\n")
            .on("am instrument", PASSING_RUN),
    );
    let job = InstrumentJob::from_config(&harness.config, harness.runner.clone(), "trace").expect("job");

    assert_eq!(harness.config.device.device_threads, 0);
    let summary = do_with_devices(
        &harness.registry,
        &DeviceSelector::physical(),
        &DeviceJobDispatcher::new(harness.config.device.device_threads),
        Arc::new(job),
        "trace",
    )
    .expect("dispatch");

    assert!(summary.is_success());
    assert_eq!(summary.outcomes.len(), 2);
    let usb1 = report(&harness, "USB1").expect("USB1 report");
    assert!(usb1.contains("tests=\"1\" failures=\"0\" errors=\"0\""));
    assert!(usb1.contains("<testcase classname=\"com.example.FooTest\" name=\"testBar\""));
    assert!(report(&harness, "USB2").is_some());
    assert!(report(&harness, "emulator-5554_Pixel_7").is_none());

    let instrumented: Vec<String> = harness
        .scripted
        .calls()
        .into_iter()
        .filter(|call| call.contains("am instrument"))
        .collect();
    assert_eq!(instrumented.len(), 2);
    assert!(instrumented.iter().all(|call| !call.contains("emulator-5554")));
}

#[test]
fn failing_device_is_reported_while_others_pass() {
    let harness = harness(
        ScriptedRunner::new()
            .on("devices -l", DEVICES)
            .on("emu avd name", "Pixel_7\nOK\n")
            .on("-s USB2 shell am instrument", FAILING_RUN)
            .on("am instrument", PASSING_RUN),
    );
    let job = InstrumentJob::from_config(&harness.config, harness.runner.clone(), "trace").expect("job");

    let summary = do_with_devices(
        &harness.registry,
        &DeviceSelector::all(),
        &DeviceJobDispatcher::new(0),
        Arc::new(job),
        "trace",
    )
    .expect("dispatch");

    assert_eq!(summary.outcomes.len(), 3);
    assert_eq!(summary.failures().count(), 1);
    let failure = summary.first_failure().expect("failure");
    assert_eq!(failure.serial, "USB2");
    assert_eq!(failure.kind, JobFailureKind::TestFailure);
    assert_eq!(failure.message, "USB2 :   Tests failed on device.");

    let usb2 = report(&harness, "USB2").expect("USB2 report");
    assert!(usb2.contains("errors=\"1\""));
    assert!(usb2.contains("type=\"java.lang.AssertionError\""));
    assert!(report(&harness, "emulator-5554_Pixel_7").is_some());

    let err = summary.into_result("trace").expect_err("raised");
    assert_eq!(err.code, "ERR_JOB");
}

#[test]
fn ignored_failures_do_not_fail_the_device() {
    let mut harness = harness(
        ScriptedRunner::new()
            .on("devices -l", DEVICES)
            .on("am instrument", FAILING_RUN),
    );
    harness.config.ignore.test_errors = true;
    harness.config.ignore.test_failures = true;
    let runner = Arc::new(
        TestJobRunner::new(harness.scripted.clone(), "adb", &harness.config)
            .with_host_properties(BTreeMap::new()),
    );
    let job = InstrumentJob::from_config(&harness.config, runner, "trace").expect("job");

    let summary = do_with_devices(
        &harness.registry,
        &DeviceSelector::from_values(["USB1"]),
        &DeviceJobDispatcher::new(1),
        Arc::new(job),
        "trace",
    )
    .expect("dispatch");
    assert!(summary.is_success());
}

#[test]
fn timed_out_device_is_classified_and_still_reported() {
    let harness = harness(
        ScriptedRunner::new()
            .on("devices -l", DEVICES)
            .fail("-s USB1 shell am instrument", CommandError::Timeout(Duration::from_secs(1800)))
            .on("am instrument", PASSING_RUN),
    );
    let job = InstrumentJob::from_config(&harness.config, harness.runner.clone(), "trace").expect("job");

    let summary = do_with_devices(
        &harness.registry,
        &DeviceSelector::physical(),
        &DeviceJobDispatcher::new(0),
        Arc::new(job),
        "trace",
    )
    .expect("dispatch");

    let failure = summary.first_failure().expect("timeout");
    assert_eq!(failure.serial, "USB1");
    assert_eq!(failure.kind, JobFailureKind::Timeout);
    assert!(report(&harness, "USB1").is_some());
    assert!(summary.outcomes[1].result.is_ok());
}

#[test]
fn no_attached_devices_is_an_error() {
    let harness = harness(ScriptedRunner::new().on("devices -l", "List of devices attached\n\n"));
    let job = InstrumentJob::from_config(&harness.config, harness.runner.clone(), "trace").expect("job");
    let err = do_with_devices(
        &harness.registry,
        &DeviceSelector::all(),
        &DeviceJobDispatcher::new(0),
        Arc::new(job),
        "trace",
    )
    .expect_err("no devices");
    assert_eq!(err.code, "ERR_NO_DEVICE");
    assert_eq!(err.error, "No online devices attached.");
}

#[test]
fn unmatched_selector_is_an_error() {
    let harness = harness(ScriptedRunner::new().on("devices -l", DEVICES));
    let job = InstrumentJob::from_config(&harness.config, harness.runner.clone(), "trace").expect("job");
    let err = do_with_devices(
        &harness.registry,
        &DeviceSelector::from_values(["NOPE"]),
        &DeviceJobDispatcher::new(0),
        Arc::new(job),
        "trace",
    )
    .expect_err("no match");
    assert_eq!(err.code, "ERR_NO_DEVICE");
    assert!(harness.scripted.calls().iter().all(|call| !call.contains("am instrument")));
}

#[test]
fn monkey_crash_fails_the_device() {
    let output = "\
:Monkey: seed=42 count=2
:Switch: #Intent;action=android.intent.action.MAIN;end
:Sending Touch (ACTION_DOWN): 0:(100.0,200.0)
// CRASH: com.example.app (pid 1234)
// Short Msg: java.lang.NullPointerException
// Long Msg: java.lang.NullPointerException: boom
// Build Label: google/sdk/generic:14
// Build Changelist: 1
// Build Time: 1700000000000
// java.lang.NullPointerException: boom
// \tat com.example.Main.onClick(Main.java:10)
//
** Monkey aborted due to error.
";
    let harness = harness(
        ScriptedRunner::new()
            .on("devices -l", "List of devices attached\nUSB1\tdevice\n")
            .on("monkey -v -v -v", output),
    );
    let job = MonkeyJob::from_config(&harness.config, harness.runner.clone());

    let summary = do_with_devices(
        &harness.registry,
        &DeviceSelector::all(),
        &DeviceJobDispatcher::new(0),
        Arc::new(job),
        "trace",
    )
    .expect("dispatch");

    let failure = summary.first_failure().expect("crash");
    assert_eq!(failure.kind, JobFailureKind::TestFailure);
    let xml = report(&harness, "USB1").expect("monkey report");
    assert!(xml.contains("name=\"ui monkey tests\""));
    assert!(xml.contains("classname=\"MonkeyTest\""));
}

#[test]
fn incomplete_instrumentation_run_fails_the_device() {
    let harness = harness(
        ScriptedRunner::new()
            .on("devices -l", DEVICES)
            .on("am instrument", FAILED_TO_START),
    );
    let job = InstrumentJob::from_config(&harness.config, harness.runner.clone(), "trace").expect("job");

    let summary = run_on_usb1(&harness, Arc::new(job));
    let failure = summary.first_failure().expect("incomplete");
    assert_eq!(failure.kind, JobFailureKind::TestRunIncomplete);
    assert_eq!(
        failure.message,
        "USB1 :   Test run failed to complete: com.example.test/x"
    );
}

#[test]
fn fail_safe_instrumentation_tolerates_incomplete_and_failing_runs() {
    let mut harness = harness(
        ScriptedRunner::new()
            .on("devices -l", DEVICES)
            .on("-s USB1 shell am instrument", FAILED_TO_START)
            .on("am instrument", FAILING_RUN),
    );
    harness.config.test.fail_safe = true;
    let job = InstrumentJob::from_config(&harness.config, harness.runner.clone(), "trace").expect("job");

    let summary = do_with_devices(
        &harness.registry,
        &DeviceSelector::physical(),
        &DeviceJobDispatcher::new(0),
        Arc::new(job),
        "trace",
    )
    .expect("dispatch");
    assert!(summary.is_success());
    assert!(report(&harness, "USB1").is_some());
    assert!(report(&harness, "USB2").expect("USB2 report").contains("errors=\"1\""));
}

#[test]
fn ignored_monkey_crash_does_not_fail_the_device() {
    let output = "\
:Monkey: seed=42 count=1
:Sending Touch (ACTION_DOWN): 0:(100.0,200.0)
// CRASH: com.example.app (pid 1234)
// Short Msg: java.lang.NullPointerException
// Long Msg: java.lang.NullPointerException: boom
// Build Time: 1700000000000
// java.lang.NullPointerException: boom
//
** Monkey aborted due to error.
";
    let mut harness = harness(
        ScriptedRunner::new()
            .on("devices -l", DEVICES)
            .on("monkey -v -v -v", output),
    );
    harness.config.ignore.test_failures = true;
    harness.config.ignore.test_errors = true;
    refresh_runner(&mut harness);
    let job = MonkeyJob::from_config(&harness.config, harness.runner.clone());

    let summary = run_on_usb1(&harness, Arc::new(job));
    assert!(summary.is_success());
    let xml = report(&harness, "USB1").expect("monkey report");
    assert!(xml.contains("java.lang.NullPointerException"));
}

#[test]
fn uiautomator_ignores_failures_but_not_incomplete_runs() {
    let mut harness = harness(
        ScriptedRunner::new()
            .on("devices -l", DEVICES)
            .on("-s USB1 shell uiautomator", FAILING_RUN)
            .on("-s USB2 shell uiautomator", FAILED_TO_START),
    );
    harness.config.uiautomator.jar_file = "uitests.jar".to_string();
    harness.config.test.fail_safe = true;
    harness.config.ignore.test_failures = true;
    harness.config.ignore.test_errors = true;
    refresh_runner(&mut harness);
    let job = UiAutomatorJob::from_config(&harness.config, harness.runner.clone(), "trace").expect("job");

    let summary = do_with_devices(
        &harness.registry,
        &DeviceSelector::physical(),
        &DeviceJobDispatcher::new(0),
        Arc::new(job),
        "trace",
    )
    .expect("dispatch");
    assert_eq!(summary.failures().count(), 1);
    let failure = summary.first_failure().expect("incomplete");
    assert_eq!(failure.serial, "USB2");
    assert_eq!(failure.kind, JobFailureKind::TestRunIncomplete);
}
