use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::app::devices::{descriptive_name, select, DeviceRegistry, DeviceSelector};
use crate::app::error::{AppError, JobFailure, JobFailureKind};
use crate::app::models::Device;
use crate::app::scheduler::WorkQueue;

/// Work applied identically to every selected device.
pub trait DeviceJob: Send + Sync {
    fn name(&self) -> &str;

    fn do_with_device(&self, device: &Device, trace_id: &str) -> Result<(), JobFailure>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub serial: String,
    pub descriptive_name: String,
    pub result: Result<(), JobFailure>,
    pub elapsed_ms: u64,
}

/// Every device's outcome, in device order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub job_name: String,
    pub outcomes: Vec<JobOutcome>,
}

impl DispatchSummary {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobFailure> {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().err())
    }

    pub fn first_failure(&self) -> Option<&JobFailure> {
        self.failures().next()
    }

    /// Raises the failure of the first device in dispatch order, if any.
    pub fn into_result(self, trace_id: &str) -> Result<DispatchSummary, AppError> {
        if let Some(failure) = self.first_failure() {
            return Err(AppError::job(failure, trace_id));
        }
        Ok(self)
    }

    pub fn log_summary(&self, trace_id: &str) {
        for outcome in &self.outcomes {
            match &outcome.result {
                Ok(()) => info!(
                    trace_id = %trace_id,
                    serial = %outcome.serial,
                    elapsed_ms = outcome.elapsed_ms,
                    "{} : {} succeeded",
                    outcome.descriptive_name,
                    self.job_name
                ),
                Err(failure) => error!(
                    trace_id = %trace_id,
                    serial = %outcome.serial,
                    kind = %failure.kind,
                    elapsed_ms = outcome.elapsed_ms,
                    "{} : {} failed: {}",
                    outcome.descriptive_name,
                    self.job_name,
                    failure.message
                ),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceJobDispatcher {
    device_threads: usize,
}

impl DeviceJobDispatcher {
    /// `device_threads == 0` runs every device at once.
    pub fn new(device_threads: usize) -> Self {
        Self { device_threads }
    }

    pub fn resolve_pool_size(&self, device_count: usize) -> usize {
        if self.device_threads == 0 {
            device_count.max(1)
        } else {
            self.device_threads
        }
    }

    /// Runs `job` once per device on a pool of `pool size` worker threads pulling from a shared
    /// queue. A failing or panicking device never stops the others; the call returns after every
    /// device finished.
    pub fn run_on_devices(
        &self,
        devices: Vec<Device>,
        job: Arc<dyn DeviceJob>,
        trace_id: &str,
    ) -> DispatchSummary {
        let pool_size = self.resolve_pool_size(devices.len()).min(devices.len().max(1));
        info!(
            trace_id = %trace_id,
            job = %job.name(),
            devices = devices.len(),
            pool_size,
            "dispatching device job"
        );

        let labels: Vec<(String, String)> = devices
            .iter()
            .map(|device| (device.serial.clone(), descriptive_name(device)))
            .collect();
        let queue = Arc::new(WorkQueue::new(devices));

        let mut workers = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            let queue = Arc::clone(&queue);
            let job = Arc::clone(&job);
            let trace = trace_id.to_string();
            let spawned = std::thread::Builder::new()
                .name(format!("device-worker-{index}"))
                .spawn(move || drain_queue(&queue, job.as_ref(), &trace));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => warn!(trace_id = %trace_id, worker = index, error = %err, "failed to start device worker"),
            }
        }

        let mut finished: Vec<Option<JobOutcome>> = labels.iter().map(|_| None).collect();
        for worker in workers {
            match worker.join() {
                Ok(outcomes) => {
                    for (position, outcome) in outcomes {
                        if let Some(slot) = finished.get_mut(position) {
                            *slot = Some(outcome);
                        }
                    }
                }
                Err(payload) => warn!(
                    trace_id = %trace_id,
                    "device worker exited early: {}",
                    panic_message(payload.as_ref())
                ),
            }
        }

        let outcomes = finished
            .into_iter()
            .zip(labels)
            .map(|(outcome, (serial, name))| {
                outcome.unwrap_or_else(|| JobOutcome {
                    serial: serial.clone(),
                    descriptive_name: name,
                    result: Err(JobFailure::io(serial, "No device worker ran the job")),
                    elapsed_ms: 0,
                })
            })
            .collect();

        DispatchSummary {
            job_name: job.name().to_string(),
            outcomes,
        }
    }
}

fn drain_queue(queue: &WorkQueue<Device>, job: &dyn DeviceJob, trace_id: &str) -> Vec<(usize, JobOutcome)> {
    let mut done = Vec::new();
    while let Some((position, device)) = queue.take_next() {
        done.push((position, run_device(&device, job, trace_id)));
    }
    done
}

fn run_device(device: &Device, job: &dyn DeviceJob, trace_id: &str) -> JobOutcome {
    let start = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| job.do_with_device(device, trace_id)))
        .unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            warn!(trace_id = %trace_id, serial = %device.serial, "device job panicked: {message}");
            Err(JobFailure::new(
                device.serial.clone(),
                JobFailureKind::Panicked,
                format!("worker panicked: {message}"),
            ))
        });
    JobOutcome {
        serial: device.serial.clone(),
        descriptive_name: descriptive_name(device),
        result,
        elapsed_ms: start.elapsed().as_millis() as u64,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Lists the connected devices, applies `selector` and runs `job` on the result.
pub fn do_with_devices(
    registry: &DeviceRegistry,
    selector: &DeviceSelector,
    dispatcher: &DeviceJobDispatcher,
    job: Arc<dyn DeviceJob>,
    trace_id: &str,
) -> Result<DispatchSummary, AppError> {
    let devices = registry.list_connected_devices(trace_id)?;
    if devices.is_empty() {
        return Err(AppError::no_device("No online devices attached.", trace_id));
    }
    let selected = select(&devices, selector, trace_id)?;
    Ok(dispatcher.run_on_devices(selected, job, trace_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::{emulator, physical};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingJob {
        seen: Mutex<HashSet<String>>,
        fail: Vec<&'static str>,
        panic_on: Option<&'static str>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        threads: Mutex<HashSet<String>>,
    }

    impl RecordingJob {
        fn new(fail: Vec<&'static str>) -> Self {
            Self {
                seen: Mutex::new(HashSet::new()),
                fail,
                panic_on: None,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                threads: Mutex::new(HashSet::new()),
            }
        }
    }

    impl DeviceJob for RecordingJob {
        fn name(&self) -> &str {
            "recording"
        }

        fn do_with_device(&self, device: &Device, _trace_id: &str) -> Result<(), JobFailure> {
            let current = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(current, Ordering::SeqCst);
            if let Some(name) = std::thread::current().name() {
                self.threads.lock().expect("threads").insert(name.to_string());
            }
            std::thread::sleep(Duration::from_millis(50));
            self.seen.lock().expect("seen").insert(device.serial.clone());
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.panic_on == Some(device.serial.as_str()) {
                panic!("device {} exploded", device.serial);
            }
            if self.fail.contains(&device.serial.as_str()) {
                return Err(JobFailure::test_failure(&device.serial, "Tests failed on device."));
            }
            Ok(())
        }
    }

    fn devices(count: usize) -> Vec<Device> {
        (0..count).map(|index| physical(&format!("dev-{index}"))).collect()
    }

    #[test]
    fn failing_device_does_not_stop_the_others() {
        let job = Arc::new(RecordingJob::new(vec!["dev-3", "dev-1"]));
        let summary = DeviceJobDispatcher::new(0).run_on_devices(devices(5), job.clone(), "trace");

        assert_eq!(job.seen.lock().expect("seen").len(), 5);
        assert_eq!(summary.outcomes.len(), 5);
        assert_eq!(summary.failures().count(), 2);
        let first = summary.first_failure().expect("failure");
        assert_eq!(first.serial, "dev-1");
        assert_eq!(first.kind, JobFailureKind::TestFailure);

        let err = summary.into_result("trace-4").expect_err("first failure raised");
        assert_eq!(err.code, "ERR_JOB");
        assert!(err.error.contains("dev-1"));
    }

    #[test]
    fn outcomes_keep_device_order() {
        let job = Arc::new(RecordingJob::new(Vec::new()));
        let summary = DeviceJobDispatcher::new(2).run_on_devices(devices(4), job, "trace");
        let serials: Vec<&str> = summary.outcomes.iter().map(|o| o.serial.as_str()).collect();
        assert_eq!(serials, vec!["dev-0", "dev-1", "dev-2", "dev-3"]);
        assert!(summary.is_success());
    }

    #[test]
    fn pool_size_bounds_concurrency_and_threads() {
        let job = Arc::new(RecordingJob::new(Vec::new()));
        DeviceJobDispatcher::new(2).run_on_devices(devices(6), job.clone(), "trace");
        assert!(job.max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(job.seen.lock().expect("seen").len(), 6);
        let threads = job.threads.lock().expect("threads");
        assert!(threads.len() <= 2, "workers used: {threads:?}");
        assert!(threads.iter().all(|name| name.starts_with("device-worker-")));
    }

    #[test]
    fn pool_larger_than_fleet_spawns_one_worker_per_device() {
        let job = Arc::new(RecordingJob::new(Vec::new()));
        let summary = DeviceJobDispatcher::new(8).run_on_devices(devices(2), job.clone(), "trace");
        assert!(summary.is_success());
        assert!(job.threads.lock().expect("threads").len() <= 2);
    }

    #[test]
    fn single_worker_keeps_going_after_a_panic() {
        let mut job = RecordingJob::new(Vec::new());
        job.panic_on = Some("dev-0");
        let job = Arc::new(job);
        let summary = DeviceJobDispatcher::new(1).run_on_devices(devices(3), job.clone(), "trace");
        assert_eq!(job.seen.lock().expect("seen").len(), 3);
        assert_eq!(summary.failures().count(), 1);
        assert_eq!(
            summary.first_failure().map(|failure| failure.kind),
            Some(JobFailureKind::Panicked)
        );
        assert!(summary.outcomes[1].result.is_ok());
        assert!(summary.outcomes[2].result.is_ok());
    }

    #[test]
    fn default_pool_is_one_worker_per_device() {
        let dispatcher = DeviceJobDispatcher::new(0);
        assert_eq!(dispatcher.resolve_pool_size(3), 3);
        assert_eq!(dispatcher.resolve_pool_size(0), 1);
        assert_eq!(DeviceJobDispatcher::new(2).resolve_pool_size(5), 2);

        let job = Arc::new(RecordingJob::new(Vec::new()));
        dispatcher.run_on_devices(devices(3), job.clone(), "trace");
        assert_eq!(job.max_running.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_worker_becomes_an_outcome() {
        let mut job = RecordingJob::new(Vec::new());
        job.panic_on = Some("emulator-5554");
        let fleet = vec![physical("A"), emulator("emulator-5554", "Pixel"), physical("B")];
        let summary = DeviceJobDispatcher::new(0).run_on_devices(fleet, Arc::new(job), "trace");
        let failure = summary.first_failure().expect("panic recorded");
        assert_eq!(failure.kind, JobFailureKind::Panicked);
        assert!(failure.message.contains("exploded"));
        assert_eq!(summary.failures().count(), 1);
        assert!(summary.outcomes[0].result.is_ok());
        assert!(summary.outcomes[2].result.is_ok());
    }
}
