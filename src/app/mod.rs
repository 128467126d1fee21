pub mod adb;
pub mod config;
pub mod devices;
pub mod dispatcher;
pub mod error;
pub mod instrumentation;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod monkey;
pub mod protocol;
pub mod recorder;
pub mod report;
pub mod scheduler;

#[cfg(test)]
pub mod test_support;
