//! The job engine: materializes the configured records into jobs and runs them.
//!
//! A run goes through three steps:
//!
//! 1. Every backend in the [DriverRegistry] materializes the jobs of its enabled
//!    records into a bounded [JobTable] ([materialize_jobs]).
//! 2. The [scheduler] runs all jobs concurrently through
//!    `connect -> replicate -> close`.
//! 3. The reports of all jobs form a [RunSummary], which decides the exit code.

mod job;
mod job_log;
mod materialize;
mod registry;
pub mod scheduler;
mod table;

pub use job::{ExecutionReport, Job, JobState, Lifecycle, NotificationStatus, Outcome};
pub use job_log::{JobLog, LogTarget};
pub use materialize::{Materializer, Record, ResourceExhausted};
pub use registry::{Constructor, DriverRegistry};
pub use table::JobTable;

use crate::config::Config;
use crate::notify::NotificationTrigger;

/// Every job succeeded (or was disabled).
pub const EXIT_SUCCESS: u8 = 0;
/// At least one job failed.
pub const EXIT_JOB_FAILED: u8 = 1;
/// Nothing ran.
pub const EXIT_NO_JOBS: u8 = 2;
/// The configuration is invalid or the run couldn't start.
pub const EXIT_STARTUP_FAILED: u8 = 3;

/// Reports of every job (and rejected record) of a run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<ExecutionReport>,
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn new(reports: Vec<ExecutionReport>, warnings: Vec<String>) -> Self {
        Self { reports, warnings }
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExecutionReport> {
        self.reports.iter().filter(|report| report.is_failure())
    }

    /// Returns if no report is a failure.
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn exit_code(&self) -> u8 {
        if self.reports.is_empty() {
            EXIT_NO_JOBS
        } else if self.is_success() {
            EXIT_SUCCESS
        } else {
            EXIT_JOB_FAILED
        }
    }

    /// Writes one line per report and every warning to the process log.
    pub fn log(&self) {
        for report in &self.reports {
            let took = report.finished - report.started;
            let line = format!(
                "{} `{}` -> `{}`: {} in {}.{:03}s, digest {}",
                report.backend,
                report.origin,
                report.target,
                report.outcome,
                took.num_seconds(),
                took.num_milliseconds() % 1000,
                report.notification,
            );
            match &report.error {
                Some(error) => log::error!(target: "engine", "{line} ({error})"),
                None => log::info!(target: "engine", "{line}"),
            }
        }
        for warning in &self.warnings {
            log::warn!(target: "engine", "{warning}");
        }

        let failed = self.failures().count();
        log::info!(
            target: "engine",
            "{} job(s), {} failed, exit code {}",
            self.reports.len(),
            failed,
            self.exit_code()
        );
    }
}

/// Materializes the jobs of every registered backend into a table of
/// `config.engine.max_jobs` slots.
///
/// A backend running out of resources gets a failed report; the other
/// backends are still materialized.
pub fn materialize_jobs(config: &Config, registry: &DriverRegistry, log_target: &LogTarget) -> JobTable {
    let mut table = JobTable::with_capacity(config.engine.max_jobs);
    let mut materializer = Materializer::new(&mut table, log_target);

    for (backend, construct) in registry.iter() {
        match construct(config, &mut materializer) {
            Ok(created) => {
                log::debug!(target: "engine", "Materialized {created} {backend} job(s)");
            }
            Err(e) => {
                log::error!(target: "engine", "Materializing the {backend} jobs failed: {e}");
                let report = ExecutionReport::rejected(backend, e.origin.as_str(), "", Outcome::ResourceExhausted, &e);
                materializer.table_mut().reject(report);
                materializer
                    .table_mut()
                    .warn(format!("remaining {backend} records were skipped: {e}"));
            }
        }
    }

    table
}

/// Materializes and runs all jobs of `config`.
pub fn run(
    config: &Config,
    registry: &DriverRegistry,
    log_target: &LogTarget,
    trigger: &NotificationTrigger,
) -> RunSummary {
    let table = materialize_jobs(config, registry, log_target);
    scheduler::run(table, trigger)
}
