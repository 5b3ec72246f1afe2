//! Turns configured records into jobs.

use derive_more::{Display, Error};

use crate::backends::Driver;
use crate::config::BackendRecord;
use crate::engine::{ExecutionReport, Job, JobLog, JobTable, LogTarget, Outcome};

/// Accessors the materializer needs from a backend's record.
pub trait Record {
    fn is_enabled(&self) -> bool;

    /// Identifies the origin database in logs, reports and log file names.
    fn origin_identifier(&self) -> &str;

    fn target_identifier(&self) -> &str;

    /// Returns if a digest should be mailed for this record.
    fn wants_email(&self) -> bool;
}

impl Record for BackendRecord {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn origin_identifier(&self) -> &str {
        &self.origin.database
    }

    fn target_identifier(&self) -> &str {
        &self.target.database
    }

    fn wants_email(&self) -> bool {
        self.email
    }
}

/// Memory for a job couldn't be allocated.
///
/// Ends materialization of the affected backend only.
#[derive(Debug, Display, Error)]
#[display("out of memory while materializing the {backend} job of `{origin}`")]
pub struct ResourceExhausted {
    pub backend: &'static str,
    pub origin: String,
}

/// Fills a [JobTable] with the jobs of the enabled records of each backend.
pub struct Materializer<'a> {
    table: &'a mut JobTable,
    log_target: &'a LogTarget,
}

impl<'a> Materializer<'a> {
    pub fn new(table: &'a mut JobTable, log_target: &'a LogTarget) -> Self {
        Self { table, log_target }
    }

    pub fn table(&self) -> &JobTable {
        &*self.table
    }

    pub(crate) fn table_mut(&mut self) -> &mut JobTable {
        &mut *self.table
    }

    /// Creates one job per enabled record, in order, until the table is full.
    ///
    /// `build` creates the driver of a record. Returns the number of jobs
    /// created. Records whose log can't be opened are rejected with
    /// [Outcome::LogSinkUnavailable]; the remaining records are still
    /// materialized.
    pub fn materialize<R, F>(
        &mut self,
        backend: &'static str,
        records: &[R],
        mut build: F,
    ) -> Result<usize, ResourceExhausted>
    where
        R: Record,
        F: FnMut(&R) -> Result<Box<dyn Driver>, ResourceExhausted>,
    {
        let mut created = 0;

        for record in records {
            let origin = record.origin_identifier();
            let target = record.target_identifier();

            if !record.is_enabled() {
                log::info!(target: "engine::materialize", "Database `{origin}` ({backend}) is disabled, skipping");
                continue;
            }

            if self.table.is_full() {
                self.table.note_overflow(backend, origin);
                continue;
            }

            self.table
                .reserve_slot()
                .map_err(|_| ResourceExhausted {
                    backend,
                    origin: origin.to_string(),
                })?;
            let driver = build(record)?;

            let log = match JobLog::create(self.log_target, backend, origin) {
                Ok(log) => log,
                Err(e) => {
                    log::error!(target: "engine::materialize", "Can't open the log of {backend} database `{origin}`: {e}");
                    self.table.reject(ExecutionReport::rejected(
                        backend,
                        origin,
                        target,
                        Outcome::LogSinkUnavailable,
                        format!("opening the job log failed: {e}"),
                    ));
                    continue;
                }
            };

            let job = Job {
                id: self.table.next_slot(),
                backend,
                origin: origin.to_string(),
                target: target.to_string(),
                email: record.wants_email(),
                log,
                driver,
            };

            match self.table.insert(job) {
                Ok(slot) => {
                    log::debug!(target: "engine::materialize", "Job {slot}: {backend} `{origin}` -> `{target}`");
                    created += 1;
                }
                Err(job) => self.table.note_overflow(backend, &job.origin),
            }
        }

        Ok(created)
    }
}
