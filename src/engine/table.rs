use std::collections::TryReserveError;

use crate::engine::{ExecutionReport, Job};

/// Bounded table of the jobs of one run.
///
/// Filled while materializing jobs (single threaded), consumed by the
/// [scheduler](crate::engine::scheduler).
#[derive(Debug)]
pub struct JobTable {
    capacity: usize,
    jobs: Vec<Job>,
    rejected: Vec<ExecutionReport>,
    overflowed: usize,
    warnings: Vec<String>,
}

impl JobTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            jobs: Vec::new(),
            rejected: Vec::new(),
            overflowed: 0,
            warnings: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.capacity
    }

    /// Index the next job will get.
    pub fn next_slot(&self) -> usize {
        self.jobs.len()
    }

    /// Reserves memory for one more job.
    pub(crate) fn reserve_slot(&mut self) -> Result<(), TryReserveError> {
        self.jobs.try_reserve(1)
    }

    /// Adds a job. Returns it back if the table is full.
    pub(crate) fn insert(&mut self, job: Job) -> Result<usize, Job> {
        if self.is_full() {
            return Err(job);
        }
        let slot = self.jobs.len();
        self.jobs.push(job);
        Ok(slot)
    }

    /// Notes an eligible record that was skipped because the table is full.
    pub(crate) fn note_overflow(&mut self, backend: &str, origin: &str) {
        self.overflowed += 1;
        let warning = format!(
            "job table is full ({} jobs), skipping {backend} database `{origin}`",
            self.capacity
        );
        log::warn!(target: "engine::table", "{warning}");
        self.warnings.push(warning);
    }

    /// Records the report of a record that couldn't become a job.
    pub(crate) fn reject(&mut self, report: ExecutionReport) {
        self.rejected.push(report);
    }

    pub(crate) fn warn(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Number of eligible records skipped because the table was full.
    pub fn overflowed(&self) -> usize {
        self.overflowed
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn rejected(&self) -> &[ExecutionReport] {
        &self.rejected
    }

    /// Occupied slots in slot order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub(crate) fn into_parts(self) -> (Vec<Job>, Vec<ExecutionReport>, Vec<String>) {
        (self.jobs, self.rejected, self.warnings)
    }
}
