//! Runs every job of a [JobTable] on its own worker thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, Scope, ScopedJoinHandle};

use chrono::{DateTime, Local};
use log::Level;

use crate::backends::ConnectOutcome;
use crate::engine::{
    ExecutionReport, Job, JobLog, JobState, JobTable, Lifecycle, Outcome, RunSummary,
};
use crate::notify::{Digest, NotificationTrigger};

/// Identity of a job, kept by the scheduler to report on workers that never
/// returned a report.
struct JobMeta {
    id: usize,
    backend: &'static str,
    origin: String,
    target: String,
    started: DateTime<Local>,
}

impl JobMeta {
    fn of(job: &Job) -> Self {
        Self {
            id: job.id,
            backend: job.backend,
            origin: job.origin.clone(),
            target: job.target.clone(),
            started: Local::now(),
        }
    }

    fn failed(self, outcome: Outcome, error: String) -> ExecutionReport {
        ExecutionReport {
            job_id: Some(self.id),
            started: self.started,
            ..ExecutionReport::rejected(self.backend, self.origin, self.target, outcome, error)
        }
    }
}

enum Worker<'scope> {
    Running {
        meta: JobMeta,
        handle: ScopedJoinHandle<'scope, ExecutionReport>,
    },
    NotStarted(ExecutionReport),
}

impl Worker<'_> {
    fn join(self) -> ExecutionReport {
        match self {
            Worker::Running { meta, handle } => match handle.join() {
                Ok(report) => report,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    log::error!(target: "engine::scheduler", "Worker of job {} ({} `{}`) panicked: {message}", meta.id, meta.backend, meta.origin);
                    meta.failed(Outcome::WorkerPanicked, format!("worker panicked: {message}"))
                }
            },
            Worker::NotStarted(report) => report,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn panicked(log: &mut JobLog, step: &str, panic: &(dyn Any + Send)) -> (Outcome, Option<String>) {
    let message = format!("{step} panicked: {}", panic_message(panic));
    log.error(format_args!("{message}"));
    (Outcome::WorkerPanicked, Some(message))
}

fn spawn<'scope, 'env>(
    scope: &'scope Scope<'scope, 'env>,
    job: Job,
    trigger: &'env NotificationTrigger,
) -> Worker<'scope> {
    let meta = JobMeta::of(&job);
    let spawned = thread::Builder::new()
        .name(format!("job-{}-{}", job.id, job.backend))
        .spawn_scoped(scope, move || run_job(job, trigger));

    match spawned {
        Ok(handle) => Worker::Running { meta, handle },
        Err(e) => {
            log::error!(target: "engine::scheduler", "Starting the worker of job {} ({} `{}`) failed: {e}", meta.id, meta.backend, meta.origin);
            Worker::NotStarted(meta.failed(
                Outcome::ResourceExhausted,
                format!("starting the worker thread failed: {e}"),
            ))
        }
    }
}

/// Runs all jobs of `table` concurrently and waits for every one of them.
///
/// Returns one report per materialized job (in slot order), preceded by the
/// reports of records rejected during materialization.
pub fn run(table: JobTable, trigger: &NotificationTrigger) -> RunSummary {
    let (jobs, rejected, warnings) = table.into_parts();
    log::info!(target: "engine::scheduler", "Running {} job(s)", jobs.len());

    let finished: Vec<ExecutionReport> = thread::scope(|scope| {
        let workers: Vec<Worker<'_>> = jobs
            .into_iter()
            .map(|job| spawn(scope, job, trigger))
            .collect();
        workers.into_iter().map(Worker::join).collect()
    });

    let mut reports = rejected;
    reports.extend(finished);
    RunSummary::new(reports, warnings)
}

/// Runs the connect, replicate and close steps of a single job.
///
/// `close` is called exactly once no matter how `connect` or `replicate`
/// ended, then the digest is sent if one is due.
pub fn run_job(job: Job, trigger: &NotificationTrigger) -> ExecutionReport {
    let Job {
        id,
        backend,
        origin,
        target,
        email,
        mut log,
        mut driver,
    } = job;
    let started = Local::now();
    let mut lifecycle = Lifecycle::default();

    log.info(format_args!("Replicating {backend} database `{origin}` into `{target}`"));

    lifecycle.advance(JobState::Connecting);
    let connected = panic::catch_unwind(AssertUnwindSafe(|| driver.connect(&mut log)));
    let (mut outcome, mut error) = match connected {
        Ok(Ok(ConnectOutcome::Connected)) => {
            lifecycle.advance(JobState::Connected);
            log.info(format_args!("Connected to origin and target"));

            lifecycle.advance(JobState::Replicating);
            let replicated = panic::catch_unwind(AssertUnwindSafe(|| driver.replicate(&mut log)));
            match replicated {
                Ok(Ok(())) => {
                    lifecycle.advance(JobState::Replicated);
                    (Outcome::Success, None)
                }
                Ok(Err(e)) => {
                    lifecycle.advance(JobState::ReplicateFailed);
                    log.error(format_args!("Replication failed: {e}"));
                    (Outcome::of_replicate_error(&e), Some(e.to_string()))
                }
                Err(panic) => {
                    lifecycle.advance(JobState::ReplicateFailed);
                    panicked(&mut log, "replicate", panic.as_ref())
                }
            }
        }
        Ok(Ok(ConnectOutcome::Disabled)) => {
            lifecycle.advance(JobState::Disabled);
            log.info(format_args!("Database `{origin}` is disabled, skipping"));
            (Outcome::Disabled, None)
        }
        Ok(Err(e)) => {
            lifecycle.advance(JobState::ConnectFailed);
            log.error(format_args!("Connecting failed: {e}"));
            (Outcome::ConnectFailed, Some(e.to_string()))
        }
        Err(panic) => {
            lifecycle.advance(JobState::ConnectFailed);
            panicked(&mut log, "connect", panic.as_ref())
        }
    };

    lifecycle.advance(JobState::Closing);
    match panic::catch_unwind(AssertUnwindSafe(|| driver.close(&mut log))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log.warn(format_args!("Closing the connections failed: {e}")),
        Err(panic) => {
            let (close_outcome, message) = panicked(&mut log, "close", panic.as_ref());
            if !outcome.is_failure() {
                outcome = close_outcome;
                error = message;
            }
        }
    }
    drop(driver);

    let level = if outcome.is_failure() {
        Level::Error
    } else {
        Level::Info
    };
    log.record(level, format_args!("Finished: {outcome}"));

    let notification = trigger.on_close(
        &Digest {
            backend,
            origin: &origin,
            target: &target,
            outcome,
            requested: email,
        },
        &mut log,
    );
    lifecycle.advance(JobState::Closed);

    let contents = log.contents().unwrap_or_else(|e| {
        log::warn!(target: "engine::scheduler", "Reading the log of job {id} back failed: {e}");
        String::new()
    });

    ExecutionReport {
        job_id: Some(id),
        backend,
        origin,
        target,
        outcome,
        states: lifecycle.into_states(),
        error,
        log: contents,
        log_path: log.path().map(ToOwned::to_owned),
        notification,
        started,
        finished: Local::now(),
    }
}
