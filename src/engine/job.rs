use chrono::{DateTime, Local};
use derive_more::Display;

use crate::backends::{Driver, DriverError};
use crate::engine::JobLog;

/// States of a job, see [JobState::can_transition_to] for the allowed transitions.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum JobState {
    Constructed,
    Connecting,
    Connected,
    ConnectFailed,
    Disabled,
    Replicating,
    Replicated,
    ReplicateFailed,
    Closing,
    Closed,
}

impl JobState {
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, next),
            (Constructed, Connecting)
                | (Connecting, Connected | ConnectFailed | Disabled)
                | (Connected, Replicating)
                | (Replicating, Replicated | ReplicateFailed)
                | (Replicated | ReplicateFailed | ConnectFailed | Disabled, Closing)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == JobState::Closed
    }
}

/// Tracks the state of a job and every state it went through.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    states: Vec<JobState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            states: vec![JobState::Constructed],
        }
    }
}

impl Lifecycle {
    pub fn current(&self) -> JobState {
        self.states
            .last()
            .copied()
            .unwrap_or(JobState::Constructed)
    }

    pub fn advance(&mut self, next: JobState) {
        debug_assert!(
            self.current().can_transition_to(next),
            "invalid job state transition {} -> {next}",
            self.current()
        );
        self.states.push(next);
    }

    pub fn into_states(self) -> Vec<JobState> {
        self.states
    }
}

/// How a job ended.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum Outcome {
    #[display("succeeded")]
    Success,
    #[display("disabled")]
    Disabled,
    #[display("connection failed")]
    ConnectFailed,
    #[display("replication failed")]
    ReplicateFailed,
    #[display("dump/restore program failed")]
    SubprocessFailed,
    #[display("out of resources")]
    ResourceExhausted,
    #[display("log file unavailable")]
    LogSinkUnavailable,
    #[display("worker panicked")]
    WorkerPanicked,
}

impl Outcome {
    /// Disabled jobs are skipped on purpose and don't count as failures.
    pub fn is_failure(self) -> bool {
        !matches!(self, Outcome::Success | Outcome::Disabled)
    }

    /// Outcome of a failed `replicate`.
    pub fn of_replicate_error(error: &DriverError) -> Self {
        match error {
            DriverError::Subprocess(_) => Outcome::SubprocessFailed,
            _ => Outcome::ReplicateFailed,
        }
    }
}

/// Whether a digest was mailed for a job.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum NotificationStatus {
    #[display("not requested")]
    NotRequested,
    #[display("sent")]
    Sent,
    #[display("failed")]
    Failed,
}

/// The unit of execution: one enabled record of one backend.
pub struct Job {
    pub(crate) id: usize,
    pub(crate) backend: &'static str,
    pub(crate) origin: String,
    pub(crate) target: String,
    pub(crate) email: bool,
    pub(crate) log: JobLog,
    pub(crate) driver: Box<dyn Driver>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("origin", &self.origin)
            .field("target", &self.target)
            .field("email", &self.email)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Slot of the job in the [JobTable](crate::engine::JobTable).
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Identifier of the origin database.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Identifier of the target database.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns if the record of the job opted in to mail digests.
    pub fn wants_email(&self) -> bool {
        self.email
    }

    pub fn log(&self) -> &JobLog {
        &self.log
    }
}

/// Result of one job.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub job_id: Option<usize>,
    pub backend: &'static str,
    pub origin: String,
    pub target: String,
    pub outcome: Outcome,
    /// Every state the job went through, in order.
    pub states: Vec<JobState>,
    /// Description of the error that ended the job, if any.
    pub error: Option<String>,
    /// Everything the job logged, with `\r\n` line endings.
    pub log: String,
    pub log_path: Option<std::path::PathBuf>,
    pub notification: NotificationStatus,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
}

impl ExecutionReport {
    /// Report of a record that never became a job.
    pub fn rejected(
        backend: &'static str,
        origin: impl Into<String>,
        target: impl Into<String>,
        outcome: Outcome,
        error: impl ToString,
    ) -> Self {
        let now = Local::now();
        Self {
            job_id: None,
            backend,
            origin: origin.into(),
            target: target.into(),
            outcome,
            states: Vec::new(),
            error: Some(error.to_string()),
            log: String::new(),
            log_path: None,
            notification: NotificationStatus::NotRequested,
            started: now,
            finished: now,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome.is_failure()
    }

    /// Final state of the job, `None` if the record never became a job.
    pub fn final_state(&self) -> Option<JobState> {
        self.states.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::exec::ExecError;
    use rstest::rstest;
    use JobState::*;

    const ALL_STATES: [JobState; 10] = [
        Constructed,
        Connecting,
        Connected,
        ConnectFailed,
        Disabled,
        Replicating,
        Replicated,
        ReplicateFailed,
        Closing,
        Closed,
    ];

    #[rstest]
    #[case(Constructed, Connecting)]
    #[case(Connecting, Connected)]
    #[case(Connecting, ConnectFailed)]
    #[case(Connecting, Disabled)]
    #[case(Connected, Replicating)]
    #[case(Replicating, Replicated)]
    #[case(Replicating, ReplicateFailed)]
    #[case(Replicated, Closing)]
    #[case(ReplicateFailed, Closing)]
    #[case(ConnectFailed, Closing)]
    #[case(Disabled, Closing)]
    #[case(Closing, Closed)]
    fn allowed_transitions(#[case] from: JobState, #[case] to: JobState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case(Constructed, Replicating)]
    #[case(Constructed, Closing)]
    #[case(ConnectFailed, Replicating)]
    #[case(Disabled, Replicating)]
    #[case(Connected, Closing)]
    #[case(Replicated, Replicating)]
    fn forbidden_transitions(#[case] from: JobState, #[case] to: JobState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn closed_is_terminal() {
        assert!(Closed.is_terminal());
        for state in ALL_STATES {
            assert!(!Closed.can_transition_to(state), "Closed -> {state}");
        }
    }

    #[test]
    fn lifecycle_records_visited_states() {
        let mut lifecycle = Lifecycle::default();
        for state in [Connecting, ConnectFailed, Closing, Closed] {
            lifecycle.advance(state);
        }

        assert_eq!(lifecycle.current(), Closed);
        assert_eq!(
            lifecycle.into_states(),
            [Constructed, Connecting, ConnectFailed, Closing, Closed]
        );
    }

    #[rstest]
    #[case(Outcome::Success, false)]
    #[case(Outcome::Disabled, false)]
    #[case(Outcome::ConnectFailed, true)]
    #[case(Outcome::ReplicateFailed, true)]
    #[case(Outcome::SubprocessFailed, true)]
    #[case(Outcome::ResourceExhausted, true)]
    #[case(Outcome::LogSinkUnavailable, true)]
    #[case(Outcome::WorkerPanicked, true)]
    fn failing_outcomes(#[case] outcome: Outcome, #[case] failure: bool) {
        assert_eq!(outcome.is_failure(), failure);
    }

    #[test]
    fn subprocess_errors_map_to_subprocess_failed() {
        let exec = DriverError::Subprocess(ExecError::TimedOut {
            program: "pg_dump".into(),
            timeout: std::time::Duration::from_secs(1),
        });
        let client = DriverError::Client("cursor died".into());

        assert_eq!(Outcome::of_replicate_error(&exec), Outcome::SubprocessFailed);
        assert_eq!(Outcome::of_replicate_error(&client), Outcome::ReplicateFailed);
    }
}
