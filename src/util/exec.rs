//! Execution of external programs with captured, CRLF-normalized output.
//!
//! The child gets a cleared environment: only variables set through
//! [Invocation::env] or copied through [Invocation::inherit_env] are visible to
//! it. Standard output and standard error share a single pipe, so the captured
//! stream keeps the order in which the child wrote it.
//!
//! The child leads its own process group. On a timeout the whole group is
//! killed, including helpers the program forked (e.g. `pg_restore --jobs`).

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, PipeReader, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use derive_more::{Display, Error};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::util::crlf;

/// `ENOEXEC`: the file exists but is not in an executable format.
const ENOEXEC: i32 = 8;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors of running an [Invocation].
#[derive(Debug, Display, Error)]
pub enum ExecError {
    /// The pipe for capturing the output couldn't be created.
    #[display("creating the output pipe for `{program}` failed: {source}")]
    PipeCreationFailed { program: String, source: io::Error },
    /// No process could be started at all.
    #[display("starting a process for `{program}` failed: {source}")]
    SpawnFailed { program: String, source: io::Error },
    /// The process was created but the program couldn't be executed.
    #[display("executing `{program}` failed: {source}")]
    ExecFailed { program: String, source: io::Error },
    /// The program ran and exited unsuccessfully.
    #[display("`{program}` was unsuccessful ({status})")]
    ProgramFailed { program: String, status: ExitStatus },
    /// Reading the output of the program failed.
    #[display("capturing the output of `{program}` failed: {source}")]
    ReadFailed { program: String, source: io::Error },
    /// Waiting for the program to exit failed.
    #[display("waiting for `{program}` failed: {source}")]
    WaitFailed { program: String, source: io::Error },
    /// The program didn't finish in time and was killed.
    #[display("`{program}` didn't finish within {timeout:?} and was killed")]
    TimedOut { program: String, timeout: Duration },
}

impl ExecError {
    /// The program the error is about.
    pub fn program(&self) -> &str {
        match self {
            Self::PipeCreationFailed { program, .. }
            | Self::SpawnFailed { program, .. }
            | Self::ExecFailed { program, .. }
            | Self::ProgramFailed { program, .. }
            | Self::ReadFailed { program, .. }
            | Self::WaitFailed { program, .. }
            | Self::TimedOut { program, .. } => program,
        }
    }
}

/// A program invocation: program, argument vector and explicit environment.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets `key=value` in the environment of the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Copies `key` from the environment of this process, if it is set.
    pub fn inherit_env(self, key: &str) -> Self {
        match std::env::var(key) {
            Ok(value) => self.env(key, value),
            Err(_) => self,
        }
    }

    /// Kill the program if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Returns if `arg` is part of the argument vector.
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// The environment of the child as `KEY=value` entries.
    pub fn env_entries(&self) -> impl Iterator<Item = String> + '_ {
        self.env.iter().map(|(key, value)| format!("{key}={value}"))
    }

    /// Command line for logs. Environment values are left out since they carry secrets.
    pub fn display_command(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Runs the program to completion, writing its combined output into `sink`.
    ///
    /// Every line is normalized to `\r\n` line endings before it reaches the sink.
    pub fn run<W: Write + Send>(&self, sink: &mut W) -> Result<(), ExecError> {
        let program = self.program.display().to_string();
        log::debug!(target: "exec", "Running: {}", self.display_command());

        let (reader, writer) = io::pipe().map_err(|source| ExecError::PipeCreationFailed {
            program: program.clone(),
            source,
        })?;

        // The command owns both write ends and is dropped at the end of this
        // block, so the reader sees EOF once the child exits.
        let mut child = {
            let stderr = writer
                .try_clone()
                .map_err(|source| ExecError::PipeCreationFailed {
                    program: program.clone(),
                    source,
                })?;

            let mut command = Command::new(&self.program);
            command
                .args(&self.args)
                .env_clear()
                .envs(self.env.iter().map(|(key, value)| (key, value)))
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(stderr)
                .process_group(0);

            command
                .spawn()
                .map_err(|source| spawn_error(program.clone(), source))?
        };
        log::trace!(target: "exec", "Started `{program}` with pid {}", child.id());

        let (status, drained) = thread::scope(|scope| {
            let reader_thread = scope.spawn(move || drain(reader, sink));
            let status = wait(&mut child, self.timeout);
            let drained = reader_thread
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("output reader panicked")));
            (status, drained)
        });

        let status = match status {
            Err(source) => return Err(ExecError::WaitFailed { program, source }),
            Ok(None) => {
                let timeout = self.timeout.unwrap_or_default();
                return Err(ExecError::TimedOut { program, timeout });
            }
            Ok(Some(status)) => status,
        };

        if let Err(source) = drained {
            return Err(ExecError::ReadFailed { program, source });
        }

        if !status.success() {
            log::debug!(target: "exec", "`{program}` exited with {status}");
            return Err(ExecError::ProgramFailed { program, status });
        }

        Ok(())
    }
}

fn spawn_error(program: String, source: io::Error) -> ExecError {
    let exec_failed = matches!(
        source.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    ) || source.raw_os_error() == Some(ENOEXEC);

    if exec_failed {
        ExecError::ExecFailed { program, source }
    } else {
        ExecError::SpawnFailed { program, source }
    }
}

/// Copies the pipe line by line into `sink` until every writer is gone.
fn drain<W: Write>(reader: PipeReader, sink: &mut W) -> io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(256);

    loop {
        line.clear();
        // read_until retries on short reads, 0 only means EOF
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        sink.write_all(&crlf::normalize(&line))?;
    }

    sink.flush()
}

/// Waits for the child. Returns `None` if it was killed after `timeout`.
fn wait(child: &mut Child, timeout: Option<Duration>) -> io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }

        if Instant::now() >= deadline {
            kill_group(child);
            child.wait()?;
            return Ok(None);
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Kills the process group led by `child`, or only `child` if that fails.
fn kill_group(child: &mut Child) {
    let killed = i32::try_from(child.id())
        .map_err(|_| nix::Error::ESRCH)
        .and_then(|pid| signal::killpg(Pid::from_raw(pid), Signal::SIGKILL));

    if let Err(e) = killed {
        log::warn!(target: "exec", "Killing the process group of pid {} failed: {e}", child.id());
        if let Err(e) = child.kill() {
            log::warn!(target: "exec", "Killing pid {} failed: {e}", child.id());
        }
    }
}
