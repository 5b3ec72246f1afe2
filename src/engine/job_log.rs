//! The log sink owned by a single job.
//!
//! Everything a job reports (its own status lines and the output of the
//! programs it runs) goes into its log, which later becomes the body of the
//! job's mail digest. All text is stored with `\r\n` line endings.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use log::Level;

use crate::util::{crlf, paths};

/// Where job logs are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// One file per job in this directory.
    Directory(PathBuf),
    /// In memory only (dry runs and tests).
    Memory,
}

enum Sink {
    File { path: PathBuf, file: File },
    Memory(Vec<u8>),
}

/// Log of one job.
pub struct JobLog {
    label: String,
    sink: Sink,
}

impl fmt::Debug for JobLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLog")
            .field("label", &self.label)
            .field("path", &self.path())
            .finish()
    }
}

impl JobLog {
    /// Creates the log of the job replicating `origin`.
    ///
    /// Log files are named `cnc_<origin>_<DDMMYYYYHHMMSS>.log`; a numeric
    /// suffix is added if a file of that name exists already.
    pub fn create(target: &LogTarget, backend: &str, origin: &str) -> io::Result<Self> {
        let label = format!("{backend}/{origin}");
        let dir = match target {
            LogTarget::Memory => return Ok(Self::in_memory(label)),
            LogTarget::Directory(dir) => dir,
        };

        let timestamp = Local::now().format("%d%m%Y%H%M%S");
        let stem = format!("cnc_{}_{timestamp}", paths::sanitize_file_component(origin));

        let mut attempt = 0;
        loop {
            let name = if attempt == 0 {
                format!("{stem}.log")
            } else {
                format!("{stem}-{attempt}.log")
            };
            let path = dir.join(name);

            match File::create_new(&path) {
                Ok(file) => {
                    log::debug!(target: "engine::job_log", "Logging {label} to {}", path.display());
                    return Ok(Self {
                        label,
                        sink: Sink::File { path, file },
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 100 => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn in_memory(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            sink: Sink::Memory(Vec::new()),
        }
    }

    /// `<backend>/<origin>` of the job.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Path of the log file, if the log is kept in a file.
    pub fn path(&self) -> Option<&Path> {
        match &self.sink {
            Sink::File { path, .. } => Some(path),
            Sink::Memory(_) => None,
        }
    }

    /// Appends a timestamped line and mirrors it to the process log.
    pub fn record(&mut self, level: Level, args: fmt::Arguments<'_>) {
        log::log!(target: "cnc::job", level, "[{}] {args}", self.label);

        let line = format!("[{}] {level:<5} {args}\n", Local::now().format("%Y-%m-%d %H:%M:%S"));
        if let Err(e) = self.write_all(&crlf::normalize(line.as_bytes())) {
            log::warn!(target: "engine::job_log", "Writing to the log of {} failed: {e}", self.label);
        }
    }

    pub fn info(&mut self, args: fmt::Arguments<'_>) {
        self.record(Level::Info, args);
    }

    pub fn warn(&mut self, args: fmt::Arguments<'_>) {
        self.record(Level::Warn, args);
    }

    pub fn error(&mut self, args: fmt::Arguments<'_>) {
        self.record(Level::Error, args);
    }

    /// Reads the whole log from the beginning.
    pub fn contents(&mut self) -> io::Result<String> {
        match &mut self.sink {
            Sink::File { path, file } => {
                file.flush()?;
                let bytes = fs::read(path)?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            Sink::Memory(buffer) => Ok(String::from_utf8_lossy(buffer).into_owned()),
        }
    }
}

impl Write for JobLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.sink {
            Sink::File { file, .. } => file.write(buf),
            Sink::Memory(buffer) => buffer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::File { file, .. } => file.flush(),
            Sink::Memory(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_log_is_named_after_origin_and_readable() {
        let tmp = tempfile::tempdir().unwrap();
        let target = LogTarget::Directory(tmp.path().to_path_buf());

        let mut log = JobLog::create(&target, "postgres", "dbA").unwrap();
        log.info(format_args!("dumping {}", "dbA"));
        log.write_all(b"pg_dump: done\r\n").unwrap();

        let path = log.path().unwrap().to_path_buf();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("cnc_dbA_"), "{name}");
        assert!(name.ends_with(".log"), "{name}");

        let contents = log.contents().unwrap();
        assert!(contents.contains("INFO  dumping dbA\r\n"), "{contents:?}");
        assert!(contents.ends_with("pg_dump: done\r\n"));
    }

    #[test]
    fn logs_of_the_same_database_get_distinct_files() {
        let tmp = tempfile::tempdir().unwrap();
        let target = LogTarget::Directory(tmp.path().to_path_buf());

        let first = JobLog::create(&target, "postgres", "dbA").unwrap();
        let second = JobLog::create(&target, "postgres", "dbA").unwrap();

        assert_ne!(first.path(), second.path());
    }

    #[test]
    fn missing_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let target = LogTarget::Directory(tmp.path().join("missing"));

        assert!(JobLog::create(&target, "postgres", "dbA").is_err());
    }

    #[test]
    fn memory_log_keeps_lines() {
        let mut log = JobLog::create(&LogTarget::Memory, "mongodb", "shop").unwrap();
        log.warn(format_args!("collection `carts` is empty"));

        assert_eq!(log.path(), None);
        assert_eq!(log.label(), "mongodb/shop");
        assert!(log.contents().unwrap().ends_with("WARN  collection `carts` is empty\r\n"));
    }
}
