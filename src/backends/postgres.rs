//! Postgres replication through `pg_dump` and `pg_restore`.
//!
//! `connect` opens a native client session to origin and target to fail early
//! on unreachable servers or bad credentials. `replicate` dumps the origin in
//! the custom archive format and restores the archive into the target.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Local;
use postgres::{Client, NoTls};

use crate::backends::{ConnectLock, ConnectOutcome, Driver, DriverError, Handle};
use crate::config::{BackendRecord, BackupType, Config, EngineConfig, Endpoint};
use crate::engine::{DriverRegistry, JobLog, Materializer, ResourceExhausted};
use crate::util::exec::Invocation;
use crate::util::paths;

pub const NAME: &str = "postgres";

static CONNECT_LOCK: ConnectLock = ConnectLock::new();

static DUMP_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

pub fn register(registry: &mut DriverRegistry) {
    registry.register(NAME, construct);
}

fn construct(config: &Config, materializer: &mut Materializer<'_>) -> Result<usize, ResourceExhausted> {
    let settings = PostgresSettings::from_config(&config.engine);
    materializer.materialize(NAME, &config.postgres, |record| {
        Ok(Box::new(PostgresDriver::new(record.clone(), settings.clone())) as Box<dyn Driver>)
    })
}

/// Engine settings the Postgres driver depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresSettings {
    pub bin_dir: Option<PathBuf>,
    pub dump_dir: PathBuf,
    pub connect_timeout: Duration,
    pub subprocess_timeout: Option<Duration>,
    pub keep_dumps: bool,
}

impl PostgresSettings {
    pub fn from_config(engine: &EngineConfig) -> Self {
        Self {
            bin_dir: engine.pg_bin_dir.clone(),
            dump_dir: engine.dump_directory(),
            connect_timeout: engine.connect_timeout(),
            subprocess_timeout: engine.subprocess_timeout(),
            keep_dumps: engine.keep_dumps,
        }
    }

    fn program(&self, name: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }
}

/// `pg_dump` writing the origin database into the archive at `path`.
pub fn dump_invocation(record: &BackendRecord, path: &Path, settings: &PostgresSettings) -> Invocation {
    let origin = &record.origin;
    let invocation = Invocation::new(settings.program("pg_dump"))
        .args(connection_args(origin))
        .arg("--format=custom")
        .arg("--verbose")
        .arg(format!("--file={}", path.display()));

    let invocation = match record.backup_type {
        BackupType::SchemaOnly => invocation.arg("--schema-only"),
        BackupType::Full => invocation,
    };

    invocation
        .env("PGPASSWORD", origin.password.as_str())
        .inherit_env("PATH")
        .timeout(settings.subprocess_timeout)
}

/// `pg_restore` replacing the target database's objects with the archive at `path`.
pub fn restore_invocation(record: &BackendRecord, path: &Path, settings: &PostgresSettings) -> Invocation {
    let target = &record.target;
    Invocation::new(settings.program("pg_restore"))
        .args(connection_args(target))
        .arg("--clean")
        .arg("--if-exists")
        .arg("--no-owner")
        .arg("--verbose")
        .arg(path.as_os_str())
        .env("PGPASSWORD", target.password.as_str())
        .inherit_env("PATH")
        .timeout(settings.subprocess_timeout)
}

fn connection_args(endpoint: &Endpoint) -> [String; 5] {
    [
        format!("--host={}", endpoint.host),
        format!("--port={}", endpoint.port),
        format!("--username={}", endpoint.user),
        format!("--dbname={}", endpoint.database),
        "--no-password".to_string(),
    ]
}

fn connect_client(endpoint: &Endpoint, timeout: Duration) -> Result<Client, DriverError> {
    postgres::Config::new()
        .host(&endpoint.host)
        .port(endpoint.port)
        .user(&endpoint.user)
        .password(&endpoint.password)
        .dbname(&endpoint.database)
        .connect_timeout(timeout)
        .application_name("cnc")
        .connect(NoTls)
        .map_err(|e| DriverError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
}

pub struct PostgresDriver {
    record: BackendRecord,
    settings: PostgresSettings,
    origin: Handle<Client>,
    target: Handle<Client>,
    dump_file: Option<PathBuf>,
}

impl PostgresDriver {
    pub fn new(record: BackendRecord, settings: PostgresSettings) -> Self {
        Self {
            record,
            settings,
            origin: Handle::Unset,
            target: Handle::Unset,
            dump_file: None,
        }
    }

    fn generate_dump_filename(&self) -> PathBuf {
        let timestamp = Local::now().format("%Y-%m-%dT%H-%M-%S");
        let sequence = DUMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let database = paths::sanitize_file_component(&self.record.origin.database);

        self.settings
            .dump_dir
            .join(format!("{database}-{timestamp}-{sequence}.dump"))
    }
}

impl Driver for PostgresDriver {
    fn connect(&mut self, log: &mut JobLog) -> Result<ConnectOutcome, DriverError> {
        if !self.record.enabled {
            return Ok(ConnectOutcome::Disabled);
        }

        let timeout = self.settings.connect_timeout;
        log.info(format_args!("Connecting to origin {}", self.record.origin));
        let origin = CONNECT_LOCK.connect(|| connect_client(&self.record.origin, timeout))?;
        self.origin = Handle::Open(origin);

        log.info(format_args!("Connecting to target {}", self.record.target));
        let target = CONNECT_LOCK.connect(|| connect_client(&self.record.target, timeout))?;
        self.target = Handle::Open(target);

        Ok(ConnectOutcome::Connected)
    }

    fn replicate(&mut self, log: &mut JobLog) -> Result<(), DriverError> {
        if !self.origin.is_open() {
            return Err(DriverError::NotConnected("origin"));
        }
        if !self.target.is_open() {
            return Err(DriverError::NotConnected("target"));
        }

        fs::create_dir_all(&self.settings.dump_dir)?;
        let dump_file = self.generate_dump_filename();

        log.info(format_args!(
            "Creating {} dump of `{}` at {}",
            self.record.backup_type,
            self.record.origin.database,
            dump_file.display()
        ));
        self.dump_file = Some(dump_file.clone());
        dump_invocation(&self.record, &dump_file, &self.settings).run(log)?;

        log.info(format_args!("Restoring the dump into {}", self.record.target));
        restore_invocation(&self.record, &dump_file, &self.settings).run(log)?;
        log.info(format_args!("Replicated `{}`", self.record.origin.database));

        if self.settings.keep_dumps {
            log.info(format_args!("Keeping dump {}", dump_file.display()));
        } else {
            fs::remove_file(&dump_file)?;
        }
        self.dump_file = None;

        Ok(())
    }

    fn close(&mut self, log: &mut JobLog) -> Result<(), DriverError> {
        if let Some(dump_file) = self.dump_file.take() {
            if dump_file.exists() {
                log.warn(format_args!("Dump of the failed run is kept at {}", dump_file.display()));
            }
        }

        let mut result = Ok(());
        for (side, handle) in [("origin", &mut self.origin), ("target", &mut self.target)] {
            if let Some(client) = handle.close() {
                log::trace!(target: "backend::postgres", "Closing {side} session of `{}`", self.record.origin.database);
                if let Err(e) = client.close() {
                    result = Err(DriverError::Client(format!("closing the {side} session failed: {e}")));
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    fn endpoint(host: &str, database: &str) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            user: "backup".to_string(),
            password: format!("pw-{host}"),
            port: 5432,
            database: database.to_string(),
        }
    }

    fn record(database: &str, backup_type: BackupType) -> BackendRecord {
        BackendRecord {
            enabled: true,
            origin: endpoint("10.0.0.1", database),
            target: endpoint("10.0.0.2", database),
            backup_type,
            email: false,
        }
    }

    #[fixture]
    fn settings() -> PostgresSettings {
        PostgresSettings {
            bin_dir: Some(PathBuf::from("/usr/lib/postgresql/16/bin")),
            dump_dir: PathBuf::from("/var/tmp/cnc"),
            connect_timeout: Duration::from_secs(5),
            subprocess_timeout: Some(Duration::from_secs(600)),
            keep_dumps: false,
        }
    }

    fn argv(invocation: &Invocation) -> Vec<String> {
        invocation
            .arguments()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[rstest]
    fn full_and_schema_only_dumps_differ_only_in_schema_flag(settings: PostgresSettings) {
        let path = Path::new("/var/tmp/cnc/dbA.dump");
        let full = dump_invocation(&record("dbA", BackupType::Full), path, &settings);
        let schema = dump_invocation(&record("dbB", BackupType::SchemaOnly), path, &settings);

        assert_eq!(full.program(), Path::new("/usr/lib/postgresql/16/bin/pg_dump"));
        assert_eq!(
            argv(&full),
            [
                "--host=10.0.0.1",
                "--port=5432",
                "--username=backup",
                "--dbname=dbA",
                "--no-password",
                "--format=custom",
                "--verbose",
                "--file=/var/tmp/cnc/dbA.dump",
            ]
        );
        assert!(!full.has_arg("--schema-only"));
        assert!(schema.has_arg("--schema-only"));
        assert!(schema.has_arg("--dbname=dbB"));
    }

    #[rstest]
    fn restore_targets_the_target_endpoint(settings: PostgresSettings) {
        let path = Path::new("/var/tmp/cnc/dbA.dump");
        let restore = restore_invocation(&record("dbA", BackupType::Full), path, &settings);

        assert_eq!(restore.program(), Path::new("/usr/lib/postgresql/16/bin/pg_restore"));
        assert!(restore.has_arg("--host=10.0.0.2"));
        assert!(restore.has_arg("--clean"));
        assert!(restore.has_arg("--if-exists"));
        assert!(restore.has_arg("/var/tmp/cnc/dbA.dump"));
    }

    #[rstest]
    fn passwords_only_travel_in_the_environment(settings: PostgresSettings) {
        let record = record("dbA", BackupType::Full);
        let path = Path::new("/var/tmp/cnc/dbA.dump");

        for (invocation, password) in [
            (dump_invocation(&record, path, &settings), "pw-10.0.0.1"),
            (restore_invocation(&record, path, &settings), "pw-10.0.0.2"),
        ] {
            assert!(argv(&invocation).iter().all(|arg| !arg.contains(password)));
            assert!(!invocation.display_command().contains(password));
            assert!(invocation
                .env_entries()
                .any(|entry| entry == format!("PGPASSWORD={password}")));
        }
    }

    #[rstest]
    fn programs_are_looked_up_in_path_without_bin_dir(mut settings: PostgresSettings) {
        settings.bin_dir = None;
        let dump = dump_invocation(&record("dbA", BackupType::Full), Path::new("a.dump"), &settings);
        assert_eq!(dump.program(), Path::new("pg_dump"));
    }

    #[rstest]
    fn disabled_record_does_not_connect(settings: PostgresSettings) {
        let mut record = record("dbA", BackupType::Full);
        record.enabled = false;
        let mut driver = PostgresDriver::new(record, settings);
        let mut log = JobLog::in_memory("postgres/dbA");

        assert_eq!(driver.connect(&mut log).unwrap(), ConnectOutcome::Disabled);
        assert!(driver.close(&mut log).is_ok());
        assert!(driver.origin.is_closed());
        assert!(driver.target.is_closed());
    }

    #[rstest]
    fn replicate_without_connection_fails(settings: PostgresSettings) {
        let mut driver = PostgresDriver::new(record("dbA", BackupType::Full), settings);
        let mut log = JobLog::in_memory("postgres/dbA");

        let err = driver.replicate(&mut log).unwrap_err();
        assert!(matches!(err, DriverError::NotConnected("origin")));
    }

    #[rstest]
    fn dump_files_of_the_same_database_differ(settings: PostgresSettings) {
        let driver = PostgresDriver::new(record("dbA", BackupType::Full), settings);
        assert_ne!(driver.generate_dump_filename(), driver.generate_dump_filename());
    }
}
