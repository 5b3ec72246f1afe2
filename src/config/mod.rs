//! Configuration of the backends, the engine, logging and mail digests.
//!
//! The configuration is a TOML file. Every backend has a list of records, one
//! per origin/target pair:
//!
//! ```toml
//! [[postgres]]
//! backup_type = "full"
//! email = true
//! origin = { host = "10.0.0.1", user = "backup", password = "...", port = 5432, database = "dbA" }
//! target = { host = "10.0.0.2", user = "backup", password = "...", port = 5432, database = "dbA" }
//! ```

mod record;
mod smtp;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::{Display, Error};

pub use record::{BackendRecord, BackupType, Endpoint};
pub use smtp::SmtpConfig;

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    /// The config file can't be read.
    #[display("reading the config file {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    /// The config file isn't valid TOML or doesn't match the expected layout.
    #[display("parsing the config file {} failed: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// The config is well-formed but unusable.
    #[display("invalid configuration: {}", _0.join("; "))]
    Invalid(#[error(ignore)] Vec<String>),
}

/// Settings of the job engine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Capacity of the job table, i.e. the maximum number of jobs of one run.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    /// Timeout for establishing a database connection.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Kill dump/restore programs running longer than this.
    #[serde(default)]
    pub subprocess_timeout_secs: Option<u64>,

    /// Where dumps are written to before they are restored.
    #[serde(default)]
    pub dump_directory: Option<PathBuf>,

    /// Directory containing `pg_dump` and `pg_restore`. Looked up in `PATH` if unset.
    #[serde(default)]
    pub pg_bin_dir: Option<PathBuf>,

    /// Keep dump files after a successful restore.
    #[serde(default)]
    pub keep_dumps: bool,
}

fn default_max_jobs() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            connect_timeout_secs: default_connect_timeout(),
            subprocess_timeout_secs: None,
            dump_directory: None,
            pg_bin_dir: None,
            keep_dumps: false,
        }
    }
}

impl EngineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn subprocess_timeout(&self) -> Option<Duration> {
        self.subprocess_timeout_secs.map(Duration::from_secs)
    }

    pub fn dump_directory(&self) -> PathBuf {
        self.dump_directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("cnc"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogConfig {
    /// Directory of the per-job log files. Has to be absolute.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// The complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp: Option<SmtpConfig>,

    /// Records of the [Postgres](crate::backends::postgres) backend.
    #[serde(default)]
    pub postgres: Vec<BackendRecord>,

    /// Records of the [MongoDB](crate::backends::mongodb) backend.
    #[serde(default)]
    pub mongodb: Vec<BackendRecord>,
}

impl Config {
    /// Parses a configuration. Call [Config::validate] once all overrides are
    /// applied.
    pub fn from_toml(path: &Path, raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads the configuration at `path`.
    ///
    /// If the file doesn't exist yet, the default configuration is written to
    /// `path` and returned.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml(path, &raw),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    target: "config",
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let default_config = Config::default();
                match toml::to_string_pretty(&default_config) {
                    Ok(config_str) => {
                        if let Err(e) = std::fs::write(path, config_str) {
                            log::warn!(
                                target: "config",
                                "Writing default config to {} failed: {e}",
                                path.display(),
                            );
                        }
                    }
                    Err(e) => log::warn!(target: "config", "Serializing the default config failed: {e}"),
                }

                Ok(default_config)
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Checks everything serde can't.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.engine.max_jobs == 0 {
            problems.push("engine.max_jobs must be at least 1".to_string());
        }

        if let Some(dir) = &self.log.directory {
            if !dir.is_absolute() {
                problems.push(format!("log.directory must be absolute: {}", dir.display()));
            }
        }

        if let Some(smtp) = self.smtp.as_ref().filter(|_| self.email_enabled()) {
            problems.extend(smtp.problems());
        }

        for (backend, records) in [("postgres", &self.postgres), ("mongodb", &self.mongodb)] {
            for (i, record) in records.iter().enumerate().filter(|(_, r)| r.enabled) {
                problems.extend(
                    record
                        .problems()
                        .into_iter()
                        .map(|problem| format!("{backend}[{i}]: {problem}")),
                );
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Returns if digests are enabled globally.
    pub fn email_enabled(&self) -> bool {
        self.smtp.as_ref().is_some_and(|smtp| smtp.enabled)
    }

    /// Overrides `smtp.enabled`. Without SMTP settings digests stay disabled.
    pub fn set_email_enabled(&mut self, enabled: bool) {
        match &mut self.smtp {
            Some(smtp) => smtp.enabled = enabled,
            None if enabled => {
                log::warn!(target: "config", "Digests were requested but there are no SMTP settings");
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        [engine]
        max_jobs = 4
        subprocess_timeout_secs = 600

        [log]
        directory = "/var/log/cnc"

        [smtp]
        enabled = true
        username = "cnc"
        password = "secret"
        host = "smtp.example.org"
        from = "cnc@example.org"
        to = ["ops@example.org"]

        [[postgres]]
        email = true
        origin = { host = "10.0.0.1", user = "backup", password = "a", port = 5432, database = "dbA" }
        target = { host = "10.0.0.2", user = "backup", password = "b", port = 5433, database = "dbA" }

        [[postgres]]
        backup_type = "schema-only"
        origin = { host = "10.0.0.1", user = "backup", password = "a", port = 5432, database = "dbB" }
        target = { host = "10.0.0.2", user = "backup", password = "b", port = 5433, database = "dbB" }

        [[mongodb]]
        enabled = false
        origin = { host = "", user = "", password = "", port = 27017, database = "" }
        target = { host = "", user = "", password = "", port = 27017, database = "" }
    "#;

    fn parse(raw: &str) -> Config {
        Config::from_toml(Path::new("cnc.toml"), raw).unwrap()
    }

    #[test]
    fn parses_example_config() {
        let config = Config::from_toml(Path::new("cnc.toml"), EXAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.engine.max_jobs, 4);
        assert_eq!(config.engine.connect_timeout_secs, 30);
        assert_eq!(config.engine.subprocess_timeout(), Some(Duration::from_secs(600)));
        assert!(config.email_enabled());
        assert_eq!(config.smtp.as_ref().unwrap().port, 587);

        let databases: Vec<_> = config
            .postgres
            .iter()
            .map(|r| r.origin.database.as_str())
            .collect();
        assert_eq!(databases, ["dbA", "dbB"]);
        assert_eq!(config.postgres[0].backup_type, BackupType::Full);
        assert!(config.postgres[0].enabled);
        assert!(config.postgres[0].email);
        assert_eq!(config.postgres[1].backup_type, BackupType::SchemaOnly);
        assert!(!config.postgres[1].email);
        assert!(!config.mongodb[0].enabled);
    }

    #[test]
    fn rejects_incomplete_enabled_records() {
        let raw = r#"
            [[postgres]]
            origin = { host = "", user = "backup", password = "a", port = 5432, database = "dbA" }
            target = { host = "10.0.0.2", user = "backup", password = "b", port = 0, database = "dbA" }
        "#;

        let err = parse(raw).validate().unwrap_err();
        let ConfigError::Invalid(problems) = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(
            problems,
            ["postgres[0]: origin.host is empty", "postgres[0]: target.port is 0"]
        );
    }

    #[test]
    fn rejects_zero_capacity_and_relative_log_directory() {
        let raw = r#"
            [engine]
            max_jobs = 0
            [log]
            directory = "logs"
        "#;

        let err = parse(raw).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref p) if p.len() == 2), "{err}");
    }

    #[test]
    fn overrides_are_applied_before_validation() {
        let raw = r#"
            [engine]
            max_jobs = 0
            [log]
            directory = "logs"
        "#;
        let mut config = parse(raw);

        config.engine.max_jobs = 5;
        config.log.directory = Some(PathBuf::from("/var/log/cnc"));

        config.validate().unwrap();
    }

    const SMTP_WITHOUT_RECIPIENTS: &str = r#"
        [smtp]
        enabled = false
        username = "cnc"
        password = "secret"
        host = "smtp.example.org"
        from = "cnc@example.org"
    "#;

    #[test]
    fn disabled_smtp_is_not_checked() {
        parse(SMTP_WITHOUT_RECIPIENTS).validate().unwrap();
    }

    #[test]
    fn rejects_enabled_smtp_without_recipients() {
        let mut config = parse(SMTP_WITHOUT_RECIPIENTS);
        config.set_email_enabled(true);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("smtp.to has no recipients"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = Config::from_toml(Path::new("cnc.toml"), "[[postgres]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_config_is_initialized_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cnc.toml");

        let config = Config::load_or_init(&path).unwrap();

        assert_eq!(config, Config::default());
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(Config::from_toml(&path, &written).unwrap(), Config::default());
    }
}
