use std::fmt;

/// Connection parameters of one database instance.
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub database: String,
}

// Keeps the password out of logs.
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"***")
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

/// Which part of the origin database gets replicated.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, derive_more::Display, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum BackupType {
    /// Only the schema (tables, indices, ...) without data.
    #[serde(alias = "schema")]
    #[display("schema-only")]
    SchemaOnly,
    /// Schema and data.
    #[default]
    #[display("full")]
    Full,
}

/// One configured origin/target pair of a backend.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BackendRecord {
    /// Disabled records are skipped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Database the data is copied from.
    pub origin: Endpoint,

    /// Database the data is copied to.
    pub target: Endpoint,

    #[serde(default)]
    pub backup_type: BackupType,

    /// Send a digest of this record's job per mail (if mails are enabled globally).
    #[serde(default)]
    pub email: bool,
}

fn default_enabled() -> bool {
    true
}

impl BackendRecord {
    pub(super) fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (side, endpoint) in [("origin", &self.origin), ("target", &self.target)] {
            for (field, value) in [
                ("host", &endpoint.host),
                ("user", &endpoint.user),
                ("database", &endpoint.database),
            ] {
                if value.trim().is_empty() {
                    problems.push(format!("{side}.{field} is empty"));
                }
            }
            if endpoint.port == 0 {
                problems.push(format!("{side}.port is 0"));
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("\"full\"", BackupType::Full)]
    #[case("\"schema-only\"", BackupType::SchemaOnly)]
    #[case("\"schema\"", BackupType::SchemaOnly)]
    fn parses_backup_type(#[case] raw: &str, #[case] expected: BackupType) {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            backup_type: BackupType,
        }

        let parsed: Wrapper = toml::from_str(&format!("backup_type = {raw}")).unwrap();
        assert_eq!(parsed.backup_type, expected);
    }

    #[test]
    fn debug_hides_password() {
        let endpoint = Endpoint {
            host: "db.internal".into(),
            user: "backup".into(),
            password: "hunter2".into(),
            port: 5432,
            database: "dbA".into(),
        };

        assert!(!format!("{endpoint:?}").contains("hunter2"));
        assert_eq!(endpoint.to_string(), "backup@db.internal:5432/dbA");
    }
}
