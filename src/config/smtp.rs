use std::fmt;

/// SMTP settings for the job digests.
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SmtpConfig {
    /// Global switch for digests. Records opt in individually with `email = true`.
    #[serde(default)]
    pub enabled: bool,
    pub username: String,
    pub password: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
}

fn default_port() -> u16 {
    587
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("enabled", &self.enabled)
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("cc", &self.cc)
            .finish()
    }
}

impl SmtpConfig {
    pub(super) fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.host.trim().is_empty() {
            problems.push("smtp.host is empty".to_string());
        }
        if self.from.trim().is_empty() {
            problems.push("smtp.from is empty".to_string());
        }
        if self.to.is_empty() {
            problems.push("smtp.to has no recipients".to_string());
        }
        problems
    }
}
