//! Mail digests of finished jobs.
//!
//! A digest is sent when a job closes if digests are enabled globally and the
//! job's record opted in. The digest body is the job's log.

mod smtp;

use std::io;

use derive_more::{Display, Error};

pub use smtp::SmtpMailer;

use crate::config::SmtpConfig;
use crate::engine::{JobLog, NotificationStatus, Outcome};
use crate::util::crlf;

#[derive(Debug, Display, Error)]
pub enum NotifyError {
    /// The job log couldn't be read back.
    #[display("reading the job log failed: {_0}")]
    ReadLog(io::Error),
    #[display("invalid mail address `{address}`: {source}")]
    Address {
        address: String,
        source: lettre::address::AddressError,
    },
    #[display("building the mail failed: {_0}")]
    Build(lettre::error::Error),
    #[display("SMTP transport failed: {_0}")]
    Transport(lettre::transport::smtp::Error),
    #[display("{_0}")]
    Rejected(#[error(ignore)] String),
}

/// A plain text mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    /// Lines end with `\r\n`.
    pub body: String,
}

/// Delivers mails. Shared by all workers.
pub trait MailSender: Send + Sync {
    fn send(&self, mail: &Mail) -> Result<(), NotifyError>;
}

/// The job a digest is about.
#[derive(Debug, Clone, Copy)]
pub struct Digest<'a> {
    pub backend: &'a str,
    pub origin: &'a str,
    pub target: &'a str,
    pub outcome: Outcome,
    /// Whether the job's record opted in to digests.
    pub requested: bool,
}

impl Digest<'_> {
    pub fn subject(&self) -> String {
        format!("CNC digest: {} `{}` {}", self.backend, self.origin, self.outcome)
    }
}

struct Envelope {
    from: String,
    to: Vec<String>,
    cc: Vec<String>,
}

/// Decides whether a closing job gets a digest and sends it.
pub struct NotificationTrigger {
    envelope: Option<Envelope>,
    sender: Box<dyn MailSender>,
}

impl NotificationTrigger {
    /// Trigger that never sends anything.
    pub fn disabled() -> Self {
        Self {
            envelope: None,
            sender: Box::new(NoSender),
        }
    }

    /// Creates a trigger sending digests with `sender`.
    ///
    /// `enabled` overrides `smtp.enabled`. Digests stay disabled without SMTP
    /// settings.
    pub fn new(smtp: Option<&SmtpConfig>, enabled: Option<bool>, sender: Box<dyn MailSender>) -> Self {
        let envelope = match smtp {
            Some(smtp) if enabled.unwrap_or(smtp.enabled) => Some(Envelope {
                from: smtp.from.clone(),
                to: smtp.to.clone(),
                cc: smtp.cc.clone(),
            }),
            None if enabled == Some(true) => {
                log::warn!(target: "notify", "Digests were requested but there are no SMTP settings");
                None
            }
            _ => None,
        };

        Self { envelope, sender }
    }

    /// Creates a trigger sending digests over SMTP.
    pub fn smtp(smtp: Option<&SmtpConfig>, enabled: Option<bool>) -> Self {
        match smtp {
            Some(config) => Self::new(smtp, enabled, Box::new(SmtpMailer::new(config))),
            None => Self::new(None, enabled, Box::new(NoSender)),
        }
    }

    /// Returns if digests are enabled globally.
    pub fn is_enabled(&self) -> bool {
        self.envelope.is_some()
    }

    /// Sends the digest of a closing job, if one is due.
    ///
    /// Failures are written to the job log and never affect the job's outcome.
    pub fn on_close(&self, digest: &Digest<'_>, log: &mut JobLog) -> NotificationStatus {
        let Some(envelope) = self.envelope.as_ref().filter(|_| digest.requested) else {
            return NotificationStatus::NotRequested;
        };

        let result = log
            .contents()
            .map_err(NotifyError::ReadLog)
            .and_then(|body| {
                let mail = Mail {
                    from: envelope.from.clone(),
                    to: envelope.to.clone(),
                    cc: envelope.cc.clone(),
                    subject: digest.subject(),
                    body: crlf::normalize_str(&body).into_owned(),
                };
                self.sender.send(&mail)
            });

        match result {
            Ok(()) => {
                log.info(format_args!("Sent digest to {}", envelope.to.join(", ")));
                NotificationStatus::Sent
            }
            Err(e) => {
                log.warn(format_args!("Sending the digest failed: {e}"));
                NotificationStatus::Failed
            }
        }
    }
}

struct NoSender;

impl MailSender for NoSender {
    fn send(&self, _mail: &Mail) -> Result<(), NotifyError> {
        Err(NotifyError::Rejected("no SMTP settings".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Outbox {
        mails: Arc<Mutex<Vec<Mail>>>,
        fail: bool,
    }

    impl MailSender for Outbox {
        fn send(&self, mail: &Mail) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Rejected("relay said no".to_string()));
            }
            self.mails.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    #[fixture]
    fn smtp() -> SmtpConfig {
        SmtpConfig {
            enabled: true,
            username: "cnc".to_string(),
            password: "secret".to_string(),
            host: "smtp.example.org".to_string(),
            port: 587,
            from: "cnc@example.org".to_string(),
            to: vec!["ops@example.org".to_string()],
            cc: vec!["dba@example.org".to_string()],
        }
    }

    fn digest(requested: bool) -> Digest<'static> {
        Digest {
            backend: "postgres",
            origin: "dbA",
            target: "dbA",
            outcome: Outcome::ConnectFailed,
            requested,
        }
    }

    #[rstest]
    #[case(true, None, true, NotificationStatus::Sent)]
    #[case(true, None, false, NotificationStatus::NotRequested)]
    #[case(false, None, true, NotificationStatus::NotRequested)]
    #[case(false, Some(true), true, NotificationStatus::Sent)]
    #[case(true, Some(false), true, NotificationStatus::NotRequested)]
    fn both_switches_must_be_on(
        mut smtp: SmtpConfig,
        #[case] globally: bool,
        #[case] cli_override: Option<bool>,
        #[case] requested: bool,
        #[case] expected: NotificationStatus,
    ) {
        smtp.enabled = globally;
        let outbox = Outbox::default();
        let trigger = NotificationTrigger::new(Some(&smtp), cli_override, Box::new(outbox.clone()));
        let mut log = JobLog::in_memory("postgres/dbA");

        assert_eq!(trigger.on_close(&digest(requested), &mut log), expected);
        let sent = outbox.mails.lock().unwrap().len();
        assert_eq!(sent, usize::from(expected == NotificationStatus::Sent));
    }

    #[rstest]
    fn digest_carries_the_log(smtp: SmtpConfig) {
        let outbox = Outbox::default();
        let trigger = NotificationTrigger::new(Some(&smtp), None, Box::new(outbox.clone()));
        let mut log = JobLog::in_memory("postgres/dbA");
        log.error(format_args!("connecting failed\nsecond line"));

        trigger.on_close(&digest(true), &mut log);

        let mails = outbox.mails.lock().unwrap();
        let mail = &mails[0];
        assert_eq!(mail.subject, "CNC digest: postgres `dbA` connection failed");
        assert_eq!(mail.to, ["ops@example.org"]);
        assert_eq!(mail.cc, ["dba@example.org"]);
        assert!(mail.body.contains("connecting failed\r\nsecond line\r\n"), "{:?}", mail.body);
        assert!(crlf::is_normalized(mail.body.as_bytes()));
    }

    #[rstest]
    fn send_failure_is_logged(smtp: SmtpConfig) {
        let outbox = Outbox {
            fail: true,
            ..Outbox::default()
        };
        let trigger = NotificationTrigger::new(Some(&smtp), None, Box::new(outbox));
        let mut log = JobLog::in_memory("postgres/dbA");

        assert_eq!(trigger.on_close(&digest(true), &mut log), NotificationStatus::Failed);
        assert!(log.contents().unwrap().contains("relay said no"));
    }

    #[test]
    fn override_without_smtp_settings_stays_disabled() {
        let trigger = NotificationTrigger::smtp(None, Some(true));
        assert!(!trigger.is_enabled());
        assert!(!NotificationTrigger::disabled().is_enabled());
    }
}
