use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::config::SmtpConfig;
use crate::notify::{Mail, MailSender, NotifyError};

/// Sends mails with STARTTLS through the configured relay.
pub struct SmtpMailer {
    host: String,
    port: u16,
    credentials: Credentials,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            credentials: Credentials::new(config.username.clone(), config.password.clone()),
        }
    }
}

fn mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address.parse().map_err(|source| NotifyError::Address {
        address: address.to_string(),
        source,
    })
}

impl MailSender for SmtpMailer {
    fn send(&self, mail: &Mail) -> Result<(), NotifyError> {
        let mut builder = Message::builder()
            .from(mailbox(&mail.from)?)
            .subject(mail.subject.as_str())
            .header(ContentType::TEXT_PLAIN);
        for to in &mail.to {
            builder = builder.to(mailbox(to)?);
        }
        for cc in &mail.cc {
            builder = builder.cc(mailbox(cc)?);
        }
        let message = builder.body(mail.body.clone()).map_err(NotifyError::Build)?;

        let transport = SmtpTransport::starttls_relay(&self.host)
            .map_err(NotifyError::Transport)?
            .port(self.port)
            .credentials(self.credentials.clone())
            .build();

        log::debug!(target: "notify::smtp", "Sending `{}` via {}:{}", mail.subject, self.host, self.port);
        transport.send(&message).map_err(NotifyError::Transport)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_addresses_fail_before_connecting() {
        let mailer = SmtpMailer {
            host: "smtp.invalid".to_string(),
            port: 587,
            credentials: Credentials::new("cnc".to_string(), "secret".to_string()),
        };
        let mail = Mail {
            from: "not an address".to_string(),
            to: vec!["ops@example.org".to_string()],
            cc: Vec::new(),
            subject: "CNC digest".to_string(),
            body: "hello\r\n".to_string(),
        };

        let err = mailer.send(&mail).unwrap_err();
        assert!(matches!(err, NotifyError::Address { ref address, .. } if address == "not an address"));
    }
}
