//! Email poster: SMTP via lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use super::{PostReceipt, Poster, first_field, message_text};
use crate::config::SmtpConfig;
use crate::error::PostError;
use crate::vault::{Platform, UnitFile};

/// Subject used when a unit carries none.
pub const DEFAULT_SUBJECT: &str = "Message from AI Employee";

pub struct EmailPoster {
    smtp: Option<SmtpConfig>,
    live: bool,
}

impl EmailPoster {
    pub fn new(smtp: Option<SmtpConfig>, live: bool) -> Self {
        Self { smtp, live }
    }
}

/// Recipient address: `to`, falling back to `email`.
fn recipient(unit: &UnitFile) -> Option<&str> {
    first_field(unit, &["to", "email"])
}

fn send_failed(reason: String) -> PostError {
    PostError::SendFailed {
        platform: "email".into(),
        reason,
    }
}

/// Blocking SMTP send. Run inside `spawn_blocking`.
fn send_email(config: &SmtpConfig, to: &str, subject: &str, body: &str) -> Result<String, PostError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.host)
        .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
        .port(config.port)
        .credentials(creds)
        .build();

    let email = Message::builder()
        .from(config.from_address.parse().map_err(|e| PostError::NotConfigured {
            platform: "email".into(),
            reason: format!("Invalid from address: {e}"),
        })?)
        .to(to.parse().map_err(|e| PostError::Rejected {
            platform: "email".into(),
            reason: format!("Invalid to address: {e}"),
        })?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))?;

    let response = transport
        .send(&email)
        .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;

    Ok(response.message().collect::<Vec<_>>().join(" "))
}

#[async_trait]
impl Poster for EmailPoster {
    fn platform(&self) -> Platform {
        Platform::Email
    }

    fn validate(&self, unit: &UnitFile) -> Result<(), PostError> {
        if recipient(unit).is_none() {
            return Err(PostError::MissingField("No recipient specified".into()));
        }
        Ok(())
    }

    async fn post(&self, unit: &UnitFile) -> Result<PostReceipt, PostError> {
        self.validate(unit)?;
        let to = recipient(unit).unwrap_or_default().to_string();
        let subject = unit.get_nonempty("subject").unwrap_or(DEFAULT_SUBJECT).to_string();
        let body = message_text(unit);

        if !self.live {
            tracing::info!(to = %to, subject = %subject, "Dry run: email not sent");
            return Ok(PostReceipt::dry_run());
        }

        let config = self.smtp.clone().ok_or_else(|| PostError::NotConfigured {
            platform: "email".into(),
            reason: "EMAIL_SMTP_HOST not set".into(),
        })?;

        let recipient = to.clone();
        let server_reply = tokio::task::spawn_blocking(move || send_email(&config, &recipient, &subject, &body))
            .await
            .map_err(|e| send_failed(format!("SMTP task failed: {e}")))??;

        tracing::info!(to = %to, "Email sent");
        Ok(PostReceipt {
            external_id: (!server_reply.is_empty()).then_some(server_reply),
            url: None,
            dry_run: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_recipient() {
        let poster = EmailPoster::new(None, false);
        let missing = UnitFile::parse("---\ntype: email\nsubject: Hi\n---\nbody\n");
        let err = poster.validate(&missing).unwrap_err();
        assert_eq!(err.to_string(), "No recipient specified");

        let via_email_key = UnitFile::parse("---\nemail: bob@example.com\n---\nbody\n");
        assert!(poster.validate(&via_email_key).is_ok());
    }

    #[tokio::test]
    async fn dry_run_does_not_need_smtp() {
        let poster = EmailPoster::new(None, false);
        let unit = UnitFile::parse("---\nto: bob@example.com\n---\nhello\n");
        let receipt = poster.post(&unit).await.unwrap();
        assert!(receipt.dry_run);
    }

    #[tokio::test]
    async fn live_without_smtp_is_not_configured() {
        let poster = EmailPoster::new(None, true);
        let unit = UnitFile::parse("---\nto: bob@example.com\n---\nhello\n");
        let err = poster.post(&unit).await.unwrap_err();
        assert!(matches!(err, PostError::NotConfigured { .. }));
        assert!(!err.is_retryable());
    }
}
