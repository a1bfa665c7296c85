//! Mail channel adapter.
//!
//! Boundary wrapper over an async SMTP transport. Attachments arrive already
//! loaded and validated by the dispatch loop; this module only assembles and
//! sends the MIME message.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::config;

/// One fully assembled outbound email.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMail {
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub reply_to: Option<String>,
    pub attachments: Vec<LoadedAttachment>,
}

/// Attachment content read from the media root.
#[derive(Debug, Clone)]
pub struct LoadedAttachment {
    pub file_name: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[async_trait]
pub trait MailService: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<()>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    default_from: String,
}

impl SmtpMailer {
    pub fn from_config(cfg: &config::Mail) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host)
            .context("invalid SMTP relay")?
            .port(cfg.smtp_port);
        if let (Some(user), Some(pass)) = (&cfg.smtp_username, &cfg.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        Ok(Self {
            transport: builder.build(),
            default_from: cfg.default_from.clone(),
        })
    }

    fn build_message(&self, mail: &OutgoingMail) -> Result<Message> {
        if mail.to.is_empty() {
            return Err(anyhow!("mail has no recipients"));
        }

        let from = if mail.from.is_empty() {
            &self.default_from
        } else {
            &mail.from
        };
        let mut builder = Message::builder()
            .from(from.parse::<Mailbox>().context("invalid sender address")?)
            .subject(mail.subject.clone());
        for to in &mail.to {
            builder = builder.to(to.parse::<Mailbox>().context("invalid recipient address")?);
        }
        if let Some(reply_to) = &mail.reply_to {
            builder = builder.reply_to(
                reply_to
                    .parse::<Mailbox>()
                    .context("invalid reply-to address")?,
            );
        }

        let mut alternatives = MultiPart::alternative().singlepart(SinglePart::plain(mail.body.clone()));
        if let Some(html) = &mail.html_body {
            alternatives = alternatives.singlepart(SinglePart::html(html.clone()));
        }

        if mail.attachments.is_empty() {
            return builder
                .multipart(alternatives)
                .context("failed to assemble mail");
        }

        let mut mixed = MultiPart::mixed().multipart(alternatives);
        for attachment in &mail.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .unwrap_or(ContentType::TEXT_PLAIN);
            mixed = mixed.singlepart(
                MimeAttachment::new(attachment.file_name.clone())
                    .body(attachment.content.clone(), content_type),
            );
        }
        builder.multipart(mixed).context("failed to assemble mail")
    }
}

#[async_trait]
impl MailService for SmtpMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<()> {
        let message = self.build_message(mail)?;
        self.transport
            .send(message)
            .await
            .context("SMTP send failed")?;
        info!(to = mail.to.len(), subject = %mail.subject, "mail sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailer() -> SmtpMailer {
        let cfg = config::Mail {
            default_from: "notifications@example.com".into(),
            smtp_host: "localhost".into(),
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
        };
        SmtpMailer::from_config(&cfg).unwrap()
    }

    #[test]
    fn builds_plain_message() {
        let mail = OutgoingMail {
            subject: "hi".into(),
            body: "hello".into(),
            from: "sender@example.com".into(),
            to: vec!["x@a.com".into(), "y@a.com".into()],
            ..Default::default()
        };
        mailer().build_message(&mail).unwrap();
    }

    #[test]
    fn builds_html_and_attachment_message() {
        let mail = OutgoingMail {
            subject: "report".into(),
            body: "see attached".into(),
            html_body: Some("<b>see attached</b>".into()),
            from: "sender@example.com".into(),
            to: vec!["x@a.com".into()],
            reply_to: Some("ops@example.com".into()),
            attachments: vec![LoadedAttachment {
                file_name: "report.csv".into(),
                content_type: "text/csv".into(),
                content: b"a,b\n1,2\n".to_vec(),
            }],
        };
        mailer().build_message(&mail).unwrap();
    }

    #[test]
    fn empty_sender_falls_back_to_default() {
        let mail = OutgoingMail {
            subject: "hi".into(),
            body: "hello".into(),
            to: vec!["x@a.com".into()],
            ..Default::default()
        };
        mailer().build_message(&mail).unwrap();
    }

    #[test]
    fn no_recipients_is_an_error() {
        let mail = OutgoingMail {
            subject: "hi".into(),
            body: "hello".into(),
            from: "sender@example.com".into(),
            ..Default::default()
        };
        assert!(mailer().build_message(&mail).is_err());
    }
}
