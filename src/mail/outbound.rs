//! Outbound mail for confirmation emails, over SMTP via lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;

use super::OutboundConfig;
use crate::error::MailError;

/// One outgoing message.
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body_html: String,
    pub reply_to: Option<String>,
    /// Message-ID this mail answers, when threading onto an inbound message.
    pub in_reply_to: Option<String>,
}

/// Sends mail and reports the Message-ID actually used.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, config: &OutboundConfig, mail: OutgoingMail) -> Result<String, MailError>;
}

/// lettre-backed SMTP sender. Port 465 uses implicit TLS, anything else
/// STARTTLS.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    timeout: Duration,
}

impl SmtpMailer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, config: &OutboundConfig, mail: OutgoingMail) -> Result<String, MailError> {
        let message_id = generate_message_id(&config.from_address);
        let email = build_message(config, &mail, &message_id)?;

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );
        let builder = if config.smtp_port == 465 {
            SmtpTransport::relay(&config.smtp_host)
        } else {
            SmtpTransport::starttls_relay(&config.smtp_host)
        }
        .map_err(|e| MailError::Send(format!("SMTP relay error: {e}")))?;
        let transport = builder
            .port(config.smtp_port)
            .credentials(creds)
            .timeout(Some(self.timeout))
            .build();

        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| MailError::Send(format!("SMTP task failed: {e}")))?
            .map_err(|e| MailError::Send(format!("SMTP send failed: {e}")))?;

        info!(to = %mail.to, message_id = %message_id, "Confirmation email sent");
        Ok(message_id)
    }
}

fn build_message(
    config: &OutboundConfig,
    mail: &OutgoingMail,
    message_id: &str,
) -> Result<Message, MailError> {
    let from = Mailbox::new(
        Some(config.from_name.clone()).filter(|n| !n.is_empty()),
        config
            .from_address
            .parse()
            .map_err(|e| MailError::Send(format!("Invalid from address: {e}")))?,
    );
    let to: Mailbox = mail
        .to
        .parse()
        .map_err(|e| MailError::Send(format!("Invalid to address: {e}")))?;

    let mut builder = Message::builder()
        .message_id(Some(message_id.to_string()))
        .from(from)
        .to(to)
        .subject(mail.subject.clone())
        .header(ContentType::TEXT_HTML);
    if let Some(reply_to) = &mail.reply_to {
        let reply_to: Mailbox = reply_to
            .parse()
            .map_err(|e| MailError::Send(format!("Invalid reply-to address: {e}")))?;
        builder = builder.reply_to(reply_to);
    }
    if let Some(parent) = &mail.in_reply_to {
        builder = builder
            .in_reply_to(parent.clone())
            .references(parent.clone());
    }

    builder
        .body(mail.body_html.clone())
        .map_err(|e| MailError::Send(format!("Failed to build email: {e}")))
}

/// `<uuid@domain-of-sender>`.
fn generate_message_id(from_address: &str) -> String {
    let domain = from_address
        .rsplit_once('@')
        .map(|(_, d)| d)
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost");
    format!("<{}@{}>", uuid::Uuid::new_v4(), domain)
}

/// Render plain text as minimal HTML, preserving line breaks.
pub fn text_to_html(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!("<html><body>{}</body></html>", escaped.replace('\n', "<br>\n"))
}
