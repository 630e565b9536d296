//! Mailbox access: the connector interface, its two wire variants, content
//! normalization, and outbound SMTP for auto-replies.

pub mod imap;
pub mod normalize;
pub mod outbound;
pub mod pop3;
pub mod transport;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::MailError;

pub use normalize::{AttachmentInfo, NormalizedMessage, normalize};
pub use outbound::{Mailer, OutgoingMail, SmtpMailer};

// ── Configuration ───────────────────────────────────────────────────

/// Wire variant used to read a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stateful folder/flag protocol; candidates are unseen messages.
    Imap,
    /// Stateless retrieve protocol; every message is a candidate.
    Pop3,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imap => "imap",
            Self::Pop3 => "pop3",
        }
    }

    /// Conventional port for this protocol.
    pub fn default_port(&self, use_tls: bool) -> u16 {
        match (self, use_tls) {
            (Self::Imap, true) => 993,
            (Self::Imap, false) => 143,
            (Self::Pop3, true) => 995,
            (Self::Pop3, false) => 110,
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "imap" => Ok(Self::Imap),
            "pop3" | "pop" => Ok(Self::Pop3),
            other => Err(format!("unknown mail protocol '{other}'")),
        }
    }
}

/// SMTP credentials used for confirmation emails.
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub from_name: String,
}

/// Auto-reply behaviour for new tickets.
#[derive(Debug, Clone)]
pub struct AutoReplySettings {
    pub enabled: bool,
    pub company_name: String,
    /// Template; supports `{ticket_number}`, `{subject}`, `{priority}`.
    pub subject_template: String,
    /// Template; additionally supports `{guest_name}`, `{guest_surname}`, `{company_name}`.
    pub body_template: String,
}

impl Default for AutoReplySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            company_name: "Support Team".into(),
            subject_template: "Ticket Confirmation - #{ticket_number}".into(),
            body_template: DEFAULT_CONFIRMATION_BODY.into(),
        }
    }
}

pub const DEFAULT_CONFIRMATION_BODY: &str = "Dear {guest_name} {guest_surname},

Thank you for contacting us. Your support ticket has been created.

Ticket Number: {ticket_number}
Subject: {subject}
Priority: {priority}

Please keep the ticket number in the subject line of any follow-up.

Best regards,
{company_name}";

/// One mailbox to poll: tenant-wide, or scoped to a single project.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub id: i64,
    pub tenant_id: i64,
    pub project_id: Option<i64>,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub use_tls: bool,
    /// IMAP folder to read; ignored for POP3.
    pub folder: String,
    pub outbound: Option<OutboundConfig>,
    pub auto_reply: AutoReplySettings,
}

impl MailboxConfig {
    /// Stable key identifying this polling target.
    pub fn target_key(&self) -> TargetKey {
        TargetKey {
            tenant_id: self.tenant_id,
            project_id: self.project_id,
            mailbox_id: self.id,
        }
    }
}

/// Identifies one polling target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    pub tenant_id: i64,
    pub project_id: Option<i64>,
    pub mailbox_id: i64,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.project_id {
            Some(project) => write!(
                f,
                "tenant:{}/project:{}/mailbox:{}",
                self.tenant_id, project, self.mailbox_id
            ),
            None => write!(f, "tenant:{}/mailbox:{}", self.tenant_id, self.mailbox_id),
        }
    }
}

// ── Connector interface ─────────────────────────────────────────────

/// Opaque per-session reference to one message: an IMAP UID or a POP3
/// message number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageHandle(pub String);

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An open, authenticated mailbox session. All calls block; drive them from
/// `spawn_blocking`.
pub trait MailSession: Send {
    /// Messages eligible for processing, in server order.
    fn list_candidates(&mut self) -> Result<Vec<MessageHandle>, MailError>;

    /// Raw RFC 5322 bytes of one message. Must not consume it.
    fn fetch(&mut self, handle: &MessageHandle) -> Result<Vec<u8>, MailError>;

    /// Mark a message as handled. Never deletes server mail.
    fn mark_consumed(&mut self, handle: &MessageHandle) -> Result<(), MailError>;

    /// Log out and drop the connection.
    fn close(self: Box<Self>);
}

/// Opens sessions for mailbox configs.
pub trait MailConnector: Send + Sync {
    fn connect(&self, config: &MailboxConfig) -> Result<Box<dyn MailSession>, MailError>;
}

/// Connector that talks to real servers, choosing the wire variant from
/// the config's protocol.
#[derive(Debug, Clone)]
pub struct NetworkConnector {
    timeout: Duration,
}

impl NetworkConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl MailConnector for NetworkConnector {
    fn connect(&self, config: &MailboxConfig) -> Result<Box<dyn MailSession>, MailError> {
        match config.protocol {
            Protocol::Imap => Ok(Box::new(imap::ImapSession::connect(config, self.timeout)?)),
            Protocol::Pop3 => Ok(Box::new(pop3::Pop3Session::connect(config, self.timeout)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parses_case_insensitively() {
        assert_eq!("IMAP".parse::<Protocol>().unwrap(), Protocol::Imap);
        assert_eq!(" pop3 ".parse::<Protocol>().unwrap(), Protocol::Pop3);
        assert!("exchange".parse::<Protocol>().is_err());
    }

    #[test]
    fn default_ports() {
        assert_eq!(Protocol::Imap.default_port(true), 993);
        assert_eq!(Protocol::Pop3.default_port(false), 110);
    }

    #[test]
    fn target_key_display() {
        let tenant = TargetKey {
            tenant_id: 7,
            project_id: None,
            mailbox_id: 1,
        };
        let project = TargetKey {
            project_id: Some(3),
            ..tenant
        };
        assert_eq!(tenant.to_string(), "tenant:7/mailbox:1");
        assert_eq!(project.to_string(), "tenant:7/project:3/mailbox:1");
    }
}
