//! Error types for mail intake.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mailbox and SMTP errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS setup failed for {host}: {reason}")]
    Tls { host: String, reason: String },

    #[error("Authentication rejected by {host}")]
    Auth { host: String },

    #[error("Unexpected {protocol} response: {response}")]
    Protocol {
        protocol: &'static str,
        response: String,
    },

    #[error("Mailbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mailbox operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed message {handle}: {reason}")]
    Parse { handle: String, reason: String },

    #[error("Failed to send mail: {0}")]
    Send(String),
}

impl MailError {
    /// Transport failures leave the session unusable and abort the target.
    /// Parse failures and per-command rejections are scoped to one message.
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Parse { .. } | Self::Protocol { .. })
    }
}

/// Errors that end one target's unit of work.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Mailbox transport failed: {0}")]
    Transport(#[from] MailError),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] DatabaseError),

    #[error("Cycle cancelled by shutdown")]
    Cancelled,

    #[error("Blocking mailbox task panicked: {0}")]
    TaskPanicked(String),
}
