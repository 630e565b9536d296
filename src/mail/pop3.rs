//! Stateless variant: POP3 over TCP/TLS.
//!
//! Every message in the maildrop is a candidate; POP3 has no read flag, so
//! `mark_consumed` is a no-op and idempotency rests on the ledger. `DELE` is
//! never issued.

use std::time::Duration;

use secrecy::ExposeSecret;
use tracing::debug;

use super::transport::LineStream;
use super::{MailSession, MailboxConfig, MessageHandle};
use crate::error::MailError;

pub struct Pop3Session {
    stream: LineStream,
    host: String,
}

impl Pop3Session {
    /// Connect and authenticate with USER/PASS.
    pub fn connect(config: &MailboxConfig, timeout: Duration) -> Result<Self, MailError> {
        let stream = LineStream::connect(&config.host, config.port, config.use_tls, timeout, "POP3")?;
        let mut session = Self {
            stream,
            host: config.host.clone(),
        };

        let greeting = session.stream.read_line()?;
        session.check(greeting)?;

        let user = session.command(&format!("USER {}", config.username))?;
        if !user.starts_with("+OK") {
            return Err(MailError::Auth {
                host: session.host.clone(),
            });
        }
        let pass = session.command(&format!("PASS {}", config.password.expose_secret()))?;
        if !pass.starts_with("+OK") {
            return Err(MailError::Auth {
                host: session.host.clone(),
            });
        }

        debug!(host = %session.host, "POP3 session ready");
        Ok(session)
    }

    fn command(&mut self, cmd: &str) -> Result<String, MailError> {
        self.stream.write_line(cmd)?;
        self.stream.read_line()
    }

    fn check(&self, line: String) -> Result<String, MailError> {
        if line.starts_with("+OK") {
            Ok(line)
        } else {
            Err(MailError::Protocol {
                protocol: "POP3",
                response: line,
            })
        }
    }

    /// Read a dot-terminated multi-line body, undoing byte-stuffing.
    fn read_multiline(&mut self) -> Result<Vec<u8>, MailError> {
        let mut out = Vec::new();
        loop {
            let line = self.stream.read_line_bytes()?;
            let content = line
                .strip_suffix(b"\r\n")
                .or_else(|| line.strip_suffix(b"\n"))
                .unwrap_or(&line);
            if content == b"." {
                return Ok(out);
            }
            match line.strip_prefix(b".") {
                Some(unstuffed) => out.extend_from_slice(unstuffed),
                None => out.extend_from_slice(&line),
            }
        }
    }
}

impl MailSession for Pop3Session {
    fn list_candidates(&mut self) -> Result<Vec<MessageHandle>, MailError> {
        let status = self.command("LIST")?;
        self.check(status)?;
        let listing = self.read_multiline()?;
        Ok(parse_list(&String::from_utf8_lossy(&listing))
            .into_iter()
            .map(MessageHandle)
            .collect())
    }

    fn fetch(&mut self, handle: &MessageHandle) -> Result<Vec<u8>, MailError> {
        let status = self.command(&format!("RETR {handle}"))?;
        self.check(status)?;
        self.read_multiline()
    }

    fn mark_consumed(&mut self, _handle: &MessageHandle) -> Result<(), MailError> {
        Ok(())
    }

    fn close(mut self: Box<Self>) {
        if let Err(e) = self.command("QUIT") {
            debug!(host = %self.host, error = %e, "POP3 quit failed");
        }
    }
}

/// Message numbers from a LIST scan listing (`<n> <octets>` per line).
fn parse_list(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|n| n.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}
