//! Stateful variant: IMAP over TCP/TLS.
//!
//! Candidates are the UNSEEN messages of the configured folder. Messages are
//! fetched with `BODY.PEEK[]` so reading never flips the flag; only
//! `mark_consumed` sets `\Seen`. Nothing is ever expunged.

use std::time::Duration;

use secrecy::ExposeSecret;
use tracing::debug;

use super::transport::LineStream;
use super::{MailSession, MailboxConfig, MessageHandle};
use crate::error::MailError;

/// Tagged response: untagged lines, the first literal payload (if any), and
/// the final tagged status line.
struct Response {
    untagged: Vec<String>,
    literal: Option<Vec<u8>>,
    status: String,
}

/// An authenticated IMAP session with a folder selected.
pub struct ImapSession {
    stream: LineStream,
    next_tag: u32,
    host: String,
}

impl ImapSession {
    /// Connect, log in, and select the configured folder.
    pub fn connect(config: &MailboxConfig, timeout: Duration) -> Result<Self, MailError> {
        let stream = LineStream::connect(&config.host, config.port, config.use_tls, timeout, "IMAP")?;
        let mut session = Self {
            stream,
            next_tag: 1,
            host: config.host.clone(),
        };

        let greeting = session.stream.read_line()?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(MailError::Protocol {
                protocol: "IMAP",
                response: greeting,
            });
        }

        let login = session.command(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))?;
        if !is_ok(&login.status) {
            return Err(MailError::Auth {
                host: session.host.clone(),
            });
        }

        let select = session.command(&format!("SELECT {}", quote(&config.folder)))?;
        if !is_ok(&select.status) {
            return Err(MailError::Protocol {
                protocol: "IMAP",
                response: select.status,
            });
        }

        debug!(host = %session.host, folder = %config.folder, "IMAP session ready");
        Ok(session)
    }

    fn command(&mut self, cmd: &str) -> Result<Response, MailError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;
        self.stream.write_line(&format!("{tag} {cmd}"))?;

        let tag_prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        let mut literal = None;
        loop {
            let line = self.stream.read_line()?;
            if line.starts_with(&tag_prefix) {
                return Ok(Response {
                    untagged,
                    literal,
                    status: line[tag_prefix.len()..].to_string(),
                });
            }
            if let Some(len) = literal_len(&line) {
                let bytes = self.stream.read_exact_bytes(len)?;
                if literal.is_none() {
                    literal = Some(bytes);
                }
            }
            untagged.push(line);
        }
    }

    fn expect_ok(&mut self, cmd: &str) -> Result<Response, MailError> {
        let response = self.command(cmd)?;
        if is_ok(&response.status) {
            Ok(response)
        } else {
            Err(MailError::Protocol {
                protocol: "IMAP",
                response: response.status,
            })
        }
    }
}

impl MailSession for ImapSession {
    fn list_candidates(&mut self) -> Result<Vec<MessageHandle>, MailError> {
        let response = self.expect_ok("UID SEARCH UNSEEN")?;
        Ok(parse_search(&response.untagged)
            .into_iter()
            .map(MessageHandle)
            .collect())
    }

    fn fetch(&mut self, handle: &MessageHandle) -> Result<Vec<u8>, MailError> {
        let response = self.expect_ok(&format!("UID FETCH {handle} BODY.PEEK[]"))?;
        response.literal.ok_or_else(|| MailError::Parse {
            handle: handle.to_string(),
            reason: "FETCH returned no message body".into(),
        })
    }

    fn mark_consumed(&mut self, handle: &MessageHandle) -> Result<(), MailError> {
        self.expect_ok(&format!("UID STORE {handle} +FLAGS (\\Seen)"))?;
        Ok(())
    }

    fn close(mut self: Box<Self>) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(host = %self.host, error = %e, "IMAP logout failed");
        }
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────

fn is_ok(status: &str) -> bool {
    status.starts_with("OK")
}

/// Quote a string for use as an IMAP astring.
fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Length of a trailing `{n}` literal marker, if the line ends with one.
fn literal_len(line: &str) -> Option<usize> {
    let rest = line.strip_suffix('}')?;
    let open = rest.rfind('{')?;
    rest[open + 1..].trim_end_matches('+').parse().ok()
}

/// Collect UIDs from `* SEARCH` lines.
fn parse_search(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter(|uid| uid.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}
