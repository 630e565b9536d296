//! Content normalization: raw RFC 5322 bytes to a [`NormalizedMessage`].
//!
//! Decoding problems degrade quality but never abort: a header that fails to
//! decode falls back to its raw text, a missing body becomes empty, a missing
//! Message-ID gets a deterministic synthetic id. Only bytes that do not parse
//! as a message at all produce [`MailError::Parse`].

use std::sync::LazyLock;

use mail_parser::{Address, MessageParser, MimeHeaders, PartType};
use regex::Regex;
use serde::Serialize;

use super::MessageHandle;
use crate::error::MailError;

/// Lines starting with any of these begin a signature block.
const SIGNATURE_MARKERS: &[&str] = &[
    "-- ",
    "Sent from",
    "Get Outlook",
    "Sent from my iPhone",
    "Sent from my Android",
];

static UNDERSCORE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^_{10,}").unwrap());
static MESSAGE_ID_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^<>\s]+>").unwrap());
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>?").unwrap());
static SPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());
static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Metadata for one attachment. The content itself is not retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentInfo {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
}

/// A decoded inbound message, ready for matching.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedMessage {
    /// Never empty. Verbatim header value, or a synthetic id.
    pub message_id: String,
    /// Verbatim, brackets as received.
    pub in_reply_to: Option<String>,
    /// Oldest first, as they appear in the header.
    pub references: Vec<String>,
    pub sender_name: String,
    /// Lowercased.
    pub sender_address: String,
    /// Lowercased; empty when the message has no `To`.
    pub recipient_address: String,
    pub subject: String,
    /// Extracted and cleaned plain text.
    pub body: String,
    pub attachments: Vec<AttachmentInfo>,
    /// `Date` header as a unix timestamp, when present and valid.
    pub date: Option<i64>,
}

impl NormalizedMessage {
    /// Display name if known, otherwise the address.
    pub fn sender_label(&self) -> &str {
        if self.sender_name.is_empty() {
            &self.sender_address
        } else {
            &self.sender_name
        }
    }
}

/// Decode one fetched message.
pub fn normalize(handle: &MessageHandle, raw: &[u8]) -> Result<NormalizedMessage, MailError> {
    let parse_err = |reason: &str| MailError::Parse {
        handle: handle.to_string(),
        reason: reason.to_string(),
    };
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(parse_err("empty message"));
    }
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| parse_err("not an RFC 5322 message"))?;

    let (sender_name, sender_address) = first_mailbox(parsed.from());
    let (_, recipient_address) = first_mailbox(parsed.to());

    let subject = parsed
        .subject()
        .map(str::to_string)
        .or_else(|| parsed.header_raw("Subject").map(unfold))
        .unwrap_or_default()
        .trim()
        .to_string();

    let date = parsed.date().map(|d| d.to_timestamp());

    let in_reply_to = parsed
        .header_raw("In-Reply-To")
        .and_then(|raw| id_tokens(raw).into_iter().next());
    let references = parsed
        .header_raw("References")
        .map(id_tokens)
        .unwrap_or_default();

    let message_id = parsed
        .header_raw("Message-ID")
        .map(|raw| unfold(raw).trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| synthetic_message_id(handle, date, &sender_address));

    let attachments = parsed
        .attachments()
        .map(|part| AttachmentInfo {
            filename: part.attachment_name().unwrap_or("attachment").to_string(),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".into()),
            size: part.contents().len(),
        })
        .collect();

    let plain = parsed.text_bodies().find_map(|part| match &part.body {
        PartType::Text(text) => Some(text.to_string()),
        _ => None,
    });
    let extracted = match plain {
        Some(text) => text,
        None => parsed
            .html_bodies()
            .find_map(|part| match &part.body {
                PartType::Html(html) => Some(html_to_text(html)),
                _ => None,
            })
            .unwrap_or_default(),
    };

    Ok(NormalizedMessage {
        message_id,
        in_reply_to,
        references,
        sender_name,
        sender_address,
        recipient_address,
        subject,
        body: clean_body(&extracted),
        attachments,
        date,
    })
}

/// Stable stand-in for a missing Message-ID, so re-polling the same message
/// still hits the ledger.
pub fn synthetic_message_id(handle: &MessageHandle, date: Option<i64>, sender: &str) -> String {
    let sender = if sender.is_empty() { "unknown" } else { sender };
    format!("no-id.{}.{}.{}", handle, date.unwrap_or(0), sender)
}

/// Canonical ledger key: trimmed, one pair of surrounding angle brackets
/// removed, case preserved.
pub fn canonical_message_id(id: &str) -> String {
    let trimmed = id.trim();
    trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

fn first_mailbox(addr: Option<&Address<'_>>) -> (String, String) {
    let Some(first) = addr.and_then(|a| a.first()) else {
        return (String::new(), String::new());
    };
    let name = first.name().map(|n| n.trim().to_string()).unwrap_or_default();
    let address = first
        .address()
        .map(|a| a.trim().to_lowercase())
        .unwrap_or_default();
    (name, address)
}

/// Undo header folding.
fn unfold(raw: &str) -> String {
    raw.split(['\r', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a threading header into ids, keeping brackets as received.
fn id_tokens(raw: &str) -> Vec<String> {
    let unfolded = unfold(raw);
    let bracketed: Vec<String> = MESSAGE_ID_TOKEN
        .find_iter(&unfolded)
        .map(|m| m.as_str().to_string())
        .collect();
    if !bracketed.is_empty() {
        return bracketed;
    }
    unfolded.split_whitespace().map(str::to_string).collect()
}

// ── Body text ───────────────────────────────────────────────────────

/// Drop the signature block and quoted reply lines.
pub fn clean_body(body: &str) -> String {
    let mut kept = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed == "--"
            || SIGNATURE_MARKERS.iter().any(|m| trimmed.starts_with(m))
            || UNDERSCORE_RUN.is_match(trimmed)
        {
            break;
        }
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }
        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }
        if trimmed.starts_with('>') {
            continue;
        }
        kept.push(line.trim_end());
    }
    while kept.last().is_some_and(|l| l.is_empty()) {
        kept.pop();
    }
    while kept.first().is_some_and(|l| l.is_empty()) {
        kept.remove(0);
    }
    kept.join("\n")
}

/// Convert an HTML body to readable text.
pub fn html_to_text(html: &str) -> String {
    let raw = structured_text(html).unwrap_or_else(|| ANY_TAG.replace_all(html, " ").into_owned());
    tidy(&decode_entities(&raw))
}

/// Walk the markup tag by tag. `None` when the markup is too broken to
/// walk (an unterminated tag).
fn structured_text(html: &str) -> Option<String> {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    let mut skip_until: Option<&'static str> = None;

    while let Some(open) = rest.find('<') {
        let starts_tag = rest[open + 1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '/' || c == '!');
        if !starts_tag {
            if skip_until.is_none() {
                out.push_str(&rest[..=open]);
            }
            rest = &rest[open + 1..];
            continue;
        }

        if skip_until.is_none() {
            out.push_str(&rest[..open]);
        }
        let close = rest[open..].find('>')? + open;
        let tag = &rest[open + 1..close];
        rest = &rest[close + 1..];

        let is_end = tag.starts_with('/');
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        if let Some(until) = skip_until {
            if is_end && name == until {
                skip_until = None;
            }
            continue;
        }

        match (name.as_str(), is_end) {
            ("script", false) => skip_until = Some("script"),
            ("style", false) => skip_until = Some("style"),
            ("head", false) => skip_until = Some("head"),
            ("br", _) => out.push('\n'),
            ("p", _) => out.push_str("\n\n"),
            ("li", false) => out.push_str("\n• "),
            ("div" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "ul" | "ol" | "table", _) => {
                out.push('\n')
            }
            _ => {}
        }
    }
    if skip_until.is_none() {
        out.push_str(rest);
    }
    Some(out)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Collapse runs of spaces and blank lines.
fn tidy(text: &str) -> String {
    let lines: Vec<String> = text
        .lines()
        .map(|l| SPACE_RUN.replace_all(l, " ").trim().to_string())
        .collect();
    BLANK_RUN
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}
