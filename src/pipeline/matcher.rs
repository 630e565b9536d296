//! Match engine: decides what one inbound message becomes.
//!
//! Strategies run in strict order and the first hit wins:
//! 1. threading headers against the dedup ledger (In-Reply-To, then
//!    References newest to oldest)
//! 2. a ticket number in the subject line
//! 3. the sender's single open ticket
//! 4. a project whose inbox address is the recipient: new task
//! 5. otherwise a new guest ticket
//!
//! Derived fields (priority, title, description, guest identity) are only
//! computed when new work is created.

use tracing::debug;

use crate::error::DatabaseError;
use crate::mail::{MailboxConfig, NormalizedMessage};
use crate::pipeline::rules::{RuleSet, TicketToken};
use crate::pipeline::types::{
    Disposition, GuestIdentity, MatchReason, TaskDraft, TicketDraft, WorkItemRef,
};
use crate::store::{Database, ProjectRecord, TicketRecord};

pub const TICKET_SUBJECT_MAX_CHARS: usize = 200;
pub const DESCRIPTION_MAX_CHARS: usize = 5000;

pub struct MatchEngine {
    rules: RuleSet,
}

impl MatchEngine {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Decide the disposition for `msg`, received on `target`.
    pub async fn decide(
        &self,
        db: &dyn Database,
        target: &MailboxConfig,
        msg: &NormalizedMessage,
    ) -> Result<Disposition, DatabaseError> {
        let tenant_id = target.tenant_id;

        if let Some((ticket, reason)) = self.match_headers(db, tenant_id, msg).await? {
            return Ok(Disposition::AppendToTicket { ticket, reason });
        }
        if let Some(ticket) = self.match_subject(db, tenant_id, &msg.subject).await? {
            return Ok(Disposition::AppendToTicket {
                ticket,
                reason: MatchReason::SubjectPattern,
            });
        }
        if let Some(ticket) = self.match_sender(db, tenant_id, &msg.sender_address).await? {
            return Ok(Disposition::AppendToTicket {
                ticket,
                reason: MatchReason::SenderHeuristic,
            });
        }
        if let Some(project) = self.route_project(db, target, msg).await? {
            return Ok(Disposition::CreateTask(self.task_draft(&project, msg)));
        }
        Ok(Disposition::CreateTicket(self.ticket_draft(target, msg)))
    }

    // ── Reply strategies ────────────────────────────────────────────

    async fn match_headers(
        &self,
        db: &dyn Database,
        tenant_id: i64,
        msg: &NormalizedMessage,
    ) -> Result<Option<(TicketRecord, MatchReason)>, DatabaseError> {
        let candidates = msg
            .in_reply_to
            .iter()
            .map(|id| (id, MatchReason::InReplyTo))
            .chain(msg.references.iter().rev().map(|id| (id, MatchReason::Reference)));

        for (id, reason) in candidates {
            let Some(entry) = db.find_ledger_entry(tenant_id, id).await? else {
                continue;
            };
            match entry.work_item {
                Some(WorkItemRef::Ticket(ticket_id)) => {
                    if let Some(ticket) = db.find_ticket(tenant_id, ticket_id).await? {
                        debug!(header_id = %id, ticket_id, ?reason, "Header match");
                        return Ok(Some((ticket, reason)));
                    }
                }
                other => {
                    debug!(header_id = %id, work_item = ?other, "Ledger hit without ticket, skipping");
                }
            }
        }
        Ok(None)
    }

    async fn match_subject(
        &self,
        db: &dyn Database,
        tenant_id: i64,
        subject: &str,
    ) -> Result<Option<TicketRecord>, DatabaseError> {
        for token in self.rules.subject.candidates(subject) {
            let found = match &token {
                TicketToken::Number(number) => db.find_ticket_by_number(tenant_id, number).await?,
                TicketToken::Sequence(seq) => db.find_ticket_by_sequence(tenant_id, *seq).await?,
            };
            if found.is_some() {
                return Ok(found);
            }
            debug!(?token, "Subject token did not resolve");
        }
        Ok(None)
    }

    async fn match_sender(
        &self,
        db: &dyn Database,
        tenant_id: i64,
        sender: &str,
    ) -> Result<Option<TicketRecord>, DatabaseError> {
        if sender.is_empty() {
            return Ok(None);
        }
        let mut open = db.find_open_tickets_by_guest_email(tenant_id, sender).await?;
        if open.len() == 1 {
            return Ok(open.pop());
        }
        if open.len() > 1 {
            debug!(sender, open = open.len(), "Sender has several open tickets, not guessing");
        }
        Ok(None)
    }

    /// Recipient inbox first; a project mailbox falls back to its own project.
    async fn route_project(
        &self,
        db: &dyn Database,
        target: &MailboxConfig,
        msg: &NormalizedMessage,
    ) -> Result<Option<ProjectRecord>, DatabaseError> {
        if let Some(project) = db
            .find_project_by_inbox_address(target.tenant_id, &msg.recipient_address)
            .await?
        {
            return Ok(Some(project));
        }
        match target.project_id {
            Some(project_id) => Ok(db
                .find_project(target.tenant_id, project_id)
                .await?
                .filter(|p| !p.is_archived)),
            None => Ok(None),
        }
    }

    // ── Derived fields ──────────────────────────────────────────────

    fn task_draft(&self, project: &ProjectRecord, msg: &NormalizedMessage) -> TaskDraft {
        let mut description = format!(
            "Received via email from {} <{}>\nSubject: {}\n\n{}",
            msg.sender_label(),
            msg.sender_address,
            msg.subject,
            msg.body
        );
        description.push_str(&attachment_listing(msg));
        description.push_str("\n\n---\nAuto-created from email support request");

        TaskDraft {
            tenant_id: project.tenant_id,
            project_id: project.id,
            project_name: project.name.clone(),
            title: self.rules.title.derive(&msg.subject, &msg.body),
            description: truncate_chars(&description, DESCRIPTION_MAX_CHARS),
            priority: self.rules.priority.evaluate(&msg.subject, &msg.body),
        }
    }

    fn ticket_draft(&self, target: &MailboxConfig, msg: &NormalizedMessage) -> TicketDraft {
        let subject = if msg.subject.is_empty() {
            "(no subject)".to_string()
        } else {
            truncate_chars(&msg.subject, TICKET_SUBJECT_MAX_CHARS)
        };
        let mut description = format!(
            "From: {} <{}>\n\n{}",
            msg.sender_label(),
            msg.sender_address,
            msg.body
        );
        description.push_str(&attachment_listing(msg));

        TicketDraft {
            tenant_id: target.tenant_id,
            project_id: target.project_id,
            subject,
            description: truncate_chars(&description, DESCRIPTION_MAX_CHARS),
            priority: self.rules.priority.evaluate(&msg.subject, &msg.body),
            guest: guest_identity(msg),
        }
    }
}

/// First word of the display name as name, last word as surname.
pub fn guest_identity(msg: &NormalizedMessage) -> GuestIdentity {
    let words: Vec<&str> = msg.sender_name.split_whitespace().collect();
    let (name, surname) = match words.as_slice() {
        [] => ("Unknown".to_string(), String::new()),
        [only] => (only.to_string(), String::new()),
        [first, .., last] => (first.to_string(), last.to_string()),
    };
    GuestIdentity {
        name,
        surname,
        email: msg.sender_address.clone(),
        ..Default::default()
    }
}

/// Trailing "Attachments:" block, empty when there are none.
pub fn attachment_listing(msg: &NormalizedMessage) -> String {
    if msg.attachments.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\nAttachments:");
    for a in &msg.attachments {
        out.push_str(&format!("\n- {} ({}, {} bytes)", a.filename, a.content_type, a.size));
    }
    out
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
