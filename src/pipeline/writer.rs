//! Work-item writer: turns a disposition into rows, atomically with the
//! ledger entry, then sends the optional confirmation email.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::mail::outbound::text_to_html;
use crate::mail::{MailboxConfig, Mailer, NormalizedMessage, OutgoingMail};
use crate::pipeline::matcher::attachment_listing;
use crate::pipeline::types::{
    CommitOutcome, Disposition, MatchReason, MessageOutcome, TaskDraft, TicketDraft, WorkItemRef,
};
use crate::store::{
    CreatedTicket, Database, Direction, LedgerWrite, ReplyCommit, TaskCommit, TicketCommit,
    TicketRecord,
};

pub struct WorkItemWriter {
    db: Arc<dyn Database>,
    mailer: Arc<dyn Mailer>,
}

impl WorkItemWriter {
    pub fn new(db: Arc<dyn Database>, mailer: Arc<dyn Mailer>) -> Self {
        Self { db, mailer }
    }

    /// Commit the disposition for `msg`. The ledger row is written in the
    /// same transaction as the work item.
    pub async fn apply(
        &self,
        target: &MailboxConfig,
        msg: &NormalizedMessage,
        disposition: Disposition,
        cancel: &CancellationToken,
    ) -> Result<MessageOutcome, DatabaseError> {
        let ledger = LedgerWrite {
            tenant_id: target.tenant_id,
            message_id: msg.message_id.clone(),
            sender: msg.sender_address.clone(),
            subject: msg.subject.clone(),
        };

        match disposition {
            Disposition::AppendToTicket { ticket, reason } => {
                self.append_reply(ledger, msg, &ticket, reason).await
            }
            Disposition::CreateTask(draft) => self.create_task(ledger, draft).await,
            Disposition::CreateTicket(draft) => {
                self.create_ticket(target, ledger, msg, draft, cancel).await
            }
        }
    }

    async fn append_reply(
        &self,
        ledger: LedgerWrite,
        msg: &NormalizedMessage,
        ticket: &TicketRecord,
        reason: MatchReason,
    ) -> Result<MessageOutcome, DatabaseError> {
        let mut comment = format!(
            "**Email reply from {} ({}):**\n\n{}",
            msg.sender_label(),
            msg.sender_address,
            msg.body
        );
        comment.push_str(&attachment_listing(msg));

        let commit = ReplyCommit {
            ledger,
            ticket_id: ticket.id,
            author_email: msg.sender_address.clone(),
            comment,
            history: format!(
                "Email reply received from {} ({})",
                msg.sender_address,
                reason.describe()
            ),
            notification: format!(
                "New email reply on ticket #{}: {}",
                ticket.ticket_number, ticket.subject
            ),
        };

        match self.db.commit_ticket_reply(&commit).await? {
            CommitOutcome::Committed(_) => {
                info!(
                    tenant_id = ticket.tenant_id,
                    ticket = %ticket.ticket_number,
                    ?reason,
                    "Appended email reply to ticket"
                );
                Ok(MessageOutcome::Appended {
                    ticket_id: ticket.id,
                })
            }
            CommitOutcome::Duplicate => Ok(MessageOutcome::Duplicate),
        }
    }

    async fn create_task(
        &self,
        ledger: LedgerWrite,
        draft: TaskDraft,
    ) -> Result<MessageOutcome, DatabaseError> {
        let notification = format!(
            "New task from email in {}: {}",
            draft.project_name, draft.title
        );
        let commit = TaskCommit {
            ledger,
            draft,
            notification,
        };

        match self.db.commit_new_task(&commit).await? {
            CommitOutcome::Committed(task_id) => {
                info!(
                    tenant_id = commit.draft.tenant_id,
                    project_id = commit.draft.project_id,
                    task_id,
                    title = %commit.draft.title,
                    "Created task from email"
                );
                Ok(MessageOutcome::TaskCreated { task_id })
            }
            CommitOutcome::Duplicate => Ok(MessageOutcome::Duplicate),
        }
    }

    async fn create_ticket(
        &self,
        target: &MailboxConfig,
        ledger: LedgerWrite,
        msg: &NormalizedMessage,
        draft: TicketDraft,
        cancel: &CancellationToken,
    ) -> Result<MessageOutcome, DatabaseError> {
        let mut history = format!(
            "Ticket created automatically from email: {}",
            msg.sender_address
        );
        if !msg.recipient_address.is_empty() {
            history.push_str(&format!(" (to: {})", msg.recipient_address));
        }
        let commit = TicketCommit {
            ledger,
            draft,
            history,
        };

        let created = match self.db.commit_new_ticket(&commit).await? {
            CommitOutcome::Committed(created) => created,
            CommitOutcome::Duplicate => return Ok(MessageOutcome::Duplicate),
        };
        info!(
            tenant_id = target.tenant_id,
            ticket = %created.ticket_number,
            priority = %commit.draft.priority,
            "Created ticket from email"
        );

        self.send_confirmation(target, msg, &commit.draft, &created, cancel)
            .await;

        Ok(MessageOutcome::TicketCreated {
            ticket_id: created.id,
            ticket_number: created.ticket_number,
        })
    }

    /// Best-effort: the ticket is already committed, so failures are logged
    /// and never surface to the caller.
    async fn send_confirmation(
        &self,
        target: &MailboxConfig,
        msg: &NormalizedMessage,
        draft: &TicketDraft,
        created: &CreatedTicket,
        cancel: &CancellationToken,
    ) {
        let settings = &target.auto_reply;
        let Some(outbound) = target.outbound.as_ref().filter(|_| settings.enabled) else {
            return;
        };
        if msg.sender_address.is_empty() {
            return;
        }

        let vars = [
            ("ticket_number", created.ticket_number.as_str()),
            ("subject", draft.subject.as_str()),
            ("priority", draft.priority.as_str()),
            ("guest_name", draft.guest.name.as_str()),
            ("guest_surname", draft.guest.surname.as_str()),
            ("company_name", settings.company_name.as_str()),
        ];
        let subject = render_template(&settings.subject_template, &vars);
        let body = render_template(&settings.body_template, &vars);

        let mail = OutgoingMail {
            to: msg.sender_address.clone(),
            subject: subject.clone(),
            body_html: text_to_html(&body),
            reply_to: Some(outbound.from_address.clone()),
            in_reply_to: Some(msg.message_id.clone()).filter(|id| id.contains('@')),
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(ticket = %created.ticket_number, "Shutdown before confirmation email was sent");
                return;
            }
            sent = self.mailer.send(outbound, mail) => sent,
        };
        let message_id = match sent {
            Ok(id) => id,
            Err(e) => {
                warn!(ticket = %created.ticket_number, error = %e, "Failed to send confirmation email");
                return;
            }
        };

        let ledger = LedgerWrite {
            tenant_id: target.tenant_id,
            message_id,
            sender: outbound.from_address.clone(),
            subject,
        };
        if let Err(e) = self
            .db
            .record_processed(&ledger, Some(WorkItemRef::Ticket(created.id)), Direction::Outbound)
            .await
        {
            warn!(
                ticket = %created.ticket_number,
                message_id = %ledger.message_id,
                error = %e,
                "Failed to record outbound message id"
            );
        }
    }
}

/// Replace every `{name}` placeholder. Unknown placeholders are left as-is.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |out, (name, value)| {
        out.replace(&format!("{{{name}}}"), value)
    })
}
