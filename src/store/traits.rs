//! Unified `Database` trait: the dedup ledger plus the CRUD contracts the
//! ingestion pipeline reads and writes through.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::error::DatabaseError;
use crate::mail::MailboxConfig;
use crate::pipeline::types::{
    CommitOutcome, Priority, TaskDraft, TicketDraft, TicketStatus, WorkItemRef,
};

// ── Records ─────────────────────────────────────────────────────────

/// Whether a ledger row came from an inbound message or from mail we sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// One dedup ledger row.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub tenant_id: i64,
    /// Canonical form (no angle brackets).
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub work_item: Option<WorkItemRef>,
    pub direction: Direction,
    pub processed_at: DateTime<Utc>,
}

/// Ledger fields written alongside a work item.
#[derive(Debug, Clone)]
pub struct LedgerWrite {
    pub tenant_id: i64,
    pub message_id: String,
    pub sender: String,
    pub subject: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketRecord {
    pub id: i64,
    pub tenant_id: i64,
    pub ticket_number: String,
    pub subject: String,
    pub description: String,
    pub priority: Priority,
    pub status: TicketStatus,
    pub project_id: Option<i64>,
    pub assignee_id: Option<i64>,
    pub guest_name: String,
    pub guest_surname: String,
    pub guest_email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketComment {
    pub id: i64,
    pub ticket_id: i64,
    pub author_email: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketHistoryEntry {
    pub id: i64,
    pub ticket_id: i64,
    pub action: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: i64,
    pub tenant_id: i64,
    pub project_id: i64,
    pub title: String,
    pub description: String,
    /// Task label, e.g. `critical`.
    pub priority: String,
    pub status: String,
    pub creator_id: Option<i64>,
    pub start_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectRecord {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub inbox_address: Option<String>,
    pub is_archived: bool,
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub message: String,
    pub link: String,
}

/// A ticket created by [`Database::commit_new_ticket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTicket {
    pub id: i64,
    pub ticket_number: String,
}

// ── Inputs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewUser {
    pub tenant_id: i64,
    pub email: String,
    pub full_name: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone)]
pub struct NewProject {
    pub tenant_id: i64,
    pub name: String,
    pub inbox_address: Option<String>,
    pub is_archived: bool,
    pub created_by: Option<i64>,
}

/// A reply appended to an existing ticket.
#[derive(Debug, Clone)]
pub struct ReplyCommit {
    pub ledger: LedgerWrite,
    pub ticket_id: i64,
    pub author_email: String,
    pub comment: String,
    pub history: String,
    /// Sent to the ticket's assignee when that user is not an admin.
    pub notification: String,
}

#[derive(Debug, Clone)]
pub struct TicketCommit {
    pub ledger: LedgerWrite,
    pub draft: TicketDraft,
    pub history: String,
}

#[derive(Debug, Clone)]
pub struct TaskCommit {
    pub ledger: LedgerWrite,
    pub draft: TaskDraft,
    pub notification: String,
}

// ── Trait ───────────────────────────────────────────────────────────

/// Backend-agnostic persistence for mail intake.
///
/// Every `commit_*` method writes its work item, its audit rows, its
/// notifications and its ledger row in one transaction, re-checking the
/// ledger first. A message that is already recorded yields
/// [`CommitOutcome::Duplicate`] and writes nothing.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// A handle with its own connection, for one target's unit of work.
    async fn open_session(&self) -> Result<Arc<dyn Database>, DatabaseError>;

    // ── Mailbox configuration ───────────────────────────────────────

    /// Tenant and project mailboxes with a host, skipping archived configs
    /// and archived projects.
    async fn list_mailbox_configs(&self) -> Result<Vec<MailboxConfig>, DatabaseError>;

    async fn insert_mailbox_config(
        &self,
        config: &MailboxConfig,
        is_archived: bool,
    ) -> Result<i64, DatabaseError>;

    // ── Dedup ledger ────────────────────────────────────────────────

    async fn is_processed(&self, tenant_id: i64, message_id: &str) -> Result<bool, DatabaseError>;

    async fn find_ledger_entry(
        &self,
        tenant_id: i64,
        message_id: &str,
    ) -> Result<Option<LedgerEntry>, DatabaseError>;

    /// Append a ledger row. Returns `false` if the id was already recorded.
    async fn record_processed(
        &self,
        ledger: &LedgerWrite,
        work_item: Option<WorkItemRef>,
        direction: Direction,
    ) -> Result<bool, DatabaseError>;

    async fn list_ledger(&self, tenant_id: i64) -> Result<Vec<LedgerEntry>, DatabaseError>;

    // ── Lookups used by the match engine ────────────────────────────

    async fn find_ticket(
        &self,
        tenant_id: i64,
        ticket_id: i64,
    ) -> Result<Option<TicketRecord>, DatabaseError>;

    /// Exact match on the full `TKT-YYYY-NNNNN` number.
    async fn find_ticket_by_number(
        &self,
        tenant_id: i64,
        ticket_number: &str,
    ) -> Result<Option<TicketRecord>, DatabaseError>;

    /// Most recent ticket whose number ends in this sequence value.
    async fn find_ticket_by_sequence(
        &self,
        tenant_id: i64,
        sequence: i64,
    ) -> Result<Option<TicketRecord>, DatabaseError>;

    /// Tickets whose guest email matches, excluding closed ones.
    async fn find_open_tickets_by_guest_email(
        &self,
        tenant_id: i64,
        email: &str,
    ) -> Result<Vec<TicketRecord>, DatabaseError>;

    /// Non-archived project whose inbox address matches (case-insensitive).
    async fn find_project_by_inbox_address(
        &self,
        tenant_id: i64,
        address: &str,
    ) -> Result<Option<ProjectRecord>, DatabaseError>;

    async fn find_project(
        &self,
        tenant_id: i64,
        project_id: i64,
    ) -> Result<Option<ProjectRecord>, DatabaseError>;

    // ── Atomic dispositions ─────────────────────────────────────────

    async fn commit_ticket_reply(
        &self,
        commit: &ReplyCommit,
    ) -> Result<CommitOutcome<i64>, DatabaseError>;

    async fn commit_new_ticket(
        &self,
        commit: &TicketCommit,
    ) -> Result<CommitOutcome<CreatedTicket>, DatabaseError>;

    async fn commit_new_task(
        &self,
        commit: &TaskCommit,
    ) -> Result<CommitOutcome<i64>, DatabaseError>;

    // ── Collaborator CRUD ───────────────────────────────────────────

    async fn insert_tenant(&self, name: &str) -> Result<i64, DatabaseError>;

    async fn insert_user(&self, user: &NewUser) -> Result<i64, DatabaseError>;

    async fn insert_project(&self, project: &NewProject) -> Result<i64, DatabaseError>;

    async fn add_project_member(&self, project_id: i64, user_id: i64)
    -> Result<(), DatabaseError>;

    /// Insert a ticket directly, outside the intake flow.
    async fn insert_ticket(
        &self,
        draft: &TicketDraft,
        status: TicketStatus,
        assignee_id: Option<i64>,
    ) -> Result<CreatedTicket, DatabaseError>;

    async fn list_tickets(&self, tenant_id: i64) -> Result<Vec<TicketRecord>, DatabaseError>;

    async fn list_ticket_comments(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<TicketComment>, DatabaseError>;

    async fn list_ticket_history(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<TicketHistoryEntry>, DatabaseError>;

    async fn list_tasks(&self, project_id: i64) -> Result<Vec<TaskRecord>, DatabaseError>;

    async fn list_notifications(
        &self,
        user_id: i64,
    ) -> Result<Vec<NotificationRecord>, DatabaseError>;
}
