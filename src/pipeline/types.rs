//! Shared types for the ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::store::TicketRecord;

// ── Work-item vocabulary ────────────────────────────────────────────

/// Ticket/task priority. `Low` is never assigned automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    /// Tasks use `critical` where tickets use `urgent`.
    pub fn task_label(&self) -> &'static str {
        match self {
            Self::Urgent => "critical",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" | "critical" => Ok(Self::Urgent),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Ticket lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Waiting,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Waiting => "waiting",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "waiting" => Ok(Self::Waiting),
            "resolved" => Ok(Self::Resolved),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown ticket status '{other}'")),
        }
    }
}

/// The entity a processed message produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum WorkItemRef {
    Ticket(i64),
    Task(i64),
}

impl WorkItemRef {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ticket(_) => "ticket",
            Self::Task(_) => "task",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Ticket(id) | Self::Task(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: i64) -> Option<Self> {
        match kind {
            "ticket" => Some(Self::Ticket(id)),
            "task" => Some(Self::Task(id)),
            _ => None,
        }
    }
}

// ── Match engine output ─────────────────────────────────────────────

/// Which reply strategy linked a message to an existing ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    InReplyTo,
    Reference,
    SubjectPattern,
    SenderHeuristic,
}

impl MatchReason {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::InReplyTo => "matched In-Reply-To header",
            Self::Reference => "matched References header",
            Self::SubjectPattern => "matched ticket number in subject",
            Self::SenderHeuristic => "matched sender's only open ticket",
        }
    }
}

/// Sender identity recorded on tickets with no account owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuestIdentity {
    pub name: String,
    pub surname: String,
    pub email: String,
    pub phone: String,
    pub company: String,
}

/// Fields for a new guest ticket.
#[derive(Debug, Clone, Serialize)]
pub struct TicketDraft {
    pub tenant_id: i64,
    pub project_id: Option<i64>,
    pub subject: String,
    pub description: String,
    pub priority: Priority,
    pub guest: GuestIdentity,
}

/// Fields for a new project task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDraft {
    pub tenant_id: i64,
    pub project_id: i64,
    pub project_name: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
}

/// The engine's decision for one message.
#[derive(Debug, Clone)]
pub enum Disposition {
    AppendToTicket {
        ticket: TicketRecord,
        reason: MatchReason,
    },
    CreateTask(TaskDraft),
    CreateTicket(TicketDraft),
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AppendToTicket { .. } => "append_to_ticket",
            Self::CreateTask(_) => "create_task",
            Self::CreateTicket(_) => "create_ticket",
        }
    }
}

// ── Writer / unit-of-work output ────────────────────────────────────

/// Result of an atomic write that re-checks the ledger inside its
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome<T> {
    Committed(T),
    /// Another poller recorded this message first; nothing was written.
    Duplicate,
}

/// What happened to one candidate message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MessageOutcome {
    Appended { ticket_id: i64 },
    TaskCreated { task_id: i64 },
    TicketCreated { ticket_id: i64, ticket_number: String },
    /// Ledger hit before matching.
    AlreadyProcessed,
    /// Lost the race inside the commit transaction.
    Duplicate,
    /// Sent by this mailbox's own outbound address.
    SelfSent,
}

impl MessageOutcome {
    /// True when the message produced a comment, task or ticket.
    pub fn wrote_work_item(&self) -> bool {
        matches!(
            self,
            Self::Appended { .. } | Self::TaskCreated { .. } | Self::TicketCreated { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgent_tasks_are_critical() {
        assert_eq!(Priority::Urgent.task_label(), "critical");
        assert_eq!(Priority::High.task_label(), "high");
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Urgent);
    }

    #[test]
    fn work_item_ref_parts() {
        let item = WorkItemRef::from_parts("task", 9).unwrap();
        assert_eq!(item, WorkItemRef::Task(9));
        assert_eq!(item.kind(), "task");
        assert!(WorkItemRef::from_parts("card", 1).is_none());
    }

    #[test]
    fn status_parses_snake_case() {
        assert_eq!(
            "in_progress".parse::<TicketStatus>().unwrap(),
            TicketStatus::InProgress
        );
        assert!("pending".parse::<TicketStatus>().is_err());
    }
}
