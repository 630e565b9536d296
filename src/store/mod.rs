//! Persistence layer: libSQL-backed dedup ledger, mailbox configuration and
//! the ticket/task tables the intake pipeline writes to.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    CreatedTicket, Database, Direction, LedgerEntry, LedgerWrite, NewProject, NewUser,
    NotificationRecord, ProjectRecord, ReplyCommit, TaskCommit, TaskRecord, TicketComment,
    TicketCommit, TicketHistoryEntry, TicketRecord,
};
