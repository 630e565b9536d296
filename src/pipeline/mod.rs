//! Inbound mail pipeline.
//!
//! Every candidate message of a target flows through:
//! 1. `MailSession::fetch()` and `normalize()`: wire bytes to a clean message
//! 2. the dedup ledger: already-seen ids stop here
//! 3. `MatchEngine::decide()`: reply, new task or new ticket
//! 4. `WorkItemWriter::apply()`: one transaction for rows plus ledger entry

pub mod ingest;
pub mod matcher;
pub mod rules;
pub mod types;
pub mod writer;

pub use ingest::{IngestDeps, StatusBoard, TargetPhase, TargetReport, TargetStatus, run_target};
pub use matcher::MatchEngine;
pub use rules::RuleSet;
pub use writer::WorkItemWriter;
