//! Per-target unit of work: connect, list, then for each message fetch,
//! normalize, dedup, match, write and mark consumed.
//!
//! Messages of one target are processed strictly one at a time in listing
//! order, so the sender heuristic and the ledger see everything committed
//! earlier in the same batch. Mailbox I/O runs on the blocking pool and is
//! abandoned as soon as the cancellation token fires; database commits are
//! never raced against cancellation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, IngestError, MailError};
use crate::mail::{
    MailConnector, MailSession, MailboxConfig, Mailer, MessageHandle, NormalizedMessage, Protocol,
    TargetKey, normalize,
};
use crate::pipeline::matcher::MatchEngine;
use crate::pipeline::types::MessageOutcome;
use crate::pipeline::writer::WorkItemWriter;
use crate::store::{Database, Direction, LedgerWrite};

// ── Status ──────────────────────────────────────────────────────────

/// Where a target currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPhase {
    Idle,
    Fetching,
    Normalizing,
    Matching,
    Writing,
}

/// Per-outcome tallies for one target run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub appended: usize,
    pub tasks_created: usize,
    pub tickets_created: usize,
    pub already_processed: usize,
    pub duplicates: usize,
    pub self_sent: usize,
    /// Messages that failed to fetch or parse and were left in the mailbox.
    pub skipped: usize,
}

impl OutcomeCounts {
    fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Appended { .. } => self.appended += 1,
            MessageOutcome::TaskCreated { .. } => self.tasks_created += 1,
            MessageOutcome::TicketCreated { .. } => self.tickets_created += 1,
            MessageOutcome::AlreadyProcessed => self.already_processed += 1,
            MessageOutcome::Duplicate => self.duplicates += 1,
            MessageOutcome::SelfSent => self.self_sent += 1,
        }
    }
}

/// Result of one target's unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: TargetKey,
    pub protocol: Protocol,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Listed messages examined this run.
    pub candidates: usize,
    /// Listed messages left for the next cycle once the write cap was hit.
    pub deferred: usize,
    pub counts: OutcomeCounts,
    /// Set when the target aborted; earlier commits in the batch still stand.
    pub error: Option<String>,
}

impl TargetReport {
    /// Empty report for a run starting now.
    pub fn start(config: &MailboxConfig) -> Self {
        let now = Utc::now();
        Self {
            target: config.target_key(),
            protocol: config.protocol,
            host: config.host.clone(),
            started_at: now,
            finished_at: now,
            candidates: 0,
            deferred: 0,
            counts: OutcomeCounts::default(),
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Current phase plus the last finished run, for one target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub target: TargetKey,
    pub phase: TargetPhase,
    pub last_report: Option<TargetReport>,
}

/// Shared view of every target's status. Each target writes only its own key.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<HashMap<TargetKey, TargetStatus>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_phase(&self, target: TargetKey, phase: TargetPhase) {
        let mut map = self.inner.write().await;
        map.entry(target)
            .and_modify(|s| s.phase = phase)
            .or_insert(TargetStatus {
                target,
                phase,
                last_report: None,
            });
    }

    pub async fn finish(&self, report: TargetReport) {
        let target = report.target;
        self.inner.write().await.insert(
            target,
            TargetStatus {
                target,
                phase: TargetPhase::Idle,
                last_report: Some(report),
            },
        );
    }

    /// Forget targets that are no longer configured.
    pub async fn retain(&self, live: &HashSet<TargetKey>) {
        self.inner.write().await.retain(|key, _| live.contains(key));
    }

    pub async fn snapshot(&self) -> Vec<TargetStatus> {
        let mut out: Vec<TargetStatus> = self.inner.read().await.values().cloned().collect();
        out.sort_by_key(|s| (s.target.tenant_id, s.target.project_id, s.target.mailbox_id));
        out
    }
}

// ── Blocking session driver ─────────────────────────────────────────

/// Owns a blocking `MailSession` and runs each call on the blocking pool,
/// racing it against cancellation.
struct SessionDriver {
    session: Option<Box<dyn MailSession>>,
}

impl SessionDriver {
    async fn connect(
        connector: Arc<dyn MailConnector>,
        config: &MailboxConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, IngestError> {
        let config = config.clone();
        let task = tokio::task::spawn_blocking(move || connector.connect(&config));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            joined = task => {
                let session = joined.map_err(|e| IngestError::TaskPanicked(e.to_string()))??;
                Ok(Self { session: Some(session) })
            }
        }
    }

    /// Outer error: cancellation or a panicked task. Inner: the session's
    /// own result, left to the caller to classify.
    async fn call<T, F>(
        &mut self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<Result<T, MailError>, IngestError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn MailSession) -> Result<T, MailError> + Send + 'static,
    {
        let Some(mut session) = self.session.take() else {
            return Err(IngestError::Cancelled);
        };
        let task = tokio::task::spawn_blocking(move || {
            let result = f(session.as_mut());
            (session, result)
        });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            joined = task => {
                let (session, result) = joined.map_err(|e| IngestError::TaskPanicked(e.to_string()))?;
                self.session = Some(session);
                Ok(result)
            }
        }
    }

    async fn close(mut self) {
        if let Some(session) = self.session.take() {
            let _ = tokio::task::spawn_blocking(move || session.close()).await;
        }
    }
}

// ── Unit of work ────────────────────────────────────────────────────

/// Collaborators shared by every target in a cycle.
#[derive(Clone)]
pub struct IngestDeps {
    pub connector: Arc<dyn MailConnector>,
    pub mailer: Arc<dyn Mailer>,
    pub engine: Arc<MatchEngine>,
    pub board: StatusBoard,
    pub max_messages: usize,
}

/// Run one target to completion. Never fails: errors end up in the report.
pub async fn run_target(
    deps: &IngestDeps,
    db: Arc<dyn Database>,
    config: &MailboxConfig,
    cancel: &CancellationToken,
) -> TargetReport {
    let key = config.target_key();
    let mut report = TargetReport::start(config);

    let run = TargetRun {
        deps,
        db: db.clone(),
        writer: WorkItemWriter::new(db, deps.mailer.clone()),
        config,
        key,
        cancel,
    };
    if let Err(e) = run.process(&mut report).await {
        match &e {
            IngestError::Cancelled => info!(target_key = %key, "Target run cancelled"),
            _ => error!(target_key = %key, host = %config.host, error = %e, "Target run failed"),
        }
        report.error = Some(e.to_string());
    }
    report.finished_at = Utc::now();

    info!(
        target_key = %key,
        candidates = report.candidates,
        deferred = report.deferred,
        appended = report.counts.appended,
        tickets = report.counts.tickets_created,
        tasks = report.counts.tasks_created,
        skipped = report.counts.skipped,
        "Target run finished"
    );
    deps.board.finish(report.clone()).await;
    report
}

struct TargetRun<'a> {
    deps: &'a IngestDeps,
    db: Arc<dyn Database>,
    writer: WorkItemWriter,
    config: &'a MailboxConfig,
    key: TargetKey,
    cancel: &'a CancellationToken,
}

impl TargetRun<'_> {
    async fn process(&self, report: &mut TargetReport) -> Result<(), IngestError> {
        self.phase(TargetPhase::Fetching).await;
        let mut driver =
            SessionDriver::connect(self.deps.connector.clone(), self.config, self.cancel).await?;

        let result = self.drain(&mut driver, report).await;
        if !matches!(result, Err(IngestError::Cancelled)) {
            driver.close().await;
        }
        result
    }

    async fn drain(
        &self,
        driver: &mut SessionDriver,
        report: &mut TargetReport,
    ) -> Result<(), IngestError> {
        let handles = driver.call(self.cancel, |s| s.list_candidates()).await??;
        let listed = handles.len();
        let mut written = 0;

        for handle in handles {
            if self.cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            if written >= self.deps.max_messages {
                report.deferred = listed - report.candidates;
                info!(
                    target_key = %self.key,
                    cap = self.deps.max_messages,
                    deferred = report.deferred,
                    "Write cap reached, remaining messages wait for the next cycle"
                );
                break;
            }
            report.candidates += 1;

            self.phase(TargetPhase::Fetching).await;
            let h = handle.clone();
            let raw = match driver.call(self.cancel, move |s| s.fetch(&h)).await? {
                Ok(raw) => raw,
                Err(e) if !e.is_transport() => {
                    warn!(target_key = %self.key, handle = %handle, error = %e, "Skipping unfetchable message");
                    report.counts.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.phase(TargetPhase::Normalizing).await;
            let msg = match normalize(&handle, &raw) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(target_key = %self.key, handle = %handle, error = %e, "Skipping unparseable message");
                    report.counts.skipped += 1;
                    continue;
                }
            };

            let outcome = self.handle_message(&msg).await?;
            report.counts.record(&outcome);
            if outcome.wrote_work_item() {
                written += 1;
            }

            self.mark_consumed(driver, &handle).await?;
        }
        Ok(())
    }

    async fn handle_message(&self, msg: &NormalizedMessage) -> Result<MessageOutcome, DatabaseError> {
        self.phase(TargetPhase::Matching).await;
        let tenant_id = self.config.tenant_id;

        if self.db.is_processed(tenant_id, &msg.message_id).await? {
            debug!(target_key = %self.key, message_id = %msg.message_id, "Already processed");
            return Ok(MessageOutcome::AlreadyProcessed);
        }

        if let Some(outbound) = &self.config.outbound
            && msg.sender_address.eq_ignore_ascii_case(&outbound.from_address)
        {
            debug!(target_key = %self.key, message_id = %msg.message_id, "Skipping self-sent email");
            let ledger = LedgerWrite {
                tenant_id,
                message_id: msg.message_id.clone(),
                sender: msg.sender_address.clone(),
                subject: msg.subject.clone(),
            };
            self.db.record_processed(&ledger, None, Direction::Inbound).await?;
            return Ok(MessageOutcome::SelfSent);
        }

        let disposition = self
            .deps
            .engine
            .decide(self.db.as_ref(), self.config, msg)
            .await?;
        info!(
            tenant_id,
            target_key = %self.key,
            message_id = %msg.message_id,
            disposition = disposition.label(),
            "Matched message"
        );

        self.phase(TargetPhase::Writing).await;
        self.writer
            .apply(self.config, msg, disposition, self.cancel)
            .await
    }

    async fn mark_consumed(
        &self,
        driver: &mut SessionDriver,
        handle: &MessageHandle,
    ) -> Result<(), IngestError> {
        let h = handle.clone();
        match driver.call(self.cancel, move |s| s.mark_consumed(&h)).await? {
            Ok(()) => Ok(()),
            Err(e) if !e.is_transport() => {
                warn!(target_key = %self.key, handle = %handle, error = %e, "Failed to mark message consumed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn phase(&self, phase: TargetPhase) {
        self.deps.board.set_phase(self.key, phase).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::mail::{AutoReplySettings, OutboundConfig, OutgoingMail};
    use crate::pipeline::rules::RuleSet;
    use crate::store::LibSqlBackend;

    struct NoMail;

    #[async_trait]
    impl Mailer for NoMail {
        async fn send(&self, _: &OutboundConfig, _: OutgoingMail) -> Result<String, MailError> {
            Err(MailError::Send("disabled".into()))
        }
    }

    /// Serves a fixed list of raw messages and records what was marked.
    struct FakeSession {
        messages: Vec<Vec<u8>>,
        marked: Arc<Mutex<Vec<String>>>,
    }

    impl MailSession for FakeSession {
        fn list_candidates(&mut self) -> Result<Vec<MessageHandle>, MailError> {
            Ok((1..=self.messages.len())
                .map(|n| MessageHandle(n.to_string()))
                .collect())
        }

        fn fetch(&mut self, handle: &MessageHandle) -> Result<Vec<u8>, MailError> {
            let n: usize = handle.0.parse().unwrap();
            Ok(self.messages[n - 1].clone())
        }

        fn mark_consumed(&mut self, handle: &MessageHandle) -> Result<(), MailError> {
            self.marked.lock().unwrap().push(handle.0.clone());
            Ok(())
        }

        fn close(self: Box<Self>) {}
    }

    struct FakeConnector {
        messages: Vec<Vec<u8>>,
        marked: Arc<Mutex<Vec<String>>>,
        refuse: bool,
    }

    impl MailConnector for FakeConnector {
        fn connect(&self, config: &MailboxConfig) -> Result<Box<dyn MailSession>, MailError> {
            if self.refuse {
                return Err(MailError::Auth {
                    host: config.host.clone(),
                });
            }
            Ok(Box::new(FakeSession {
                messages: self.messages.clone(),
                marked: self.marked.clone(),
            }))
        }
    }

    fn config(tenant_id: i64) -> MailboxConfig {
        MailboxConfig {
            id: 1,
            tenant_id,
            project_id: None,
            protocol: Protocol::Imap,
            host: "imap.acme.example".into(),
            port: 993,
            username: "help@acme.example".into(),
            password: "pw".to_string().into(),
            use_tls: true,
            folder: "INBOX".into(),
            outbound: Some(OutboundConfig {
                smtp_host: "smtp.acme.example".into(),
                smtp_port: 587,
                username: "help@acme.example".into(),
                password: "pw".to_string().into(),
                from_address: "help@acme.example".into(),
                from_name: String::new(),
            }),
            auto_reply: AutoReplySettings::default(),
        }
    }

    fn raw(id: &str, from: &str, subject: &str) -> Vec<u8> {
        format!(
            "Message-ID: <{id}>\r\nFrom: {from}\r\nTo: help@acme.example\r\nSubject: {subject}\r\n\r\nHello there.\r\n"
        )
        .into_bytes()
    }

    fn deps(connector: FakeConnector) -> IngestDeps {
        IngestDeps {
            connector: Arc::new(connector),
            mailer: Arc::new(NoMail),
            engine: Arc::new(MatchEngine::new(RuleSet::default_rules(50))),
            board: StatusBoard::new(),
            max_messages: 10,
        }
    }

    #[tokio::test]
    async fn processes_batch_and_marks_each_message() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let tenant = db.insert_tenant("acme").await.unwrap();
        let marked = Arc::new(Mutex::new(Vec::new()));
        let deps = deps(FakeConnector {
            messages: vec![
                raw("a@mail", "jane@example.com", "Printer jam"),
                b"   ".to_vec(),
                raw("b@mail", "help@acme.example", "Loop"),
            ],
            marked: marked.clone(),
            refuse: false,
        });

        let report = run_target(&deps, db.clone(), &config(tenant), &CancellationToken::new()).await;

        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(report.candidates, 3);
        assert_eq!(report.counts.tickets_created, 1);
        assert_eq!(report.counts.skipped, 1);
        assert_eq!(report.counts.self_sent, 1);
        assert_eq!(*marked.lock().unwrap(), vec!["1", "3"]);
        assert!(db.is_processed(tenant, "b@mail").await.unwrap());

        let status = deps.board.snapshot().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].phase, TargetPhase::Idle);
    }

    #[tokio::test]
    async fn connect_failure_is_reported_not_raised() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let deps = deps(FakeConnector {
            messages: Vec::new(),
            marked: Arc::default(),
            refuse: true,
        });

        let report = run_target(&deps, db, &config(1), &CancellationToken::new()).await;
        assert!(report.error.unwrap().contains("imap.acme.example"));
        assert_eq!(report.candidates, 0);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_connecting() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let marked = Arc::new(Mutex::new(Vec::new()));
        let deps = deps(FakeConnector {
            messages: vec![raw("a@mail", "jane@example.com", "hi")],
            marked: marked.clone(),
            refuse: false,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = run_target(&deps, db, &config(1), &cancel).await;
        assert!(report.error.is_some());
        assert!(marked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn candidate_cap_limits_batch() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let tenant = db.insert_tenant("acme").await.unwrap();
        let mut deps = deps(FakeConnector {
            messages: (0..3)
                .map(|i| raw(&format!("{i}@mail"), &format!("user{i}@example.com"), "hello"))
                .collect(),
            marked: Arc::default(),
            refuse: false,
        });
        deps.max_messages = 2;

        let report = run_target(&deps, db.clone(), &config(tenant), &CancellationToken::new()).await;
        assert_eq!(report.candidates, 2);
        assert_eq!(report.deferred, 1);
        assert_eq!(db.list_tickets(tenant).await.unwrap().len(), 2);

        // Ledger hits do not use up the cap, so the relisted batch reaches the third message.
        let report = run_target(&deps, db.clone(), &config(tenant), &CancellationToken::new()).await;
        assert_eq!(report.candidates, 3);
        assert_eq!(report.deferred, 0);
        assert_eq!(report.counts.already_processed, 2);
        assert_eq!(report.counts.tickets_created, 1);
        assert_eq!(db.list_tickets(tenant).await.unwrap().len(), 3);
    }
}
