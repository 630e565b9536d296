//! Poll scheduler: one supervisory loop that wakes on a fixed interval and
//! runs every configured mailbox target concurrently.
//!
//! Cycles never overlap. Timer-driven and manual cycles share one guard, so
//! a run-now request issued mid-cycle waits for that cycle and then runs
//! its own.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::IntakeConfig;
use crate::mail::{MailConnector, Mailer};
use crate::pipeline::{
    IngestDeps, MatchEngine, RuleSet, StatusBoard, TargetReport, TargetStatus, run_target,
};
use crate::store::Database;

/// Outcome of one full cycle across all targets.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: Vec<TargetReport>,
    /// Set only when the target list itself could not be read.
    pub error: Option<String>,
}

pub struct PollScheduler {
    db: Arc<dyn Database>,
    deps: IngestDeps,
    interval: Duration,
    cycle_guard: Mutex<()>,
    last_cycle: RwLock<Option<CycleReport>>,
    cancel: CancellationToken,
}

impl PollScheduler {
    pub fn new(
        config: &IntakeConfig,
        db: Arc<dyn Database>,
        connector: Arc<dyn MailConnector>,
        mailer: Arc<dyn Mailer>,
        cancel: CancellationToken,
    ) -> Self {
        let deps = IngestDeps {
            connector,
            mailer,
            engine: Arc::new(MatchEngine::new(RuleSet::default_rules(
                config.title_max_chars,
            ))),
            board: StatusBoard::new(),
            max_messages: config.max_messages_per_target,
        };
        Self {
            db,
            deps,
            interval: config.poll_interval,
            cycle_guard: Mutex::new(()),
            last_cycle: RwLock::new(None),
            cancel,
        }
    }

    /// Start the timer loop. The first cycle runs immediately.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Poll scheduler started");
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        info!("Poll scheduler shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        self.run_now().await;
                    }
                }
            }
        })
    }

    /// Run one cycle and wait for it. Serialized with the timer loop.
    pub async fn run_now(&self) -> CycleReport {
        let _guard = self.cycle_guard.lock().await;
        let report = self.run_cycle().await;
        *self.last_cycle.write().await = Some(report.clone());
        report
    }

    /// Current phase and last report of every known target.
    pub async fn status(&self) -> Vec<TargetStatus> {
        self.deps.board.snapshot().await
    }

    pub async fn last_cycle(&self) -> Option<CycleReport> {
        self.last_cycle.read().await.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn run_cycle(&self) -> CycleReport {
        let started_at = Utc::now();
        let finish = |targets: Vec<TargetReport>, error: Option<String>| CycleReport {
            started_at,
            finished_at: Utc::now(),
            targets,
            error,
        };

        if self.cancel.is_cancelled() {
            return finish(Vec::new(), Some("shutdown in progress".into()));
        }

        let configs = match self.db.list_mailbox_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                error!(error = %e, "Cannot read mailbox targets, skipping cycle");
                return finish(Vec::new(), Some(e.to_string()));
            }
        };

        let live: HashSet<_> = configs.iter().map(|c| c.target_key()).collect();
        self.deps.board.retain(&live).await;
        info!(targets = configs.len(), "Starting ingestion cycle");

        let runs = configs.iter().map(|config| async move {
            match self.db.open_session().await {
                Ok(session) => run_target(&self.deps, session, config, &self.cancel).await,
                Err(e) => {
                    warn!(target_key = %config.target_key(), error = %e, "Cannot open storage session");
                    let mut report = TargetReport::start(config);
                    report.error = Some(e.to_string());
                    self.deps.board.finish(report.clone()).await;
                    report
                }
            }
        });
        let targets = join_all(runs).await;

        let failed = targets.iter().filter(|r| !r.succeeded()).count();
        info!(
            targets = targets.len(),
            failed,
            "Ingestion cycle finished"
        );
        finish(targets, None)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::MailError;
    use crate::mail::{
        AutoReplySettings, MailSession, MailboxConfig, MessageHandle, OutboundConfig,
        OutgoingMail, Protocol,
    };
    use crate::pipeline::TargetPhase;
    use crate::store::LibSqlBackend;

    struct NoMail;

    #[async_trait]
    impl Mailer for NoMail {
        async fn send(&self, _: &OutboundConfig, _: OutgoingMail) -> Result<String, MailError> {
            Err(MailError::Send("disabled".into()))
        }
    }

    /// One message per mailbox, keyed by host; `down.example` refuses.
    struct HostConnector;

    struct OneMessage {
        host: String,
    }

    impl MailSession for OneMessage {
        fn list_candidates(&mut self) -> Result<Vec<MessageHandle>, MailError> {
            Ok(vec![MessageHandle("1".into())])
        }

        fn fetch(&mut self, _: &MessageHandle) -> Result<Vec<u8>, MailError> {
            Ok(format!(
                "Message-ID: <first@{host}>\r\nFrom: jane@example.com\r\nTo: help@{host}\r\nSubject: Hello\r\n\r\nHi.\r\n",
                host = self.host
            )
            .into_bytes())
        }

        fn mark_consumed(&mut self, _: &MessageHandle) -> Result<(), MailError> {
            Ok(())
        }

        fn close(self: Box<Self>) {}
    }

    impl MailConnector for HostConnector {
        fn connect(&self, config: &MailboxConfig) -> Result<Box<dyn MailSession>, MailError> {
            if config.host == "down.example" {
                return Err(MailError::Connect {
                    host: config.host.clone(),
                    port: config.port,
                    reason: "connection refused".into(),
                });
            }
            Ok(Box::new(OneMessage {
                host: config.host.clone(),
            }))
        }
    }

    fn mailbox(tenant_id: i64, host: &str) -> MailboxConfig {
        MailboxConfig {
            id: 0,
            tenant_id,
            project_id: None,
            protocol: Protocol::Imap,
            host: host.into(),
            port: 993,
            username: "help".into(),
            password: "pw".to_string().into(),
            use_tls: true,
            folder: "INBOX".into(),
            outbound: None,
            auto_reply: AutoReplySettings::default(),
        }
    }

    async fn scheduler(hosts: &[&str]) -> (Arc<PollScheduler>, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        for host in hosts {
            let tenant = db.insert_tenant(host).await.unwrap();
            db.insert_mailbox_config(&mailbox(tenant, host), false)
                .await
                .unwrap();
        }
        let config = IntakeConfig {
            poll_interval: Duration::from_secs(3600),
            ..IntakeConfig::default()
        };
        let scheduler = PollScheduler::new(
            &config,
            db.clone(),
            Arc::new(HostConnector),
            Arc::new(NoMail),
            CancellationToken::new(),
        );
        (Arc::new(scheduler), db)
    }

    #[tokio::test]
    async fn failing_target_does_not_affect_others() {
        let (scheduler, db) = scheduler(&["acme.example", "down.example"]).await;

        let report = scheduler.run_now().await;
        assert!(report.error.is_none());
        assert_eq!(report.targets.len(), 2);

        let ok = report.targets.iter().find(|r| r.host == "acme.example").unwrap();
        assert!(ok.succeeded());
        assert_eq!(ok.counts.tickets_created, 1);
        assert_eq!(db.list_tickets(ok.target.tenant_id).await.unwrap().len(), 1);

        let down = report.targets.iter().find(|r| r.host == "down.example").unwrap();
        assert!(down.error.as_deref().unwrap().contains("connection refused"));

        let status = scheduler.status().await;
        assert_eq!(status.len(), 2);
        assert!(status.iter().all(|s| s.phase == TargetPhase::Idle));
        assert!(scheduler.last_cycle().await.is_some());
    }

    #[tokio::test]
    async fn concurrent_run_now_calls_are_serialized() {
        let (scheduler, _db) = scheduler(&["acme.example"]).await;

        let (first, second) = tokio::join!(scheduler.run_now(), scheduler.run_now());
        assert_eq!(first.targets[0].counts.tickets_created, 1);
        assert_eq!(second.targets[0].counts.already_processed, 1);
        assert!(second.started_at >= first.finished_at);
    }

    #[tokio::test]
    async fn spawned_loop_runs_first_cycle_and_stops_on_cancel() {
        let (scheduler, _db) = scheduler(&["acme.example"]).await;
        let cancel = scheduler.cancel_token();
        let handle = scheduler.clone().spawn();

        tokio::time::timeout(Duration::from_secs(10), async {
            while scheduler.last_cycle().await.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_scheduler_starts_no_cycle() {
        let (scheduler, db) = scheduler(&["acme.example"]).await;
        scheduler.cancel_token().cancel();

        let report = scheduler.run_now().await;
        assert!(report.error.is_some());
        assert!(report.targets.is_empty());
        assert!(db.list_tickets(1).await.unwrap().is_empty());
    }
}
