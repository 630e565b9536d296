//! End-to-end ingestion scenarios against an in-memory database, a scripted
//! mailbox and a recording mailer. No network.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use mail_intake::error::MailError;
use mail_intake::mail::{
    AutoReplySettings, MailConnector, MailSession, MailboxConfig, Mailer, MessageHandle,
    OutboundConfig, OutgoingMail, Protocol,
};
use mail_intake::pipeline::types::{GuestIdentity, Priority, TicketDraft, TicketStatus, WorkItemRef};
use mail_intake::pipeline::{IngestDeps, MatchEngine, RuleSet, StatusBoard, TargetReport, run_target};
use mail_intake::store::{Database, Direction, LedgerWrite, LibSqlBackend, NewProject};

// ── Fakes ───────────────────────────────────────────────────────────────

#[derive(Clone)]
enum Scripted {
    Raw(Vec<u8>),
    /// Fetch fails as if the connection dropped.
    Dropped,
}

/// Serves the same scripted messages on every connect.
#[derive(Clone, Default)]
struct ScriptedMailbox {
    messages: Arc<Mutex<Vec<Scripted>>>,
    marked: Arc<Mutex<Vec<String>>>,
}

impl ScriptedMailbox {
    fn push(&self, raw: Vec<u8>) {
        self.messages.lock().unwrap().push(Scripted::Raw(raw));
    }

    fn push_dropped(&self) {
        self.messages.lock().unwrap().push(Scripted::Dropped);
    }

    fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}

struct ScriptedSession {
    mailbox: ScriptedMailbox,
}

impl MailSession for ScriptedSession {
    fn list_candidates(&mut self) -> Result<Vec<MessageHandle>, MailError> {
        let count = self.mailbox.messages.lock().unwrap().len();
        Ok((1..=count).map(|n| MessageHandle(n.to_string())).collect())
    }

    fn fetch(&mut self, handle: &MessageHandle) -> Result<Vec<u8>, MailError> {
        let index: usize = handle.0.parse().unwrap();
        match self.mailbox.messages.lock().unwrap()[index - 1].clone() {
            Scripted::Raw(raw) => Ok(raw),
            Scripted::Dropped => Err(MailError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            ))),
        }
    }

    fn mark_consumed(&mut self, handle: &MessageHandle) -> Result<(), MailError> {
        self.mailbox.marked.lock().unwrap().push(handle.0.clone());
        Ok(())
    }

    fn close(self: Box<Self>) {}
}

struct ScriptedConnector {
    mailbox: ScriptedMailbox,
}

impl MailConnector for ScriptedConnector {
    fn connect(&self, _config: &MailboxConfig) -> Result<Box<dyn MailSession>, MailError> {
        Ok(Box::new(ScriptedSession {
            mailbox: self.mailbox.clone(),
        }))
    }
}

/// Records every send and answers with sequential Message-IDs.
#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OutgoingMail>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, _config: &OutboundConfig, mail: OutgoingMail) -> Result<String, MailError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(mail);
        Ok(format!("<confirm-{}@acme.example>", sent.len()))
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    db: Arc<dyn Database>,
    mailbox: ScriptedMailbox,
    mailer: Arc<RecordingMailer>,
    deps: IngestDeps,
}

impl Harness {
    async fn new() -> Self {
        Self::with_title_cap(50).await
    }

    async fn with_title_cap(cap: usize) -> Self {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mailbox = ScriptedMailbox::default();
        let mailer = Arc::new(RecordingMailer::default());
        let deps = IngestDeps {
            connector: Arc::new(ScriptedConnector {
                mailbox: mailbox.clone(),
            }),
            mailer: mailer.clone(),
            engine: Arc::new(MatchEngine::new(RuleSet::default_rules(cap))),
            board: StatusBoard::new(),
            max_messages: 100,
        };
        Self {
            db,
            mailbox,
            mailer,
            deps,
        }
    }

    async fn run(&self, config: &MailboxConfig) -> TargetReport {
        let session = self.db.open_session().await.unwrap();
        run_target(&self.deps, session, config, &CancellationToken::new()).await
    }
}

fn target(tenant_id: i64, auto_reply: bool) -> MailboxConfig {
    MailboxConfig {
        id: 1,
        tenant_id,
        project_id: None,
        protocol: Protocol::Pop3,
        host: "pop.acme.example".into(),
        port: 995,
        username: "support@acme.example".into(),
        password: "pw".to_string().into(),
        use_tls: true,
        folder: "INBOX".into(),
        outbound: Some(OutboundConfig {
            smtp_host: "smtp.acme.example".into(),
            smtp_port: 587,
            username: "support@acme.example".into(),
            password: "pw".to_string().into(),
            from_address: "support@acme.example".into(),
            from_name: "Acme Support".into(),
        }),
        auto_reply: AutoReplySettings {
            enabled: auto_reply,
            company_name: "Acme".into(),
            ..Default::default()
        },
    }
}

struct Email<'a> {
    id: &'a str,
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    in_reply_to: Option<&'a str>,
    body: &'a str,
}

impl Default for Email<'_> {
    fn default() -> Self {
        Self {
            id: "<msg-1@mail.example.com>",
            from: "Jane Doe <jane@example.com>",
            to: "support@acme.example",
            subject: "Question about my invoice",
            in_reply_to: None,
            body: "Hello, could you resend the invoice?",
        }
    }
}

impl Email<'_> {
    fn raw(&self) -> Vec<u8> {
        let mut out = format!(
            "Message-ID: {}\r\nFrom: {}\r\nTo: {}\r\nSubject: {}\r\nDate: Mon, 5 Oct 2026 09:30:00 +0000\r\n",
            self.id, self.from, self.to, self.subject
        );
        if let Some(parent) = self.in_reply_to {
            out.push_str(&format!("In-Reply-To: {parent}\r\nReferences: {parent}\r\n"));
        }
        out.push_str(&format!("\r\n{}\r\n", self.body));
        out.into_bytes()
    }
}

fn guest_ticket(tenant_id: i64, email: &str) -> TicketDraft {
    TicketDraft {
        tenant_id,
        project_id: None,
        subject: "Earlier request".into(),
        description: String::new(),
        priority: Priority::Medium,
        guest: GuestIdentity {
            name: "Guest".into(),
            email: email.into(),
            ..Default::default()
        },
    }
}

async fn link_ledger(db: &Arc<dyn Database>, tenant_id: i64, message_id: &str, item: WorkItemRef) {
    db.record_processed(
        &LedgerWrite {
            tenant_id,
            message_id: message_id.into(),
            sender: "someone@example.com".into(),
            subject: String::new(),
        },
        Some(item),
        Direction::Inbound,
    )
    .await
    .unwrap();
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn processing_same_message_twice_creates_one_ticket() {
    let h = Harness::new().await;
    let tenant = h.db.insert_tenant("acme").await.unwrap();
    h.mailbox.push(Email::default().raw());
    let config = target(tenant, false);

    let first = h.run(&config).await;
    let second = h.run(&config).await;

    assert_eq!(first.counts.tickets_created, 1);
    assert_eq!(second.counts.already_processed, 1);
    assert_eq!(h.db.list_tickets(tenant).await.unwrap().len(), 1);
    assert_eq!(h.db.list_ledger(tenant).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reply_header_lands_on_linked_ticket() {
    let h = Harness::new().await;
    let mut tenant = 0;
    for n in 1..=7 {
        tenant = h.db.insert_tenant(&format!("tenant-{n}")).await.unwrap();
    }
    assert_eq!(tenant, 7);
    let mut last = 0;
    for n in 0..42 {
        last = h
            .db
            .insert_ticket(&guest_ticket(tenant, &format!("guest{n}@example.com")), TicketStatus::Open, None)
            .await
            .unwrap()
            .id;
    }
    assert_eq!(last, 42);
    link_ledger(&h.db, tenant, "<abc@mail>", WorkItemRef::Ticket(42)).await;

    h.mailbox.push(
        Email {
            id: "<reply-1@mail.example.com>",
            subject: "Re: Earlier request",
            in_reply_to: Some("<abc@mail>"),
            body: "Thanks, that fixed it.\n\n> quoted text",
            ..Default::default()
        }
        .raw(),
    );
    let report = h.run(&target(tenant, false)).await;

    assert_eq!(report.counts.appended, 1);
    let comments = h.db.list_ticket_comments(42).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].body.contains("Thanks, that fixed it."));
    assert!(!comments[0].body.contains("quoted text"));
    assert_eq!(h.db.list_ticket_history(42).await.unwrap().len(), 1);
    assert_eq!(h.db.list_tickets(tenant).await.unwrap().len(), 42);

    let own = h
        .db
        .find_ledger_entry(tenant, "reply-1@mail.example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(own.work_item, Some(WorkItemRef::Ticket(42)));
    assert_eq!(h.db.list_ledger(tenant).await.unwrap().len(), 2);
}

#[tokio::test]
async fn header_match_wins_over_subject_number() {
    let h = Harness::new().await;
    let tenant = h.db.insert_tenant("acme").await.unwrap();
    let threaded = h
        .db
        .insert_ticket(&guest_ticket(tenant, "a@example.com"), TicketStatus::Open, None)
        .await
        .unwrap();
    let numbered = h
        .db
        .insert_ticket(&guest_ticket(tenant, "b@example.com"), TicketStatus::Open, None)
        .await
        .unwrap();
    link_ledger(&h.db, tenant, "thread-root@mail", WorkItemRef::Ticket(threaded.id)).await;

    let subject = format!("Re: {}", numbered.ticket_number);
    h.mailbox.push(
        Email {
            subject: &subject,
            in_reply_to: Some("<thread-root@mail>"),
            ..Default::default()
        }
        .raw(),
    );
    h.run(&target(tenant, false)).await;

    assert_eq!(h.db.list_ticket_comments(threaded.id).await.unwrap().len(), 1);
    assert!(h.db.list_ticket_comments(numbered.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn ambiguous_sender_gets_a_new_ticket() {
    let h = Harness::new().await;
    let tenant = h.db.insert_tenant("acme").await.unwrap();
    for _ in 0..2 {
        h.db.insert_ticket(&guest_ticket(tenant, "jane@example.com"), TicketStatus::Open, None)
            .await
            .unwrap();
    }
    h.mailbox.push(Email::default().raw());

    let report = h.run(&target(tenant, false)).await;

    assert_eq!(report.counts.tickets_created, 1);
    assert_eq!(h.db.list_tickets(tenant).await.unwrap().len(), 3);
}

#[tokio::test]
async fn single_open_ticket_absorbs_followup_from_sender() {
    let h = Harness::new().await;
    let tenant = h.db.insert_tenant("acme").await.unwrap();
    let open = h
        .db
        .insert_ticket(&guest_ticket(tenant, "jane@example.com"), TicketStatus::Waiting, None)
        .await
        .unwrap();
    h.db.insert_ticket(&guest_ticket(tenant, "jane@example.com"), TicketStatus::Closed, None)
        .await
        .unwrap();
    h.mailbox.push(Email::default().raw());

    let report = h.run(&target(tenant, false)).await;

    assert_eq!(report.counts.appended, 1);
    assert_eq!(h.db.list_ticket_comments(open.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn project_inbox_creates_task() {
    let h = Harness::new().await;
    let tenant = h.db.insert_tenant("acme").await.unwrap();
    let other = h.db.insert_tenant("elsewhere").await.unwrap();
    h.db.insert_ticket(&guest_ticket(other, "jane@example.com"), TicketStatus::Open, None)
        .await
        .unwrap();
    let project = h
        .db
        .insert_project(&NewProject {
            tenant_id: tenant,
            name: "Support".into(),
            inbox_address: Some("Support@Acme.example".into()),
            is_archived: false,
            created_by: None,
        })
        .await
        .unwrap();

    h.mailbox.push(
        Email {
            subject: "Laptop cannot connect to the office wifi network after the latest update",
            body: "Since this morning nothing works.",
            ..Default::default()
        }
        .raw(),
    );
    let report = h.run(&target(tenant, false)).await;

    assert_eq!(report.counts.tasks_created, 1);
    assert!(h.db.list_tickets(tenant).await.unwrap().is_empty());
    let tasks = h.db.list_tasks(project).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].title.chars().count() <= 50);
    assert_eq!(tasks[0].title, "Update Laptop Wifi");
    assert_eq!(tasks[0].start_date, Utc::now().date_naive());
    assert!(tasks[0].due_date.is_none());
    assert_eq!(tasks[0].priority, "medium");

    let entry = h
        .db
        .find_ledger_entry(tenant, "<msg-1@mail.example.com>")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.work_item, Some(WorkItemRef::Task(tasks[0].id)));
}

#[tokio::test]
async fn priority_comes_from_keywords() {
    let h = Harness::new().await;
    let tenant = h.db.insert_tenant("acme").await.unwrap();
    h.mailbox.push(
        Email {
            id: "<a@mail>",
            from: "a@example.com",
            subject: "URGENT: server down",
            body: "Nothing loads.",
            ..Default::default()
        }
        .raw(),
    );
    h.mailbox.push(
        Email {
            id: "<b@mail>",
            from: "b@example.com",
            subject: "please add a new report field",
            body: "Thanks.",
            ..Default::default()
        }
        .raw(),
    );
    h.run(&target(tenant, false)).await;

    let tickets = h.db.list_tickets(tenant).await.unwrap();
    assert_eq!(tickets.len(), 2);
    assert_eq!(tickets[0].priority, Priority::Urgent);
    assert_eq!(tickets[1].priority, Priority::Medium);
}

#[tokio::test]
async fn long_task_titles_are_capped() {
    let h = Harness::with_title_cap(12).await;
    let tenant = h.db.insert_tenant("acme").await.unwrap();
    let project = h
        .db
        .insert_project(&NewProject {
            tenant_id: tenant,
            name: "Support".into(),
            inbox_address: Some("support@acme.example".into()),
            is_archived: false,
            created_by: None,
        })
        .await
        .unwrap();
    h.mailbox.push(
        Email {
            subject: "Quarterly budget spreadsheet",
            body: "See attached.",
            ..Default::default()
        }
        .raw(),
    );
    h.run(&target(tenant, false)).await;

    let title = &h.db.list_tasks(project).await.unwrap()[0].title;
    assert!(title.chars().count() <= 12, "{title}");
    assert!(title.ends_with("..."));
}

#[tokio::test]
async fn confirmation_id_threads_the_guest_reply() {
    let h = Harness::new().await;
    let tenant = h.db.insert_tenant("acme").await.unwrap();
    let config = target(tenant, true);

    h.mailbox.push(Email::default().raw());
    h.run(&config).await;
    let ticket = h.db.list_tickets(tenant).await.unwrap().remove(0);
    assert_eq!(h.mailer.sent.lock().unwrap().len(), 1);

    // A second open ticket from the same sender rules out the sender
    // heuristic, so only the header can link the reply.
    h.db.insert_ticket(&guest_ticket(tenant, "jane@example.com"), TicketStatus::Open, None)
        .await
        .unwrap();
    h.mailbox.clear();
    h.mailbox.push(
        Email {
            id: "<reply@mail.example.com>",
            subject: "Re: your message",
            in_reply_to: Some("<confirm-1@acme.example>"),
            body: "Here is the extra detail.",
            ..Default::default()
        }
        .raw(),
    );
    let report = h.run(&config).await;

    assert_eq!(report.counts.appended, 1);
    assert_eq!(h.db.list_ticket_comments(ticket.id).await.unwrap().len(), 1);
    assert_eq!(h.mailer.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn own_outbound_mail_is_consumed_without_work() {
    let h = Harness::new().await;
    let tenant = h.db.insert_tenant("acme").await.unwrap();
    h.mailbox.push(
        Email {
            from: "Acme Support <Support@acme.example>",
            ..Default::default()
        }
        .raw(),
    );

    let report = h.run(&target(tenant, true)).await;

    assert_eq!(report.counts.self_sent, 1);
    assert!(h.db.list_tickets(tenant).await.unwrap().is_empty());
    assert!(h.mailer.sent.lock().unwrap().is_empty());
    assert_eq!(*h.mailbox.marked.lock().unwrap(), vec!["1"]);
}

#[tokio::test]
async fn dropped_connection_aborts_rest_of_batch() {
    let h = Harness::new().await;
    let tenant = h.db.insert_tenant("acme").await.unwrap();
    h.mailbox.push(Email::default().raw());
    h.mailbox.push_dropped();
    h.mailbox.push(
        Email {
            id: "<later@mail>",
            from: "later@example.com",
            ..Default::default()
        }
        .raw(),
    );

    let report = h.run(&target(tenant, false)).await;

    assert!(report.error.is_some());
    assert_eq!(report.counts.tickets_created, 1);
    assert_eq!(h.db.list_tickets(tenant).await.unwrap().len(), 1);
    assert!(!h.db.is_processed(tenant, "later@mail").await.unwrap());
}

#[tokio::test]
async fn relisting_mailbox_reaches_new_mail_past_the_cap() {
    let mut h = Harness::new().await;
    h.deps.max_messages = 2;
    let tenant = h.db.insert_tenant("acme").await.unwrap();
    let config = target(tenant, false);
    let senders = ["ann", "bob", "cid", "dee", "eve"];
    let push = |name: &str| {
        let id = format!("<{name}@mail.example.com>");
        let from = format!("{name}@example.com");
        h.mailbox.push(
            Email {
                id: &id,
                from: &from,
                ..Default::default()
            }
            .raw(),
        );
    };
    for name in &senders[..3] {
        push(name);
    }

    let first = h.run(&config).await;
    assert_eq!(first.counts.tickets_created, 2);
    assert_eq!(first.deferred, 1);

    let second = h.run(&config).await;
    assert_eq!(second.counts.already_processed, 2);
    assert_eq!(second.counts.tickets_created, 1);
    assert_eq!(second.deferred, 0);

    // Older mail stays listed forever; later arrivals must still be picked up.
    for name in &senders[3..] {
        push(name);
    }
    let third = h.run(&config).await;
    assert!(third.succeeded(), "{:?}", third.error);
    assert_eq!(third.counts.already_processed, 3);
    assert_eq!(third.counts.tickets_created, 2);

    let tickets = h.db.list_tickets(tenant).await.unwrap();
    assert_eq!(tickets.len(), senders.len());
    for name in senders {
        let email = format!("{name}@example.com");
        assert!(tickets.iter().any(|t| t.guest_email == email), "{email} never ingested");
    }
}
