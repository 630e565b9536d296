//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Writes that must be atomic
//! with the dedup ledger run inside `BEGIN IMMEDIATE` transactions.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, Row, Transaction, TransactionBehavior, params};
use secrecy::ExposeSecret;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::mail::normalize::canonical_message_id;
use crate::mail::{AutoReplySettings, MailboxConfig, OutboundConfig, Protocol};
use crate::pipeline::types::{
    CommitOutcome, Priority, TicketDraft, TicketStatus, WorkItemRef,
};
use crate::store::migrations;
use crate::store::traits::{
    CreatedTicket, Database, Direction, LedgerEntry, LedgerWrite, NewProject, NewUser,
    NotificationRecord, ProjectRecord, ReplyCommit, TaskCommit, TaskRecord, TicketComment,
    TicketCommit, TicketHistoryEntry, TicketRecord,
};

/// Milliseconds a connection waits on a locked database file.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// libSQL database backend.
///
/// File databases hand each session its own connection. In-memory databases
/// cannot be reopened, so their sessions share one connection.
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    shared_conn: bool,
    /// Serializes writes issued through this backend and its sessions.
    write_lock: Arc<Mutex<()>>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let conn = connect_file(&db).await?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            shared_conn: false,
            write_lock: Arc::new(Mutex::new(())),
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            shared_conn: true,
            write_lock: Arc::new(Mutex::new(())),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Take the write lock and open an immediate transaction.
    async fn begin(
        &self,
        ctx: &'static str,
    ) -> Result<(MutexGuard<'_, ()>, Transaction), DatabaseError> {
        let guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(q(ctx))?;
        Ok((guard, tx))
    }
}

async fn connect_file(db: &LibSqlDatabase) -> Result<Connection, DatabaseError> {
    let conn = db
        .connect()
        .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
    // PRAGMAs that report a value must go through query().
    for pragma in [
        format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"),
        "PRAGMA journal_mode = WAL".to_string(),
        "PRAGMA foreign_keys = ON".to_string(),
    ] {
        conn.query(&pragma, ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("{pragma}: {e}")))?;
    }
    Ok(conn)
}

/// Commit on success, roll back on failure.
async fn finish<T>(
    tx: Transaction,
    result: Result<T, libsql::Error>,
    ctx: &'static str,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit().await.map_err(q(ctx))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed after {ctx}");
            }
            Err(db_error(ctx, e))
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn q(ctx: &'static str) -> impl FnOnce(libsql::Error) -> DatabaseError {
    move |e| db_error(ctx, e)
}

fn db_error(ctx: &str, e: libsql::Error) -> DatabaseError {
    let message = format!("{ctx}: {e}");
    if message.contains("constraint failed") {
        DatabaseError::Constraint(message)
    } else {
        DatabaseError::Query(message)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or_default()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

async fn query_one<T>(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams,
    map: fn(&Row) -> Result<T, libsql::Error>,
) -> Result<Option<T>, libsql::Error> {
    let mut rows = conn.query(sql, params).await?;
    match rows.next().await? {
        Some(row) => Ok(Some(map(&row)?)),
        None => Ok(None),
    }
}

async fn query_all<T>(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams,
    map: fn(&Row) -> Result<T, libsql::Error>,
) -> Result<Vec<T>, libsql::Error> {
    let mut rows = conn.query(sql, params).await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(map(&row)?);
    }
    Ok(out)
}

async fn insert_returning_id(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams,
) -> Result<i64, libsql::Error> {
    conn.execute(sql, params).await?;
    Ok(conn.last_insert_rowid())
}

async fn ledger_contains(
    conn: &Connection,
    tenant_id: i64,
    message_id: &str,
) -> Result<bool, libsql::Error> {
    let hit = query_one(
        conn,
        "SELECT 1 FROM processed_mail WHERE tenant_id = ?1 AND message_id = ?2",
        params![tenant_id, canonical_message_id(message_id)],
        |row| row.get::<i64>(0),
    )
    .await?;
    Ok(hit.is_some())
}

async fn insert_ledger(
    conn: &Connection,
    ledger: &LedgerWrite,
    work_item: Option<WorkItemRef>,
    direction: Direction,
) -> Result<u64, libsql::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO processed_mail
            (tenant_id, message_id, sender, subject, work_item_kind, work_item_id, direction, processed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            ledger.tenant_id,
            canonical_message_id(&ledger.message_id),
            ledger.sender.clone(),
            truncate_chars(&ledger.subject, 500),
            work_item.map(|w| w.kind()),
            work_item.map(|w| w.id()),
            direction.as_str(),
            now()
        ],
    )
    .await
}

const TICKET_COLUMNS: &str = "id, tenant_id, ticket_number, subject, description, priority, \
     status, project_id, assignee_id, guest_name, guest_surname, guest_email, created_at";

/// Column order matches TICKET_COLUMNS.
fn row_to_ticket(row: &Row) -> Result<TicketRecord, libsql::Error> {
    let priority: String = row.get(5)?;
    let status: String = row.get(6)?;
    let created: String = row.get(12)?;
    Ok(TicketRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        ticket_number: row.get(2)?,
        subject: row.get(3)?,
        description: row.get(4)?,
        priority: priority.parse().unwrap_or(Priority::Medium),
        status: status.parse().unwrap_or(TicketStatus::Open),
        project_id: row.get(7)?,
        assignee_id: row.get(8)?,
        guest_name: row.get(9)?,
        guest_surname: row.get(10)?,
        guest_email: row.get(11)?,
        created_at: parse_datetime(&created),
    })
}

const LEDGER_COLUMNS: &str =
    "tenant_id, message_id, sender, subject, work_item_kind, work_item_id, direction, processed_at";

fn row_to_ledger(row: &Row) -> Result<LedgerEntry, libsql::Error> {
    let kind: Option<String> = row.get(4)?;
    let item_id: Option<i64> = row.get(5)?;
    let direction: String = row.get(6)?;
    let processed: String = row.get(7)?;
    Ok(LedgerEntry {
        tenant_id: row.get(0)?,
        message_id: row.get(1)?,
        sender: row.get(2)?,
        subject: row.get(3)?,
        work_item: kind
            .zip(item_id)
            .and_then(|(kind, id)| WorkItemRef::from_parts(&kind, id)),
        direction: if direction == "outbound" {
            Direction::Outbound
        } else {
            Direction::Inbound
        },
        processed_at: parse_datetime(&processed),
    })
}

const PROJECT_COLUMNS: &str = "id, tenant_id, name, inbox_address, is_archived, created_by";

fn row_to_project(row: &Row) -> Result<ProjectRecord, libsql::Error> {
    Ok(ProjectRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        inbox_address: row.get(3)?,
        is_archived: row.get::<i64>(4)? != 0,
        created_by: row.get(5)?,
    })
}

const MAILBOX_COLUMNS: &str = "m.id, m.tenant_id, m.project_id, m.protocol, m.host, m.port, \
     m.username, m.password, m.use_tls, m.folder, m.smtp_host, m.smtp_port, m.smtp_username, \
     m.smtp_password, m.from_address, m.from_name, m.auto_reply_enabled, m.company_name, \
     m.confirmation_subject, m.confirmation_body";

fn row_to_mailbox(row: &Row) -> Result<MailboxConfig, libsql::Error> {
    let protocol_str: String = row.get(3)?;
    let protocol = protocol_str.parse().unwrap_or_else(|e| {
        warn!(error = %e, "Unknown mailbox protocol, assuming IMAP");
        Protocol::Imap
    });
    let use_tls = row.get::<i64>(8)? != 0;
    let username: String = row.get(6)?;
    let password: String = row.get(7)?;

    let smtp_host: Option<String> = row.get(10)?;
    let from_address: Option<String> = row.get(14)?;
    let company_name: Option<String> = row.get(17)?;

    let outbound = match (smtp_host.filter(|h| !h.trim().is_empty()), from_address) {
        (Some(smtp_host), Some(from_address)) => Some(OutboundConfig {
            smtp_host,
            smtp_port: row
                .get::<Option<i64>>(11)?
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(587),
            username: row
                .get::<Option<String>>(12)?
                .unwrap_or_else(|| username.clone()),
            password: row
                .get::<Option<String>>(13)?
                .unwrap_or_else(|| password.clone())
                .into(),
            from_name: row
                .get::<Option<String>>(15)?
                .or_else(|| company_name.clone())
                .unwrap_or_default(),
            from_address: from_address.trim().to_lowercase(),
        }),
        _ => None,
    };

    let defaults = AutoReplySettings::default();
    let auto_reply = AutoReplySettings {
        enabled: row.get::<i64>(16)? != 0,
        company_name: company_name.unwrap_or(defaults.company_name),
        subject_template: row
            .get::<Option<String>>(18)?
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.subject_template),
        body_template: row
            .get::<Option<String>>(19)?
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.body_template),
    };

    Ok(MailboxConfig {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        project_id: row.get(2)?,
        protocol,
        host: row.get::<Option<String>>(4)?.unwrap_or_default(),
        port: row
            .get::<Option<i64>>(5)?
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or_else(|| protocol.default_port(use_tls)),
        username,
        password: password.into(),
        use_tls,
        folder: row.get(9)?,
        outbound,
        auto_reply,
    })
}

fn row_to_task(row: &Row) -> Result<TaskRecord, libsql::Error> {
    let start: String = row.get(8)?;
    let due: Option<String> = row.get(9)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        project_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        priority: row.get(5)?,
        status: row.get(6)?,
        creator_id: row.get(7)?,
        start_date: parse_date(&start),
        due_date: due.as_deref().map(parse_date),
    })
}

/// Next `TKT-<year>-<seq>` number for a tenant, scoped per calendar year.
async fn next_ticket_number(conn: &Connection, tenant_id: i64) -> Result<String, libsql::Error> {
    let year = Utc::now().year();
    let prefix = format!("TKT-{year}-");
    let max = query_one(
        conn,
        "SELECT COALESCE(MAX(CAST(substr(ticket_number, ?3) AS INTEGER)), 0)
         FROM tickets WHERE tenant_id = ?1 AND ticket_number LIKE ?2",
        params![tenant_id, format!("{prefix}%"), prefix.len() as i64 + 1],
        |row| row.get::<i64>(0),
    )
    .await?
    .unwrap_or(0);
    Ok(format!("{prefix}{:05}", max + 1))
}

async fn insert_ticket_row(
    conn: &Connection,
    draft: &TicketDraft,
    status: TicketStatus,
    assignee_id: Option<i64>,
) -> Result<CreatedTicket, libsql::Error> {
    let ticket_number = next_ticket_number(conn, draft.tenant_id).await?;
    let ts = now();
    let id = insert_returning_id(
        conn,
        "INSERT INTO tickets
            (tenant_id, ticket_number, subject, description, priority, status, project_id,
             assignee_id, guest_name, guest_surname, guest_email, guest_phone, guest_company,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
        params![
            draft.tenant_id,
            ticket_number.clone(),
            draft.subject.clone(),
            draft.description.clone(),
            draft.priority.as_str(),
            status.as_str(),
            draft.project_id,
            assignee_id,
            draft.guest.name.clone(),
            draft.guest.surname.clone(),
            draft.guest.email.clone(),
            draft.guest.phone.clone(),
            draft.guest.company.clone(),
            ts
        ],
    )
    .await?;
    Ok(CreatedTicket { id, ticket_number })
}

async fn insert_history(
    conn: &Connection,
    ticket_id: i64,
    action: &str,
    details: &str,
) -> Result<(), libsql::Error> {
    conn.execute(
        "INSERT INTO ticket_history (ticket_id, action, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![ticket_id, action, details, now()],
    )
    .await?;
    Ok(())
}

async fn reply_tx(conn: &Connection, commit: &ReplyCommit) -> Result<CommitOutcome<i64>, libsql::Error> {
    if ledger_contains(conn, commit.ledger.tenant_id, &commit.ledger.message_id).await? {
        return Ok(CommitOutcome::Duplicate);
    }
    let ts = now();
    let comment_id = insert_returning_id(
        conn,
        "INSERT INTO ticket_comments (ticket_id, author_email, body, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![commit.ticket_id, commit.author_email.clone(), commit.comment.clone(), ts.clone()],
    )
    .await?;
    insert_history(conn, commit.ticket_id, "email_reply", &commit.history).await?;
    conn.execute(
        "UPDATE tickets SET updated_at = ?1 WHERE id = ?2",
        params![ts.clone(), commit.ticket_id],
    )
    .await?;
    conn.execute(
        "INSERT INTO notifications (tenant_id, user_id, kind, message, link, created_at)
         SELECT t.tenant_id, u.id, 'ticket_reply', ?1, ?2, ?3
         FROM tickets t JOIN users u ON u.id = t.assignee_id
         WHERE t.id = ?4 AND u.is_admin = 0",
        params![
            commit.notification.clone(),
            format!("/tickets/{}", commit.ticket_id),
            ts,
            commit.ticket_id
        ],
    )
    .await?;
    insert_ledger(
        conn,
        &commit.ledger,
        Some(WorkItemRef::Ticket(commit.ticket_id)),
        Direction::Inbound,
    )
    .await?;
    Ok(CommitOutcome::Committed(comment_id))
}

async fn new_ticket_tx(
    conn: &Connection,
    commit: &TicketCommit,
) -> Result<CommitOutcome<CreatedTicket>, libsql::Error> {
    if ledger_contains(conn, commit.ledger.tenant_id, &commit.ledger.message_id).await? {
        return Ok(CommitOutcome::Duplicate);
    }
    let created = insert_ticket_row(conn, &commit.draft, TicketStatus::Open, None).await?;
    insert_history(conn, created.id, "created", &commit.history).await?;
    conn.execute(
        "INSERT INTO notifications (tenant_id, user_id, kind, message, link, created_at)
         SELECT ?1, id, 'ticket_created', ?2, ?3, ?4
         FROM users WHERE tenant_id = ?1 AND is_admin = 1",
        params![
            commit.draft.tenant_id,
            format!(
                "New ticket from email #{}: {}",
                created.ticket_number,
                truncate_chars(&commit.draft.subject, 100)
            ),
            format!("/tickets/{}", created.id),
            now()
        ],
    )
    .await?;
    insert_ledger(
        conn,
        &commit.ledger,
        Some(WorkItemRef::Ticket(created.id)),
        Direction::Inbound,
    )
    .await?;
    Ok(CommitOutcome::Committed(created))
}

async fn new_task_tx(conn: &Connection, commit: &TaskCommit) -> Result<CommitOutcome<i64>, libsql::Error> {
    if ledger_contains(conn, commit.ledger.tenant_id, &commit.ledger.message_id).await? {
        return Ok(CommitOutcome::Duplicate);
    }
    let draft = &commit.draft;
    let ts = now();
    let task_id = insert_returning_id(
        conn,
        "INSERT INTO tasks
            (tenant_id, project_id, title, description, priority, status, creator_id, start_date, due_date, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'todo',
            COALESCE(
                (SELECT created_by FROM projects WHERE id = ?2),
                (SELECT id FROM users WHERE tenant_id = ?1 AND is_admin = 1 ORDER BY id LIMIT 1)
            ),
            ?6, NULL, ?7)",
        params![
            draft.tenant_id,
            draft.project_id,
            draft.title.clone(),
            draft.description.clone(),
            draft.priority.task_label(),
            Utc::now().date_naive().format("%Y-%m-%d").to_string(),
            ts.clone()
        ],
    )
    .await?;
    conn.execute(
        "INSERT INTO notifications (tenant_id, user_id, kind, message, link, created_at)
         SELECT ?1, user_id, 'task_created', ?2, ?3, ?4
         FROM project_members WHERE project_id = ?5",
        params![
            draft.tenant_id,
            commit.notification.clone(),
            format!("/projects/{}/tasks/{}", draft.project_id, task_id),
            ts,
            draft.project_id
        ],
    )
    .await?;
    insert_ledger(conn, &commit.ledger, Some(WorkItemRef::Task(task_id)), Direction::Inbound).await?;
    Ok(CommitOutcome::Committed(task_id))
}

// ── Database trait ──────────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn open_session(&self) -> Result<Arc<dyn Database>, DatabaseError> {
        let conn = if self.shared_conn {
            self.conn.clone()
        } else {
            connect_file(&self.db).await?
        };
        Ok(Arc::new(Self {
            db: Arc::clone(&self.db),
            conn,
            shared_conn: self.shared_conn,
            write_lock: Arc::clone(&self.write_lock),
        }))
    }

    // ── Mailbox configuration ───────────────────────────────────────

    async fn list_mailbox_configs(&self) -> Result<Vec<MailboxConfig>, DatabaseError> {
        query_all(
            self.conn(),
            &format!(
                "SELECT {MAILBOX_COLUMNS} FROM mailbox_configs m
                 LEFT JOIN projects p ON p.id = m.project_id
                 WHERE m.is_archived = 0
                   AND m.host IS NOT NULL AND trim(m.host) != ''
                   AND (m.project_id IS NULL OR p.is_archived = 0)
                 ORDER BY m.tenant_id, m.id"
            ),
            (),
            row_to_mailbox,
        )
        .await
        .map_err(q("list_mailbox_configs"))
    }

    async fn insert_mailbox_config(
        &self,
        config: &MailboxConfig,
        is_archived: bool,
    ) -> Result<i64, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let outbound = config.outbound.as_ref();
        insert_returning_id(
            self.conn(),
            "INSERT INTO mailbox_configs
                (tenant_id, project_id, protocol, host, port, username, password, use_tls, folder,
                 smtp_host, smtp_port, smtp_username, smtp_password, from_address, from_name,
                 auto_reply_enabled, company_name, confirmation_subject, confirmation_body, is_archived)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                config.tenant_id,
                config.project_id,
                config.protocol.as_str(),
                config.host.clone(),
                config.port as i64,
                config.username.clone(),
                config.password.expose_secret().to_string(),
                config.use_tls as i64,
                config.folder.clone(),
                outbound.map(|o| o.smtp_host.clone()),
                outbound.map(|o| o.smtp_port as i64),
                outbound.map(|o| o.username.clone()),
                outbound.map(|o| o.password.expose_secret().to_string()),
                outbound.map(|o| o.from_address.clone()),
                outbound.map(|o| o.from_name.clone()),
                config.auto_reply.enabled as i64,
                config.auto_reply.company_name.clone(),
                config.auto_reply.subject_template.clone(),
                config.auto_reply.body_template.clone(),
                is_archived as i64
            ],
        )
        .await
        .map_err(q("insert_mailbox_config"))
    }

    // ── Dedup ledger ────────────────────────────────────────────────

    async fn is_processed(&self, tenant_id: i64, message_id: &str) -> Result<bool, DatabaseError> {
        ledger_contains(self.conn(), tenant_id, message_id)
            .await
            .map_err(q("is_processed"))
    }

    async fn find_ledger_entry(
        &self,
        tenant_id: i64,
        message_id: &str,
    ) -> Result<Option<LedgerEntry>, DatabaseError> {
        query_one(
            self.conn(),
            &format!(
                "SELECT {LEDGER_COLUMNS} FROM processed_mail WHERE tenant_id = ?1 AND message_id = ?2"
            ),
            params![tenant_id, canonical_message_id(message_id)],
            row_to_ledger,
        )
        .await
        .map_err(q("find_ledger_entry"))
    }

    async fn record_processed(
        &self,
        ledger: &LedgerWrite,
        work_item: Option<WorkItemRef>,
        direction: Direction,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let inserted = insert_ledger(self.conn(), ledger, work_item, direction)
            .await
            .map_err(q("record_processed"))?;
        debug!(
            tenant_id = ledger.tenant_id,
            message_id = %ledger.message_id,
            direction = direction.as_str(),
            inserted = inserted > 0,
            "Ledger write"
        );
        Ok(inserted > 0)
    }

    async fn list_ledger(&self, tenant_id: i64) -> Result<Vec<LedgerEntry>, DatabaseError> {
        query_all(
            self.conn(),
            &format!("SELECT {LEDGER_COLUMNS} FROM processed_mail WHERE tenant_id = ?1 ORDER BY id"),
            params![tenant_id],
            row_to_ledger,
        )
        .await
        .map_err(q("list_ledger"))
    }

    // ── Lookups ─────────────────────────────────────────────────────

    async fn find_ticket(
        &self,
        tenant_id: i64,
        ticket_id: i64,
    ) -> Result<Option<TicketRecord>, DatabaseError> {
        query_one(
            self.conn(),
            &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE tenant_id = ?1 AND id = ?2"),
            params![tenant_id, ticket_id],
            row_to_ticket,
        )
        .await
        .map_err(q("find_ticket"))
    }

    async fn find_ticket_by_number(
        &self,
        tenant_id: i64,
        ticket_number: &str,
    ) -> Result<Option<TicketRecord>, DatabaseError> {
        query_one(
            self.conn(),
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets WHERE tenant_id = ?1 AND ticket_number = ?2 COLLATE NOCASE"
            ),
            params![tenant_id, ticket_number],
            row_to_ticket,
        )
        .await
        .map_err(q("find_ticket_by_number"))
    }

    async fn find_ticket_by_sequence(
        &self,
        tenant_id: i64,
        sequence: i64,
    ) -> Result<Option<TicketRecord>, DatabaseError> {
        query_one(
            self.conn(),
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets
                 WHERE tenant_id = ?1 AND ticket_number LIKE 'TKT-%-%'
                   AND CAST(substr(ticket_number, 10) AS INTEGER) = ?2
                 ORDER BY created_at DESC, id DESC LIMIT 1"
            ),
            params![tenant_id, sequence],
            row_to_ticket,
        )
        .await
        .map_err(q("find_ticket_by_sequence"))
    }

    async fn find_open_tickets_by_guest_email(
        &self,
        tenant_id: i64,
        email: &str,
    ) -> Result<Vec<TicketRecord>, DatabaseError> {
        query_all(
            self.conn(),
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets
                 WHERE tenant_id = ?1 AND guest_email = ?2 COLLATE NOCASE AND status != 'closed'
                 ORDER BY created_at DESC, id DESC"
            ),
            params![tenant_id, email.trim()],
            row_to_ticket,
        )
        .await
        .map_err(q("find_open_tickets_by_guest_email"))
    }

    async fn find_project_by_inbox_address(
        &self,
        tenant_id: i64,
        address: &str,
    ) -> Result<Option<ProjectRecord>, DatabaseError> {
        if address.trim().is_empty() {
            return Ok(None);
        }
        query_one(
            self.conn(),
            &format!(
                "SELECT {PROJECT_COLUMNS} FROM projects
                 WHERE tenant_id = ?1 AND trim(inbox_address) = ?2 COLLATE NOCASE AND is_archived = 0
                 ORDER BY id LIMIT 1"
            ),
            params![tenant_id, address.trim()],
            row_to_project,
        )
        .await
        .map_err(q("find_project_by_inbox_address"))
    }

    async fn find_project(
        &self,
        tenant_id: i64,
        project_id: i64,
    ) -> Result<Option<ProjectRecord>, DatabaseError> {
        query_one(
            self.conn(),
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE tenant_id = ?1 AND id = ?2"),
            params![tenant_id, project_id],
            row_to_project,
        )
        .await
        .map_err(q("find_project"))
    }

    // ── Atomic dispositions ─────────────────────────────────────────

    async fn commit_ticket_reply(
        &self,
        commit: &ReplyCommit,
    ) -> Result<CommitOutcome<i64>, DatabaseError> {
        let (_guard, tx) = self.begin("commit_ticket_reply").await?;
        let result = reply_tx(&tx, commit).await;
        finish(tx, result, "commit_ticket_reply").await
    }

    async fn commit_new_ticket(
        &self,
        commit: &TicketCommit,
    ) -> Result<CommitOutcome<CreatedTicket>, DatabaseError> {
        let (_guard, tx) = self.begin("commit_new_ticket").await?;
        let result = new_ticket_tx(&tx, commit).await;
        finish(tx, result, "commit_new_ticket").await
    }

    async fn commit_new_task(
        &self,
        commit: &TaskCommit,
    ) -> Result<CommitOutcome<i64>, DatabaseError> {
        let (_guard, tx) = self.begin("commit_new_task").await?;
        let result = new_task_tx(&tx, commit).await;
        finish(tx, result, "commit_new_task").await
    }

    // ── Collaborator CRUD ───────────────────────────────────────────

    async fn insert_tenant(&self, name: &str) -> Result<i64, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        insert_returning_id(
            self.conn(),
            "INSERT INTO tenants (name) VALUES (?1)",
            params![name],
        )
        .await
        .map_err(q("insert_tenant"))
    }

    async fn insert_user(&self, user: &NewUser) -> Result<i64, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        insert_returning_id(
            self.conn(),
            "INSERT INTO users (tenant_id, email, full_name, is_admin) VALUES (?1, ?2, ?3, ?4)",
            params![
                user.tenant_id,
                user.email.to_lowercase(),
                user.full_name.clone(),
                user.is_admin as i64
            ],
        )
        .await
        .map_err(q("insert_user"))
    }

    async fn insert_project(&self, project: &NewProject) -> Result<i64, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        insert_returning_id(
            self.conn(),
            "INSERT INTO projects (tenant_id, name, inbox_address, is_archived, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project.tenant_id,
                project.name.clone(),
                project.inbox_address.clone(),
                project.is_archived as i64,
                project.created_by
            ],
        )
        .await
        .map_err(q("insert_project"))
    }

    async fn add_project_member(
        &self,
        project_id: i64,
        user_id: i64,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO project_members (project_id, user_id) VALUES (?1, ?2)",
                params![project_id, user_id],
            )
            .await
            .map_err(q("add_project_member"))?;
        Ok(())
    }

    async fn insert_ticket(
        &self,
        draft: &TicketDraft,
        status: TicketStatus,
        assignee_id: Option<i64>,
    ) -> Result<CreatedTicket, DatabaseError> {
        let (_guard, tx) = self.begin("insert_ticket").await?;
        let result = insert_ticket_row(&tx, draft, status, assignee_id).await;
        finish(tx, result, "insert_ticket").await
    }

    async fn list_tickets(&self, tenant_id: i64) -> Result<Vec<TicketRecord>, DatabaseError> {
        query_all(
            self.conn(),
            &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE tenant_id = ?1 ORDER BY id"),
            params![tenant_id],
            row_to_ticket,
        )
        .await
        .map_err(q("list_tickets"))
    }

    async fn list_ticket_comments(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<TicketComment>, DatabaseError> {
        query_all(
            self.conn(),
            "SELECT id, ticket_id, author_email, body, created_at
             FROM ticket_comments WHERE ticket_id = ?1 ORDER BY id",
            params![ticket_id],
            |row| {
                let created: String = row.get(4)?;
                Ok(TicketComment {
                    id: row.get(0)?,
                    ticket_id: row.get(1)?,
                    author_email: row.get(2)?,
                    body: row.get(3)?,
                    created_at: parse_datetime(&created),
                })
            },
        )
        .await
        .map_err(q("list_ticket_comments"))
    }

    async fn list_ticket_history(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<TicketHistoryEntry>, DatabaseError> {
        query_all(
            self.conn(),
            "SELECT id, ticket_id, action, details, created_at
             FROM ticket_history WHERE ticket_id = ?1 ORDER BY id",
            params![ticket_id],
            |row| {
                let created: String = row.get(4)?;
                Ok(TicketHistoryEntry {
                    id: row.get(0)?,
                    ticket_id: row.get(1)?,
                    action: row.get(2)?,
                    details: row.get(3)?,
                    created_at: parse_datetime(&created),
                })
            },
        )
        .await
        .map_err(q("list_ticket_history"))
    }

    async fn list_tasks(&self, project_id: i64) -> Result<Vec<TaskRecord>, DatabaseError> {
        query_all(
            self.conn(),
            "SELECT id, tenant_id, project_id, title, description, priority, status, creator_id,
                    start_date, due_date
             FROM tasks WHERE project_id = ?1 ORDER BY id",
            params![project_id],
            row_to_task,
        )
        .await
        .map_err(q("list_tasks"))
    }

    async fn list_notifications(
        &self,
        user_id: i64,
    ) -> Result<Vec<NotificationRecord>, DatabaseError> {
        query_all(
            self.conn(),
            "SELECT id, user_id, kind, message, link FROM notifications WHERE user_id = ?1 ORDER BY id",
            params![user_id],
            |row| {
                Ok(NotificationRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    kind: row.get(2)?,
                    message: row.get(3)?,
                    link: row.get(4)?,
                })
            },
        )
        .await
        .map_err(q("list_notifications"))
    }
}
