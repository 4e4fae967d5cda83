//! libSQL backend: async `SystemStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::types::RawEmailRecord;
use crate::store::migrations;
use crate::store::traits::{
    ForwardingConfig, ForwardingRule, MatchingStats, SystemStore, Watch, WatchStatus,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "System database opened");
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
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    /// Get the connection.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Tenant directory seeding ────────────────────────────────────
    //
    // Tenant and account management lives elsewhere; these writers exist so
    // the directory tables can be populated by provisioning scripts and tests.

    pub async fn register_tenant(&self, id: &str, name: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tenants (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                params![id, name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("register_tenant: {e}")))?;
        Ok(())
    }

    pub async fn register_detail(
        &self,
        id: &str,
        tenant_id: &str,
        store_name: &str,
        tax_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tenant_details (id, tenant_id, store_name, tax_id) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET tenant_id = excluded.tenant_id,
                    store_name = excluded.store_name, tax_id = excluded.tax_id",
                params![id, tenant_id, store_name, opt_text(tax_id)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("register_detail: {e}")))?;
        Ok(())
    }

    pub async fn register_account(
        &self,
        id: &str,
        detail_id: &str,
        bank_name: Option<&str>,
        account_number: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO accounts (id, detail_id, bank_name, account_number) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET detail_id = excluded.detail_id,
                    bank_name = excluded.bank_name, account_number = excluded.account_number",
                params![id, detail_id, opt_text(bank_name), opt_text(account_number)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("register_account: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
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

pub(crate) fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
pub(crate) fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Serialize an optional value as JSON text, or NULL.
fn opt_json<T: serde::Serialize>(value: &Option<T>) -> Result<libsql::Value, DatabaseError> {
    match value {
        Some(v) => serde_json::to_string(v)
            .map(libsql::Value::Text)
            .map_err(|e| DatabaseError::Serialization(e.to_string())),
        None => Ok(libsql::Value::Null),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const WATCH_COLUMNS: &str = "mailbox, history_cursor, expiration, topic, access_token, \
     refresh_token, status, last_error, created_at, updated_at";

/// Map a libsql Row to a Watch. Column order matches WATCH_COLUMNS.
fn row_to_watch(row: &libsql::Row) -> Result<Watch, libsql::Error> {
    let mailbox: String = row.get(0)?;
    let cursor: i64 = row.get(1)?;
    let expiration: String = row.get(2)?;
    let topic: String = row.get(3)?;
    let access_token: String = row.get(4)?;
    let refresh_token: Option<String> = row.get(5)?;
    let status: String = row.get(6)?;
    let last_error: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(Watch {
        mailbox,
        history_cursor: cursor.max(0) as u64,
        expiration: parse_datetime(&expiration),
        topic,
        access_token: SecretString::from(access_token),
        refresh_token: refresh_token.map(SecretString::from),
        status: WatchStatus::parse(&status),
        last_error,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

const RAW_COLUMNS: &str = "id, provider_message_id, thread_id, history_cursor, message_id, \
     sender, subject, received_at, headers, text_body, html_body, labels, attachments, routing, \
     parsed, transaction_variables, transaction_type, enriched, processed, processed_at, error, \
     created_at";

/// Map a libsql Row to a RawEmailRecord. Column order matches RAW_COLUMNS.
///
/// JSON columns that fail to decode come back empty rather than failing the row.
fn row_to_raw(row: &libsql::Row) -> Result<RawEmailRecord, libsql::Error> {
    let headers: String = row.get(8)?;
    let labels: String = row.get(11)?;
    let attachments: String = row.get(12)?;
    let routing: Option<String> = row.get(13)?;
    let parsed: Option<String> = row.get(14)?;
    let variables: Option<String> = row.get(15)?;
    let cursor: i64 = row.get(3)?;
    let received_at: String = row.get(7)?;
    let enriched: i64 = row.get(17)?;
    let processed: i64 = row.get(18)?;
    let processed_at: Option<String> = row.get(19)?;
    let created_at: String = row.get(21)?;

    Ok(RawEmailRecord {
        id: row.get(0)?,
        provider_message_id: row.get(1)?,
        thread_id: row.get(2)?,
        history_cursor: cursor.max(0) as u64,
        message_id: row.get(4)?,
        sender: row.get(5)?,
        subject: row.get(6)?,
        received_at: parse_datetime(&received_at),
        headers: serde_json::from_str(&headers).unwrap_or_default(),
        text_body: row.get(9)?,
        html_body: row.get(10)?,
        labels: serde_json::from_str(&labels).unwrap_or_default(),
        attachments: serde_json::from_str(&attachments).unwrap_or_default(),
        routing: routing.and_then(|s| serde_json::from_str(&s).ok()),
        parsed: parsed.and_then(|s| serde_json::from_str(&s).ok()),
        transaction_variables: variables.and_then(|s| serde_json::from_str(&s).ok()),
        transaction_type: row.get(16)?,
        enriched: enriched != 0,
        processed: processed != 0,
        processed_at: parse_optional_datetime(&processed_at),
        error: row.get(20)?,
        created_at: parse_datetime(&created_at),
    })
}

async fn collect_raw(mut rows: libsql::Rows, op: &str) -> Result<Vec<RawEmailRecord>, DatabaseError> {
    let mut records = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => {
                let record =
                    row_to_raw(&row).map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
                records.push(record);
            }
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
    Ok(records)
}

async fn collect_watches(mut rows: libsql::Rows, op: &str) -> Result<Vec<Watch>, DatabaseError> {
    let mut watches = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => {
                let watch =
                    row_to_watch(&row).map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
                watches.push(watch);
            }
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
    Ok(watches)
}

/// Read a single integer from the first row, 0 when there is none.
async fn scalar_i64(mut rows: libsql::Rows, op: &str) -> Result<i64, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => row
            .get::<Option<i64>>(0)
            .map(|v| v.unwrap_or(0))
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl SystemStore for LibSqlBackend {
    // ── Watches ─────────────────────────────────────────────────────

    async fn upsert_watch(&self, watch: &Watch) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO watches (mailbox, history_cursor, expiration, topic, access_token,
                    refresh_token, status, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(mailbox) DO UPDATE SET
                    history_cursor = MAX(watches.history_cursor, excluded.history_cursor),
                    expiration = excluded.expiration,
                    topic = excluded.topic,
                    access_token = excluded.access_token,
                    refresh_token = COALESCE(excluded.refresh_token, watches.refresh_token),
                    status = excluded.status,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at",
                params![
                    watch.mailbox.as_str(),
                    watch.history_cursor as i64,
                    watch.expiration.to_rfc3339(),
                    watch.topic.as_str(),
                    watch.access_token.expose_secret(),
                    opt_text(watch.refresh_token.as_ref().map(|t| t.expose_secret())),
                    watch.status.as_str(),
                    opt_text(watch.last_error.as_deref()),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_watch: {e}")))?;

        debug!(mailbox = %watch.mailbox, cursor = watch.history_cursor, "Watch upserted");
        Ok(())
    }

    async fn get_watch(&self, mailbox: &str) -> Result<Option<Watch>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {WATCH_COLUMNS} FROM watches WHERE mailbox = ?1"),
                params![mailbox],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_watch: {e}")))?;
        Ok(collect_watches(rows, "get_watch").await?.into_iter().next())
    }

    async fn list_watches(&self) -> Result<Vec<Watch>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {WATCH_COLUMNS} FROM watches ORDER BY mailbox ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_watches: {e}")))?;
        collect_watches(rows, "list_watches").await
    }

    async fn any_active_watch(&self) -> Result<Option<Watch>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {WATCH_COLUMNS} FROM watches WHERE status = 'active'
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("any_active_watch: {e}")))?;
        Ok(collect_watches(rows, "any_active_watch").await?.into_iter().next())
    }

    async fn watches_expiring_before(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<Watch>, DatabaseError> {
        let watches = self.list_watches().await?;
        Ok(watches
            .into_iter()
            .filter(|w| w.status == WatchStatus::Active && w.expiration < deadline)
            .collect())
    }

    async fn advance_cursor(&self, mailbox: &str, cursor: u64) -> Result<u64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE watches SET history_cursor = MAX(history_cursor, ?2), updated_at = ?3
                 WHERE mailbox = ?1",
                params![mailbox, cursor as i64, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_cursor: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "watch".into(),
                id: mailbox.into(),
            });
        }

        let rows = self
            .conn()
            .query(
                "SELECT history_cursor FROM watches WHERE mailbox = ?1",
                params![mailbox],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_cursor: {e}")))?;
        let stored = scalar_i64(rows, "advance_cursor").await?;
        Ok(stored.max(0) as u64)
    }

    async fn renew_watch(
        &self,
        mailbox: &str,
        expiration: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE watches SET expiration = ?2, status = 'active', last_error = NULL,
                    updated_at = ?3
                 WHERE mailbox = ?1",
                params![mailbox, expiration.to_rfc3339(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("renew_watch: {e}")))?;
        Ok(())
    }

    async fn set_watch_status(
        &self,
        mailbox: &str,
        status: WatchStatus,
        last_error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE watches SET status = ?2, last_error = ?3, updated_at = ?4 WHERE mailbox = ?1",
                params![
                    mailbox,
                    status.as_str(),
                    opt_text(last_error),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_watch_status: {e}")))?;
        Ok(())
    }

    async fn set_watch_error(&self, mailbox: &str, last_error: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE watches SET last_error = ?2, updated_at = ?3 WHERE mailbox = ?1",
                params![mailbox, last_error, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_watch_error: {e}")))?;
        Ok(())
    }

    // ── Forwarding rules ────────────────────────────────────────────

    async fn replace_forwarding(
        &self,
        entity_id: &str,
        active: bool,
        rules: &[ForwardingRule],
    ) -> Result<(), DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_forwarding: {e}")))?;

        tx.execute(
            "INSERT INTO forwarding_configs (entity_id, active, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(entity_id) DO UPDATE SET active = excluded.active,
                updated_at = excluded.updated_at",
            params![entity_id, active as i64, Utc::now().to_rfc3339()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("replace_forwarding: {e}")))?;

        tx.execute(
            "DELETE FROM forwarding_rules WHERE entity_id = ?1",
            params![entity_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("replace_forwarding: {e}")))?;

        for (position, rule) in rules.iter().enumerate() {
            tx.execute(
                "INSERT INTO forwarding_rules (entity_id, position, email, account_ids)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    entity_id,
                    position as i64,
                    rule.email.to_lowercase(),
                    to_json(&rule.account_ids)?
                ],
            )
            .await
            .map_err(|e| DatabaseError::Constraint(format!("replace_forwarding: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_forwarding: {e}")))?;

        info!(entity_id = entity_id, rules = rules.len(), active, "Forwarding config replaced");
        Ok(())
    }

    async fn get_forwarding(
        &self,
        entity_id: &str,
    ) -> Result<Option<ForwardingConfig>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT active, updated_at FROM forwarding_configs WHERE entity_id = ?1",
                params![entity_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_forwarding: {e}")))?;

        let (active, updated_at) = match rows.next().await {
            Ok(Some(row)) => {
                let active: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_forwarding: {e}")))?;
                let updated_at: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("get_forwarding: {e}")))?;
                (active != 0, parse_datetime(&updated_at))
            }
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_forwarding: {e}"))),
        };

        let mut rows = self
            .conn()
            .query(
                "SELECT entity_id, email, account_ids FROM forwarding_rules
                 WHERE entity_id = ?1 ORDER BY position ASC",
                params![entity_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_forwarding: {e}")))?;

        let mut rules = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_rule(&row) {
                Ok(rule) => rules.push(rule),
                Err(e) => tracing::warn!("Skipping malformed forwarding rule: {e}"),
            }
        }

        Ok(Some(ForwardingConfig {
            entity_id: entity_id.to_string(),
            active,
            rules,
            updated_at,
        }))
    }

    async fn find_forwarding_rule(
        &self,
        email: &str,
    ) -> Result<Option<ForwardingRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT r.entity_id, r.email, r.account_ids FROM forwarding_rules r
                 JOIN forwarding_configs c ON c.entity_id = r.entity_id
                 WHERE c.active = 1 AND r.email = ?1
                 ORDER BY c.updated_at ASC LIMIT 1",
                params![email.trim().to_lowercase()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_forwarding_rule: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_rule(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("find_forwarding_rule: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_forwarding_rule: {e}"))),
        }
    }

    // ── Raw emails ──────────────────────────────────────────────────

    async fn raw_email_exists(&self, provider_message_id: &str) -> Result<bool, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM raw_emails WHERE provider_message_id = ?1",
                params![provider_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("raw_email_exists: {e}")))?;
        Ok(scalar_i64(rows, "raw_email_exists").await? > 0)
    }

    async fn insert_raw_email(&self, record: &RawEmailRecord) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO raw_emails ({RAW_COLUMNS}, entity_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                             ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
                     ON CONFLICT(provider_message_id) DO NOTHING"
                ),
                params![
                    record.id.as_str(),
                    record.provider_message_id.as_str(),
                    record.thread_id.as_str(),
                    record.history_cursor as i64,
                    opt_text(record.message_id.as_deref()),
                    record.sender.as_str(),
                    record.subject.as_str(),
                    record.received_at.to_rfc3339(),
                    to_json(&record.headers)?,
                    opt_text(record.text_body.as_deref()),
                    opt_text(record.html_body.as_deref()),
                    to_json(&record.labels)?,
                    to_json(&record.attachments)?,
                    opt_json(&record.routing)?,
                    opt_json(&record.parsed)?,
                    opt_json(&record.transaction_variables)?,
                    opt_text(record.transaction_type.as_deref()),
                    record.enriched as i64,
                    record.processed as i64,
                    opt_text(record.processed_at.map(|t| t.to_rfc3339()).as_deref()),
                    opt_text(record.error.as_deref()),
                    record.created_at.to_rfc3339(),
                    opt_text(record.routing.as_ref().map(|r| r.entity_id.as_str())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_raw_email: {e}")))?;

        debug!(
            provider_message_id = %record.provider_message_id,
            inserted = affected > 0,
            "Raw email insert"
        );
        Ok(affected > 0)
    }

    async fn get_raw_email(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<RawEmailRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {RAW_COLUMNS} FROM raw_emails WHERE provider_message_id = ?1"),
                params![provider_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_raw_email: {e}")))?;
        Ok(collect_raw(rows, "get_raw_email").await?.into_iter().next())
    }

    async fn pending_raw_emails(
        &self,
        entity_id: &str,
    ) -> Result<Vec<RawEmailRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RAW_COLUMNS} FROM raw_emails
                     WHERE entity_id = ?1 AND processed = 0
                     ORDER BY received_at ASC"
                ),
                params![entity_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_raw_emails: {e}")))?;
        collect_raw(rows, "pending_raw_emails").await
    }

    async fn mark_raw_processed(
        &self,
        id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE raw_emails SET processed = 1, processed_at = ?2 WHERE id = ?1",
                params![id, processed_at.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_raw_processed: {e}")))?;
        Ok(())
    }

    async fn list_raw_emails(
        &self,
        entity_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RawEmailRecord>, DatabaseError> {
        let rows = match entity_id {
            Some(entity_id) => self
                .conn()
                .query(
                    &format!(
                        "SELECT {RAW_COLUMNS} FROM raw_emails WHERE entity_id = ?1
                         ORDER BY received_at DESC LIMIT ?2"
                    ),
                    params![entity_id, limit as i64],
                )
                .await,
            None => self
                .conn()
                .query(
                    &format!(
                        "SELECT {RAW_COLUMNS} FROM raw_emails ORDER BY received_at DESC LIMIT ?1"
                    ),
                    params![limit as i64],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_raw_emails: {e}")))?;
        collect_raw(rows, "list_raw_emails").await
    }

    async fn matching_stats(&self) -> Result<MatchingStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(routing IS NOT NULL), 0),
                        COALESCE(SUM(processed), 0),
                        COALESCE(SUM(error IS NOT NULL), 0)
                 FROM raw_emails",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("matching_stats: {e}")))?;

        let mut stats = MatchingStats::default();
        if let Ok(Some(row)) = rows.next().await {
            let get = |i: i32| -> Result<u64, DatabaseError> {
                row.get::<i64>(i)
                    .map(|v| v.max(0) as u64)
                    .map_err(|e| DatabaseError::Query(format!("matching_stats: {e}")))
            };
            stats.total = get(0)?;
            stats.matched = get(1)?;
            stats.processed = get(2)?;
            stats.with_errors = get(3)?;
        }
        stats.unmatched = stats.total - stats.matched;
        if stats.total > 0 {
            stats.match_rate = stats.matched as f64 / stats.total as f64;
        }

        let mut rows = self
            .conn()
            .query(
                "SELECT json_extract(routing, '$.bank') AS bank, COUNT(*) FROM raw_emails
                 WHERE routing IS NOT NULL GROUP BY bank",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("matching_stats: {e}")))?;

        let mut by_bank = BTreeMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let bank: Option<String> = row.get(0).unwrap_or(None);
            let count: i64 = row.get(1).unwrap_or(0);
            by_bank.insert(bank.unwrap_or_else(|| "UNKNOWN".into()), count.max(0) as u64);
        }
        stats.by_bank = by_bank;

        Ok(stats)
    }
}

fn row_to_rule(row: &libsql::Row) -> Result<ForwardingRule, libsql::Error> {
    let account_ids: String = row.get(2)?;
    Ok(ForwardingRule {
        entity_id: row.get(0)?,
        email: row.get(1)?,
        account_ids: serde_json::from_str(&account_ids).unwrap_or_default(),
    })
}
