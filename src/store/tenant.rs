//! Per-tenant store: one isolated libSQL database per tenant-detail.
//!
//! The schema is a fixed set of record kinds; opening a store ensures every
//! kind's table exists.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::libsql_backend::{opt_text, parse_datetime, parse_optional_datetime};

/// Record kinds held in every tenant store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Raw capture from the secondary (IMAP) source.
    SecondaryRaw,
    /// Canonical record merged from both raw sources.
    Transaction,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::SecondaryRaw, RecordKind::Transaction];

    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::SecondaryRaw => "secondary_raw",
            RecordKind::Transaction => "transactions",
        }
    }

    fn ddl(&self) -> &'static str {
        match self {
            RecordKind::SecondaryRaw => {
                r#"
                CREATE TABLE IF NOT EXISTS secondary_raw (
                    id TEXT PRIMARY KEY,
                    message_id TEXT NOT NULL UNIQUE,
                    sender TEXT NOT NULL,
                    subject TEXT NOT NULL,
                    body TEXT,
                    received_at TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                "#
            }
            RecordKind::Transaction => {
                r#"
                CREATE TABLE IF NOT EXISTS transactions (
                    message_id TEXT PRIMARY KEY,
                    system_raw_id TEXT NOT NULL,
                    secondary_raw_id TEXT,
                    entity_id TEXT NOT NULL,
                    bank TEXT NOT NULL,
                    account_number TEXT NOT NULL,
                    sender TEXT NOT NULL,
                    subject TEXT NOT NULL,
                    received_at TEXT NOT NULL,
                    amount TEXT,
                    amount_text TEXT,
                    currency TEXT,
                    operation_number TEXT,
                    operation_date TEXT,
                    description TEXT NOT NULL,
                    transaction_type TEXT,
                    transaction_variables TEXT,
                    match_status INTEGER NOT NULL DEFAULT 0,
                    match_at TEXT,
                    processed_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_transactions_match ON transactions(match_status);
                "#
            }
        }
    }
}

/// Independently captured raw record, keyed by the RFC 822 message id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryRawRecord {
    pub id: String,
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub body: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Canonical transaction, keyed by message identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub message_id: String,
    pub system_raw_id: String,
    pub secondary_raw_id: Option<String>,
    pub entity_id: String,
    pub bank: String,
    pub account_number: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub amount: Option<Decimal>,
    pub amount_text: Option<String>,
    pub currency: Option<String>,
    pub operation_number: Option<String>,
    pub operation_date: Option<String>,
    pub description: String,
    pub transaction_type: Option<String>,
    /// JSON text of the enrichment variables.
    pub transaction_variables: Option<String>,
    pub match_status: bool,
    pub match_at: Option<DateTime<Utc>>,
    pub processed_at: DateTime<Utc>,
}

/// Handle to one tenant-detail's database.
pub struct TenantStore {
    detail_id: String,
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl std::fmt::Debug for TenantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantStore")
            .field("detail_id", &self.detail_id)
            .finish_non_exhaustive()
    }
}

impl TenantStore {
    /// Open (or create) a tenant database file.
    pub async fn open_local(path: &Path, detail_id: &str) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create tenant directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open tenant database: {e}")))?;
        let store = Self::from_db(db, detail_id).await?;
        info!(detail_id = detail_id, path = %path.display(), "Tenant store opened");
        Ok(store)
    }

    /// In-memory tenant store (for tests).
    pub async fn open_memory(detail_id: &str) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_db(db, detail_id).await
    }

    async fn from_db(db: LibSqlDatabase, detail_id: &str) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        for kind in RecordKind::ALL {
            conn.execute_batch(kind.ddl()).await.map_err(|e| {
                DatabaseError::Migration(format!("Failed to ensure {}: {e}", kind.table()))
            })?;
        }
        Ok(Self {
            detail_id: detail_id.to_string(),
            db: Arc::new(db),
            conn,
        })
    }

    pub fn detail_id(&self) -> &str {
        &self.detail_id
    }

    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute_batch(sql)
            .await
            .map(|_| ())
            .map_err(|e| DatabaseError::Query(format!("execute_batch: {e}")))
    }

    /// Number of rows of one kind.
    pub async fn count(&self, kind: RecordKind) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn
            .query(&format!("SELECT COUNT(*) FROM {}", kind.table()), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
                Ok(n.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count: {e}"))),
        }
    }

    // ── Secondary raw ───────────────────────────────────────────────

    pub async fn insert_secondary(&self, record: &SecondaryRawRecord) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO secondary_raw (id, message_id, sender, subject, body, received_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(message_id) DO NOTHING",
                params![
                    record.id.as_str(),
                    record.message_id.as_str(),
                    record.sender.as_str(),
                    record.subject.as_str(),
                    opt_text(record.body.as_deref()),
                    record.received_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_secondary: {e}")))?;
        Ok(())
    }

    pub async fn find_secondary(
        &self,
        message_id: &str,
    ) -> Result<Option<SecondaryRawRecord>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, message_id, sender, subject, body, received_at
                 FROM secondary_raw WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_secondary: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_secondary(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("find_secondary: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_secondary: {e}"))),
        }
    }

    // ── Transactions ────────────────────────────────────────────────

    /// Insert or update by message id. A matched record is never downgraded
    /// and its first match time is kept.
    pub async fn upsert_transaction(&self, tx: &TransactionRecord) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO transactions (message_id, system_raw_id, secondary_raw_id, entity_id,
                    bank, account_number, sender, subject, received_at, amount, amount_text,
                    currency, operation_number, operation_date, description, transaction_type,
                    transaction_variables, match_status, match_at, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20)
                 ON CONFLICT(message_id) DO UPDATE SET
                    system_raw_id = excluded.system_raw_id,
                    secondary_raw_id = COALESCE(excluded.secondary_raw_id, transactions.secondary_raw_id),
                    entity_id = excluded.entity_id,
                    bank = excluded.bank,
                    account_number = excluded.account_number,
                    sender = excluded.sender,
                    subject = excluded.subject,
                    received_at = excluded.received_at,
                    amount = excluded.amount,
                    amount_text = excluded.amount_text,
                    currency = excluded.currency,
                    operation_number = excluded.operation_number,
                    operation_date = excluded.operation_date,
                    description = excluded.description,
                    transaction_type = excluded.transaction_type,
                    transaction_variables = excluded.transaction_variables,
                    match_status = MAX(transactions.match_status, excluded.match_status),
                    match_at = COALESCE(transactions.match_at, excluded.match_at),
                    processed_at = excluded.processed_at",
                params![
                    tx.message_id.as_str(),
                    tx.system_raw_id.as_str(),
                    opt_text(tx.secondary_raw_id.as_deref()),
                    tx.entity_id.as_str(),
                    tx.bank.as_str(),
                    tx.account_number.as_str(),
                    tx.sender.as_str(),
                    tx.subject.as_str(),
                    tx.received_at.to_rfc3339(),
                    opt_text(tx.amount.map(|a| a.to_string()).as_deref()),
                    opt_text(tx.amount_text.as_deref()),
                    opt_text(tx.currency.as_deref()),
                    opt_text(tx.operation_number.as_deref()),
                    opt_text(tx.operation_date.as_deref()),
                    tx.description.as_str(),
                    opt_text(tx.transaction_type.as_deref()),
                    opt_text(tx.transaction_variables.as_deref()),
                    tx.match_status as i64,
                    opt_text(tx.match_at.map(|t| t.to_rfc3339()).as_deref()),
                    tx.processed_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_transaction: {e}")))?;

        debug!(
            detail_id = %self.detail_id,
            message_id = %tx.message_id,
            matched = tx.match_status,
            "Transaction upserted"
        );
        Ok(())
    }

    pub async fn get_transaction(
        &self,
        message_id: &str,
    ) -> Result<Option<TransactionRecord>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT message_id, system_raw_id, secondary_raw_id, entity_id, bank,
                    account_number, sender, subject, received_at, amount, amount_text, currency,
                    operation_number, operation_date, description, transaction_type,
                    transaction_variables, match_status, match_at, processed_at
                 FROM transactions WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_transaction: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_transaction(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_transaction: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_transaction: {e}"))),
        }
    }
}

fn row_to_secondary(row: &libsql::Row) -> Result<SecondaryRawRecord, libsql::Error> {
    let received_at: String = row.get(5)?;
    Ok(SecondaryRawRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        sender: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        received_at: parse_datetime(&received_at),
    })
}

fn row_to_transaction(row: &libsql::Row) -> Result<TransactionRecord, libsql::Error> {
    let received_at: String = row.get(8)?;
    let amount: Option<String> = row.get(9)?;
    let match_status: i64 = row.get(17)?;
    let match_at: Option<String> = row.get(18)?;
    let processed_at: String = row.get(19)?;

    Ok(TransactionRecord {
        message_id: row.get(0)?,
        system_raw_id: row.get(1)?,
        secondary_raw_id: row.get(2)?,
        entity_id: row.get(3)?,
        bank: row.get(4)?,
        account_number: row.get(5)?,
        sender: row.get(6)?,
        subject: row.get(7)?,
        received_at: parse_datetime(&received_at),
        amount: amount.and_then(|a| a.parse().ok()),
        amount_text: row.get(10)?,
        currency: row.get(11)?,
        operation_number: row.get(12)?,
        operation_date: row.get(13)?,
        description: row.get(14)?,
        transaction_type: row.get(15)?,
        transaction_variables: row.get(16)?,
        match_status: match_status != 0,
        match_at: parse_optional_datetime(&match_at),
        processed_at: parse_datetime(&processed_at),
    })
}
