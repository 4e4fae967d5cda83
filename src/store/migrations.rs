//! Version-tracked migrations for the system database.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "tenant_directory",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS tenant_details (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                store_name TEXT NOT NULL,
                tax_id TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_tenant_details_tenant ON tenant_details(tenant_id);

            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                detail_id TEXT NOT NULL REFERENCES tenant_details(id) ON DELETE CASCADE,
                bank_name TEXT,
                account_number TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_accounts_detail ON accounts(detail_id);
        "#,
    },
    Migration {
        version: 2,
        name: "mailbox_watches",
        sql: r#"
            CREATE TABLE IF NOT EXISTS watches (
                mailbox TEXT PRIMARY KEY,
                history_cursor INTEGER NOT NULL DEFAULT 0,
                expiration TEXT NOT NULL,
                topic TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_watches_status ON watches(status);
        "#,
    },
    Migration {
        version: 3,
        name: "forwarding_rules",
        sql: r#"
            CREATE TABLE IF NOT EXISTS forwarding_configs (
                entity_id TEXT PRIMARY KEY,
                active INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS forwarding_rules (
                entity_id TEXT NOT NULL REFERENCES forwarding_configs(entity_id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                email TEXT NOT NULL,
                account_ids TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (entity_id, email)
            );
            CREATE INDEX IF NOT EXISTS idx_forwarding_rules_email ON forwarding_rules(email);
        "#,
    },
    Migration {
        version: 4,
        name: "raw_emails",
        sql: r#"
            CREATE TABLE IF NOT EXISTS raw_emails (
                id TEXT PRIMARY KEY,
                provider_message_id TEXT NOT NULL UNIQUE,
                thread_id TEXT NOT NULL,
                history_cursor INTEGER NOT NULL DEFAULT 0,
                message_id TEXT,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                received_at TEXT NOT NULL,
                headers TEXT NOT NULL DEFAULT '{}',
                text_body TEXT,
                html_body TEXT,
                labels TEXT NOT NULL DEFAULT '[]',
                attachments TEXT NOT NULL DEFAULT '[]',
                routing TEXT,
                entity_id TEXT,
                parsed TEXT,
                transaction_variables TEXT,
                transaction_type TEXT,
                enriched INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                processed_at TEXT,
                error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_raw_emails_entity ON raw_emails(entity_id, processed);
            CREATE INDEX IF NOT EXISTS idx_raw_emails_received ON raw_emails(received_at);
        "#,
    },
];

/// Apply all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        version = get_current_version(conn).await?,
        "Database migrations complete"
    );

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "tenants",
            "tenant_details",
            "accounts",
            "watches",
            "forwarding_configs",
            "forwarding_rules",
            "raw_emails",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 4);
    }

    #[tokio::test]
    async fn provider_message_id_is_unique() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let insert = "INSERT INTO raw_emails (id, provider_message_id, thread_id, sender, subject, received_at, created_at)
                      VALUES (?1, 'm1', 't1', 'a@b.c', 's', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')";
        conn.execute(insert, libsql::params!["r1"]).await.unwrap();
        assert!(conn.execute(insert, libsql::params!["r2"]).await.is_err());
    }
}
