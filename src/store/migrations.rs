//! Version-tracked database migrations for the libSQL backend.
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
        name: "inbound_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                business_name TEXT NOT NULL,
                owner_name TEXT NOT NULL,
                owner_phone TEXT NOT NULL,
                transport_address TEXT NOT NULL UNIQUE,
                region TEXT NOT NULL DEFAULT '',
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS conversation_turns (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                phone TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                speaker TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_turns_subject
                ON conversation_turns(phone, tenant_id);

            CREATE TABLE IF NOT EXISTS leads (
                phone TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                name TEXT,
                address TEXT,
                contact_phone TEXT,
                problem TEXT,
                urgent INTEGER NOT NULL DEFAULT 0,
                channel TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (phone, tenant_id)
            );
            CREATE INDEX IF NOT EXISTS idx_leads_tenant ON leads(tenant_id);

            CREATE TABLE IF NOT EXISTS quotes (
                id TEXT PRIMARY KEY,
                phone TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                problem TEXT,
                estimate_low INTEGER NOT NULL DEFAULT 0,
                estimate_high INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'sent',
                created_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "session_completions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS session_completions (
                subject_phone TEXT NOT NULL,
                tenant_address TEXT NOT NULL,
                session_id TEXT NOT NULL,
                notified INTEGER NOT NULL DEFAULT 0,
                operator_phone TEXT,
                from_address TEXT,
                alert_body TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                notified_at TEXT,
                PRIMARY KEY (subject_phone, tenant_address, session_id)
            );
            CREATE INDEX IF NOT EXISTS idx_completions_pending
                ON session_completions(notified);
        "#,
    },
    Migration {
        version: 3,
        name: "outbound_campaign",
        sql: r#"
            CREATE TABLE IF NOT EXISTS prospects (
                phone TEXT PRIMARY KEY,
                business_name TEXT NOT NULL,
                owner_name TEXT,
                city TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                sms_sent INTEGER NOT NULL DEFAULT 0,
                responded INTEGER NOT NULL DEFAULT 0,
                demo_called INTEGER NOT NULL DEFAULT 0,
                demo_answered INTEGER NOT NULL DEFAULT 0,
                trial_activated INTEGER NOT NULL DEFAULT 0,
                follow_up_count INTEGER NOT NULL DEFAULT 0,
                next_follow_up_at TEXT,
                last_follow_up_at TEXT,
                trial_started_at TEXT,
                trial_reminder_sent INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_prospects_status ON prospects(status);
            CREATE INDEX IF NOT EXISTS idx_prospects_next ON prospects(next_follow_up_at);

            CREATE TABLE IF NOT EXISTS outbound_events (
                id TEXT PRIMARY KEY,
                phone TEXT NOT NULL,
                event TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outbound_events_phone ON outbound_events(phone);

            CREATE TABLE IF NOT EXISTS demo_sessions (
                prospect_phone TEXT PRIMARY KEY,
                business_name TEXT NOT NULL,
                owner_name TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
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

    tracing::info!(
        "Database migrations complete (at V{})",
        get_current_version(conn).await?
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
            "conversation_turns",
            "leads",
            "quotes",
            "session_completions",
            "prospects",
            "outbound_events",
            "demo_sessions",
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
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        let n1: String = row1.get(1).unwrap();
        assert_eq!(n1, "inbound_schema");

        let row3 = {
            rows.next().await.unwrap().unwrap();
            rows.next().await.unwrap().unwrap()
        };
        let v3: i64 = row3.get(0).unwrap();
        let n3: String = row3.get(1).unwrap();
        assert_eq!(v3, 3);
        assert_eq!(n3, "outbound_campaign");
    }
}
