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
        name: "triage_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS attempt_counters (
                message_id TEXT PRIMARY KEY,
                last_attempt INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS decisions (
                message_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                tier INTEGER NOT NULL,
                action TEXT NOT NULL,
                dedupe_status TEXT NOT NULL,
                decided_at TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (message_id, attempt)
            );

            CREATE TABLE IF NOT EXISTS fingerprints (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                principal TEXT NOT NULL,
                message_id TEXT NOT NULL,
                received_at TEXT NOT NULL,
                payload TEXT NOT NULL,
                UNIQUE (principal, message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_fingerprints_received
                ON fingerprints(principal, received_at);

            CREATE TABLE IF NOT EXISTS approvals (
                id TEXT PRIMARY KEY,
                principal TEXT NOT NULL,
                message_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                item_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                tier INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_approvals_principal_status
                ON approvals(principal, status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_approvals_one_pending
                ON approvals(principal, message_id, attempt) WHERE status = 'pending';
        "#,
    },
    Migration {
        version: 2,
        name: "escalation_and_learning",
        sql: r#"
            CREATE TABLE IF NOT EXISTS escalation_attempts (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                attempt_number INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                at TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_escalation_attempts_key
                ON escalation_attempts(message_id, channel);

            CREATE TABLE IF NOT EXISTS learner_weights (
                version INTEGER PRIMARY KEY,
                committed_at TEXT NOT NULL,
                payload TEXT NOT NULL
            );
        "#,
    },
];

/// Run all pending migrations.
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
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
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
