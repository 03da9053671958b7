//! libSQL backend: async `Persistence` implementation.
//!
//! Supports local file and in-memory databases. Rows keep a few indexed
//! columns for querying plus the full record as a JSON `payload`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use crate::approval::model::{ApprovalItem, ApprovalStatus, CasOutcome, InsertOutcome, Resolution};
use crate::error::DatabaseError;
use crate::escalation::model::EscalationAttempt;
use crate::learning::feedback::WeightSnapshot;
use crate::pipeline::dedupe::DedupeFingerprint;
use crate::pipeline::types::Decision;
use crate::store::migrations;
use crate::store::traits::Persistence;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    /// Held so the database outlives its connection.
    _db: Arc<LibSqlDatabase>,
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

        let backend = Self::from_database(db).await?;
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
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            _db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a query and decode the JSON `payload` in column 0 of every row.
    async fn query_payloads<T: DeserializeOwned>(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            let payload: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
            out.push(from_json(&payload)?);
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format; fixed width so text comparison orders by time.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_json<T: Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(payload: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(payload).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Persistence for LibSqlBackend {
    // ── Decisions ───────────────────────────────────────────────────

    async fn next_attempt(&self, message_id: &str) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO attempt_counters (message_id, last_attempt) VALUES (?1, 1)
                 ON CONFLICT(message_id) DO UPDATE SET last_attempt = last_attempt + 1
                 RETURNING last_attempt",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("next_attempt: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("next_attempt: {e}")))?
            .ok_or_else(|| DatabaseError::Query("next_attempt: no row returned".into()))?;
        let attempt: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("next_attempt row parse: {e}")))?;
        u32::try_from(attempt)
            .map_err(|e| DatabaseError::Query(format!("next_attempt out of range: {e}")))
    }

    async fn save_decision(&self, decision: &Decision) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO decisions (message_id, attempt, tier, action, dedupe_status, decided_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    decision.message_id.as_str(),
                    i64::from(decision.attempt),
                    i64::from(decision.tier.number()),
                    decision.action.label(),
                    decision.dedupe_status.label(),
                    ts(decision.decided_at),
                    to_json(decision)?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Constraint(format!("save_decision: {e}")))?;

        debug!(message_id = %decision.message_id, attempt = decision.attempt, "Decision saved");
        Ok(())
    }

    async fn latest_decision(&self, message_id: &str) -> Result<Option<Decision>, DatabaseError> {
        let mut found = self
            .query_payloads(
                "latest_decision",
                "SELECT payload FROM decisions WHERE message_id = ?1 ORDER BY attempt DESC LIMIT 1",
                params![message_id],
            )
            .await?;
        Ok(found.pop())
    }

    async fn decision_history(&self, message_id: &str) -> Result<Vec<Decision>, DatabaseError> {
        self.query_payloads(
            "decision_history",
            "SELECT payload FROM decisions WHERE message_id = ?1 ORDER BY attempt ASC",
            params![message_id],
        )
        .await
    }

    // ── Dedupe window ───────────────────────────────────────────────

    async fn load_window(
        &self,
        principal: &str,
        limit: usize,
    ) -> Result<Vec<DedupeFingerprint>, DatabaseError> {
        self.query_payloads(
            "load_window",
            "SELECT payload FROM fingerprints WHERE principal = ?1 ORDER BY seq DESC LIMIT ?2",
            params![principal, limit as i64],
        )
        .await
    }

    async fn record_fingerprint(
        &self,
        principal: &str,
        fingerprint: &DedupeFingerprint,
        max_entries: usize,
        oldest_allowed: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO fingerprints (principal, message_id, received_at, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    principal,
                    fingerprint.message_id.as_str(),
                    ts(fingerprint.received_at),
                    to_json(fingerprint)?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_fingerprint: {e}")))?;

        let trimmed = conn
            .execute(
                "DELETE FROM fingerprints WHERE principal = ?1 AND (
                    received_at < ?2
                    OR seq NOT IN (
                        SELECT seq FROM fingerprints WHERE principal = ?1 ORDER BY seq DESC LIMIT ?3
                    )
                 )",
                params![principal, ts(oldest_allowed), max_entries as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_fingerprint trim: {e}")))?;
        if trimmed > 0 {
            debug!(principal, trimmed, "Dedupe window trimmed");
        }

        Ok(inserted == 1)
    }

    async fn forget_fingerprint(
        &self,
        principal: &str,
        message_id: &str,
    ) -> Result<bool, DatabaseError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM fingerprints WHERE principal = ?1 AND message_id = ?2",
                params![principal, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("forget_fingerprint: {e}")))?;
        Ok(removed > 0)
    }

    // ── Approvals ───────────────────────────────────────────────────

    async fn insert_approval(&self, item: &ApprovalItem) -> Result<InsertOutcome, DatabaseError> {
        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO approvals
                 (id, principal, message_id, attempt, item_type, status, tier, created_at, resolved_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    item.id.to_string(),
                    item.principal.as_str(),
                    item.message_id.as_str(),
                    i64::from(item.attempt),
                    item.item_type.as_str(),
                    item.status.as_str(),
                    i64::from(item.tier.number()),
                    ts(item.created_at),
                    opt_text(item.resolved_at.map(ts)),
                    to_json(item)?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_approval: {e}")))?;

        if inserted == 1 {
            debug!(approval_id = %item.id, message_id = %item.message_id, "Approval inserted into DB");
            return Ok(InsertOutcome::Inserted);
        }

        let existing: Vec<ApprovalItem> = self
            .query_payloads(
                "insert_approval",
                "SELECT payload FROM approvals
                 WHERE principal = ?1 AND message_id = ?2 AND attempt = ?3 AND status = 'pending'",
                params![
                    item.principal.as_str(),
                    item.message_id.as_str(),
                    i64::from(item.attempt)
                ],
            )
            .await?;
        match existing.first() {
            Some(pending) => Ok(InsertOutcome::PendingExists {
                existing: pending.id,
            }),
            None => Err(DatabaseError::Constraint(format!(
                "approval {} already exists",
                item.id
            ))),
        }
    }

    async fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalItem>, DatabaseError> {
        let mut found = self
            .query_payloads(
                "get_approval",
                "SELECT payload FROM approvals WHERE id = ?1",
                params![id.to_string()],
            )
            .await?;
        Ok(found.pop())
    }

    async fn list_approvals(
        &self,
        principal: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalItem>, DatabaseError> {
        match status {
            Some(status) => {
                self.query_payloads(
                    "list_approvals",
                    "SELECT payload FROM approvals WHERE principal = ?1 AND status = ?2
                     ORDER BY created_at ASC, id ASC",
                    params![principal, status.as_str()],
                )
                .await
            }
            None => {
                self.query_payloads(
                    "list_approvals",
                    "SELECT payload FROM approvals WHERE principal = ?1
                     ORDER BY created_at ASC, id ASC",
                    params![principal],
                )
                .await
            }
        }
    }

    async fn cas_approval(
        &self,
        id: Uuid,
        expected: ApprovalStatus,
        resolution: &Resolution,
    ) -> Result<CasOutcome, DatabaseError> {
        let Some(mut item) = self.get_approval(id).await? else {
            return Ok(CasOutcome::Missing);
        };
        if item.status != expected || item.apply(resolution).is_err() {
            return Ok(CasOutcome::Conflict(item.status));
        }

        // The status guard makes this the linearization point: of several
        // resolvers that read the same pending row, exactly one updates it.
        let updated = self
            .conn()
            .execute(
                "UPDATE approvals SET status = ?1, resolved_at = ?2, payload = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    item.status.as_str(),
                    opt_text(item.resolved_at.map(ts)),
                    to_json(&item)?,
                    id.to_string(),
                    expected.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cas_approval: {e}")))?;

        if updated == 1 {
            return Ok(CasOutcome::Applied(item));
        }
        match self.get_approval(id).await? {
            Some(current) => Ok(CasOutcome::Conflict(current.status)),
            None => Ok(CasOutcome::Missing),
        }
    }

    async fn prune_resolved(&self, principal: &str, keep: usize) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM approvals WHERE principal = ?1 AND status != 'pending' AND id NOT IN (
                    SELECT id FROM approvals WHERE principal = ?1 AND status != 'pending'
                    ORDER BY COALESCE(resolved_at, created_at) DESC LIMIT ?2
                 )",
                params![principal, keep as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_resolved: {e}")))?;

        if count > 0 {
            info!(count, keep, "Pruned resolved approvals from DB");
        }
        Ok(count as usize)
    }

    // ── Escalation attempts ─────────────────────────────────────────

    async fn record_attempt(&self, attempt: &EscalationAttempt) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO escalation_attempts (id, message_id, channel, attempt_number, outcome, at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    attempt.id.to_string(),
                    attempt.message_id.as_str(),
                    attempt.channel.as_str(),
                    i64::from(attempt.attempt_number),
                    attempt.outcome.as_str(),
                    ts(attempt.at),
                    to_json(attempt)?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_attempt: {e}")))?;
        Ok(())
    }

    async fn list_attempts(
        &self,
        message_id: &str,
        channel: &str,
    ) -> Result<Vec<EscalationAttempt>, DatabaseError> {
        self.query_payloads(
            "list_attempts",
            "SELECT payload FROM escalation_attempts WHERE message_id = ?1 AND channel = ?2
             ORDER BY rowid ASC",
            params![message_id, channel],
        )
        .await
    }

    // ── Learner weights ─────────────────────────────────────────────

    async fn save_weights(&self, snapshot: &WeightSnapshot) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO learner_weights (version, committed_at, payload) VALUES (?1, ?2, ?3)",
                params![
                    snapshot.version as i64,
                    ts(snapshot.committed_at),
                    to_json(snapshot)?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_weights: {e}")))?;
        Ok(())
    }

    async fn load_weights(&self) -> Result<Option<WeightSnapshot>, DatabaseError> {
        let mut found = self
            .query_payloads(
                "load_weights",
                "SELECT payload FROM learner_weights ORDER BY version DESC LIMIT 1",
                (),
            )
            .await?;
        Ok(found.pop())
    }
}
