//! `Persistence` trait: single async interface for all triage state.
//!
//! Every mutation that must be race-free (attempt allocation, fingerprint
//! insert, approval insert and status CAS) is one atomic call here, so the
//! callers never need their own locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::approval::model::{ApprovalItem, ApprovalStatus, CasOutcome, InsertOutcome, Resolution};
use crate::error::DatabaseError;
use crate::escalation::model::EscalationAttempt;
use crate::learning::feedback::WeightSnapshot;
use crate::pipeline::dedupe::DedupeFingerprint;
use crate::pipeline::types::Decision;

/// Backend-agnostic persistence for decisions, dedupe windows, approvals,
/// escalation attempts and learner weights.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ── Decisions ───────────────────────────────────────────────────

    /// Allocate the next attempt number for a message (1 for the first).
    async fn next_attempt(&self, message_id: &str) -> Result<u32, DatabaseError>;

    /// Append a decision. Decisions are never overwritten.
    async fn save_decision(&self, decision: &Decision) -> Result<(), DatabaseError>;

    /// Highest-attempt decision for a message.
    async fn latest_decision(&self, message_id: &str) -> Result<Option<Decision>, DatabaseError>;

    /// All decisions for a message, oldest attempt first.
    async fn decision_history(&self, message_id: &str) -> Result<Vec<Decision>, DatabaseError>;

    // ── Dedupe window ───────────────────────────────────────────────

    /// Most recent `limit` fingerprints for a principal, newest first.
    async fn load_window(
        &self,
        principal: &str,
        limit: usize,
    ) -> Result<Vec<DedupeFingerprint>, DatabaseError>;

    /// Insert a fingerprint unless its message id is already present, then
    /// trim the window to `max_entries` and drop entries received before
    /// `oldest_allowed`. Returns whether the fingerprint was inserted.
    async fn record_fingerprint(
        &self,
        principal: &str,
        fingerprint: &DedupeFingerprint,
        max_entries: usize,
        oldest_allowed: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Remove a message's fingerprint. Returns whether one was present.
    async fn forget_fingerprint(
        &self,
        principal: &str,
        message_id: &str,
    ) -> Result<bool, DatabaseError>;

    // ── Approvals ───────────────────────────────────────────────────

    /// Insert a pending item unless one is already pending for the same
    /// message attempt.
    async fn insert_approval(&self, item: &ApprovalItem) -> Result<InsertOutcome, DatabaseError>;

    async fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalItem>, DatabaseError>;

    /// Items for a principal, oldest first, optionally filtered by status.
    async fn list_approvals(
        &self,
        principal: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalItem>, DatabaseError>;

    /// Atomically apply `resolution` if the item is still in `expected`.
    async fn cas_approval(
        &self,
        id: Uuid,
        expected: ApprovalStatus,
        resolution: &Resolution,
    ) -> Result<CasOutcome, DatabaseError>;

    /// Delete resolved items beyond the newest `keep`. Returns how many were
    /// removed. Pending items are never pruned.
    async fn prune_resolved(&self, principal: &str, keep: usize) -> Result<usize, DatabaseError>;

    // ── Escalation attempts ─────────────────────────────────────────

    async fn record_attempt(&self, attempt: &EscalationAttempt) -> Result<(), DatabaseError>;

    /// Attempts for one message on one channel, in order.
    async fn list_attempts(
        &self,
        message_id: &str,
        channel: &str,
    ) -> Result<Vec<EscalationAttempt>, DatabaseError>;

    // ── Learner weights ─────────────────────────────────────────────

    async fn save_weights(&self, snapshot: &WeightSnapshot) -> Result<(), DatabaseError>;

    /// Latest committed snapshot, if any was saved.
    async fn load_weights(&self) -> Result<Option<WeightSnapshot>, DatabaseError>;
}
