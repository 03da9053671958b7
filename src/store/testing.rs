//! `MemoryStore` wrapper with injectable faults, for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::approval::model::{ApprovalItem, ApprovalStatus, CasOutcome, InsertOutcome, Resolution};
use crate::error::DatabaseError;
use crate::escalation::model::EscalationAttempt;
use crate::learning::feedback::WeightSnapshot;
use crate::pipeline::dedupe::DedupeFingerprint;
use crate::pipeline::types::Decision;
use crate::store::memory::MemoryStore;
use crate::store::traits::Persistence;

#[derive(Debug, Default)]
pub(crate) struct FaultyStore {
    inner: MemoryStore,
    failing_saves: AtomicU32,
    failing_attempt_records: AtomicU32,
    stalled_window: AtomicBool,
}

/// Consume one pending fault, if any.
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl FaultyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` decision saves.
    pub(crate) fn fail_saves(&self, n: u32) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` escalation attempt records.
    pub(crate) fn fail_attempt_records(&self, n: u32) {
        self.failing_attempt_records.store(n, Ordering::SeqCst);
    }

    /// Make window loads hang.
    pub(crate) fn stall_window(&self) {
        self.stalled_window.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Persistence for FaultyStore {
    async fn next_attempt(&self, id: &str) -> Result<u32, DatabaseError> {
        self.inner.next_attempt(id).await
    }

    async fn save_decision(&self, d: &Decision) -> Result<(), DatabaseError> {
        if take(&self.failing_saves) {
            return Err(DatabaseError::Query("disk I/O error".into()));
        }
        self.inner.save_decision(d).await
    }

    async fn latest_decision(&self, id: &str) -> Result<Option<Decision>, DatabaseError> {
        self.inner.latest_decision(id).await
    }

    async fn decision_history(&self, id: &str) -> Result<Vec<Decision>, DatabaseError> {
        self.inner.decision_history(id).await
    }

    async fn load_window(
        &self,
        principal: &str,
        limit: usize,
    ) -> Result<Vec<DedupeFingerprint>, DatabaseError> {
        if self.stalled_window.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.inner.load_window(principal, limit).await
    }

    async fn record_fingerprint(
        &self,
        p: &str,
        fp: &DedupeFingerprint,
        max: usize,
        oldest: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        self.inner.record_fingerprint(p, fp, max, oldest).await
    }

    async fn forget_fingerprint(&self, p: &str, id: &str) -> Result<bool, DatabaseError> {
        self.inner.forget_fingerprint(p, id).await
    }

    async fn insert_approval(&self, item: &ApprovalItem) -> Result<InsertOutcome, DatabaseError> {
        self.inner.insert_approval(item).await
    }

    async fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalItem>, DatabaseError> {
        self.inner.get_approval(id).await
    }

    async fn list_approvals(
        &self,
        p: &str,
        s: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalItem>, DatabaseError> {
        self.inner.list_approvals(p, s).await
    }

    async fn cas_approval(
        &self,
        id: Uuid,
        expected: ApprovalStatus,
        r: &Resolution,
    ) -> Result<CasOutcome, DatabaseError> {
        self.inner.cas_approval(id, expected, r).await
    }

    async fn prune_resolved(&self, p: &str, keep: usize) -> Result<usize, DatabaseError> {
        self.inner.prune_resolved(p, keep).await
    }

    async fn record_attempt(&self, a: &EscalationAttempt) -> Result<(), DatabaseError> {
        if take(&self.failing_attempt_records) {
            return Err(DatabaseError::Query("database is locked".into()));
        }
        self.inner.record_attempt(a).await
    }

    async fn list_attempts(&self, m: &str, c: &str) -> Result<Vec<EscalationAttempt>, DatabaseError> {
        self.inner.list_attempts(m, c).await
    }

    async fn save_weights(&self, s: &WeightSnapshot) -> Result<(), DatabaseError> {
        self.inner.save_weights(s).await
    }

    async fn load_weights(&self) -> Result<Option<WeightSnapshot>, DatabaseError> {
        self.inner.load_weights().await
    }
}
