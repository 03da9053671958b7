//! In-memory `Persistence` implementation.
//!
//! Each collection sits behind its own tokio lock; every trait method takes
//! at most one write lock, which is what makes insert-if-absent and CAS
//! atomic here.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::approval::model::{ApprovalItem, ApprovalStatus, CasOutcome, InsertOutcome, Resolution};
use crate::error::DatabaseError;
use crate::escalation::model::EscalationAttempt;
use crate::learning::feedback::WeightSnapshot;
use crate::pipeline::dedupe::{DedupeFingerprint, DedupeWindow};
use crate::pipeline::types::Decision;
use crate::store::traits::Persistence;

#[derive(Debug, Default)]
pub struct MemoryStore {
    attempt_counters: Mutex<HashMap<String, u32>>,
    decisions: RwLock<HashMap<String, Vec<Decision>>>,
    windows: Mutex<HashMap<String, DedupeWindow>>,
    approvals: RwLock<HashMap<Uuid, ApprovalItem>>,
    attempts: RwLock<Vec<EscalationAttempt>>,
    weights: RwLock<Option<WeightSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn next_attempt(&self, message_id: &str) -> Result<u32, DatabaseError> {
        let mut counters = self.attempt_counters.lock().await;
        let counter = counters.entry(message_id.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn save_decision(&self, decision: &Decision) -> Result<(), DatabaseError> {
        let mut decisions = self.decisions.write().await;
        let history = decisions.entry(decision.message_id.clone()).or_default();
        if history.iter().any(|d| d.attempt == decision.attempt) {
            return Err(DatabaseError::Constraint(format!(
                "decision {} attempt {} already saved",
                decision.message_id, decision.attempt
            )));
        }
        history.push(decision.clone());
        history.sort_by_key(|d| d.attempt);
        Ok(())
    }

    async fn latest_decision(&self, message_id: &str) -> Result<Option<Decision>, DatabaseError> {
        Ok(self
            .decisions
            .read()
            .await
            .get(message_id)
            .and_then(|history| history.last().cloned()))
    }

    async fn decision_history(&self, message_id: &str) -> Result<Vec<Decision>, DatabaseError> {
        Ok(self
            .decisions
            .read()
            .await
            .get(message_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn load_window(
        &self,
        principal: &str,
        limit: usize,
    ) -> Result<Vec<DedupeFingerprint>, DatabaseError> {
        Ok(self
            .windows
            .lock()
            .await
            .get(principal)
            .map(|w| w.recent(limit))
            .unwrap_or_default())
    }

    async fn record_fingerprint(
        &self,
        principal: &str,
        fingerprint: &DedupeFingerprint,
        max_entries: usize,
        oldest_allowed: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut windows = self.windows.lock().await;
        Ok(windows
            .entry(principal.to_string())
            .or_default()
            .insert_if_absent(fingerprint.clone(), max_entries, oldest_allowed))
    }

    async fn forget_fingerprint(
        &self,
        principal: &str,
        message_id: &str,
    ) -> Result<bool, DatabaseError> {
        Ok(self
            .windows
            .lock()
            .await
            .get_mut(principal)
            .is_some_and(|w| w.remove(message_id)))
    }

    async fn insert_approval(&self, item: &ApprovalItem) -> Result<InsertOutcome, DatabaseError> {
        let mut approvals = self.approvals.write().await;
        if let Some(existing) = approvals.values().find(|a| {
            a.status == ApprovalStatus::Pending
                && a.principal == item.principal
                && a.message_id == item.message_id
                && a.attempt == item.attempt
        }) {
            return Ok(InsertOutcome::PendingExists {
                existing: existing.id,
            });
        }
        if approvals.contains_key(&item.id) {
            return Err(DatabaseError::Constraint(format!(
                "approval {} already exists",
                item.id
            )));
        }
        approvals.insert(item.id, item.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalItem>, DatabaseError> {
        Ok(self.approvals.read().await.get(&id).cloned())
    }

    async fn list_approvals(
        &self,
        principal: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalItem>, DatabaseError> {
        let mut items: Vec<ApprovalItem> = self
            .approvals
            .read()
            .await
            .values()
            .filter(|a| a.principal == principal && status.is_none_or(|s| a.status == s))
            .cloned()
            .collect();
        items.sort_by_key(|a| (a.created_at, a.id));
        Ok(items)
    }

    async fn cas_approval(
        &self,
        id: Uuid,
        expected: ApprovalStatus,
        resolution: &Resolution,
    ) -> Result<CasOutcome, DatabaseError> {
        let mut approvals = self.approvals.write().await;
        let Some(item) = approvals.get_mut(&id) else {
            return Ok(CasOutcome::Missing);
        };
        if item.status != expected {
            return Ok(CasOutcome::Conflict(item.status));
        }
        let mut updated = item.clone();
        if updated.apply(resolution).is_err() {
            return Ok(CasOutcome::Conflict(item.status));
        }
        *item = updated.clone();
        Ok(CasOutcome::Applied(updated))
    }

    async fn prune_resolved(&self, principal: &str, keep: usize) -> Result<usize, DatabaseError> {
        let mut approvals = self.approvals.write().await;
        let mut resolved: Vec<(DateTime<Utc>, Uuid)> = approvals
            .values()
            .filter(|a| a.principal == principal && a.status.is_terminal())
            .map(|a| (a.resolved_at.unwrap_or(a.created_at), a.id))
            .collect();
        if resolved.len() <= keep {
            return Ok(0);
        }
        // Newest first; everything past `keep` goes.
        resolved.sort_by(|a, b| b.cmp(a));
        let doomed = &resolved[keep..];
        for (_, id) in doomed {
            approvals.remove(id);
        }
        Ok(doomed.len())
    }

    async fn record_attempt(&self, attempt: &EscalationAttempt) -> Result<(), DatabaseError> {
        self.attempts.write().await.push(attempt.clone());
        Ok(())
    }

    async fn list_attempts(
        &self,
        message_id: &str,
        channel: &str,
    ) -> Result<Vec<EscalationAttempt>, DatabaseError> {
        Ok(self
            .attempts
            .read()
            .await
            .iter()
            .filter(|a| a.message_id == message_id && a.channel == channel)
            .cloned()
            .collect())
    }

    async fn save_weights(&self, snapshot: &WeightSnapshot) -> Result<(), DatabaseError> {
        *self.weights.write().await = Some(snapshot.clone());
        Ok(())
    }

    async fn load_weights(&self) -> Result<Option<WeightSnapshot>, DatabaseError> {
        Ok(self.weights.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::approval::model::ApprovalType;
    use crate::pipeline::types::{Action, DedupeStatus, Tier};

    fn decision(id: &str, attempt: u32) -> Decision {
        Decision {
            message_id: id.into(),
            attempt,
            sender: "a@example.com".into(),
            subject: "s".into(),
            tier: Tier::Review,
            action: Action::Draft,
            reason: "No rule matched; requires review".into(),
            dedupe_status: DedupeStatus::Unique,
            confidence: 0.5,
            features: Default::default(),
            config_version: 1,
            decided_at: Utc::now(),
        }
    }

    fn resolve(status: ApprovalStatus) -> Resolution {
        Resolution {
            status,
            resolver: Some("me".into()),
            notes: None,
            content: None,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn attempts_are_sequential() {
        let store = MemoryStore::new();
        assert_eq!(store.next_attempt("m").await.unwrap(), 1);
        assert_eq!(store.next_attempt("m").await.unwrap(), 2);
        assert_eq!(store.next_attempt("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn latest_decision_is_highest_attempt() {
        let store = MemoryStore::new();
        store.save_decision(&decision("m", 2)).await.unwrap();
        store.save_decision(&decision("m", 1)).await.unwrap();
        assert_eq!(store.latest_decision("m").await.unwrap().unwrap().attempt, 2);
        assert_eq!(store.decision_history("m").await.unwrap().len(), 2);
        assert!(store.save_decision(&decision("m", 2)).await.is_err());
    }

    #[tokio::test]
    async fn second_pending_item_for_same_attempt_conflicts() {
        let store = MemoryStore::new();
        let d = decision("m", 1);
        let first = ApprovalItem::new("me", &d, ApprovalType::Response, "x", Utc::now());
        let second = ApprovalItem::new("me", &d, ApprovalType::Response, "y", Utc::now());
        assert_eq!(store.insert_approval(&first).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            store.insert_approval(&second).await.unwrap(),
            InsertOutcome::PendingExists { existing: first.id }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cas_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let item = ApprovalItem::new("me", &decision("m", 1), ApprovalType::Response, "x", Utc::now());
        store.insert_approval(&item).await.unwrap();
        let id = item.id;

        let handles: Vec<_> = [ApprovalStatus::Approved, ApprovalStatus::Rejected, ApprovalStatus::Expired]
            .into_iter()
            .map(|status| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .cas_approval(id, ApprovalStatus::Pending, &resolve(status))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), CasOutcome::Applied(_)) {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        let stored = store.get_approval(id).await.unwrap().unwrap();
        assert_eq!(stored.history.len(), 1);
    }

    #[tokio::test]
    async fn prune_keeps_pending_and_newest_resolved() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for i in 0..4 {
            let item = ApprovalItem::new("me", &decision(&format!("m{i}"), 1), ApprovalType::Response, "x", Utc::now());
            store.insert_approval(&item).await.unwrap();
            ids.push(item.id);
        }
        for id in &ids[..3] {
            store
                .cas_approval(*id, ApprovalStatus::Pending, &resolve(ApprovalStatus::Rejected))
                .await
                .unwrap();
        }

        assert_eq!(store.prune_resolved("me", 1).await.unwrap(), 2);
        let remaining = store.list_approvals("me", None).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|a| a.id == ids[3]));
    }
}
