//! Approval queue: lifecycle operations over persisted approval items,
//! with a broadcast channel for front ends.
//!
//! Every status change is a compare-and-swap through the persistence
//! collaborator, so concurrent approve/reject/expire calls on the same item
//! produce exactly one winner.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    ApprovalItem, ApprovalStats, ApprovalStatus, ApprovalType, CasOutcome, InsertOutcome,
    QueueEvent, Resolution,
};
use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::error::ApprovalError;
use crate::pipeline::types::{Decision, Tier};
use crate::store::traits::Persistence;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Per-id failure in a bulk operation.
#[derive(Debug, Clone)]
pub struct BulkFailure {
    pub id: Uuid,
    pub error: ApprovalError,
}

/// Split result of a bulk approval.
#[derive(Debug, Clone, Default)]
pub struct BulkResult {
    pub successful: Vec<ApprovalItem>,
    pub failed: Vec<BulkFailure>,
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub pruned: usize,
}

pub struct ApprovalQueue {
    principal: String,
    store: Arc<dyn Persistence>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    tx: broadcast::Sender<QueueEvent>,
}

impl ApprovalQueue {
    pub fn new(
        principal: impl Into<String>,
        store: Arc<dyn Persistence>,
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            principal: principal.into(),
            store,
            config,
            clock,
            tx,
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: QueueEvent) {
        // Ok if nobody is listening.
        let _ = self.tx.send(event);
    }

    /// Queue a new pending item for a decision.
    pub async fn create(
        &self,
        decision: &Decision,
        item_type: ApprovalType,
        proposed_content: impl Into<String>,
    ) -> Result<ApprovalItem, ApprovalError> {
        let item = ApprovalItem::new(
            self.principal.clone(),
            decision,
            item_type,
            proposed_content,
            self.clock.now(),
        );

        match self.store.insert_approval(&item).await? {
            InsertOutcome::Inserted => {
                info!(
                    approval_id = %item.id,
                    message_id = %item.message_id,
                    attempt = item.attempt,
                    item_type = %item.item_type,
                    tier = %item.tier,
                    "Approval item queued"
                );
                self.publish(QueueEvent::Created { item: item.clone() });
                Ok(item)
            }
            InsertOutcome::PendingExists { existing } => Err(ApprovalError::InvalidState {
                reason: format!(
                    "Item {existing} is already pending for message {} attempt {}",
                    decision.message_id, decision.attempt
                ),
            }),
        }
    }

    /// Approve an item. Returns the content to execute: the resolver's
    /// edit when given, otherwise the proposal.
    pub async fn approve(
        &self,
        id: Uuid,
        resolver: &str,
        edits: Option<String>,
    ) -> Result<String, ApprovalError> {
        let item = self.approve_item(id, resolver, edits).await?;
        Ok(item.final_content.unwrap_or(item.proposed_content))
    }

    async fn approve_item(
        &self,
        id: Uuid,
        resolver: &str,
        edits: Option<String>,
    ) -> Result<ApprovalItem, ApprovalError> {
        let edited = edits.is_some();
        let item = self
            .resolve(
                id,
                Resolution {
                    status: ApprovalStatus::Approved,
                    resolver: Some(resolver.to_string()),
                    notes: None,
                    content: edits,
                    at: self.clock.now(),
                },
            )
            .await?;
        info!(approval_id = %id, resolver, edited, "Approval item approved");
        Ok(item)
    }

    pub async fn reject(
        &self,
        id: Uuid,
        resolver: &str,
        reason: Option<String>,
    ) -> Result<ApprovalItem, ApprovalError> {
        let item = self
            .resolve(
                id,
                Resolution {
                    status: ApprovalStatus::Rejected,
                    resolver: Some(resolver.to_string()),
                    notes: reason,
                    content: None,
                    at: self.clock.now(),
                },
            )
            .await?;
        info!(approval_id = %id, resolver, "Approval item rejected");
        Ok(item)
    }

    /// Approve each id independently. One failure never affects the others.
    pub async fn bulk_approve(&self, ids: &[Uuid], resolver: &str) -> BulkResult {
        let mut result = BulkResult::default();
        for &id in ids {
            match self.approve_item(id, resolver, None).await {
                Ok(item) => result.successful.push(item),
                Err(error) => {
                    debug!(approval_id = %id, error = %error, "Bulk approve skipped item");
                    result.failed.push(BulkFailure { id, error });
                }
            }
        }
        info!(
            approved = result.successful.len(),
            failed = result.failed.len(),
            "Bulk approval complete"
        );
        result
    }

    /// Expire a pending item now, regardless of age.
    pub async fn expire(&self, id: Uuid) -> Result<ApprovalItem, ApprovalError> {
        self.resolve(
            id,
            Resolution {
                status: ApprovalStatus::Expired,
                resolver: None,
                notes: Some("Expired without a decision".into()),
                content: None,
                at: self.clock.now(),
            },
        )
        .await
    }

    /// Expire every pending item whose age has reached the TTL, then prune
    /// resolved items beyond the retention threshold.
    pub async fn sweep(&self) -> Result<SweepReport, ApprovalError> {
        let runtime = self.config.snapshot();
        let settings = &runtime.settings.approval;
        let ttl = settings.ttl();
        let now = self.clock.now();

        let mut report = SweepReport::default();
        let pending = self
            .store
            .list_approvals(&self.principal, Some(ApprovalStatus::Pending))
            .await?;
        for item in pending.iter().filter(|item| item.age(now) >= ttl) {
            match self.expire(item.id).await {
                Ok(_) => report.expired += 1,
                // Resolved between listing and expiry.
                Err(ApprovalError::AlreadyResolved { .. } | ApprovalError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        report.pruned = self
            .store
            .prune_resolved(&self.principal, settings.retention_threshold)
            .await?;
        if report.pruned > 0 {
            self.publish(QueueEvent::Pruned {
                count: report.pruned,
            });
        }

        if report.expired > 0 || report.pruned > 0 {
            info!(expired = report.expired, pruned = report.pruned, "Approval sweep complete");
        }
        Ok(report)
    }

    pub async fn get(&self, id: Uuid) -> Result<ApprovalItem, ApprovalError> {
        self.store
            .get_approval(id)
            .await?
            .ok_or(ApprovalError::NotFound { id })
    }

    /// Pending items for a principal, oldest first.
    pub async fn list_pending(&self, principal: &str) -> Result<Vec<ApprovalItem>, ApprovalError> {
        Ok(self
            .store
            .list_approvals(principal, Some(ApprovalStatus::Pending))
            .await?)
    }

    /// Read-only aggregate view of a principal's items.
    pub async fn statistics(&self, principal: &str) -> Result<ApprovalStats, ApprovalError> {
        let items = self.store.list_approvals(principal, None).await?;
        let now = self.clock.now();

        let mut stats = ApprovalStats {
            total: items.len(),
            ..Default::default()
        };
        for tier in Tier::ALL {
            stats.by_tier.insert(tier.number(), 0);
        }

        let mut resolution_secs = Vec::new();
        for item in &items {
            match item.status {
                ApprovalStatus::Pending => {
                    stats.pending += 1;
                    let age = item.age(now).num_seconds();
                    stats.oldest_pending_age_secs =
                        Some(stats.oldest_pending_age_secs.map_or(age, |oldest| oldest.max(age)));
                }
                ApprovalStatus::Approved => stats.approved += 1,
                ApprovalStatus::Rejected => stats.rejected += 1,
                ApprovalStatus::Expired => stats.expired += 1,
            }
            *stats.by_tier.entry(item.tier.number()).or_insert(0) += 1;

            if matches!(item.status, ApprovalStatus::Approved | ApprovalStatus::Rejected)
                && let Some(elapsed) = item.time_to_resolution()
            {
                resolution_secs.push(elapsed.num_milliseconds() as f64 / 1000.0);
            }
        }
        if !resolution_secs.is_empty() {
            stats.average_resolution_secs =
                Some(resolution_secs.iter().sum::<f64>() / resolution_secs.len() as f64);
        }
        Ok(stats)
    }

    async fn resolve(&self, id: Uuid, resolution: Resolution) -> Result<ApprovalItem, ApprovalError> {
        let target = resolution.status;
        match self
            .store
            .cas_approval(id, ApprovalStatus::Pending, &resolution)
            .await?
        {
            CasOutcome::Applied(item) => {
                self.publish(match target {
                    ApprovalStatus::Expired => QueueEvent::Expired { id },
                    status => QueueEvent::Resolved { id, status },
                });
                Ok(item)
            }
            CasOutcome::Conflict(status) if status.is_terminal() => {
                warn!(approval_id = %id, %status, requested = %target, "Approval item already resolved");
                Err(ApprovalError::AlreadyResolved { id, status })
            }
            CasOutcome::Conflict(status) => Err(ApprovalError::InvalidState {
                reason: format!("Cannot move {id} from {status} to {target}"),
            }),
            CasOutcome::Missing => Err(ApprovalError::NotFound { id }),
        }
    }
}

/// Spawn the periodic expiry sweep. Stops when `cancel` fires.
pub fn spawn_expiry_task(queue: Arc<ApprovalQueue>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = queue.config.snapshot().settings.approval.sweep_interval();
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Expiry task stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = queue.sweep().await {
                warn!(error = %e, "Approval sweep failed");
            }
        }
    })
}
