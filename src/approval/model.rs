//! Approval item data model: statuses, transitions, resolutions and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApprovalError;
use crate::pipeline::types::{Decision, Tier};

/// Lifecycle status of an approval item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a decision.
    Pending,
    Approved,
    Rejected,
    /// Timed out without a decision.
    Expired,
}

impl ApprovalStatus {
    /// Only `Pending` may transition, and only to a terminal state.
    pub fn can_transition_to(&self, target: ApprovalStatus) -> bool {
        use ApprovalStatus::*;
        matches!(
            (self, target),
            (Pending, Approved) | (Pending, Rejected) | (Pending, Expired)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Unknown approval status: {s}")),
        }
    }
}

/// What the approval is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    /// A reply to the message.
    Response,
    /// A non-reply action (filing, scheduling, ...).
    Action,
    /// An action covering bulk/automated mail.
    Bulk,
}

impl ApprovalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Response => "response",
            Self::Action => "action",
            Self::Bulk => "bulk",
        }
    }
}

impl std::fmt::Display for ApprovalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "response" => Ok(Self::Response),
            "action" => Ok(Self::Action),
            "bulk" => Ok(Self::Bulk),
            _ => Err(format!("Unknown approval type: {s}")),
        }
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: ApprovalStatus,
    pub to: ApprovalStatus,
    pub at: DateTime<Utc>,
    /// Who made the change; `None` for the system (expiry sweep).
    pub actor: Option<String>,
    pub note: Option<String>,
}

/// A proposed action awaiting sign-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalItem {
    pub id: Uuid,
    pub principal: String,
    /// Originating message.
    pub message_id: String,
    /// Decision attempt this item was created for.
    pub attempt: u32,
    pub item_type: ApprovalType,
    pub status: ApprovalStatus,
    pub tier: Tier,
    pub proposed_content: String,
    /// Content to execute once approved (proposal or resolver's edit).
    pub final_content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolver: Option<String>,
    pub notes: Option<String>,
    /// Every transition out of the initial state.
    #[serde(default)]
    pub history: Vec<StatusTransition>,
}

impl ApprovalItem {
    /// New pending item for a decision.
    pub fn new(
        principal: impl Into<String>,
        decision: &Decision,
        item_type: ApprovalType,
        proposed_content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal: principal.into(),
            message_id: decision.message_id.clone(),
            attempt: decision.attempt,
            item_type,
            status: ApprovalStatus::Pending,
            tier: decision.tier,
            proposed_content: proposed_content.into(),
            final_content: None,
            created_at: now,
            resolved_at: None,
            resolver: None,
            notes: None,
            history: Vec::new(),
        }
    }

    /// Age of the item at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }

    /// Time from creation to resolution, if resolved.
    pub fn time_to_resolution(&self) -> Option<chrono::Duration> {
        self.resolved_at
            .map(|at| at.signed_duration_since(self.created_at))
    }

    /// Apply a resolution. Stores call this under their own atomicity
    /// guarantee after checking the expected status.
    pub fn apply(&mut self, resolution: &Resolution) -> Result<(), ApprovalError> {
        if !self.status.can_transition_to(resolution.status) {
            return Err(if self.status.is_terminal() {
                ApprovalError::AlreadyResolved {
                    id: self.id,
                    status: self.status,
                }
            } else {
                ApprovalError::InvalidState {
                    reason: format!(
                        "Cannot transition {} from {} to {}",
                        self.id, self.status, resolution.status
                    ),
                }
            });
        }

        self.history.push(StatusTransition {
            from: self.status,
            to: resolution.status,
            at: resolution.at,
            actor: resolution.resolver.clone(),
            note: resolution.notes.clone(),
        });
        self.status = resolution.status;
        self.resolved_at = Some(resolution.at);
        self.resolver = resolution.resolver.clone();
        self.notes = resolution.notes.clone();
        if resolution.status == ApprovalStatus::Approved {
            self.final_content = Some(
                resolution
                    .content
                    .clone()
                    .unwrap_or_else(|| self.proposed_content.clone()),
            );
        }
        Ok(())
    }
}

/// Target state and metadata for a compare-and-swap transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub status: ApprovalStatus,
    pub resolver: Option<String>,
    pub notes: Option<String>,
    /// Edited content (approvals only).
    pub content: Option<String>,
    pub at: DateTime<Utc>,
}

/// Result of a compare-and-swap on an item's status.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// Transition applied; the updated item.
    Applied(ApprovalItem),
    /// The item was not in the expected status; its current status.
    Conflict(ApprovalStatus),
    Missing,
}

/// Result of inserting a new item.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// A pending item already exists for the same message attempt.
    PendingExists { existing: Uuid },
}

/// Aggregate queue statistics for one principal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStats {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub expired: usize,
    /// Item counts indexed by tier number (1–4).
    pub by_tier: std::collections::BTreeMap<u8, usize>,
    /// Mean creation→resolution time over approved and rejected items.
    pub average_resolution_secs: Option<f64>,
    pub oldest_pending_age_secs: Option<i64>,
}

/// Events broadcast to queue subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Created { item: ApprovalItem },
    Resolved { id: Uuid, status: ApprovalStatus },
    Expired { id: Uuid },
    Pruned { count: usize },
}
