//! Escalation records: payloads, attempts and dispatch outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::pipeline::types::{Decision, Tier};

/// What gets sent to a notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub message_id: String,
    pub tier: Tier,
    pub sender: String,
    pub subject: String,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

impl NotificationPayload {
    pub fn from_decision(decision: &Decision) -> Self {
        Self {
            message_id: decision.message_id.clone(),
            tier: decision.tier,
            sender: decision.sender.clone(),
            subject: decision.subject.clone(),
            reason: decision.reason.clone(),
            decided_at: decision.decided_at,
        }
    }

    /// Short human-readable alert text.
    pub fn render(&self) -> String {
        let subject = if self.subject.is_empty() {
            "(no subject)"
        } else {
            &self.subject
        };
        format!(
            "[{}] {} from {}: {}",
            self.tier, subject, self.sender, self.reason
        )
    }

    /// Key a channel can use to drop repeated sends: stable for a given
    /// message, channel and attempt number.
    pub fn idempotency_key(&self, channel: &str, attempt: u32) -> String {
        format!("{}:{channel}:{attempt}", self.message_id)
    }

    /// SHA-256 of the rendered text, recorded with each attempt.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.render().as_bytes()))
    }
}

/// Terminal outcome of one recorded attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Sent,
    Failed,
    /// Refused locally because the circuit was open.
    Throttled,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Throttled => "throttled",
        }
    }
}

impl std::str::FromStr for AttemptOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "throttled" => Ok(Self::Throttled),
            _ => Err(format!("Unknown attempt outcome: {s}")),
        }
    }
}

/// One recorded delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationAttempt {
    pub id: Uuid,
    pub message_id: String,
    pub channel: String,
    pub target: String,
    /// 1-based within one `notify` call.
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub payload_digest: String,
    pub at: DateTime<Utc>,
}

/// Successful result of a `notify` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    /// A previous call already delivered this message on this channel.
    AlreadyDelivered,
    /// Not a tier-1 decision.
    Skipped,
}

/// Per-channel delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub sent: u64,
    pub failed: u64,
    pub throttled: u64,
    pub cancelled: u64,
    /// Notifications that ended `ChannelUnavailable`.
    pub unavailable: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Action, DedupeStatus};

    #[test]
    fn payload_renders_and_digests() {
        let decision = Decision {
            message_id: "m-1".into(),
            attempt: 1,
            sender: "boss@company.com".into(),
            subject: String::new(),
            tier: Tier::Immediate,
            action: Action::Escalate,
            reason: "Sender boss@company.com is on the off-limits list".into(),
            dedupe_status: DedupeStatus::Unique,
            confidence: 1.0,
            features: Default::default(),
            config_version: 1,
            decided_at: Utc::now(),
        };
        let payload = NotificationPayload::from_decision(&decision);
        let text = payload.render();
        assert!(text.starts_with("[tier 1] (no subject) from boss@company.com"));
        assert_eq!(payload.digest().len(), 64);
        assert_eq!(payload.digest(), payload.clone().digest());
    }

    #[test]
    fn outcome_round_trips_through_str() {
        for outcome in [AttemptOutcome::Sent, AttemptOutcome::Failed, AttemptOutcome::Throttled] {
            assert_eq!(outcome.as_str().parse::<AttemptOutcome>().unwrap(), outcome);
        }
    }
}
