//! Shared types for the classification pipeline.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Inbound message ─────────────────────────────────────────────────

/// An inbound message as supplied by the message source.
///
/// Immutable once created; the core never writes to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Source identifier (e.g. the mail provider's message id).
    pub id: String,
    /// Conversation/thread identifier.
    #[serde(default)]
    pub conversation_id: String,
    /// Sender address, optionally in `Name <addr>` form.
    pub sender: String,
    /// Recipient addresses.
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub received_at: DateTime<Utc>,
    /// Attachment file names.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// First message ever received from this sender.
    #[serde(default)]
    pub first_time_contact: bool,
}

impl Message {
    /// Sender address with any display name stripped, lowercased.
    pub fn sender_address(&self) -> String {
        normalize_address(&self.sender)
    }
}

/// Extract the bare address from `Name <addr>` and lowercase it.
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();
    let addr = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if start < end => &trimmed[start + 1..end],
        _ => trimmed,
    };
    addr.trim().to_lowercase()
}

// ── Tier / action ───────────────────────────────────────────────────

/// Priority tier. Lower number means more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Tier {
    /// Tier 1: escalate immediately.
    Immediate,
    /// Tier 2: handled autonomously.
    Autonomous,
    /// Tier 3: draft for approval.
    Review,
    /// Tier 4: flag only, never acted on.
    Restricted,
}

impl Tier {
    pub const ALL: [Tier; 4] = [
        Tier::Immediate,
        Tier::Autonomous,
        Tier::Review,
        Tier::Restricted,
    ];

    pub fn number(self) -> u8 {
        match self {
            Self::Immediate => 1,
            Self::Autonomous => 2,
            Self::Review => 3,
            Self::Restricted => 4,
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> Self {
        tier.number()
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Immediate),
            2 => Ok(Self::Autonomous),
            3 => Ok(Self::Review),
            4 => Ok(Self::Restricted),
            other => Err(format!("Unknown tier: {other}")),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tier {}", self.number())
    }
}

/// Mandatory next action for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Alert the principal out of band.
    Escalate,
    /// Handle without sign-off.
    Handle,
    /// Prepare a draft for approval.
    Draft,
    /// Flag for the principal; never send or act.
    FlagOnly,
}

impl Action {
    pub fn label(self) -> &'static str {
        match self {
            Self::Escalate => "ESCALATE",
            Self::Handle => "HANDLE",
            Self::Draft => "DRAFT",
            Self::FlagOnly => "FLAG_ONLY",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Action {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ESCALATE" => Ok(Self::Escalate),
            "HANDLE" => Ok(Self::Handle),
            "DRAFT" => Ok(Self::Draft),
            "FLAG_ONLY" => Ok(Self::FlagOnly),
            _ => Err(format!("Unknown action: {s}")),
        }
    }
}

// ── Dedupe status ───────────────────────────────────────────────────

/// How a message relates to recently seen messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DedupeStatus {
    Unique,
    /// Same source identifier seen before.
    Exact,
    /// Near-identical body.
    Content,
    /// Same subject from a different sender.
    Forward,
    /// One of several copies sent to an overlapping recipient group.
    CcGroup,
    /// Reply that quotes an earlier message.
    QuotedReply,
}

impl DedupeStatus {
    /// Exact and content duplicates are not reclassified.
    pub fn suppresses(self) -> bool {
        matches!(self, Self::Exact | Self::Content)
    }

    /// Copies that still get a decision but must not re-escalate on keywords.
    pub fn is_derivative(self) -> bool {
        matches!(self, Self::Forward | Self::CcGroup | Self::QuotedReply)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Unique => "UNIQUE",
            Self::Exact => "EXACT",
            Self::Content => "CONTENT",
            Self::Forward => "FORWARD",
            Self::CcGroup => "CC_GROUP",
            Self::QuotedReply => "QUOTED_REPLY",
        }
    }
}

impl std::fmt::Display for DedupeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Features ────────────────────────────────────────────────────────

/// Boolean message features used by the feedback learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    OffLimitsSender,
    UrgentKeyword,
    FinancialTerm,
    ApprovalTerm,
    ConfidentialTerm,
    SchedulingTerm,
    BulkOrigin,
    FirstTimeContact,
    HasAttachments,
    HasQuestion,
    ReplyThread,
    ManyRecipients,
    DerivativeCopy,
}

pub type FeatureSet = BTreeSet<Feature>;

// ── Decision ────────────────────────────────────────────────────────

/// Classifier output for one message attempt.
///
/// Append-only: reprocessing produces a new decision with a higher
/// `attempt`, the previous ones stay in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub message_id: String,
    /// Processing attempt, starting at 1.
    pub attempt: u32,
    pub sender: String,
    pub subject: String,
    pub tier: Tier,
    pub action: Action,
    /// Audit text, kept verbatim.
    pub reason: String,
    pub dedupe_status: DedupeStatus,
    /// 0.0–1.0.
    pub confidence: f32,
    #[serde(default)]
    pub features: FeatureSet,
    /// Version of the configuration snapshot used.
    #[serde(default)]
    pub config_version: u64,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn is_escalation(&self) -> bool {
        self.tier == Tier::Immediate
    }
}
