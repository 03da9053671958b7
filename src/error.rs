//! Error types for the triage core.

use std::time::Duration;

use uuid::Uuid;

use crate::approval::model::ApprovalStatus;

/// Top-level error type for the triage core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("Escalation error: {0}")]
    Escalation(#[from] EscalationError),

    #[error("No decision recorded for message {0}")]
    UnknownMessage(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence collaborator errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised while classifying a single message.
///
/// These never abort a batch: the pipeline converts them into a Tier-3
/// decision with the error text recorded in the reason.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("Malformed pattern {pattern:?} in {list}: {reason}")]
    Configuration {
        list: String,
        pattern: String,
        reason: String,
    },

    #[error("Dedupe window unavailable: {0}")]
    DedupeWindowUnavailable(String),

    #[error("Invalid configuration: {0}")]
    Settings(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Approval lifecycle errors. Always surfaced to the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApprovalError {
    #[error("Approval item {id} not found")]
    NotFound { id: Uuid },

    #[error("Approval item {id} already resolved as {status}")]
    AlreadyResolved { id: Uuid, status: ApprovalStatus },

    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Escalation dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("Channel {channel} unavailable after {attempts} attempt(s): {reason}")]
    ChannelUnavailable {
        channel: String,
        attempts: u32,
        reason: String,
    },

    #[error("Escalation on channel {channel} cancelled after {attempts} attempt(s)")]
    Cancelled { channel: String, attempts: u32 },

    #[error("Unknown notification channel: {0}")]
    UnknownChannel(String),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

impl EscalationError {
    /// Whether this error means the channel could not deliver the alert.
    pub fn is_channel_unavailable(&self) -> bool {
        matches!(self, Self::ChannelUnavailable { .. } | Self::UnknownChannel(_))
    }
}

/// Errors returned by a notification channel implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Channel {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// Result type alias for the triage core.
pub type Result<T> = std::result::Result<T, Error>;
