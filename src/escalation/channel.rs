//! Notification channel abstraction.

use async_trait::async_trait;
use tracing::warn;

use super::model::NotificationPayload;
use crate::error::ChannelError;

/// Out-of-band alert sink (SMS gateway, chat webhook, pager, ...).
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Name matched against `ChannelConfig::name`.
    fn name(&self) -> &str;

    /// Deliver one alert to `target`. A repeated `idempotency_key` means
    /// the same alert was already handed over and may be dropped.
    async fn send(
        &self,
        target: &str,
        payload: &NotificationPayload,
        idempotency_key: &str,
    ) -> Result<(), ChannelError>;
}

/// Writes alerts to the log. Always succeeds.
#[derive(Debug, Clone)]
pub struct LogChannel {
    name: String,
}

impl LogChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        target: &str,
        payload: &NotificationPayload,
        idempotency_key: &str,
    ) -> Result<(), ChannelError> {
        warn!(
            channel = %self.name,
            target,
            message_id = %payload.message_id,
            idempotency_key,
            alert = %payload.render(),
            "ESCALATION"
        );
        Ok(())
    }
}
