//! Out-of-band escalation of tier-1 decisions.

pub mod breaker;
pub mod channel;
pub mod dispatcher;
pub mod model;

pub use channel::{LogChannel, NotificationChannel};
pub use dispatcher::EscalationDispatcher;
pub use model::{ChannelStats, DispatchOutcome, NotificationPayload};
