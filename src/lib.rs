//! Inbox Triage: decision core for a single principal's inbox.
//!
//! Classifies incoming messages into priority tiers, suppresses duplicates,
//! gates non-autonomous actions behind an approval queue and escalates
//! tier-1 messages out of band.

pub mod approval;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod learning;
pub mod pipeline;
pub mod store;

pub use engine::{ProcessOutcome, Route, TriageEngine};
pub use error::{Error, Result};
