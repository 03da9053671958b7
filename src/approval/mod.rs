//! Approval workflow: pending items awaiting the principal's sign-off.

pub mod model;
pub mod queue;

pub use model::{ApprovalItem, ApprovalStats, ApprovalStatus, ApprovalType, QueueEvent};
pub use queue::{ApprovalQueue, BulkFailure, BulkResult, SweepReport, spawn_expiry_task};
