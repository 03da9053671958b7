//! Tier weights learned from the principal's corrections.

pub mod feedback;

pub use feedback::{FeedbackLearner, WeightSnapshot};
