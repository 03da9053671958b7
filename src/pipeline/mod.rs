//! Classification pipeline.
//!
//! Every inbound message flows through:
//! 1. `DedupeDetector::check()` against the principal's recent window
//! 2. `RulesEngine::evaluate()`, first matching rule wins
//! 3. Learned override, consulted only by the fallback rules
//!
//! The resulting `Decision` is persisted before anything acts on it.

pub mod dedupe;
pub mod processor;
pub mod rules;
pub mod types;
