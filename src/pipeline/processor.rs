//! Classification pipeline: dedupe check, then rule evaluation, then the
//! recorded decision.
//!
//! Flow per message:
//! 1. Load the recent fingerprint window (bounded by a timeout)
//! 2. Duplicate check; record the fingerprint insert-if-absent
//! 3. EXACT → reuse prior decision; CONTENT → copy prior decision
//!
//! If no decision can be saved, the fingerprint recorded in step 2 is
//! released so a replay is classified instead of suppressed.
//! 4. Otherwise evaluate rules under the current config + learner snapshot
//! 5. Append the decision under a freshly allocated attempt number

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{ConfigHandle, RuntimeConfig};
use crate::error::{ClassificationError, ConfigError};
use crate::learning::feedback::FeedbackLearner;
use crate::pipeline::dedupe::{DedupeCheck, DedupeDetector, DedupeFingerprint};
use crate::pipeline::rules::EvaluationContext;
use crate::pipeline::types::{DedupeStatus, Decision, Message};
use crate::store::traits::Persistence;

/// Result of classifying one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// A new decision was evaluated and recorded.
    Decided(Decision),
    /// Exact or content duplicate. Not re-evaluated and never re-routed.
    Duplicate {
        status: DedupeStatus,
        matched_id: Option<String>,
        /// The reused (EXACT) or copied (CONTENT) decision, when one exists.
        decision: Option<Decision>,
    },
}

impl Classification {
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Decided(decision) => Some(decision),
            Self::Duplicate { decision, .. } => decision.as_ref(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Turns messages into recorded decisions.
pub struct ClassificationPipeline {
    principal: String,
    config: ConfigHandle,
    store: Arc<dyn Persistence>,
    learner: Arc<FeedbackLearner>,
    clock: Arc<dyn Clock>,
}

impl ClassificationPipeline {
    pub fn new(
        principal: impl Into<String>,
        config: ConfigHandle,
        store: Arc<dyn Persistence>,
        learner: Arc<FeedbackLearner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            principal: principal.into(),
            config,
            store,
            learner,
            clock,
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Classify a message, suppressing exact and content duplicates.
    pub async fn classify(&self, message: &Message) -> Result<Classification, ClassificationError> {
        let runtime = self.config.snapshot();
        let detector = DedupeDetector::new(runtime.settings.dedupe.clone());

        let (mut check, mut window_problem) = match self.load_window(&runtime).await {
            Ok(window) => (detector.check(message, &window), None),
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Treating message as unique");
                (DedupeCheck::unique(), Some(e))
            }
        };

        let mut recorded = false;
        if check.status != DedupeStatus::Exact {
            match self.record(&runtime, &detector.fingerprint(message)).await {
                Ok(true) => recorded = true,
                Ok(false) => {
                    // Another worker recorded the same id between our load and insert.
                    debug!(message_id = %message.id, "Lost fingerprint race, treating as exact duplicate");
                    check = DedupeCheck {
                        status: DedupeStatus::Exact,
                        matched_id: Some(message.id.clone()),
                    };
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Failed to record fingerprint");
                    window_problem.get_or_insert(e);
                }
            }
        }

        let result = if check.status.suppresses() {
            self.suppress(message, &runtime, check, window_problem).await
        } else {
            self.decide(message, &runtime, check.status, window_problem)
                .await
                .map(Classification::Decided)
        };
        if result.is_err() && recorded {
            self.release(message).await;
        }
        result
    }

    /// Handle an EXACT or CONTENT match.
    async fn suppress(
        &self,
        message: &Message,
        runtime: &RuntimeConfig,
        check: DedupeCheck,
        window_problem: Option<ClassificationError>,
    ) -> Result<Classification, ClassificationError> {
        if check.status == DedupeStatus::Content {
            if let Some(copy) = self.copy_prior(message, &check).await? {
                return Ok(Classification::Duplicate {
                    status: DedupeStatus::Content,
                    matched_id: check.matched_id,
                    decision: Some(copy),
                });
            }
            // Nothing to copy yet; classify on its own merits.
            return self
                .decide(message, runtime, DedupeStatus::Content, window_problem)
                .await
                .map(Classification::Decided);
        }

        let prior = self.store.latest_decision(&message.id).await?;
        info!(
            message_id = %message.id,
            has_prior = prior.is_some(),
            "Exact duplicate, not reclassified"
        );
        Ok(Classification::Duplicate {
            status: DedupeStatus::Exact,
            matched_id: check.matched_id,
            decision: prior,
        })
    }

    /// Re-run classification for a message already seen, producing a new
    /// attempt. Exact-id matching is skipped; other relations still apply.
    pub async fn reprocess(&self, message: &Message) -> Result<Decision, ClassificationError> {
        let runtime = self.config.snapshot();
        let detector = DedupeDetector::new(runtime.settings.dedupe.clone());

        let (status, window_problem) = match self.load_window(&runtime).await {
            Ok(mut window) => {
                window.retain(|fp| fp.message_id != message.id);
                let status = match detector.check(message, &window).status {
                    // A content match on reprocess still deserves a fresh evaluation.
                    DedupeStatus::Content => DedupeStatus::Unique,
                    other => other,
                };
                (status, None)
            }
            Err(e) => (DedupeStatus::Unique, Some(e)),
        };

        let decision = self.decide(message, &runtime, status, window_problem).await?;
        info!(
            message_id = %message.id,
            attempt = decision.attempt,
            tier = %decision.tier,
            "Message reprocessed"
        );
        Ok(decision)
    }

    async fn load_window(
        &self,
        runtime: &RuntimeConfig,
    ) -> Result<Vec<DedupeFingerprint>, ClassificationError> {
        let dedupe = &runtime.settings.dedupe;
        let limit = dedupe.lookup_timeout();
        match tokio::time::timeout(limit, self.store.load_window(&self.principal, dedupe.window_size))
            .await
        {
            Ok(Ok(window)) => Ok(window),
            Ok(Err(e)) => Err(ClassificationError::DedupeWindowUnavailable(e.to_string())),
            Err(_) => Err(ClassificationError::DedupeWindowUnavailable(format!(
                "lookup exceeded {limit:?}"
            ))),
        }
    }

    /// Drop this message's fingerprint after its classification failed.
    async fn release(&self, message: &Message) {
        match self
            .store
            .forget_fingerprint(&self.principal, &message.id)
            .await
        {
            Ok(_) => debug!(message_id = %message.id, "Fingerprint released after failed classification"),
            Err(e) => error!(
                message_id = %message.id,
                error = %e,
                "Failed to release fingerprint, replays stay suppressed until reprocessed"
            ),
        }
    }

    async fn record(
        &self,
        runtime: &RuntimeConfig,
        fingerprint: &DedupeFingerprint,
    ) -> Result<bool, ClassificationError> {
        let dedupe = &runtime.settings.dedupe;
        let oldest_allowed = self
            .clock
            .now()
            .checked_sub_signed(dedupe.retention())
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "dedupe.retention_hours".into(),
                message: "retention reaches past the representable time range".into(),
            })?;
        self.store
            .record_fingerprint(&self.principal, fingerprint, dedupe.window_size, oldest_allowed)
            .await
            .map_err(|e| ClassificationError::DedupeWindowUnavailable(e.to_string()))
    }

    /// Save a copy of the matched message's decision under this message's id.
    async fn copy_prior(
        &self,
        message: &Message,
        check: &DedupeCheck,
    ) -> Result<Option<Decision>, ClassificationError> {
        let Some(matched) = check.matched_id.as_deref() else {
            return Ok(None);
        };
        let Some(prior) = self.store.latest_decision(matched).await? else {
            return Ok(None);
        };

        let attempt = self.store.next_attempt(&message.id).await?;
        let copy = Decision {
            message_id: message.id.clone(),
            attempt,
            sender: message.sender_address(),
            subject: message.subject.clone(),
            reason: format!("{}; CONTENT duplicate of {matched}", prior.reason),
            dedupe_status: DedupeStatus::Content,
            decided_at: self.clock.now(),
            ..prior
        };
        self.store.save_decision(&copy).await?;
        info!(
            message_id = %message.id,
            duplicate_of = matched,
            tier = %copy.tier,
            "Content duplicate, prior decision reused"
        );
        Ok(Some(copy))
    }

    async fn decide(
        &self,
        message: &Message,
        runtime: &RuntimeConfig,
        status: DedupeStatus,
        window_problem: Option<ClassificationError>,
    ) -> Result<Decision, ClassificationError> {
        let weights = self.learner.snapshot();
        let ctx = EvaluationContext {
            dedupe_status: status,
            weights: Some(&weights),
            override_margin: runtime.settings.learning.override_margin,
        };
        let evaluation = runtime.rules.evaluate_with(message, &ctx);

        let mut reason = evaluation.reason;
        if let Some(problem) = window_problem {
            reason.push_str(&format!("; dedupe window unavailable ({problem})"));
        }

        let attempt = self.store.next_attempt(&message.id).await?;
        let decision = Decision {
            message_id: message.id.clone(),
            attempt,
            sender: message.sender_address(),
            subject: message.subject.clone(),
            tier: evaluation.tier,
            action: evaluation.action,
            reason,
            dedupe_status: status,
            confidence: evaluation.confidence,
            features: evaluation.features,
            config_version: runtime.version,
            decided_at: self.clock.now(),
        };
        self.store.save_decision(&decision).await?;

        info!(
            message_id = %decision.message_id,
            attempt,
            tier = %decision.tier,
            action = %decision.action,
            dedupe = %decision.dedupe_status,
            "Message classified"
        );
        Ok(decision)
    }
}
