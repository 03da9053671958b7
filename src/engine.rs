//! Triage engine: the single entry point a host drives.
//!
//! Wires the classification pipeline, approval queue, escalation
//! dispatcher and feedback learner together:
//!
//! message → pipeline (dedupe, rules) → approval queue or autonomous
//! handling → escalation (tier 1) → learner (from corrections).

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::model::ApprovalType;
use crate::approval::queue::ApprovalQueue;
use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::error::{ClassificationError, Error};
use crate::escalation::channel::NotificationChannel;
use crate::escalation::dispatcher::EscalationDispatcher;
use crate::escalation::model::DispatchOutcome;
use crate::learning::feedback::{FeedbackLearner, WeightSnapshot};
use crate::pipeline::processor::{Classification, ClassificationPipeline};
use crate::pipeline::types::{Action, DedupeStatus, Decision, Feature, Message, Tier};
use crate::store::traits::Persistence;

/// Default concurrency of `process_batch`.
const DEFAULT_WORKERS: usize = 4;

/// Where a processed message ended up.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
    /// Exact or content duplicate of something already routed.
    Suppressed {
        status: DedupeStatus,
        matched_id: Option<String>,
    },
    /// Handled without sign-off.
    Autonomous,
    /// Waiting for the principal.
    Queued { approval_id: Uuid },
    /// Flagged for the principal; never acted on.
    Flagged,
    /// Escalated with no response queued.
    Escalated,
}

/// Per-channel result of escalating one decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationReport {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DispatchOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub unavailable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOutcome {
    pub message_id: String,
    pub decision: Option<Decision>,
    #[serde(flatten)]
    pub route: Route,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub escalations: Vec<EscalationReport>,
}

pub struct TriageEngine {
    pipeline: ClassificationPipeline,
    queue: Arc<ApprovalQueue>,
    dispatcher: EscalationDispatcher,
    learner: Arc<FeedbackLearner>,
    store: Arc<dyn Persistence>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    workers: usize,
}

impl TriageEngine {
    /// Build an engine for one principal. Learner weights are restored from
    /// the store.
    ///
    /// Fails if the configuration names an escalation channel not in
    /// `channels`; later reloads that do so are rejected.
    pub async fn new(
        principal: impl Into<String>,
        config: ConfigHandle,
        store: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        channels: Vec<Arc<dyn NotificationChannel>>,
    ) -> Result<Self, Error> {
        let principal = principal.into();
        let learner = Arc::new(
            FeedbackLearner::restore(store.clone(), config.clone(), clock.clone()).await?,
        );
        let pipeline = ClassificationPipeline::new(
            principal.clone(),
            config.clone(),
            store.clone(),
            learner.clone(),
            clock.clone(),
        );
        let queue = Arc::new(ApprovalQueue::new(
            principal,
            store.clone(),
            config.clone(),
            clock.clone(),
        ));
        let dispatcher = channels.into_iter().fold(
            EscalationDispatcher::new(store.clone(), config.clone(), clock.clone()),
            EscalationDispatcher::with_channel,
        );
        config.register_channels(dispatcher.channel_names())?;

        Ok(Self {
            pipeline,
            queue,
            dispatcher,
            learner,
            store,
            config,
            clock,
            workers: DEFAULT_WORKERS,
        })
    }

    /// Set the `process_batch` concurrency (at least 1).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn queue(&self) -> &Arc<ApprovalQueue> {
        &self.queue
    }

    pub fn dispatcher(&self) -> &EscalationDispatcher {
        &self.dispatcher
    }

    pub fn learner(&self) -> &Arc<FeedbackLearner> {
        &self.learner
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Classify and route one message.
    ///
    /// Classification failures never surface here: they become a tier-3
    /// review decision carrying the error text. Errors returned are from
    /// routing (approval storage).
    pub async fn process(
        &self,
        message: &Message,
        proposal: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, Error> {
        let classification = match self.pipeline.classify(message).await {
            Ok(classification) => classification,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Classification failed, defaulting to review");
                Classification::Decided(self.fallback_decision(message, &e))
            }
        };

        match classification {
            Classification::Duplicate {
                status,
                matched_id,
                decision,
            } => Ok(ProcessOutcome {
                message_id: message.id.clone(),
                decision,
                route: Route::Suppressed { status, matched_id },
                escalations: Vec::new(),
            }),
            Classification::Decided(decision) => self.route(decision, proposal, cancel).await,
        }
    }

    /// Produce and route a fresh attempt for a message already seen.
    pub async fn reprocess(
        &self,
        message: &Message,
        proposal: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, Error> {
        let decision = match self.pipeline.reprocess(message).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Reclassification failed, defaulting to review");
                self.fallback_decision(message, &e)
            }
        };
        self.route(decision, proposal, cancel).await
    }

    /// Process messages on a bounded worker pool. Results come back in
    /// input order; one failure never affects the others.
    pub async fn process_batch(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Vec<Result<ProcessOutcome, Error>> {
        let mut results: Vec<(usize, Result<ProcessOutcome, Error>)> =
            stream::iter(messages.iter().enumerate())
                .map(|(index, message)| async move {
                    (index, self.process(message, None, cancel).await)
                })
                .buffer_unordered(self.workers)
                .collect()
                .await;
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Feed the principal's tier correction for a message to the learner.
    pub async fn record_correction(
        &self,
        message_id: &str,
        corrected: Tier,
    ) -> Result<Option<Arc<WeightSnapshot>>, Error> {
        let decision = self
            .store
            .latest_decision(message_id)
            .await?
            .ok_or_else(|| Error::UnknownMessage(message_id.to_string()))?;
        Ok(self.learner.record_correction(&decision, corrected).await?)
    }

    async fn route(
        &self,
        decision: Decision,
        proposal: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, Error> {
        let approval = self.config.snapshot().settings.approval.clone();
        let mut escalations = Vec::new();

        let route = match decision.action {
            Action::Escalate => {
                escalations = self.escalate(&decision, cancel).await;
                if approval.queue_escalations {
                    self.enqueue(&decision, ApprovalType::Response, proposal).await?
                } else {
                    Route::Escalated
                }
            }
            Action::Handle if approval.handle_requires_approval => {
                let item_type = if decision.features.contains(&Feature::BulkOrigin) {
                    ApprovalType::Bulk
                } else {
                    ApprovalType::Action
                };
                self.enqueue(&decision, item_type, proposal).await?
            }
            Action::Handle => Route::Autonomous,
            Action::Draft => self.enqueue(&decision, ApprovalType::Response, proposal).await?,
            Action::FlagOnly => Route::Flagged,
        };

        info!(
            message_id = %decision.message_id,
            tier = %decision.tier,
            action = %decision.action,
            route = ?route,
            "Message routed"
        );
        Ok(ProcessOutcome {
            message_id: decision.message_id.clone(),
            decision: Some(decision),
            route,
            escalations,
        })
    }

    async fn enqueue(
        &self,
        decision: &Decision,
        item_type: ApprovalType,
        proposal: Option<&str>,
    ) -> Result<Route, Error> {
        let content = proposal.map_or_else(|| placeholder_proposal(decision), str::to_string);
        let item = self.queue.create(decision, item_type, content).await?;
        Ok(Route::Queued {
            approval_id: item.id,
        })
    }

    async fn escalate(
        &self,
        decision: &Decision,
        cancel: &CancellationToken,
    ) -> Vec<EscalationReport> {
        let results = self.dispatcher.notify_all(decision, cancel).await;
        if results.is_empty() {
            warn!(message_id = %decision.message_id, "Tier-1 decision but no escalation channel configured");
        }
        results
            .into_iter()
            .map(|(channel, result)| match result {
                Ok(outcome) => EscalationReport {
                    channel,
                    outcome: Some(outcome),
                    error: None,
                    unavailable: false,
                },
                Err(e) => EscalationReport {
                    channel,
                    outcome: None,
                    unavailable: e.is_channel_unavailable(),
                    error: Some(e.to_string()),
                },
            })
            .collect()
    }

    /// Unrecorded tier-3 decision used when classification itself failed.
    fn fallback_decision(&self, message: &Message, error: &ClassificationError) -> Decision {
        let runtime = self.config.snapshot();
        Decision {
            message_id: message.id.clone(),
            attempt: 0,
            sender: message.sender_address(),
            subject: message.subject.clone(),
            tier: Tier::Review,
            action: runtime.settings.rules.tier_actions.for_tier(Tier::Review),
            reason: format!("Classification failed ({error}); requires review"),
            dedupe_status: DedupeStatus::Unique,
            confidence: 0.0,
            features: Default::default(),
            config_version: runtime.version,
            decided_at: self.clock.now(),
        }
    }
}

/// Stand-in content when the host supplied no draft.
fn placeholder_proposal(decision: &Decision) -> String {
    let subject = if decision.subject.is_empty() {
        "(no subject)"
    } else {
        decision.subject.as_str()
    };
    format!(
        "{} for \"{subject}\" from {}: {}",
        decision.action, decision.sender, decision.reason
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use std::time::Duration;

    use super::*;
    use crate::approval::model::ApprovalStatus;
    use crate::clock::ManualClock;
    use crate::config::{ChannelConfig, TriageConfig};
    use crate::error::ConfigError;
    use crate::escalation::channel::LogChannel;
    use crate::store::memory::MemoryStore;
    use crate::store::testing::FaultyStore;

    fn message(id: &str, sender: &str, subject: &str, body: &str) -> Message {
        Message {
            id: id.into(),
            conversation_id: format!("conv-{id}"),
            sender: sender.into(),
            recipients: vec!["me@company.com".into()],
            subject: subject.into(),
            body: body.into(),
            received_at: Utc::now(),
            attachments: vec![],
            first_time_contact: false,
        }
    }

    async fn engine_with(settings: TriageConfig) -> TriageEngine {
        let clock = ManualClock::new(Utc::now());
        TriageEngine::new(
            "me",
            ConfigHandle::new(settings).unwrap(),
            Arc::new(MemoryStore::new()),
            clock,
            vec![Arc::new(LogChannel::default()) as Arc<dyn NotificationChannel>],
        )
        .await
        .unwrap()
    }

    fn with_log_channel() -> TriageConfig {
        let mut settings = TriageConfig::default();
        settings.escalation.channels = vec![ChannelConfig::new("log", "principal")];
        settings
    }

    #[tokio::test]
    async fn draft_is_queued_with_proposal() {
        let engine = engine_with(TriageConfig::default()).await;
        let outcome = engine
            .process(
                &message("m1", "a@example.com", "Question", "Can you send the deck?"),
                Some("Sure, attached."),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let Route::Queued { approval_id } = outcome.route else {
            panic!("expected queued, got {:?}", outcome.route);
        };
        let item = engine.queue().get(approval_id).await.unwrap();
        assert_eq!(item.proposed_content, "Sure, attached.");
        assert_eq!(item.item_type, ApprovalType::Response);
        assert_eq!(item.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn scheduling_is_autonomous_unless_sign_off_required() {
        let engine = engine_with(TriageConfig::default()).await;
        let msg = message("m1", "a@example.com", "Meeting next week", "What is your availability?");
        let outcome = engine.process(&msg, None, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.route, Route::Autonomous);

        let mut settings = TriageConfig::default();
        settings.approval.handle_requires_approval = true;
        let engine = engine_with(settings).await;
        let outcome = engine.process(&msg, None, &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome.route, Route::Queued { .. }));
    }

    #[tokio::test]
    async fn bulk_handle_queues_bulk_item() {
        let mut settings = TriageConfig::default();
        settings.approval.handle_requires_approval = true;
        let engine = engine_with(settings).await;
        let outcome = engine
            .process(
                &message("m1", "noreply@shop.example", "Your weekly newsletter", "Deals inside"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let Route::Queued { approval_id } = outcome.route else {
            panic!("expected queued");
        };
        assert_eq!(
            engine.queue().get(approval_id).await.unwrap().item_type,
            ApprovalType::Bulk
        );
    }

    #[tokio::test]
    async fn hr_message_is_flagged_only() {
        let engine = engine_with(TriageConfig::default()).await;
        let outcome = engine
            .process(
                &message("m1", "hr@company.com", "Meeting", "Let's discuss your performance review"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.route, Route::Flagged);
        assert_eq!(outcome.decision.unwrap().tier, Tier::Restricted);
        assert_eq!(engine.queue().statistics("me").await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn urgent_message_escalates_and_queues_response() {
        let engine = engine_with(with_log_channel()).await;
        let outcome = engine
            .process(
                &message("m1", "a@example.com", "URGENT: server down", "Prod is down"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome.route, Route::Queued { .. }));
        assert_eq!(outcome.escalations.len(), 1);
        assert_eq!(
            outcome.escalations[0].outcome,
            Some(DispatchOutcome::Delivered { attempts: 1 })
        );
        assert_eq!(engine.dispatcher().stats("log").unwrap().sent, 1);
    }

    #[tokio::test]
    async fn escalation_without_queueing() {
        let mut settings = with_log_channel();
        settings.approval.queue_escalations = false;
        let engine = engine_with(settings).await;
        let outcome = engine
            .process(
                &message("m1", "a@example.com", "Critical outage", ""),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.route, Route::Escalated);
    }

    #[tokio::test]
    async fn replay_is_suppressed_without_new_decision() {
        let engine = engine_with(with_log_channel()).await;
        let msg = message("m1", "a@example.com", "URGENT: call me", "");
        let cancel = CancellationToken::new();
        engine.process(&msg, None, &cancel).await.unwrap();
        let replay = engine.process(&msg, None, &cancel).await.unwrap();

        assert!(matches!(
            replay.route,
            Route::Suppressed {
                status: DedupeStatus::Exact,
                ..
            }
        ));
        assert_eq!(replay.decision.unwrap().attempt, 1);
        assert_eq!(engine.dispatcher().stats("log").unwrap().sent, 1);
        assert_eq!(engine.queue().list_pending("me").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reprocess_creates_new_attempt() {
        let engine = engine_with(TriageConfig::default()).await;
        let msg = message("m1", "a@example.com", "Hello", "Quick question");
        let cancel = CancellationToken::new();
        engine.process(&msg, None, &cancel).await.unwrap();
        let again = engine.reprocess(&msg, None, &cancel).await.unwrap();
        assert_eq!(again.decision.unwrap().attempt, 2);
        assert_eq!(engine.queue().list_pending("me").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn batch_keeps_input_order() {
        let engine = engine_with(TriageConfig::default()).await.with_workers(2);
        let messages: Vec<Message> = (0..6)
            .map(|i| message(&format!("m{i}"), &format!("s{i}@example.com"), &format!("Topic {i}"), &format!("body number {i}")))
            .collect();
        let results = engine.process_batch(&messages, &CancellationToken::new()).await;
        let ids: Vec<String> = results
            .into_iter()
            .map(|r| r.unwrap().message_id)
            .collect();
        assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4", "m5"]);
    }

    #[tokio::test]
    async fn correction_for_unknown_message_is_an_error() {
        let engine = engine_with(TriageConfig::default()).await;
        let err = engine.record_correction("nope", Tier::Immediate).await.unwrap_err();
        assert!(matches!(err, Error::UnknownMessage(id) if id == "nope"));
    }

    #[tokio::test]
    async fn corrections_retrain_after_batch() {
        let mut settings = TriageConfig::default();
        settings.learning.batch_size = 2;
        let engine = engine_with(settings).await;
        let cancel = CancellationToken::new();
        for id in ["m1", "m2"] {
            engine
                .process(&message(id, &format!("{id}@example.com"), &format!("Note {id}"), &format!("Some text {id}")), None, &cancel)
                .await
                .unwrap();
        }
        assert!(engine.record_correction("m1", Tier::Autonomous).await.unwrap().is_none());
        let snapshot = engine
            .record_correction("m2", Tier::Autonomous)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(engine.learner().snapshot().version, 1);
    }

    #[tokio::test]
    async fn urgent_message_survives_failed_decision_save() {
        let store = Arc::new(FaultyStore::new());
        let clock = ManualClock::new(Utc::now());
        let engine = TriageEngine::new(
            "me",
            ConfigHandle::new(with_log_channel()).unwrap(),
            store.clone(),
            clock.clone(),
            vec![Arc::new(LogChannel::default()) as Arc<dyn NotificationChannel>],
        )
        .await
        .unwrap();
        let msg = message("m1", "ops@example.com", "URGENT: prod down", "Nothing responds");
        let cancel = CancellationToken::new();

        store.fail_saves(1);
        let first = engine.process(&msg, None, &cancel).await.unwrap();
        let fallback = first.decision.unwrap();
        assert_eq!(fallback.tier, Tier::Review);
        assert_eq!(fallback.attempt, 0);
        assert_eq!(fallback.decided_at, clock.now());

        clock.advance(Duration::from_secs(5));
        let replay = engine.process(&msg, None, &cancel).await.unwrap();
        let decision = replay.decision.unwrap();
        assert_eq!(decision.tier, Tier::Immediate);
        assert_eq!(store.latest_decision("m1").await.unwrap(), Some(decision));
        assert_eq!(
            replay.escalations[0].outcome,
            Some(DispatchOutcome::Delivered { attempts: 1 })
        );
        assert_eq!(engine.dispatcher().stats("log").unwrap().sent, 1);
    }

    #[tokio::test]
    async fn unregistered_channel_is_rejected_at_startup_and_reload() {
        let mut settings = TriageConfig::default();
        settings.escalation.channels = vec![ChannelConfig::new("sms", "+15550100")];
        let err = TriageEngine::new(
            "me",
            ConfigHandle::new(settings.clone()).unwrap(),
            Arc::new(MemoryStore::new()),
            ManualClock::new(Utc::now()),
            vec![Arc::new(LogChannel::default()) as Arc<dyn NotificationChannel>],
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::InvalidValue { .. })));

        let engine = engine_with(with_log_channel()).await;
        assert!(engine.config().reload(settings).is_err());
        assert_eq!(
            engine.config().snapshot().settings.escalation.channels[0].name,
            "log"
        );
    }

    #[test]
    fn outcome_serializes_flat_route() {
        let outcome = ProcessOutcome {
            message_id: "m1".into(),
            decision: None,
            route: Route::Flagged,
            escalations: Vec::new(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["route"], "flagged");
        assert!(json.get("escalations").is_none());
    }
}
