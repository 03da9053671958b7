//! Escalation dispatcher: retrying, breaker-guarded delivery of tier-1
//! alerts to notification channels.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::breaker::{Admission, CircuitBreaker, CircuitState};
use super::channel::NotificationChannel;
use super::model::{
    AttemptOutcome, ChannelStats, DispatchOutcome, EscalationAttempt, NotificationPayload,
};
use crate::clock::Clock;
use crate::config::{ChannelConfig, ConfigHandle};
use crate::error::{ChannelError, EscalationError};
use crate::pipeline::types::Decision;
use crate::store::traits::Persistence;

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    throttled: AtomicU64,
    cancelled: AtomicU64,
    unavailable: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
        }
    }
}

struct ChannelSlot {
    channel: Arc<dyn NotificationChannel>,
    breaker: CircuitBreaker,
    counters: Counters,
}

/// One call's context, shared by the attempt recorder.
struct Delivery<'a> {
    config: &'a ChannelConfig,
    payload: &'a NotificationPayload,
    digest: String,
}

pub struct EscalationDispatcher {
    channels: HashMap<String, ChannelSlot>,
    /// Counters for configured names with no registered channel.
    unregistered: Mutex<BTreeMap<String, ChannelStats>>,
    /// (message, channel) pairs sent but whose `Sent` record failed.
    unrecorded: Mutex<HashSet<(String, String)>>,
    store: Arc<dyn Persistence>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
}

impl EscalationDispatcher {
    pub fn new(store: Arc<dyn Persistence>, config: ConfigHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            channels: HashMap::new(),
            unregistered: Mutex::new(BTreeMap::new()),
            unrecorded: Mutex::new(HashSet::new()),
            store,
            config,
            clock,
        }
    }

    /// Register a channel under its own name.
    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.insert(
            channel.name().to_string(),
            ChannelSlot {
                channel,
                breaker: CircuitBreaker::new(),
                counters: Counters::default(),
            },
        );
        self
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Delivery counters for one channel, registered or not.
    pub fn stats(&self, channel: &str) -> Option<ChannelStats> {
        match self.channels.get(channel) {
            Some(slot) => Some(slot.counters.snapshot()),
            None => self.unregistered_stats().get(channel).copied(),
        }
    }

    pub fn all_stats(&self) -> BTreeMap<String, ChannelStats> {
        let mut all = self.unregistered_stats().clone();
        all.extend(
            self.channels
                .iter()
                .map(|(name, slot)| (name.clone(), slot.counters.snapshot())),
        );
        all
    }

    fn unregistered_stats(&self) -> MutexGuard<'_, BTreeMap<String, ChannelStats>> {
        self.unregistered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unrecorded(&self) -> MutexGuard<'_, HashSet<(String, String)>> {
        self.unrecorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn circuit_state(&self, channel: &str) -> Option<CircuitState> {
        self.channels
            .get(channel)
            .map(|s| s.breaker.state(self.clock.now()))
    }

    /// Send a tier-1 alert on one channel.
    ///
    /// Retries with exponential backoff up to `retry.max_attempts`; every
    /// attempt is recorded. Cancellation is honoured before an attempt and
    /// during backoff, never mid-send. A name with no registered channel
    /// is recorded as one failed attempt.
    pub async fn notify(
        &self,
        decision: &Decision,
        channel_config: &ChannelConfig,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, EscalationError> {
        if !decision.is_escalation() {
            return Ok(DispatchOutcome::Skipped);
        }
        let name = channel_config.name.as_str();

        let delivered_key = (decision.message_id.clone(), name.to_string());
        let prior = self.store.list_attempts(&decision.message_id, name).await?;
        if prior.iter().any(|a| a.outcome == AttemptOutcome::Sent)
            || self.unrecorded().contains(&delivered_key)
        {
            debug!(message_id = %decision.message_id, channel = name, "Already delivered");
            return Ok(DispatchOutcome::AlreadyDelivered);
        }

        let payload = NotificationPayload::from_decision(decision);
        let delivery = Delivery {
            config: channel_config,
            digest: payload.digest(),
            payload: &payload,
        };
        let Some(slot) = self.channels.get(name) else {
            return Err(self.reject_unregistered(&delivery).await);
        };
        let send_timeout = self.config.snapshot().settings.escalation.send_timeout();
        let max_attempts = channel_config.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(self.cancelled(slot, name, attempt - 1));
            }

            let admission = slot.breaker.admit(self.clock.now());
            if let Admission::Rejected { retry_in } = admission {
                self.record(&delivery, attempt, AttemptOutcome::Throttled, Some("circuit open"))
                    .await?;
                Counters::bump(&slot.counters.throttled);
                Counters::bump(&slot.counters.unavailable);
                warn!(
                    message_id = %decision.message_id,
                    channel = name,
                    retry_in_secs = retry_in.num_seconds(),
                    "Circuit open, escalation throttled"
                );
                return Err(EscalationError::ChannelUnavailable {
                    channel: name.to_string(),
                    attempts: attempt,
                    reason: format!("circuit open, retry in {}s", retry_in.num_seconds()),
                });
            }

            let trial = (admission == Admission::Trial).then(|| slot.breaker.hold_trial());
            let key = payload.idempotency_key(name, attempt);
            let result = match tokio::time::timeout(
                send_timeout,
                slot.channel.send(&channel_config.target, &payload, &key),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Timeout {
                    name: name.to_string(),
                    timeout: send_timeout,
                }),
            };
            match &result {
                Ok(()) => slot.breaker.record_success(),
                Err(_) => slot.breaker.record_failure(self.clock.now(), &channel_config.breaker),
            }
            if let Some(trial) = trial {
                trial.settle();
            }

            match result {
                Ok(()) => {
                    Counters::bump(&slot.counters.sent);
                    if let Err(e) = self.record(&delivery, attempt, AttemptOutcome::Sent, None).await {
                        // The alert is out; remember it so this process never resends it.
                        self.unrecorded().insert(delivered_key);
                        error!(
                            message_id = %decision.message_id,
                            channel = name,
                            idempotency_key = %key,
                            error = %e,
                            "Escalation delivered but not recorded"
                        );
                    }
                    info!(
                        message_id = %decision.message_id,
                        channel = name,
                        attempt,
                        "Escalation delivered"
                    );
                    return Ok(DispatchOutcome::Delivered { attempts: attempt });
                }
                Err(e) => {
                    last_error = e.to_string();
                    self.record(&delivery, attempt, AttemptOutcome::Failed, Some(&last_error))
                        .await?;
                    Counters::bump(&slot.counters.failed);
                    warn!(
                        message_id = %decision.message_id,
                        channel = name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Escalation attempt failed"
                    );
                }
            }

            if attempt < max_attempts {
                let delay = channel_config.retry.delay_after(attempt);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(self.cancelled(slot, name, attempt)),
                    _ = self.clock.sleep(delay) => {}
                }
            }
        }

        Counters::bump(&slot.counters.unavailable);
        error!(
            message_id = %decision.message_id,
            channel = name,
            attempts = max_attempts,
            error = %last_error,
            "Escalation failed on every attempt"
        );
        Err(EscalationError::ChannelUnavailable {
            channel: name.to_string(),
            attempts: max_attempts,
            reason: last_error,
        })
    }

    /// Send a tier-1 alert on every configured channel concurrently.
    pub async fn notify_all(
        &self,
        decision: &Decision,
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<DispatchOutcome, EscalationError>)> {
        let runtime = self.config.snapshot();
        let channels = &runtime.settings.escalation.channels;
        let results = join_all(
            channels
                .iter()
                .map(|channel| self.notify(decision, channel, cancel)),
        )
        .await;
        channels
            .iter()
            .map(|c| c.name.clone())
            .zip(results)
            .collect()
    }

    /// Record the terminal failure for a configured name nothing is
    /// registered under.
    async fn reject_unregistered(&self, delivery: &Delivery<'_>) -> EscalationError {
        let name = delivery.config.name.clone();
        if let Err(e) = self
            .record(delivery, 1, AttemptOutcome::Failed, Some("channel not registered"))
            .await
        {
            warn!(channel = %name, error = %e, "Failed to record attempt on unregistered channel");
        }
        {
            let mut stats = self.unregistered_stats();
            let entry = stats.entry(name.clone()).or_default();
            entry.failed += 1;
            entry.unavailable += 1;
        }
        error!(
            message_id = %delivery.payload.message_id,
            channel = %name,
            "Escalation channel is not registered"
        );
        EscalationError::UnknownChannel(name)
    }

    fn cancelled(&self, slot: &ChannelSlot, channel: &str, attempts: u32) -> EscalationError {
        Counters::bump(&slot.counters.cancelled);
        info!(channel, attempts, "Escalation cancelled");
        EscalationError::Cancelled {
            channel: channel.to_string(),
            attempts,
        }
    }

    async fn record(
        &self,
        delivery: &Delivery<'_>,
        attempt_number: u32,
        outcome: AttemptOutcome,
        error: Option<&str>,
    ) -> Result<(), EscalationError> {
        let attempt = EscalationAttempt {
            id: Uuid::new_v4(),
            message_id: delivery.payload.message_id.clone(),
            channel: delivery.config.name.clone(),
            target: delivery.config.target.clone(),
            attempt_number,
            outcome,
            error: error.map(str::to_string),
            payload_digest: delivery.digest.clone(),
            at: self.clock.now(),
        };
        self.store.record_attempt(&attempt).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{BreakerConfig, RetryConfig, TriageConfig};
    use crate::pipeline::types::{Action, DedupeStatus, Tier};
    use crate::store::testing::FaultyStore;

    /// Replays scripted results; succeeds once the script runs out.
    struct ScriptedChannel {
        script: Mutex<VecDeque<Result<(), ChannelError>>>,
        calls: AtomicU64,
        keys: Mutex<Vec<String>>,
        /// Cancelled after each send, when set.
        cancel_after_send: Option<CancellationToken>,
    }

    impl ScriptedChannel {
        fn new(script: Vec<Result<(), ChannelError>>) -> Arc<Self> {
            Arc::new(Self::build(script, None))
        }

        fn build(script: Vec<Result<(), ChannelError>>, cancel_after_send: Option<CancellationToken>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU64::new(0),
                keys: Mutex::new(Vec::new()),
                cancel_after_send,
            }
        }

        fn keys(&self) -> Vec<String> {
            self.keys.lock().unwrap().clone()
        }

        fn failing(n: usize) -> Arc<Self> {
            Self::new(
                (0..n)
                    .map(|_| {
                        Err(ChannelError::SendFailed {
                            name: "sms".into(),
                            reason: "gateway down".into(),
                        })
                    })
                    .collect(),
            )
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NotificationChannel for ScriptedChannel {
        fn name(&self) -> &str {
            "sms"
        }

        async fn send(&self, _: &str, _: &NotificationPayload, key: &str) -> Result<(), ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.keys.lock().unwrap().push(key.to_string());
            let result = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
            if let Some(cancel) = &self.cancel_after_send {
                cancel.cancel();
            }
            result
        }
    }

    struct StalledChannel;

    #[async_trait]
    impl NotificationChannel for StalledChannel {
        fn name(&self) -> &str {
            "sms"
        }

        async fn send(&self, _: &str, _: &NotificationPayload, _: &str) -> Result<(), ChannelError> {
            std::future::pending().await
        }
    }

    /// Fails once, hangs on the second call, then succeeds.
    struct FailThenHang {
        calls: AtomicU64,
    }

    #[async_trait]
    impl NotificationChannel for FailThenHang {
        fn name(&self) -> &str {
            "sms"
        }

        async fn send(&self, _: &str, _: &NotificationPayload, _: &str) -> Result<(), ChannelError> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(ChannelError::SendFailed {
                    name: "sms".into(),
                    reason: "gateway down".into(),
                }),
                1 => std::future::pending().await,
                _ => Ok(()),
            }
        }
    }

    fn decision(id: &str, tier: Tier) -> Decision {
        Decision {
            message_id: id.into(),
            attempt: 1,
            sender: "boss@company.com".into(),
            subject: "Server down".into(),
            tier,
            action: Action::Escalate,
            reason: "Urgent keyword: urgent".into(),
            dedupe_status: DedupeStatus::Unique,
            confidence: 0.95,
            features: Default::default(),
            config_version: 1,
            decided_at: Utc::now(),
        }
    }

    fn channel_config(max_attempts: u32, threshold: u32) -> ChannelConfig {
        ChannelConfig {
            name: "sms".into(),
            target: "+15550100".into(),
            retry: RetryConfig {
                max_attempts,
                base_delay_ms: 100,
                max_delay_ms: 1_000,
                jitter: 0.0,
            },
            breaker: BreakerConfig {
                failure_threshold: threshold,
                cooldown_secs: 60,
            },
        }
    }

    struct Harness {
        dispatcher: EscalationDispatcher,
        store: Arc<FaultyStore>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(channel: Arc<dyn NotificationChannel>, settings: TriageConfig) -> Harness {
        let store = Arc::new(FaultyStore::new());
        let clock = ManualClock::new(Utc::now());
        let dispatcher = EscalationDispatcher::new(
            store.clone(),
            ConfigHandle::new(settings).unwrap(),
            clock.clone(),
        )
        .with_channel(channel);
        Harness {
            dispatcher,
            store,
            clock,
        }
    }

    fn harness(channel: Arc<dyn NotificationChannel>) -> Harness {
        harness_with(channel, TriageConfig::default())
    }

    #[tokio::test]
    async fn non_tier_one_is_skipped() {
        let channel = ScriptedChannel::new(vec![]);
        let h = harness(channel.clone());
        let outcome = h
            .dispatcher
            .notify(&decision("m1", Tier::Review), &channel_config(3, 5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert_eq!(channel.calls(), 0);
    }

    #[tokio::test]
    async fn retries_with_backoff_then_delivers() {
        let channel = ScriptedChannel::failing(2);
        let h = harness(channel.clone());
        let outcome = h
            .dispatcher
            .notify(&decision("m1", Tier::Immediate), &channel_config(3, 5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 3 });
        assert_eq!(
            h.clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        let attempts = h.store.list_attempts("m1", "sms").await.unwrap();
        let outcomes: Vec<_> = attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![AttemptOutcome::Failed, AttemptOutcome::Failed, AttemptOutcome::Sent]
        );
        assert_eq!(attempts[2].attempt_number, 3);

        let stats = h.dispatcher.stats("sms").unwrap();
        assert_eq!((stats.sent, stats.failed), (1, 2));
    }

    #[tokio::test]
    async fn second_notify_is_idempotent() {
        let channel = ScriptedChannel::new(vec![]);
        let h = harness(channel.clone());
        let d = decision("m1", Tier::Immediate);
        let cancel = CancellationToken::new();
        h.dispatcher.notify(&d, &channel_config(3, 5), &cancel).await.unwrap();
        let again = h.dispatcher.notify(&d, &channel_config(3, 5), &cancel).await.unwrap();

        assert_eq!(again, DispatchOutcome::AlreadyDelivered);
        assert_eq!(channel.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_are_channel_unavailable() {
        let channel = ScriptedChannel::failing(10);
        let h = harness(channel.clone());
        let err = h
            .dispatcher
            .notify(&decision("m1", Tier::Immediate), &channel_config(3, 10), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_channel_unavailable());
        assert!(matches!(err, EscalationError::ChannelUnavailable { attempts: 3, .. }));
        assert_eq!(channel.calls(), 3);
        assert_eq!(h.dispatcher.stats("sms").unwrap().unavailable, 1);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_calling_channel() {
        let channel = ScriptedChannel::failing(2);
        let h = harness(channel.clone());
        let config = channel_config(1, 2);
        let cancel = CancellationToken::new();

        for id in ["m1", "m2"] {
            let err = h
                .dispatcher
                .notify(&decision(id, Tier::Immediate), &config, &cancel)
                .await
                .unwrap_err();
            assert!(err.is_channel_unavailable());
        }
        assert_eq!(channel.calls(), 2);
        assert_eq!(h.dispatcher.circuit_state("sms"), Some(CircuitState::Open));

        // Inside the cooldown: throttled, channel untouched.
        h.clock.advance(Duration::from_secs(30));
        let err = h
            .dispatcher
            .notify(&decision("m3", Tier::Immediate), &config, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(&err, EscalationError::ChannelUnavailable { reason, .. } if reason.contains("circuit open")));
        assert_eq!(channel.calls(), 2);
        let attempts = h.store.list_attempts("m3", "sms").await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Throttled);

        // After the cooldown the trial goes through and closes the circuit.
        h.clock.advance(Duration::from_secs(30));
        let outcome = h
            .dispatcher
            .notify(&decision("m3", Tier::Immediate), &config, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 1 });
        assert_eq!(channel.calls(), 3);
        assert_eq!(h.dispatcher.circuit_state("sms"), Some(CircuitState::Closed));
        assert_eq!(h.dispatcher.stats("sms").unwrap().throttled, 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_attempt() {
        let channel = ScriptedChannel::new(vec![]);
        let h = harness(channel.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h
            .dispatcher
            .notify(&decision("m1", Tier::Immediate), &channel_config(3, 5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EscalationError::Cancelled { attempts: 0, .. }));
        assert_eq!(channel.calls(), 0);
        assert!(h.store.list_attempts("m1", "sms").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_send_times_out_as_failure() {
        let mut settings = TriageConfig::default();
        settings.escalation.send_timeout_ms = 20;
        let h = harness_with(Arc::new(StalledChannel), settings);
        let err = h
            .dispatcher
            .notify(&decision("m1", Tier::Immediate), &channel_config(1, 5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_channel_unavailable());
        let attempts = h.store.list_attempts("m1", "sms").await.unwrap();
        assert_eq!(attempts[0].outcome, AttemptOutcome::Failed);
        assert!(attempts[0].error.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn unknown_channel_is_recorded_and_counted() {
        let h = harness(ScriptedChannel::new(vec![]));
        let mut config = channel_config(1, 5);
        config.name = "pager".into();
        let err = h
            .dispatcher
            .notify(&decision("m1", Tier::Immediate), &config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_channel_unavailable());
        assert!(matches!(err, EscalationError::UnknownChannel(name) if name == "pager"));

        let attempts = h.store.list_attempts("m1", "pager").await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Failed);
        assert_eq!(attempts[0].error.as_deref(), Some("channel not registered"));

        let stats = h.dispatcher.stats("pager").unwrap();
        assert_eq!((stats.failed, stats.unavailable), (1, 1));
        assert!(h.dispatcher.all_stats().contains_key("pager"));
    }

    #[tokio::test]
    async fn cancel_during_backoff_stops_retries() {
        let cancel = CancellationToken::new();
        let channel = Arc::new(ScriptedChannel::build(
            vec![Err(ChannelError::SendFailed {
                name: "sms".into(),
                reason: "gateway down".into(),
            })],
            Some(cancel.clone()),
        ));
        let h = harness(channel.clone());
        let err = h
            .dispatcher
            .notify(&decision("m1", Tier::Immediate), &channel_config(3, 5), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, EscalationError::Cancelled { attempts: 1, .. }));
        assert_eq!(channel.calls(), 1);
        let attempts = h.store.list_attempts("m1", "sms").await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Failed);
        assert_eq!(h.dispatcher.stats("sms").unwrap().cancelled, 1);
    }

    #[tokio::test]
    async fn sends_carry_per_attempt_idempotency_keys() {
        let channel = ScriptedChannel::failing(1);
        let h = harness(channel.clone());
        h.dispatcher
            .notify(&decision("m1", Tier::Immediate), &channel_config(3, 5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(channel.keys(), vec!["m1:sms:1", "m1:sms:2"]);
    }

    #[tokio::test]
    async fn unrecorded_delivery_is_not_resent() {
        let channel = ScriptedChannel::new(vec![]);
        let h = harness(channel.clone());
        let d = decision("m1", Tier::Immediate);
        let cancel = CancellationToken::new();

        h.store.fail_attempt_records(1);
        let first = h.dispatcher.notify(&d, &channel_config(3, 5), &cancel).await.unwrap();
        assert_eq!(first, DispatchOutcome::Delivered { attempts: 1 });
        assert!(h.store.list_attempts("m1", "sms").await.unwrap().is_empty());

        let again = h.dispatcher.notify(&d, &channel_config(3, 5), &cancel).await.unwrap();
        assert_eq!(again, DispatchOutcome::AlreadyDelivered);
        assert_eq!(channel.calls(), 1);
        assert_eq!(h.dispatcher.stats("sms").unwrap().sent, 1);
    }

    #[tokio::test]
    async fn abandoned_trial_does_not_wedge_the_circuit() {
        let channel = Arc::new(FailThenHang {
            calls: AtomicU64::new(0),
        });
        let h = harness(channel.clone());
        let config = channel_config(1, 1);
        let cancel = CancellationToken::new();

        assert!(h
            .dispatcher
            .notify(&decision("m1", Tier::Immediate), &config, &cancel)
            .await
            .is_err());
        assert_eq!(h.dispatcher.circuit_state("sms"), Some(CircuitState::Open));

        // The trial call hangs and the caller gives up on it.
        h.clock.advance(Duration::from_secs(60));
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            h.dispatcher.notify(&decision("m2", Tier::Immediate), &config, &cancel),
        )
        .await;
        assert!(abandoned.is_err());

        let outcome = h
            .dispatcher
            .notify(&decision("m3", Tier::Immediate), &config, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 1 });
        assert_eq!(h.dispatcher.circuit_state("sms"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn notify_all_uses_configured_channels() {
        let mut settings = TriageConfig::default();
        settings.escalation.channels = vec![channel_config(1, 5)];
        let channel = ScriptedChannel::new(vec![]);
        let h = harness_with(channel.clone(), settings);

        let results = h
            .dispatcher
            .notify_all(&decision("m1", Tier::Immediate), &CancellationToken::new())
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "sms");
        assert!(matches!(results[0].1, Ok(DispatchOutcome::Delivered { attempts: 1 })));
    }
}
