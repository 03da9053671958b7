//! Feedback learner: additive per-tier feature weights nudged by corrections.
//!
//! `score(tier) = baseline[tier] + Σ weight[tier][feature]` over the
//! features present on a message. A correction moves every present
//! feature's weight down on the predicted tier and up on the corrected one.
//! Corrections buffer until `batch_size` accumulate, then a new snapshot is
//! persisted and swapped in; readers never see a half-trained snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{ConfigHandle, LearningConfig};
use crate::error::DatabaseError;
use crate::pipeline::types::{Decision, Feature, FeatureSet, Tier};
use crate::store::traits::Persistence;

/// Weights for one tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierWeights {
    pub baseline: f64,
    #[serde(default)]
    pub features: BTreeMap<Feature, f64>,
}

/// Immutable committed weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    /// 0 for the untrained snapshot; bumped on every retrain.
    pub version: u64,
    /// Indexed by `tier.number() - 1`.
    pub tiers: [TierWeights; 4],
    pub committed_at: DateTime<Utc>,
}

fn slot(tier: Tier) -> usize {
    usize::from(tier.number() - 1)
}

impl WeightSnapshot {
    /// All-zero weights.
    pub fn initial() -> Self {
        Self {
            version: 0,
            tiers: Default::default(),
            committed_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn weight(&self, tier: Tier, feature: Feature) -> f64 {
        self.tiers[slot(tier)]
            .features
            .get(&feature)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn set_weight(&mut self, tier: Tier, feature: Feature, weight: f64) {
        self.tiers[slot(tier)].features.insert(feature, weight);
    }

    pub fn score(&self, tier: Tier, features: &FeatureSet) -> f64 {
        let weights = &self.tiers[slot(tier)];
        weights.baseline
            + features
                .iter()
                .map(|f| weights.features.get(f).copied().unwrap_or(0.0))
                .sum::<f64>()
    }

    /// Best-scoring tier other than `base`, if it leads `base` by at least
    /// `margin`. Returns the tier and its lead.
    pub fn preferred_over(
        &self,
        base: Tier,
        features: &FeatureSet,
        margin: f64,
    ) -> Option<(Tier, f64)> {
        if self.version == 0 || !margin.is_finite() {
            return None;
        }
        let base_score = self.score(base, features);
        Tier::ALL
            .into_iter()
            .filter(|t| *t != base)
            .map(|t| (t, self.score(t, features) - base_score))
            .fold(None, |best: Option<(Tier, f64)>, (tier, lead)| match best {
                Some((_, best_lead)) if best_lead >= lead => best,
                _ => Some((tier, lead)),
            })
            .filter(|(_, lead)| *lead > 0.0 && *lead >= margin)
    }

    /// Apply one correction in place.
    fn nudge(&mut self, correction: &Correction, config: &LearningConfig) {
        let rate = config.learning_rate;
        let limit = config.max_weight;
        for feature in &correction.features {
            let down = self.weight(correction.predicted, *feature) - rate;
            self.set_weight(correction.predicted, *feature, down.clamp(-limit, limit));
            let up = self.weight(correction.corrected, *feature) + rate;
            self.set_weight(correction.corrected, *feature, up.clamp(-limit, limit));
        }
    }
}

/// A principal's tier correction for one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub message_id: String,
    pub features: FeatureSet,
    pub predicted: Tier,
    pub corrected: Tier,
    pub recorded_at: DateTime<Utc>,
}

/// Buffers corrections and commits retrained weight snapshots.
pub struct FeedbackLearner {
    committed: ArcSwap<WeightSnapshot>,
    /// Held for the whole retrain so two retrains cannot interleave.
    pending: Mutex<Vec<Correction>>,
    store: Arc<dyn Persistence>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
}

impl FeedbackLearner {
    pub fn new(store: Arc<dyn Persistence>, config: ConfigHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            committed: ArcSwap::from_pointee(WeightSnapshot::initial()),
            pending: Mutex::new(Vec::new()),
            store,
            config,
            clock,
        }
    }

    /// Learner seeded with the last persisted snapshot, if any.
    pub async fn restore(
        store: Arc<dyn Persistence>,
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DatabaseError> {
        let learner = Self::new(store, config, clock);
        if let Some(snapshot) = learner.store.load_weights().await? {
            info!(version = snapshot.version, "Restored learner weights");
            learner.committed.store(Arc::new(snapshot));
        }
        Ok(learner)
    }

    /// Currently committed snapshot.
    pub fn snapshot(&self) -> Arc<WeightSnapshot> {
        self.committed.load_full()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Record a correction. Returns the new snapshot when this correction
    /// completed a batch and triggered a retrain.
    pub async fn record_correction(
        &self,
        decision: &Decision,
        corrected: Tier,
    ) -> Result<Option<Arc<WeightSnapshot>>, DatabaseError> {
        if decision.tier == corrected {
            debug!(message_id = %decision.message_id, "Correction agrees with prediction, ignored");
            return Ok(None);
        }

        let batch_size = self.config.snapshot().settings.learning.batch_size;
        let mut pending = self.pending.lock().await;
        pending.push(Correction {
            message_id: decision.message_id.clone(),
            features: decision.features.clone(),
            predicted: decision.tier,
            corrected,
            recorded_at: self.clock.now(),
        });
        debug!(
            message_id = %decision.message_id,
            predicted = %decision.tier,
            %corrected,
            pending = pending.len(),
            "Correction recorded"
        );

        if pending.len() < batch_size {
            return Ok(None);
        }
        self.retrain_locked(&mut pending).await.map(Some)
    }

    /// Fold every pending correction into a new committed snapshot.
    /// With nothing pending, returns the current snapshot unchanged.
    pub async fn retrain(&self) -> Result<Arc<WeightSnapshot>, DatabaseError> {
        let mut pending = self.pending.lock().await;
        self.retrain_locked(&mut pending).await
    }

    async fn retrain_locked(
        &self,
        pending: &mut Vec<Correction>,
    ) -> Result<Arc<WeightSnapshot>, DatabaseError> {
        let current = self.snapshot();
        if pending.is_empty() {
            return Ok(current);
        }

        let config = self.config.snapshot().settings.learning.clone();
        let mut next = (*current).clone();
        for correction in pending.iter() {
            next.nudge(correction, &config);
        }
        next.version = current.version + 1;
        next.committed_at = self.clock.now();

        // Persist before publishing; on failure the corrections stay pending.
        self.store.save_weights(&next).await?;

        let next = Arc::new(next);
        self.committed.store(next.clone());
        info!(
            version = next.version,
            corrections = pending.len(),
            "Learner weights committed"
        );
        pending.clear();
        Ok(next)
    }
}

impl std::fmt::Debug for FeedbackLearner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackLearner")
            .field("version", &self.snapshot().version)
            .finish_non_exhaustive()
    }
}
