//! Configuration types and the hot-reloadable configuration handle.
//!
//! `TriageConfig` is plain serde data. It is validated and compiled into an
//! immutable [`RuntimeConfig`] snapshot, which [`ConfigHandle`] swaps
//! atomically on reload. Readers always see one whole snapshot.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::pipeline::rules::RulesEngine;
use crate::pipeline::types::{Action, Tier};

/// Environment variable naming the JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "TRIAGE_CONFIG";

/// Upper bound on any time span a setting may express (about a century).
const MAX_SPAN_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// `value` units of `unit_secs` seconds, if within `MAX_SPAN_SECS`.
fn bounded_span(value: u64, unit_secs: u64) -> Option<chrono::Duration> {
    value
        .checked_mul(unit_secs)
        .filter(|secs| *secs <= MAX_SPAN_SECS)
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(chrono::Duration::try_seconds)
}

/// Like `bounded_span`, saturating at the upper bound.
fn saturating_span(value: u64, unit_secs: u64) -> chrono::Duration {
    bounded_span(value, unit_secs)
        .unwrap_or_else(|| chrono::Duration::seconds(MAX_SPAN_SECS as i64))
}

/// Full triage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub rules: RuleConfig,
    pub dedupe: DedupeConfig,
    pub approval: ApprovalConfig,
    pub escalation: EscalationConfig,
    pub learning: LearningConfig,
}

// ── Rules ───────────────────────────────────────────────────────────

/// Keyword lists and sender lists for the rule evaluator.
///
/// Entries are matched as case-insensitive substrings. An entry starting
/// with `re:` is a case-insensitive regular expression instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Full addresses, or `@domain` entries.
    pub off_limits_senders: Vec<String>,
    pub urgent_keywords: Vec<String>,
    pub financial_terms: Vec<String>,
    pub approval_terms: Vec<String>,
    pub confidential_terms: Vec<String>,
    pub scheduling_terms: Vec<String>,
    pub bulk_markers: Vec<String>,
    pub tier_actions: TierActions,
    /// Recipient count at which `ManyRecipients` is set.
    pub many_recipients_threshold: usize,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            off_limits_senders: Vec::new(),
            urgent_keywords: strings(&["urgent", "critical", "emergency", "asap", "immediate"]),
            financial_terms: strings(&["invoice", "payment", "contract", "legal"]),
            approval_terms: strings(&["approve", "sign"]),
            confidential_terms: strings(&[
                "performance",
                "salary",
                "compensation",
                "termination",
                "disciplinary",
                "confidential",
            ]),
            scheduling_terms: strings(&["meeting", "calendar", "schedule", "availability"]),
            bulk_markers: strings(&["newsletter", "noreply", "no-reply", "update"]),
            tier_actions: TierActions::default(),
            many_recipients_threshold: 5,
        }
    }
}

/// Tier → action mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierActions {
    pub tier1: Action,
    pub tier2: Action,
    pub tier3: Action,
    pub tier4: Action,
}

impl Default for TierActions {
    fn default() -> Self {
        Self {
            tier1: Action::Escalate,
            tier2: Action::Handle,
            tier3: Action::Draft,
            tier4: Action::FlagOnly,
        }
    }
}

impl TierActions {
    pub fn for_tier(&self, tier: Tier) -> Action {
        match tier {
            Tier::Immediate => self.tier1,
            Tier::Autonomous => self.tier2,
            Tier::Review => self.tier3,
            Tier::Restricted => self.tier4,
        }
    }
}

// ── Dedupe ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    /// Jaccard index above which two bodies are content duplicates.
    pub content_similarity: f64,
    /// Share of an earlier body that must be quoted for a quoted reply.
    pub quoted_reply_coverage: f64,
    /// Time span within which same-subject copies form a CC group.
    pub cc_group_span_secs: u64,
    /// Matching window entries needed for a CC group.
    pub cc_group_min_entries: usize,
    /// Hard cap on fingerprints kept per principal.
    pub window_size: usize,
    /// Fingerprints older than this are dropped.
    pub retention_hours: u64,
    /// Upper bound on a window load before falling back to UNIQUE.
    pub lookup_timeout_ms: u64,
    /// Cap on tokens kept per fingerprint.
    pub max_tokens: usize,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            content_similarity: 0.95,
            quoted_reply_coverage: 0.8,
            cc_group_span_secs: 600,
            cc_group_min_entries: 2,
            window_size: 2000,
            retention_hours: 72,
            lookup_timeout_ms: 250,
            max_tokens: 2048,
        }
    }
}

impl DedupeConfig {
    pub fn cc_group_span(&self) -> chrono::Duration {
        saturating_span(self.cc_group_span_secs, 1)
    }

    pub fn retention(&self) -> chrono::Duration {
        saturating_span(self.retention_hours, 60 * 60)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

// ── Approval ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Pending items at least this old are expired by the sweep.
    pub ttl_minutes: u64,
    pub sweep_interval_secs: u64,
    /// Resolved items kept before the oldest are pruned.
    pub retention_threshold: usize,
    /// Queue HANDLE actions for sign-off instead of running them.
    pub handle_requires_approval: bool,
    /// Queue a response item for escalated messages as well.
    pub queue_escalations: bool,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 24 * 60,
            sweep_interval_secs: 60,
            retention_threshold: 500,
            handle_requires_approval: false,
            queue_escalations: true,
        }
    }
}

impl ApprovalConfig {
    pub fn ttl(&self) -> chrono::Duration {
        saturating_span(self.ttl_minutes, 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// ── Escalation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub channels: Vec<ChannelConfig>,
    /// Upper bound on a single send.
    pub send_timeout_ms: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            send_timeout_ms: 10_000,
        }
    }
}

impl EscalationConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// One notification channel and its delivery discipline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Registered channel name (e.g. "sms", "chat").
    pub name: String,
    /// Channel-specific destination (phone number, chat id, ...).
    pub target: String,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Random spread applied to each delay, as a fraction (0.0 disables).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// Delay after the given attempt (1-based): `min(base * 2^(attempt-1), max)`,
    /// then ±`jitter`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);

        if self.jitter <= 0.0 {
            return Duration::from_millis(raw);
        }

        use rand::Rng;
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let jittered = (raw as f64 * (1.0 + spread)).max(0.0);
        Duration::from_millis(jittered as u64)
    }
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call.
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        saturating_span(self.cooldown_secs, 1)
    }
}

// ── Learning ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub learning_rate: f64,
    /// Corrections accumulated before a retrain.
    pub batch_size: usize,
    /// Score lead a learned tier needs over the default tier.
    pub override_margin: f64,
    /// Weights are clamped to ±this value.
    pub max_weight: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            batch_size: 20,
            override_margin: 1.0,
            max_weight: 5.0,
        }
    }
}

// ── Loading & validation ────────────────────────────────────────────

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn check_span(key: &str, value: u64, unit_secs: u64) -> Result<(), ConfigError> {
    match bounded_span(value, unit_secs) {
        Some(_) => Ok(()),
        None => Err(invalid(key, "time span out of range (at most 100 years)")),
    }
}

/// Every configured channel must be one the host registered.
fn check_registered(settings: &TriageConfig, registered: &BTreeSet<String>) -> Result<(), ConfigError> {
    match settings
        .escalation
        .channels
        .iter()
        .find(|c| !registered.contains(&c.name))
    {
        Some(channel) => Err(invalid(
            "escalation.channels.name",
            format!(
                "channel {} is not registered (known: {})",
                channel.name,
                registered.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
        )),
        None => Ok(()),
    }
}

impl TriageConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Read and parse a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Path from `TRIAGE_CONFIG`, if set.
    pub fn path_from_env() -> Option<PathBuf> {
        std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from)
    }

    /// Check structural constraints. Malformed keyword patterns are not
    /// rejected here; they fail classification of the messages that reach them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dedupe = &self.dedupe;
        check_span("dedupe.retention_hours", dedupe.retention_hours, 60 * 60)?;
        check_span("dedupe.cc_group_span_secs", dedupe.cc_group_span_secs, 1)?;
        check_span("approval.ttl_minutes", self.approval.ttl_minutes, 60)?;
        if self.approval.sweep_interval_secs == 0 {
            return Err(invalid("approval.sweep_interval_secs", "must be at least 1"));
        }
        check_span("approval.sweep_interval_secs", self.approval.sweep_interval_secs, 1)?;
        if !(dedupe.content_similarity > 0.0 && dedupe.content_similarity <= 1.0) {
            return Err(invalid("dedupe.content_similarity", "must be in (0, 1]"));
        }
        if !(dedupe.quoted_reply_coverage > 0.0 && dedupe.quoted_reply_coverage <= 1.0) {
            return Err(invalid("dedupe.quoted_reply_coverage", "must be in (0, 1]"));
        }
        if dedupe.window_size == 0 {
            return Err(invalid("dedupe.window_size", "must be at least 1"));
        }
        if dedupe.cc_group_min_entries == 0 {
            return Err(invalid("dedupe.cc_group_min_entries", "must be at least 1"));
        }

        if self.rules.tier_actions.tier4 != Action::FlagOnly {
            return Err(invalid(
                "rules.tier_actions.tier4",
                "tier 4 must map to FLAG_ONLY",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for channel in &self.escalation.channels {
            if channel.name.trim().is_empty() {
                return Err(invalid("escalation.channels.name", "must not be empty"));
            }
            if !seen.insert(channel.name.as_str()) {
                return Err(invalid(
                    "escalation.channels.name",
                    format!("duplicate channel {}", channel.name),
                ));
            }
            let key = format!("escalation.channels.{}", channel.name);
            if channel.retry.max_attempts == 0 {
                return Err(invalid(&format!("{key}.retry.max_attempts"), "must be at least 1"));
            }
            if channel.retry.base_delay_ms > channel.retry.max_delay_ms {
                return Err(invalid(
                    &format!("{key}.retry.base_delay_ms"),
                    "must not exceed max_delay_ms",
                ));
            }
            if !(0.0..1.0).contains(&channel.retry.jitter) {
                return Err(invalid(&format!("{key}.retry.jitter"), "must be in [0, 1)"));
            }
            check_span(&format!("{key}.retry.max_delay_ms"), channel.retry.max_delay_ms / 1000, 1)?;
            if channel.breaker.failure_threshold == 0 {
                return Err(invalid(
                    &format!("{key}.breaker.failure_threshold"),
                    "must be at least 1",
                ));
            }
            check_span(&format!("{key}.breaker.cooldown_secs"), channel.breaker.cooldown_secs, 1)?;
        }

        let learning = &self.learning;
        if learning.learning_rate <= 0.0 {
            return Err(invalid("learning.learning_rate", "must be positive"));
        }
        if learning.batch_size == 0 {
            return Err(invalid("learning.batch_size", "must be at least 1"));
        }
        if learning.max_weight <= 0.0 {
            return Err(invalid("learning.max_weight", "must be positive"));
        }

        Ok(())
    }
}

// ── Runtime snapshot ────────────────────────────────────────────────

/// Validated, compiled configuration. Never mutated after construction.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub version: u64,
    pub settings: TriageConfig,
    pub rules: RulesEngine,
    pub loaded_at: DateTime<Utc>,
}

impl RuntimeConfig {
    fn build(settings: TriageConfig, version: u64) -> Result<Self, ConfigError> {
        settings.validate()?;
        let rules = RulesEngine::compile(&settings.rules);
        for problem in rules.invalid_patterns() {
            warn!(version, problem = %problem, "Configuration contains a malformed pattern");
        }
        Ok(Self {
            version,
            settings,
            rules,
            loaded_at: Utc::now(),
        })
    }
}

/// Shared handle to the current configuration snapshot.
///
/// Cloning the handle shares the same snapshot slot.
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<ArcSwap<RuntimeConfig>>,
    next_version: Arc<AtomicU64>,
    /// Channel names the host can deliver on, once registered.
    registered: Arc<ArcSwapOption<BTreeSet<String>>>,
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("version", &self.snapshot().version)
            .finish()
    }
}

impl ConfigHandle {
    /// Validate and install an initial configuration (version 1).
    pub fn new(settings: TriageConfig) -> Result<Self, ConfigError> {
        let runtime = RuntimeConfig::build(settings, 1)?;
        Ok(Self {
            current: Arc::new(ArcSwap::from_pointee(runtime)),
            next_version: Arc::new(AtomicU64::new(2)),
            registered: Arc::new(ArcSwapOption::empty()),
        })
    }

    /// Handle over the built-in defaults.
    pub fn with_defaults() -> Result<Self, ConfigError> {
        Self::new(TriageConfig::default())
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        Self::new(TriageConfig::load(path)?)
    }

    /// The snapshot in effect right now.
    pub fn snapshot(&self) -> Arc<RuntimeConfig> {
        self.current.load_full()
    }

    /// Pin the set of deliverable channel names. The current snapshot and
    /// every later reload must only configure channels from this set.
    pub fn register_channels(
        &self,
        names: impl IntoIterator<Item = String>,
    ) -> Result<(), ConfigError> {
        let names: BTreeSet<String> = names.into_iter().collect();
        check_registered(&self.snapshot().settings, &names)?;
        self.registered.store(Some(Arc::new(names)));
        Ok(())
    }

    /// Replace the configuration. On error the current snapshot stays.
    pub fn reload(&self, settings: TriageConfig) -> Result<u64, ConfigError> {
        if let Some(registered) = self.registered.load_full() {
            check_registered(&settings, &registered)?;
        }
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let runtime = RuntimeConfig::build(settings, version)?;
        self.current.store(Arc::new(runtime));
        info!(version, "Configuration reloaded");
        Ok(version)
    }

    pub fn reload_from_path(&self, path: &Path) -> Result<u64, ConfigError> {
        self.reload(TriageConfig::load(path)?)
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Spawn a background task that reloads `path` whenever its mtime changes.
pub fn spawn_config_watcher(
    handle: ConfigHandle,
    path: PathBuf,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seen = modified_at(&path);
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            let current = modified_at(&path);
            if current == last_seen {
                continue;
            }
            last_seen = current;
            debug!(path = %path.display(), "Configuration file changed");
            if let Err(e) = handle.reload_from_path(&path) {
                warn!(path = %path.display(), error = %e, "Rejected configuration reload, keeping previous snapshot");
            }
        }
    })
}
