//! Deterministic rule evaluator.
//!
//! Assigns a tier, action and audit reason to a message. Rules are checked
//! top-down and the first match wins:
//!
//! 1. off-limits sender → tier 1
//! 2. urgent keyword in subject/body → tier 1
//! 3. financial/legal term + approval term in body → tier 1
//! 4. HR/confidential term in body → tier 4
//! 5. scheduling term in subject/body → tier 2
//! 6. bulk/automated sender or subject → tier 2
//! 7. first-time contact → tier 3
//! 8. default → tier 3
//!
//! Matching is case-insensitive substring containment. List entries
//! prefixed with `re:` are compiled as regular expressions.

use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::config::{RuleConfig, TierActions};
use crate::error::ClassificationError;
use crate::learning::feedback::WeightSnapshot;
use crate::pipeline::types::{DedupeStatus, Feature, FeatureSet, Message, Tier};

/// Prefix that marks a list entry as a regular expression.
const REGEX_PREFIX: &str = "re:";

const CONFIDENCE_OFF_LIMITS: f32 = 1.0;
const CONFIDENCE_URGENT: f32 = 0.9;
const CONFIDENCE_FINANCIAL: f32 = 0.85;
const CONFIDENCE_CONFIDENTIAL: f32 = 0.9;
const CONFIDENCE_SCHEDULING: f32 = 0.8;
const CONFIDENCE_BULK: f32 = 0.75;
const CONFIDENCE_FIRST_CONTACT: f32 = 0.6;
const CONFIDENCE_DEFAULT: f32 = 0.5;
const CONFIDENCE_DOWNRANKED: f32 = 0.4;

// ── Matchers ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Matcher {
    Substring(String),
    Pattern { source: String, regex: Regex },
    Invalid { source: String, reason: String },
}

impl Matcher {
    fn compile(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return None;
        }
        if let Some(pattern) = entry.strip_prefix(REGEX_PREFIX) {
            return Some(
                match RegexBuilder::new(pattern).case_insensitive(true).build() {
                    Ok(regex) => Self::Pattern {
                        source: entry.to_string(),
                        regex,
                    },
                    Err(e) => Self::Invalid {
                        source: entry.to_string(),
                        reason: e.to_string(),
                    },
                },
            );
        }
        Some(Self::Substring(entry.to_lowercase()))
    }
}

/// A named, compiled keyword list.
#[derive(Debug, Clone)]
pub struct KeywordList {
    name: &'static str,
    matchers: Vec<Matcher>,
}

impl KeywordList {
    fn compile(name: &'static str, entries: &[String]) -> Self {
        Self {
            name,
            matchers: entries.iter().filter_map(|e| Matcher::compile(e)).collect(),
        }
    }

    /// First valid entry found in `haystack` (already lowercased). A
    /// malformed entry is an error only when no valid entry matches.
    fn find(&self, haystack: &str) -> Result<Option<String>, ClassificationError> {
        let mut malformed = None;
        for matcher in &self.matchers {
            match matcher {
                Matcher::Substring(term) => {
                    if haystack.contains(term.as_str()) {
                        return Ok(Some(term.clone()));
                    }
                }
                Matcher::Pattern { source, regex } => {
                    if regex.is_match(haystack) {
                        return Ok(Some(source.clone()));
                    }
                }
                Matcher::Invalid { source, reason } => {
                    malformed.get_or_insert((source, reason));
                }
            }
        }
        match malformed {
            Some((source, reason)) => Err(ClassificationError::Configuration {
                list: self.name.to_string(),
                pattern: source.clone(),
                reason: reason.clone(),
            }),
            None => Ok(None),
        }
    }

    fn contains(&self, haystack: &str) -> bool {
        matches!(self.find(haystack), Ok(Some(_)))
    }

    fn invalid_entries(&self) -> impl Iterator<Item = String> + '_ {
        self.matchers.iter().filter_map(move |m| match m {
            Matcher::Invalid { source, reason } => {
                Some(format!("{}: {source:?} ({reason})", self.name))
            }
            _ => None,
        })
    }
}

/// Off-limits sender list: full addresses, `@domain` entries or `re:` patterns.
#[derive(Debug, Clone)]
struct SenderList {
    addresses: Vec<String>,
    domains: Vec<String>,
    patterns: KeywordList,
}

impl SenderList {
    fn compile(entries: &[String]) -> Self {
        let mut addresses = Vec::new();
        let mut domains = Vec::new();
        let mut patterns = Vec::new();
        for entry in entries {
            let entry = entry.trim();
            if entry.starts_with(REGEX_PREFIX) {
                patterns.push(entry.to_string());
            } else if let Some(domain) = entry.strip_prefix('@') {
                domains.push(format!("@{}", domain.to_lowercase()));
            } else if !entry.is_empty() {
                addresses.push(entry.to_lowercase());
            }
        }
        Self {
            addresses,
            domains,
            patterns: KeywordList::compile("off_limits_senders", &patterns),
        }
    }

    fn find(&self, address: &str) -> Result<Option<String>, ClassificationError> {
        if address.is_empty() {
            return Ok(None);
        }
        if let Some(hit) = self.addresses.iter().find(|a| a.as_str() == address) {
            return Ok(Some(hit.clone()));
        }
        if let Some(hit) = self.domains.iter().find(|d| address.ends_with(d.as_str())) {
            return Ok(Some(hit.clone()));
        }
        self.patterns.find(address)
    }
}

// ── Evaluation ──────────────────────────────────────────────────────

/// Which rule produced an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedRule {
    OffLimitsSender,
    UrgentKeyword,
    FinancialApproval,
    Confidential,
    Scheduling,
    BulkOrigin,
    FirstTimeContact,
    Default,
    /// Default rule overridden by learned weights.
    Learned,
    /// Evaluation failed; defaulted to review.
    ConfigurationError,
}

/// Result of evaluating one message.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub tier: Tier,
    pub action: crate::pipeline::types::Action,
    pub reason: String,
    pub confidence: f32,
    pub features: FeatureSet,
    pub rule: MatchedRule,
}

/// Inputs beyond the message itself.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub dedupe_status: DedupeStatus,
    /// Committed learner weights, consulted only by the default rules.
    pub weights: Option<&'a WeightSnapshot>,
    pub override_margin: f64,
}

impl Default for EvaluationContext<'_> {
    fn default() -> Self {
        Self {
            dedupe_status: DedupeStatus::Unique,
            weights: None,
            override_margin: f64::INFINITY,
        }
    }
}

/// Lowercased views of the fields the rules look at.
struct Prepared {
    sender: String,
    subject: String,
    body: String,
}

impl Prepared {
    fn new(message: &Message) -> Self {
        Self {
            sender: message.sender_address(),
            subject: message.subject.to_lowercase(),
            body: message.body.to_lowercase(),
        }
    }
}

/// Compiled rule set. Built once per configuration snapshot.
#[derive(Debug, Clone)]
pub struct RulesEngine {
    off_limits: SenderList,
    urgent: KeywordList,
    financial: KeywordList,
    approval: KeywordList,
    confidential: KeywordList,
    scheduling: KeywordList,
    bulk: KeywordList,
    tier_actions: TierActions,
    many_recipients_threshold: usize,
}

impl RulesEngine {
    /// Compile a rule configuration. Never fails: malformed patterns are kept
    /// and reported when a message reaches them.
    pub fn compile(config: &RuleConfig) -> Self {
        Self {
            off_limits: SenderList::compile(&config.off_limits_senders),
            urgent: KeywordList::compile("urgent_keywords", &config.urgent_keywords),
            financial: KeywordList::compile("financial_terms", &config.financial_terms),
            approval: KeywordList::compile("approval_terms", &config.approval_terms),
            confidential: KeywordList::compile("confidential_terms", &config.confidential_terms),
            scheduling: KeywordList::compile("scheduling_terms", &config.scheduling_terms),
            bulk: KeywordList::compile("bulk_markers", &config.bulk_markers),
            tier_actions: config.tier_actions,
            many_recipients_threshold: config.many_recipients_threshold,
        }
    }

    /// Rules engine over the built-in defaults.
    pub fn default_rules() -> Self {
        Self::compile(&RuleConfig::default())
    }

    /// Human-readable descriptions of every malformed pattern.
    pub fn invalid_patterns(&self) -> Vec<String> {
        [
            &self.off_limits.patterns,
            &self.urgent,
            &self.financial,
            &self.approval,
            &self.confidential,
            &self.scheduling,
            &self.bulk,
        ]
        .iter()
        .flat_map(|list| list.invalid_entries())
        .collect()
    }

    /// Evaluate a fresh, unique message with no learned weights.
    pub fn evaluate(&self, message: &Message) -> Evaluation {
        self.evaluate_with(message, &EvaluationContext::default())
    }

    /// Evaluate a message. Total: configuration errors yield a tier-3
    /// evaluation with the error in the reason.
    pub fn evaluate_with(&self, message: &Message, ctx: &EvaluationContext<'_>) -> Evaluation {
        let prepared = Prepared::new(message);
        let features = self.features(message, &prepared, ctx.dedupe_status);

        match self.try_evaluate(message, &prepared, ctx, &features) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Rule evaluation failed, defaulting to review");
                Evaluation {
                    tier: Tier::Review,
                    action: self.tier_actions.for_tier(Tier::Review),
                    reason: format!("Configuration error ({e}); requires review"),
                    confidence: 0.0,
                    features,
                    rule: MatchedRule::ConfigurationError,
                }
            }
        }
    }

    fn try_evaluate(
        &self,
        message: &Message,
        prepared: &Prepared,
        ctx: &EvaluationContext<'_>,
        features: &FeatureSet,
    ) -> Result<Evaluation, ClassificationError> {
        let build = |tier: Tier, rule: MatchedRule, reason: String, confidence: f32| Evaluation {
            tier,
            action: self.tier_actions.for_tier(tier),
            reason,
            confidence,
            features: features.clone(),
            rule,
        };

        // 1. Off-limits sender
        if let Some(entry) = self.off_limits.find(&prepared.sender)? {
            debug!(message_id = %message.id, entry = %entry, "Off-limits sender");
            return Ok(build(
                Tier::Immediate,
                MatchedRule::OffLimitsSender,
                format!("Sender {} is on the off-limits list", prepared.sender),
                CONFIDENCE_OFF_LIMITS,
            ));
        }

        // 2. Urgent keyword
        let urgent = match self.urgent.find(&prepared.subject)? {
            Some(term) => Some((term, "subject")),
            None => self.urgent.find(&prepared.body)?.map(|t| (t, "body")),
        };
        if let Some((term, field)) = urgent {
            let reason = format!("Urgent keyword \"{term}\" in {field}");
            return Ok(self.keyword_escalation(
                build,
                MatchedRule::UrgentKeyword,
                reason,
                CONFIDENCE_URGENT,
                ctx.dedupe_status,
            ));
        }

        // 3. Financial/legal term together with an approval term
        if let Some(financial) = self.financial.find(&prepared.body)?
            && let Some(approval) = self.approval.find(&prepared.body)?
        {
            let reason = format!(
                "Financial/legal term \"{financial}\" with approval term \"{approval}\" in body"
            );
            return Ok(self.keyword_escalation(
                build,
                MatchedRule::FinancialApproval,
                reason,
                CONFIDENCE_FINANCIAL,
                ctx.dedupe_status,
            ));
        }

        // 4. HR / confidential
        if let Some(term) = self.confidential.find(&prepared.body)? {
            return Ok(build(
                Tier::Restricted,
                MatchedRule::Confidential,
                format!("HR/confidential term \"{term}\" in body; flag only"),
                CONFIDENCE_CONFIDENTIAL,
            ));
        }

        // 5. Scheduling
        let scheduling = match self.scheduling.find(&prepared.subject)? {
            Some(term) => Some(term),
            None => self.scheduling.find(&prepared.body)?,
        };
        if let Some(term) = scheduling {
            return Ok(build(
                Tier::Autonomous,
                MatchedRule::Scheduling,
                format!("Scheduling term \"{term}\""),
                CONFIDENCE_SCHEDULING,
            ));
        }

        // 6. Bulk / automated origin
        let bulk = match self.bulk.find(&prepared.sender)? {
            Some(term) => Some((term, "sender")),
            None => self.bulk.find(&prepared.subject)?.map(|t| (t, "subject")),
        };
        if let Some((term, field)) = bulk {
            return Ok(build(
                Tier::Autonomous,
                MatchedRule::BulkOrigin,
                format!("Bulk/automated origin (\"{term}\" in {field})"),
                CONFIDENCE_BULK,
            ));
        }

        // 7 / 8. First contact or default, optionally adjusted by learned weights
        let (rule, base_reason, confidence) = if message.first_time_contact {
            (
                MatchedRule::FirstTimeContact,
                "First-time contact; requires review",
                CONFIDENCE_FIRST_CONTACT,
            )
        } else {
            (
                MatchedRule::Default,
                "No rule matched; requires review",
                CONFIDENCE_DEFAULT,
            )
        };

        if let Some(weights) = ctx.weights
            && let Some((tier, lead)) =
                weights.preferred_over(Tier::Review, features, ctx.override_margin)
        {
            debug!(message_id = %message.id, %tier, lead, "Learned weights override default tier");
            let confidence = (0.5 + lead / 10.0).clamp(0.5, 0.95) as f32;
            return Ok(build(
                tier,
                MatchedRule::Learned,
                format!(
                    "Learned adjustment: weights v{} favour {tier} by {lead:.2} ({base_reason})",
                    weights.version
                ),
                confidence,
            ));
        }

        Ok(build(Tier::Review, rule, base_reason.to_string(), confidence))
    }

    /// Tier-1 result for a keyword rule, down-ranked for derivative copies.
    fn keyword_escalation(
        &self,
        build: impl Fn(Tier, MatchedRule, String, f32) -> Evaluation,
        rule: MatchedRule,
        reason: String,
        confidence: f32,
        dedupe_status: DedupeStatus,
    ) -> Evaluation {
        if dedupe_status.is_derivative() {
            return build(
                Tier::Review,
                rule,
                format!("{reason}; {dedupe_status} copy, not re-escalated"),
                CONFIDENCE_DOWNRANKED,
            );
        }
        build(Tier::Immediate, rule, reason, confidence)
    }

    /// Boolean features of a message. Malformed patterns count as no match.
    fn features(&self, message: &Message, prepared: &Prepared, dedupe: DedupeStatus) -> FeatureSet {
        let mut features = FeatureSet::new();
        let mut set = |feature: Feature, present: bool| {
            if present {
                features.insert(feature);
            }
        };

        set(
            Feature::OffLimitsSender,
            matches!(self.off_limits.find(&prepared.sender), Ok(Some(_))),
        );
        set(
            Feature::UrgentKeyword,
            self.urgent.contains(&prepared.subject) || self.urgent.contains(&prepared.body),
        );
        set(Feature::FinancialTerm, self.financial.contains(&prepared.body));
        set(Feature::ApprovalTerm, self.approval.contains(&prepared.body));
        set(Feature::ConfidentialTerm, self.confidential.contains(&prepared.body));
        set(
            Feature::SchedulingTerm,
            self.scheduling.contains(&prepared.subject) || self.scheduling.contains(&prepared.body),
        );
        set(
            Feature::BulkOrigin,
            self.bulk.contains(&prepared.sender) || self.bulk.contains(&prepared.subject),
        );
        set(Feature::FirstTimeContact, message.first_time_contact);
        set(Feature::HasAttachments, !message.attachments.is_empty());
        set(Feature::HasQuestion, message.body.contains('?'));
        set(Feature::ReplyThread, prepared.subject.trim_start().starts_with("re:"));
        set(
            Feature::ManyRecipients,
            self.many_recipients_threshold > 0
                && message.recipients.len() >= self.many_recipients_threshold,
        );
        set(Feature::DerivativeCopy, dedupe.is_derivative());

        features
    }
}
