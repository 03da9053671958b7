//! Duplicate detection over a bounded window of recent message fingerprints.
//!
//! Checks run in order and the first match wins:
//! exact id → near-identical content → forward → CC group → quoted reply.
//! Exact and content duplicates suppress reclassification; the other
//! matches only tag the decision.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::DedupeConfig;
use crate::pipeline::types::{DedupeStatus, Message, normalize_address};

/// Subject prefixes stripped before subjects are compared.
const SUBJECT_MARKERS: &[&str] = &["fwd:", "fw:", "re:"];

/// Minimum tokens a body needs before content similarity is trusted.
const MIN_CONTENT_TOKENS: usize = 3;

// ── Fingerprint ─────────────────────────────────────────────────────

/// Derived record used to recognise a message in later forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupeFingerprint {
    pub message_id: String,
    pub conversation_id: String,
    pub sender: String,
    pub recipients: BTreeSet<String>,
    /// Lowercased subject with forward/reply markers removed.
    pub subject_key: String,
    /// SHA-256 of the normalized body.
    pub body_digest: String,
    /// Normalized body tokens (capped).
    pub tokens: BTreeSet<String>,
    /// Normalized non-empty body lines that are not themselves quotes.
    pub lines: BTreeSet<String>,
    pub received_at: DateTime<Utc>,
}

impl DedupeFingerprint {
    pub fn from_message(message: &Message, max_tokens: usize) -> Self {
        let normalized = normalize_text(&message.body);
        let digest = Sha256::digest(normalized.as_bytes());
        Self {
            message_id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender: message.sender_address(),
            recipients: message
                .recipients
                .iter()
                .map(|r| normalize_address(r))
                .filter(|r| !r.is_empty())
                .collect(),
            subject_key: subject_key(&message.subject),
            body_digest: hex::encode(digest),
            tokens: tokenize(&normalized).take(max_tokens).collect(),
            lines: message
                .body
                .lines()
                .filter(|l| !l.trim_start().starts_with('>'))
                .map(normalize_text)
                .filter(|l| !l.is_empty())
                .collect(),
            received_at: message.received_at,
        }
    }
}

/// Lowercase, strip punctuation, collapse whitespace.
fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn tokenize(normalized: &str) -> impl Iterator<Item = String> + '_ {
    normalized.split_whitespace().map(str::to_string)
}

/// Subject with any number of leading `Fwd:`/`Fw:`/`Re:` markers removed.
pub fn subject_key(subject: &str) -> String {
    let mut rest = subject.trim().to_lowercase();
    loop {
        let trimmed = rest.trim_start();
        match SUBJECT_MARKERS.iter().find(|m| trimmed.starts_with(**m)) {
            Some(marker) => rest = trimmed[marker.len()..].to_string(),
            None => break,
        }
    }
    rest.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Normalized lines of the message that are quotes (`>` prefixed).
fn quoted_lines(body: &str) -> BTreeSet<String> {
    body.lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            trimmed
                .starts_with('>')
                .then(|| normalize_text(trimmed.trim_start_matches(|c: char| c == '>' || c.is_whitespace())))
        })
        .filter(|l| !l.is_empty())
        .collect()
}

// ── Window ──────────────────────────────────────────────────────────

/// Bounded, time-ordered fingerprint window.
///
/// Insert is O(1) amortized; eviction drops from the oldest end.
#[derive(Debug, Clone, Default)]
pub struct DedupeWindow {
    entries: VecDeque<DedupeFingerprint>,
}

impl DedupeWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.iter().any(|e| e.message_id == message_id)
    }

    /// Insert unless the id is already present. Returns whether it was added.
    pub fn insert_if_absent(
        &mut self,
        fingerprint: DedupeFingerprint,
        max_entries: usize,
        oldest_allowed: DateTime<Utc>,
    ) -> bool {
        if self.contains(&fingerprint.message_id) {
            return false;
        }
        self.entries.push_back(fingerprint);
        self.evict(max_entries, oldest_allowed);
        true
    }

    /// Remove the entry for `message_id`. Returns whether it was present.
    pub fn remove(&mut self, message_id: &str) -> bool {
        match self.entries.iter().position(|e| e.message_id == message_id) {
            Some(index) => self.entries.remove(index).is_some(),
            None => false,
        }
    }

    /// Drop entries beyond the cap, then stale entries from the oldest end.
    /// An out-of-order stale entry stays until it reaches the front.
    pub fn evict(&mut self, max_entries: usize, oldest_allowed: DateTime<Utc>) {
        while self.entries.len() > max_entries {
            self.entries.pop_front();
        }
        while self
            .entries
            .front()
            .is_some_and(|e| e.received_at < oldest_allowed)
        {
            self.entries.pop_front();
        }
    }

    /// Most recent `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<DedupeFingerprint> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

// ── Detector ────────────────────────────────────────────────────────

/// Outcome of a duplicate check.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupeCheck {
    pub status: DedupeStatus,
    /// Window entry that triggered the match.
    pub matched_id: Option<String>,
}

impl DedupeCheck {
    pub fn unique() -> Self {
        Self {
            status: DedupeStatus::Unique,
            matched_id: None,
        }
    }

    fn matched(status: DedupeStatus, entry: &DedupeFingerprint) -> Self {
        Self {
            status,
            matched_id: Some(entry.message_id.clone()),
        }
    }
}

/// Pure duplicate detector.
#[derive(Debug, Clone)]
pub struct DedupeDetector {
    config: DedupeConfig,
}

impl DedupeDetector {
    pub fn new(config: DedupeConfig) -> Self {
        Self { config }
    }

    pub fn fingerprint(&self, message: &Message) -> DedupeFingerprint {
        DedupeFingerprint::from_message(message, self.config.max_tokens)
    }

    /// Classify `message` against `window`.
    pub fn check(&self, message: &Message, window: &[DedupeFingerprint]) -> DedupeCheck {
        let fp = self.fingerprint(message);

        // 1. Exact
        if let Some(entry) = window.iter().find(|e| e.message_id == fp.message_id) {
            return DedupeCheck::matched(DedupeStatus::Exact, entry);
        }

        // 2. Content
        if fp.tokens.len() >= MIN_CONTENT_TOKENS
            && let Some(entry) = window.iter().find(|e| {
                e.body_digest == fp.body_digest
                    || jaccard(&e.tokens, &fp.tokens) > self.config.content_similarity
            })
        {
            return DedupeCheck::matched(DedupeStatus::Content, entry);
        }

        // 3. Forward
        if !fp.subject_key.is_empty()
            && let Some(entry) = window
                .iter()
                .find(|e| e.subject_key == fp.subject_key && e.sender != fp.sender)
        {
            return DedupeCheck::matched(DedupeStatus::Forward, entry);
        }

        // 4. CC group
        if !fp.subject_key.is_empty() && !fp.recipients.is_empty() {
            let span = self.config.cc_group_span();
            let group: Vec<&DedupeFingerprint> = window
                .iter()
                .filter(|e| {
                    e.subject_key == fp.subject_key
                        && !e.recipients.is_disjoint(&fp.recipients)
                        && (e.received_at - fp.received_at).abs() <= span
                })
                .collect();
            if group.len() >= self.config.cc_group_min_entries
                && let Some(first) = group.first()
            {
                return DedupeCheck::matched(DedupeStatus::CcGroup, first);
            }
        }

        // 5. Quoted reply
        let quoted = quoted_lines(&message.body);
        if !quoted.is_empty()
            && let Some(entry) = window.iter().find(|e| {
                !e.lines.is_empty()
                    && e.lines.intersection(&quoted).count() as f64 / e.lines.len() as f64
                        >= self.config.quoted_reply_coverage
            })
        {
            return DedupeCheck::matched(DedupeStatus::QuotedReply, entry);
        }

        DedupeCheck::unique()
    }
}
