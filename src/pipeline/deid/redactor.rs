use std::collections::{BTreeMap, HashMap};

use regex::{Regex, RegexBuilder};
use sha2::{Digest, Sha256};

use super::detector::placeholder_spans;
use super::types::{Entity, EntityKind, RedactedSpan, RedactionPolicy, ScrubResult};
use super::DeidError;

/// Signature of an identifier: SHA-256 over the kind label and the
/// case-folded, whitespace-collapsed text. The text itself is never stored.
pub fn entity_signature(kind: EntityKind, text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(kind.label().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Originals shorter than this are never swept.
const MIN_WORD_SWEEP_CHARS: usize = 2;

/// Byte ranges in `text` where `original` occurs again, sorted by start.
///
/// Originals of at least `min_sweep_len` chars match anywhere in exact case,
/// and as whole words in any case. Shorter ones match only as whole words
/// in exact case.
pub(crate) fn occurrences(text: &str, original: &str, min_sweep_len: usize) -> Vec<(usize, usize)> {
    let chars = original.chars().count();
    let short = chars < min_sweep_len;
    if short && chars < MIN_WORD_SWEEP_CHARS {
        return Vec::new();
    }

    let mut found: Vec<(usize, usize)> = Vec::new();
    if !short {
        found.extend(text.match_indices(original).map(|(s, m)| (s, s + m.len())));
    }
    if let Some(word) = word_pattern(original, !short) {
        for m in word.find_iter(text) {
            if !found.iter().any(|&(s, e)| m.start() < e && s < m.end()) {
                found.push((m.start(), m.end()));
            }
        }
    }
    found.sort_unstable();
    found
}

fn word_pattern(original: &str, case_insensitive: bool) -> Option<Regex> {
    let body = original
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    if body.is_empty() {
        return None;
    }
    let is_word = |c: Option<char>| c.is_some_and(|c| c.is_alphanumeric() || c == '_');
    let lead = if is_word(original.chars().next()) { r"\b" } else { "" };
    let trail = if is_word(original.chars().last()) { r"\b" } else { "" };
    RegexBuilder::new(&format!("{lead}{body}{trail}"))
        .case_insensitive(case_insensitive)
        .build()
        .ok()
}

/// Signature → placeholder token. Entries are never changed once created.
#[derive(Debug, Default, Clone)]
pub struct RedactionMap {
    tokens: HashMap<String, String>,
    next_index: BTreeMap<EntityKind, usize>,
}

impl RedactionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.next_index.clear();
    }

    /// Existing token for this identifier, or a new one from `policy`.
    pub fn token_for(&mut self, kind: EntityKind, text: &str, policy: &RedactionPolicy) -> String {
        let signature = entity_signature(kind, text);
        if let Some(token) = self.tokens.get(&signature) {
            return token.clone();
        }
        let index = self.next_index.entry(kind).or_insert(0);
        *index += 1;
        let token = policy.render(kind, *index);
        self.tokens.insert(signature, token.clone());
        token
    }
}

/// Replaces detected spans with placeholder tokens.
#[derive(Debug, Clone)]
pub struct Redactor {
    policy: RedactionPolicy,
    placeholder: Regex,
}

impl Redactor {
    pub fn new(policy: RedactionPolicy) -> Result<Self, DeidError> {
        let placeholder = policy.placeholder_pattern()?;
        Ok(Self { policy, placeholder })
    }

    pub fn policy(&self) -> &RedactionPolicy {
        &self.policy
    }

    /// Replace every entity span, plus any other literal occurrence of an
    /// entity's text, with its placeholder.
    ///
    /// `entities` must be non-overlapping. Replacement runs from the highest
    /// offset to the lowest so earlier offsets stay valid.
    pub fn redact(&self, text: &str, entities: &[Entity], map: &mut RedactionMap) -> Result<ScrubResult, DeidError> {
        let mut spans: Vec<Entity> = entities.to_vec();
        spans.sort_by_key(|e| (e.start, e.end));
        validate_spans(text, &spans)?;

        let swept = self.sweep(text, &spans);
        if !swept.is_empty() {
            tracing::debug!(extra_occurrences = swept.len(), "Swept repeated identifier occurrences");
        }
        spans.extend(swept);
        spans.sort_by_key(|e| (e.start, e.end));

        let tokens: Vec<String> = spans
            .iter()
            .map(|e| map.token_for(e.kind, e.original_text(), &self.policy))
            .collect();

        let mut scrubbed = text.to_string();
        for (entity, token) in spans.iter().zip(tokens.iter()).rev() {
            scrubbed.replace_range(entity.start..entity.end, token);
        }

        let mut redacted = Vec::with_capacity(spans.len());
        let mut counts_by_kind: BTreeMap<EntityKind, usize> = BTreeMap::new();
        let mut shift: isize = 0;
        for (entity, token) in spans.iter().zip(tokens) {
            let start = (entity.start as isize + shift) as usize;
            let end = start + token.len();
            shift += token.len() as isize - entity.len() as isize;
            *counts_by_kind.entry(entity.kind).or_insert(0) += 1;
            redacted.push(RedactedSpan {
                kind: entity.kind,
                start,
                end,
                placeholder: token,
                confidence: entity.confidence,
            });
        }

        Ok(ScrubResult {
            scrubbed_text: scrubbed,
            entities: redacted,
            counts_by_kind,
            degraded: false,
        })
    }

    /// Additional occurrences of detected originals outside the detected
    /// spans and existing placeholders. Longer originals are swept first.
    fn sweep(&self, text: &str, spans: &[Entity]) -> Vec<Entity> {
        let mut sources: Vec<&Entity> = spans.iter().collect();
        sources.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.start.cmp(&b.start)));

        let mut taken: Vec<(usize, usize)> = spans.iter().map(|e| (e.start, e.end)).collect();
        taken.extend(placeholder_spans(&self.placeholder, text));
        let mut extra = Vec::new();
        for source in sources {
            for (start, end) in occurrences(text, source.original_text(), self.policy.min_sweep_len) {
                if taken.iter().any(|&(s, e)| start < e && s < end) {
                    continue;
                }
                taken.push((start, end));
                extra.push(Entity::new(source.kind, start, end, source.confidence, &text[start..end]));
            }
        }
        extra
    }
}

fn validate_spans(text: &str, sorted: &[Entity]) -> Result<(), DeidError> {
    let mut previous_end = 0;
    for e in sorted {
        let in_bounds = e.start < e.end
            && e.end <= text.len()
            && text.is_char_boundary(e.start)
            && text.is_char_boundary(e.end);
        let matches_text = in_bounds && &text[e.start..e.end] == e.original_text();
        if !matches_text || e.start < previous_end {
            return Err(DeidError::InvalidSpan {
                start: e.start,
                end: e.end,
            });
        }
        previous_end = e.end;
    }
    Ok(())
}
