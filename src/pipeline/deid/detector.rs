use std::cmp::Ordering;

use regex::Regex;

use super::recognizers::{ContextualNameRecognizer, NerBackend, NerRecognizer, PatternRecognizer, Recognizer};
use super::types::{DegradedMode, Detection, DetectionConfig, Entity, RedactionPolicy};
use super::DeidError;

/// Layered entity detector.
///
/// Recognizers run in registration order: pattern, contextual names, then
/// any statistical recognizers. Their candidates are filtered and merged so
/// the returned entities never overlap.
pub struct EntityDetector {
    recognizers: Vec<Box<dyn Recognizer>>,
    config: DetectionConfig,
    placeholder: Regex,
}

impl EntityDetector {
    pub fn new(config: DetectionConfig, policy: &RedactionPolicy) -> Result<Self, DeidError> {
        let placeholder = policy.placeholder_pattern()?;
        let recognizers: Vec<Box<dyn Recognizer>> = vec![
            Box::new(PatternRecognizer::new()),
            Box::new(ContextualNameRecognizer::new(&config.extra_names)),
        ];
        Ok(Self {
            recognizers,
            config,
            placeholder,
        })
    }

    /// Register an additional recognizer after the built-in ones.
    pub fn register(mut self, recognizer: Box<dyn Recognizer>) -> Self {
        self.recognizers.push(recognizer);
        self
    }

    pub fn with_ner(self, backend: Box<dyn NerBackend>) -> Self {
        self.register(Box::new(NerRecognizer::new(backend)))
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn recognizer_names(&self) -> Vec<&str> {
        self.recognizers.iter().map(|r| r.name()).collect()
    }

    pub(crate) fn placeholder_regex(&self) -> &Regex {
        &self.placeholder
    }

    /// Find identifier spans in `text`.
    ///
    /// Fails with `DetectionUnavailable` when a statistical recognizer is
    /// down and the degraded mode is `FailClosed`.
    pub fn detect(&self, text: &str) -> Result<Detection, DeidError> {
        let placeholders = placeholder_spans(&self.placeholder, text);
        let mut degraded = false;
        let mut candidates: Vec<(Entity, usize)> = Vec::new();

        for (rank, recognizer) in self.recognizers.iter().enumerate() {
            let found = match recognizer.detect(text) {
                Ok(found) => found,
                Err(e) if recognizer.is_statistical() => match self.config.degraded_mode {
                    DegradedMode::FailClosed => {
                        tracing::error!(recognizer = recognizer.name(), "Statistical recognizer unavailable, refusing to scrub");
                        return Err(match e {
                            DeidError::DetectionUnavailable { .. } => e,
                            _ => DeidError::DetectionUnavailable {
                                recognizer: recognizer.name().to_string(),
                            },
                        });
                    }
                    DegradedMode::PatternOnly => {
                        tracing::warn!(recognizer = recognizer.name(), "Statistical recognizer unavailable, continuing pattern-only");
                        degraded = true;
                        continue;
                    }
                },
                Err(e) => return Err(e),
            };

            candidates.extend(
                found
                    .into_iter()
                    .filter(|e| accept_candidate(e, &self.config, &placeholders))
                    .map(|e| (e, rank)),
            );
        }

        let total_candidates = candidates.len();
        let entities = merge_candidates(candidates);
        tracing::debug!(
            candidates = total_candidates,
            accepted = entities.len(),
            degraded,
            "Entity detection complete"
        );

        Ok(Detection { entities, degraded })
    }
}

/// Byte ranges of placeholder tokens already present in `text`.
pub(crate) fn placeholder_spans(placeholder: &Regex, text: &str) -> Vec<(usize, usize)> {
    placeholder.find_iter(text).map(|m| (m.start(), m.end())).collect()
}

/// Allowlist, threshold, minimum length, and no overlap with an existing
/// placeholder.
pub(crate) fn accept_candidate(entity: &Entity, config: &DetectionConfig, placeholders: &[(usize, usize)]) -> bool {
    config.allows(entity.kind)
        && entity.confidence >= config.score_threshold
        && entity.char_len() >= config.min_entity_len
        && !placeholders.iter().any(|&(s, e)| entity.overlaps_range(s, e))
}

/// Longest span wins; ties go to higher confidence, then earlier
/// registration, then earlier start. Output is ordered by start offset.
fn merge_candidates(mut candidates: Vec<(Entity, usize)>) -> Vec<Entity> {
    candidates.sort_by(|(a, rank_a), (b, rank_b)| {
        b.len()
            .cmp(&a.len())
            .then_with(|| b.confidence.total_cmp(&a.confidence))
            .then_with(|| rank_a.cmp(rank_b))
            .then_with(|| a.start.cmp(&b.start))
    });

    let mut accepted: Vec<Entity> = Vec::new();
    for (candidate, _) in candidates {
        if accepted.iter().all(|a| !a.overlaps(&candidate)) {
            accepted.push(candidate);
        }
    }

    accepted.sort_by(|a, b| match a.start.cmp(&b.start) {
        Ordering::Equal => a.end.cmp(&b.end),
        other => other,
    });
    accepted
}
