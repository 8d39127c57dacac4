//! Post-redaction verification. A scrubbed text that still carries a
//! detected original or a residual pattern match is rejected outright.

use std::collections::BTreeMap;

use regex::Regex;

use super::detector::{accept_candidate, placeholder_spans};
use super::recognizers::PatternRecognizer;
use super::redactor::occurrences;
use super::types::{DetectionConfig, Entity, EntityKind};
use super::DeidError;

pub struct Verifier<'a> {
    pub config: &'a DetectionConfig,
    pub placeholder: &'a Regex,
    pub min_sweep_len: usize,
}

impl Verifier<'_> {
    /// Residual identifier counts by kind. Empty means the text is clean.
    pub fn residuals(&self, scrubbed: &str, originals: &[Entity]) -> BTreeMap<EntityKind, usize> {
        let mut residual: BTreeMap<EntityKind, usize> = BTreeMap::new();
        let placeholders = placeholder_spans(self.placeholder, scrubbed);

        for entity in originals {
            let leftover = occurrences(scrubbed, entity.original_text(), self.min_sweep_len)
                .into_iter()
                .any(|(s, e)| !placeholders.iter().any(|&(ps, pe)| s < pe && ps < e));
            if leftover {
                *residual.entry(entity.kind).or_insert(0) += 1;
            }
        }

        for candidate in PatternRecognizer::new().scan(scrubbed) {
            if accept_candidate(&candidate, self.config, &placeholders) {
                *residual.entry(candidate.kind).or_insert(0) += 1;
            }
        }

        residual
    }

    pub fn verify(&self, scrubbed: &str, originals: &[Entity]) -> Result<(), DeidError> {
        let residual_by_kind = self.residuals(scrubbed, originals);
        if residual_by_kind.is_empty() {
            return Ok(());
        }
        tracing::error!(residual = ?residual_by_kind, "Redaction verification failed");
        Err(DeidError::RedactionInvariantViolation { residual_by_kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::deid::types::RedactionPolicy;

    fn check(scrubbed: &str, originals: &[Entity]) -> Result<(), DeidError> {
        let config = DetectionConfig::default();
        let placeholder = RedactionPolicy::default().placeholder_pattern().unwrap();
        Verifier {
            config: &config,
            placeholder: &placeholder,
            min_sweep_len: 4,
        }
        .verify(scrubbed, originals)
    }

    #[test]
    fn clean_text_passes() {
        let original = Entity::new(EntityKind::Person, 0, 10, 0.9, "John Smith");
        assert!(check("[PHI-PERSON] was seen on [PHI-DATE]", &[original]).is_ok());
    }

    #[test]
    fn leftover_original_is_a_violation() {
        let original = Entity::new(EntityKind::Person, 0, 10, 0.9, "John Smith");
        let err = check("[PHI-PERSON] and John Smith", &[original]).unwrap_err();
        match err {
            DeidError::RedactionInvariantViolation { residual_by_kind } => {
                assert_eq!(residual_by_kind.get(&EntityKind::Person), Some(&1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn leftover_case_variant_is_a_violation() {
        let original = Entity::new(EntityKind::Person, 0, 10, 0.9, "John Smith");
        assert!(check("[PHI-PERSON] and JOHN SMITH", &[original.clone()]).is_err());
        assert!(check("[PHI-PERSON] and john smith.", &[original]).is_err());
    }

    #[test]
    fn short_original_as_whole_word_is_a_violation() {
        let original = Entity::new(EntityKind::Person, 9, 12, 0.9, "Lee");
        assert!(check("Patient: [PHI-PERSON]\nLee is fine.", &[original.clone()]).is_err());
        assert!(check("Patient: [PHI-PERSON], seen in Leeds.", &[original]).is_ok());
    }

    #[test]
    fn placeholder_text_is_not_a_leftover() {
        let original = Entity::new(EntityKind::Person, 0, 6, 0.9, "Person");
        assert!(check("[PHI-PERSON] noted", &[original]).is_ok());
    }

    #[test]
    fn residual_pattern_is_a_violation() {
        let err = check("Seen on [PHI-DATE], SSN 123-45-6789", &[]).unwrap_err();
        assert!(err.to_string().contains("SSN=1"));
        assert!(!err.to_string().contains("6789"));
    }
}
