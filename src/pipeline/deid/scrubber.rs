use std::collections::BTreeMap;

use super::detector::EntityDetector;
use super::recognizers::NerBackend;
use super::redactor::{RedactionMap, Redactor};
use super::types::{Detection, DetectionConfig, EntityKind, EntityReport, KindStats, RedactionPolicy, ScrubResult};
use super::verify::Verifier;
use super::DeidError;

/// Detect, redact, verify. The only path by which raw text becomes
/// scrubbed text.
pub struct Scrubber {
    detector: EntityDetector,
    redactor: Redactor,
}

impl Scrubber {
    pub fn new(config: DetectionConfig, policy: RedactionPolicy) -> Result<Self, DeidError> {
        let detector = EntityDetector::new(config, &policy)?;
        let redactor = Redactor::new(policy)?;
        Ok(Self { detector, redactor })
    }

    pub fn with_ner(mut self, backend: Box<dyn NerBackend>) -> Self {
        self.detector = self.detector.with_ner(backend);
        self
    }

    pub fn policy(&self) -> &RedactionPolicy {
        self.redactor.policy()
    }

    pub fn detection_config(&self) -> &DetectionConfig {
        self.detector.config()
    }

    pub fn detect(&self, text: &str) -> Result<Detection, DeidError> {
        self.detector.detect(text)
    }

    /// Redact a prior detection and verify the result.
    pub fn redact(&self, text: &str, detection: &Detection, map: &mut RedactionMap) -> Result<ScrubResult, DeidError> {
        let mut result = self.redactor.redact(text, &detection.entities, map)?;
        result.degraded = detection.degraded;

        let verifier = Verifier {
            config: self.detector.config(),
            placeholder: self.detector.placeholder_regex(),
            min_sweep_len: self.policy().min_sweep_len,
        };
        verifier.verify(&result.scrubbed_text, &detection.entities)?;

        tracing::info!(
            total = result.total_redacted(),
            counts = ?result.counts_by_kind,
            degraded = result.degraded,
            "Text scrubbed"
        );
        Ok(result)
    }

    /// Scrub with a caller-owned map (session scope).
    pub fn scrub(&self, text: &str, map: &mut RedactionMap) -> Result<ScrubResult, DeidError> {
        let detection = self.detect(text)?;
        self.redact(text, &detection, map)
    }

    /// Scrub with a fresh map (document scope).
    pub fn scrub_standalone(&self, text: &str) -> Result<ScrubResult, DeidError> {
        self.scrub(text, &mut RedactionMap::new())
    }

    /// Scrub several texts against one map. Stops at the first failure.
    pub fn scrub_batch(&self, texts: &[&str], map: &mut RedactionMap) -> Result<Vec<ScrubResult>, DeidError> {
        texts.iter().map(|t| self.scrub(t, map)).collect()
    }

    /// Audit summary of what would be redacted: counts and confidence
    /// ranges per kind, without any matched values.
    pub fn entity_report(&self, text: &str) -> Result<EntityReport, DeidError> {
        let detection = self.detect(text)?;
        let mut grouped: BTreeMap<EntityKind, Vec<f32>> = BTreeMap::new();
        for e in &detection.entities {
            grouped.entry(e.kind).or_default().push(e.confidence);
        }

        let breakdown = grouped
            .into_iter()
            .map(|(kind, scores)| {
                let count = scores.len();
                let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let avg = scores.iter().sum::<f32>() / count as f32;
                (
                    kind,
                    KindStats {
                        count,
                        min_confidence: min,
                        max_confidence: max,
                        avg_confidence: avg,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();

        Ok(EntityReport {
            total_entities: detection.entities.len(),
            unique_kinds: breakdown.len(),
            breakdown,
            text_length: text.chars().count(),
            degraded: detection.degraded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::deid::recognizers::NerSpan;
    use crate::pipeline::deid::types::{DegradedMode, MapScope};

    fn scrubber() -> Scrubber {
        Scrubber::new(DetectionConfig::default(), RedactionPolicy::default()).unwrap()
    }

    struct DownNer;

    impl NerBackend for DownNer {
        fn is_available(&self) -> bool {
            false
        }

        fn recognize(&self, _text: &str) -> Result<Vec<NerSpan>, DeidError> {
            Ok(Vec::new())
        }
    }

    const SAMPLE: &str = "John Smith's SSN is 123-45-6789, seen on 01/15/2024";

    #[test]
    fn scrubs_the_reference_example() {
        let result = scrubber().scrub_standalone(SAMPLE).unwrap();
        assert_eq!(result.scrubbed_text, "[PHI-PERSON]'s SSN is [PHI-SSN], seen on [PHI-DATE]");
        let expected: BTreeMap<EntityKind, usize> =
            [(EntityKind::Person, 1), (EntityKind::Ssn, 1), (EntityKind::Date, 1)].into_iter().collect();
        assert_eq!(result.counts_by_kind, expected);
        assert!(!result.degraded);
    }

    #[test]
    fn scrubbing_is_idempotent() {
        let s = scrubber();
        let texts = [
            SAMPLE,
            "Dr. Okafor reviewed Mary Jones (MRN: 778812) on March 3, 2024. Call (555) 123-4567.",
            "Email mary.jones@example.com from 10.0.0.12; lives at 42 Elm Street.",
            "No identifiers here, just metformin 500 mg.",
        ];
        let mut map = RedactionMap::new();
        for text in texts {
            let once = s.scrub(text, &mut map).unwrap();
            let twice = s.scrub(&once.scrubbed_text, &mut map).unwrap();
            assert_eq!(once.scrubbed_text, twice.scrubbed_text);
            assert_eq!(twice.total_redacted(), 0);
        }
    }

    #[test]
    fn no_detected_original_survives() {
        let s = scrubber();
        let text = "Patient: Mary Jones. Mary Jones was admitted 2024-01-05; contact mary.jones@example.com.";
        let detection = s.detect(text).unwrap();
        let result = s.redact(text, &detection, &mut RedactionMap::new()).unwrap();
        for e in &detection.entities {
            if e.char_len() >= 4 {
                assert!(!result.scrubbed_text.contains(e.original_text()));
            }
        }
    }

    #[test]
    fn case_variants_and_iso_datetimes_are_scrubbed() {
        let text = "Patient John Smith admitted 2024-01-05T10:00. JOHN SMITH consented; john smith signed.";
        let result = scrubber().scrub_standalone(text).unwrap();
        let lower = result.scrubbed_text.to_lowercase();
        assert!(!lower.contains("john"));
        assert!(!lower.contains("smith"));
        assert!(!result.scrubbed_text.contains("2024-01-05"));
        assert!(result.scrubbed_text.contains("admitted [PHI-DATE]."));
        assert!(result.scrubbed_text.contains("consented"));
    }

    #[test]
    fn indexed_session_scope_reuses_tokens_across_documents() {
        let policy = RedactionPolicy {
            placeholder_format: "[PHI-{kind}-{index}]".into(),
            scope: MapScope::Session,
            ..Default::default()
        };
        let s = Scrubber::new(DetectionConfig::default(), policy).unwrap();
        let mut map = RedactionMap::new();
        let a = s.scrub("Seen by Dr. Okafor today.", &mut map).unwrap();
        let b = s.scrub("Dr. Barlow then Dr. Okafor.", &mut map).unwrap();
        assert_eq!(a.scrubbed_text, "Seen by Dr. [PHI-PERSON-1] today.");
        assert_eq!(b.scrubbed_text, "Dr. [PHI-PERSON-2] then Dr. [PHI-PERSON-1].");
    }

    #[test]
    fn indexed_document_scope_restarts_numbering() {
        let policy = RedactionPolicy {
            placeholder_format: "[PHI-{kind}-{index}]".into(),
            scope: MapScope::Document,
            ..Default::default()
        };
        let s = Scrubber::new(DetectionConfig::default(), policy).unwrap();
        let a = s.scrub_standalone("Seen by Dr. Okafor today.").unwrap();
        let b = s.scrub_standalone("Dr. Barlow then Dr. Okafor.").unwrap();
        assert_eq!(a.scrubbed_text, "Seen by Dr. [PHI-PERSON-1] today.");
        assert_eq!(b.scrubbed_text, "Dr. [PHI-PERSON-1] then Dr. [PHI-PERSON-2].");
    }

    #[test]
    fn fail_closed_refuses_and_pattern_only_degrades() {
        let closed = scrubber().with_ner(Box::new(DownNer));
        assert!(matches!(
            closed.scrub_standalone(SAMPLE),
            Err(DeidError::DetectionUnavailable { .. })
        ));

        let config = DetectionConfig {
            degraded_mode: DegradedMode::PatternOnly,
            ..Default::default()
        };
        let open = Scrubber::new(config, RedactionPolicy::default())
            .unwrap()
            .with_ner(Box::new(DownNer));
        let result = open.scrub_standalone(SAMPLE).unwrap();
        assert!(result.degraded);
        assert_eq!(result.scrubbed_text, "[PHI-PERSON]'s SSN is [PHI-SSN], seen on [PHI-DATE]");
    }

    #[test]
    fn batch_shares_the_map() {
        let s = scrubber();
        let mut map = RedactionMap::new();
        let results = s
            .scrub_batch(&["Dr. Okafor called.", "Dr. Okafor again."], &mut map)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn entity_report_has_stats_without_values() {
        let report = scrubber().entity_report(SAMPLE).unwrap();
        assert_eq!(report.total_entities, 3);
        assert_eq!(report.unique_kinds, 3);
        let person = &report.breakdown[&EntityKind::Person];
        assert_eq!(person.count, 1);
        assert!((person.avg_confidence - 0.85).abs() < 1e-6);
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("Smith"));
        assert!(!json.contains("6789"));
    }
}
