pub mod types;
pub mod recognizers;
pub mod detector;
pub mod redactor;
pub mod verify;
pub mod scrubber;

pub use types::*;
pub use recognizers::{ContextualNameRecognizer, NerBackend, NerRecognizer, NerSpan, PatternRecognizer, Recognizer};
pub use detector::EntityDetector;
pub use redactor::{entity_signature, RedactionMap, Redactor};
pub use scrubber::Scrubber;

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors from the de-identification stage.
///
/// Messages carry recognizer names, kind labels and counts only. Nothing
/// here may ever hold identifier text.
#[derive(Error, Debug)]
pub enum DeidError {
    #[error("Entity recognition unavailable ({recognizer}); refusing to scrub")]
    DetectionUnavailable { recognizer: String },

    #[error("Scrubbed output still contains identifiers: {}", format_counts(.residual_by_kind))]
    RedactionInvariantViolation {
        residual_by_kind: BTreeMap<EntityKind, usize>,
    },

    #[error("Recognizer {recognizer} failed: {reason}")]
    Recognizer { recognizer: String, reason: String },

    #[error("Entity span {start}..{end} is outside the text or not on a character boundary")]
    InvalidSpan { start: usize, end: usize },

    #[error("Invalid redaction policy: {0}")]
    InvalidPolicy(String),
}

fn format_counts(counts: &BTreeMap<EntityKind, usize>) -> String {
    counts
        .iter()
        .map(|(kind, n)| format!("{kind}={n}"))
        .collect::<Vec<_>>()
        .join(", ")
}
