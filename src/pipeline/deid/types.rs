use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::DeidError;

/// Identifier categories removed during de-identification (Safe Harbor subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Person,
    Ssn,
    Phone,
    Email,
    Date,
    Location,
    CreditCard,
    IpAddress,
    Url,
    #[serde(rename = "MRN")]
    MedicalRecord,
    /// Any other identifying number: licences, passports, accounts.
    #[serde(rename = "ID")]
    Identifier,
}

impl EntityKind {
    pub const ALL: [EntityKind; 11] = [
        EntityKind::Person,
        EntityKind::Ssn,
        EntityKind::Phone,
        EntityKind::Email,
        EntityKind::Date,
        EntityKind::Location,
        EntityKind::CreditCard,
        EntityKind::IpAddress,
        EntityKind::Url,
        EntityKind::MedicalRecord,
        EntityKind::Identifier,
    ];

    /// Label used in placeholders and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Person => "PERSON",
            Self::Ssn => "SSN",
            Self::Phone => "PHONE",
            Self::Email => "EMAIL",
            Self::Date => "DATE",
            Self::Location => "LOCATION",
            Self::CreditCard => "CREDIT_CARD",
            Self::IpAddress => "IP_ADDRESS",
            Self::Url => "URL",
            Self::MedicalRecord => "MRN",
            Self::Identifier => "ID",
        }
    }

    /// Map a label emitted by an external NER model onto a kind.
    ///
    /// Labels for plain quantities and non-personal names map to `None`.
    /// Every other label, known or not, is treated as an identifier.
    pub fn from_ner_label(label: &str) -> Option<Self> {
        match label.to_ascii_uppercase().as_str() {
            "PERSON" | "PER" | "PATIENT" | "DOCTOR" | "NAME" => Some(Self::Person),
            "LOCATION" | "LOC" | "GPE" | "ADDRESS" | "CITY" | "STREET" => Some(Self::Location),
            "DATE" | "DATE_TIME" | "DOB" => Some(Self::Date),
            "PHONE" | "PHONE_NUMBER" | "FAX" => Some(Self::Phone),
            "EMAIL" | "EMAIL_ADDRESS" => Some(Self::Email),
            "SSN" | "US_SSN" => Some(Self::Ssn),
            "MRN" | "MEDICAL_RECORD" => Some(Self::MedicalRecord),
            "URL" => Some(Self::Url),
            "IP_ADDRESS" => Some(Self::IpAddress),
            "CREDIT_CARD" => Some(Self::CreditCard),
            "CARDINAL" | "ORDINAL" | "QUANTITY" | "PERCENT" | "MONEY" | "TIME" | "ORG" | "NORP"
            | "LANGUAGE" | "EVENT" | "PRODUCT" | "WORK_OF_ART" | "LAW" => None,
            _ => Some(Self::Identifier),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        EntityKind::ALL
            .iter()
            .find(|k| k.label() == upper)
            .copied()
            .or_else(|| match upper.as_str() {
                "MEDICAL_RECORD" => Some(EntityKind::MedicalRecord),
                _ => None,
            })
            .ok_or_else(|| format!("Unknown entity kind: {s}"))
    }
}

/// A candidate identifier span found in raw text.
///
/// Offsets are byte offsets into the scanned text. The matched text is held
/// in a zeroizing buffer and never printed: `Debug` masks it.
#[derive(Clone, PartialEq)]
pub struct Entity {
    pub kind: EntityKind,
    pub start: usize,
    pub end: usize,
    pub confidence: f32,
    original_text: Zeroizing<String>,
}

impl Entity {
    pub fn new(kind: EntityKind, start: usize, end: usize, confidence: f32, original_text: &str) -> Self {
        Self {
            kind,
            start,
            end,
            confidence,
            original_text: Zeroizing::new(original_text.to_string()),
        }
    }

    /// Build an entity from a span of `text`. Returns `None` if the span is
    /// empty, out of range, or not on character boundaries.
    pub fn from_span(kind: EntityKind, text: &str, start: usize, end: usize, confidence: f32) -> Option<Self> {
        if start >= end || end > text.len() {
            return None;
        }
        let slice = text.get(start..end)?;
        Some(Self::new(kind, start, end, confidence, slice))
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn char_len(&self) -> usize {
        self.original_text.chars().count()
    }

    pub fn overlaps(&self, other: &Entity) -> bool {
        self.overlaps_range(other.start, other.end)
    }

    pub fn overlaps_range(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }

    /// Raw matched text. Only the redactor and verifier read this.
    pub(crate) fn original_text(&self) -> &str {
        &self.original_text
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("kind", &self.kind)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("confidence", &self.confidence)
            .field("original_text", &"<redacted>")
            .finish()
    }
}

/// Output of the entity detector.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    /// Non-overlapping entities, ordered by start offset.
    pub entities: Vec<Entity>,
    /// True when a statistical recognizer was unavailable and detection
    /// continued with deterministic recognizers only.
    pub degraded: bool,
}

/// What to do when a statistical recognizer is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedMode {
    /// Refuse to scrub at all.
    #[default]
    FailClosed,
    /// Continue with deterministic recognizers and flag the result as degraded.
    PatternOnly,
}

/// Detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Kinds that will be reported. Everything else is discarded.
    pub allowed_kinds: Vec<EntityKind>,
    /// Matches below this confidence are discarded.
    pub score_threshold: f32,
    /// Matches shorter than this many characters are discarded.
    pub min_entity_len: usize,
    pub degraded_mode: DegradedMode,
    /// Additional names (given or family) treated as person-name anchors.
    pub extra_names: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            allowed_kinds: EntityKind::ALL.to_vec(),
            score_threshold: 0.5,
            min_entity_len: 2,
            degraded_mode: DegradedMode::FailClosed,
            extra_names: Vec::new(),
        }
    }
}

impl DetectionConfig {
    pub fn allows(&self, kind: EntityKind) -> bool {
        self.allowed_kinds.contains(&kind)
    }
}

/// How far a redaction map's consistency reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapScope {
    /// A fresh map for every scrubbed text.
    Document,
    /// One map shared by every text scrubbed in a session.
    #[default]
    Session,
}

/// Redaction policy: placeholder format and map scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionPolicy {
    /// Placeholder template. `{kind}` is required; `{index}` numbers distinct
    /// entities of the same kind within the map scope.
    pub placeholder_format: String,
    pub scope: MapScope,
    /// Originals at least this many characters long are swept from the whole
    /// text and checked for absence after redaction.
    pub min_sweep_len: usize,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self {
            placeholder_format: "[PHI-{kind}]".to_string(),
            scope: MapScope::Session,
            min_sweep_len: 4,
        }
    }
}

impl RedactionPolicy {
    pub fn validate(&self) -> Result<(), DeidError> {
        if !self.placeholder_format.contains("{kind}") {
            return Err(DeidError::InvalidPolicy(
                "placeholder format must contain {kind}".into(),
            ));
        }
        if self.min_sweep_len == 0 {
            return Err(DeidError::InvalidPolicy("min_sweep_len must be at least 1".into()));
        }
        Ok(())
    }

    pub fn render(&self, kind: EntityKind, index: usize) -> String {
        self.placeholder_format
            .replace("{kind}", kind.label())
            .replace("{index}", &index.to_string())
    }

    /// Regex matching any placeholder this policy can produce.
    pub fn placeholder_pattern(&self) -> Result<Regex, DeidError> {
        self.validate()?;
        let pattern = regex::escape(&self.placeholder_format)
            .replace(r"\{kind\}", "[A-Z_]+")
            .replace(r"\{index\}", r"\d+");
        Regex::new(&pattern).map_err(|e| DeidError::InvalidPolicy(e.to_string()))
    }
}

/// A redacted region, described in scrubbed-text coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedactedSpan {
    pub kind: EntityKind,
    pub start: usize,
    pub end: usize,
    pub placeholder: String,
    pub confidence: f32,
}

/// Result of scrubbing one text. Only `counts_by_kind` is safe to log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrubResult {
    pub scrubbed_text: String,
    pub entities: Vec<RedactedSpan>,
    pub counts_by_kind: BTreeMap<EntityKind, usize>,
    pub degraded: bool,
}

impl ScrubResult {
    pub fn total_redacted(&self) -> usize {
        self.counts_by_kind.values().sum()
    }
}

/// Per-kind confidence statistics for audit, without any matched values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindStats {
    pub count: usize,
    pub min_confidence: f32,
    pub max_confidence: f32,
    pub avg_confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReport {
    pub total_entities: usize,
    pub unique_kinds: usize,
    pub breakdown: BTreeMap<EntityKind, KindStats>,
    pub text_length: usize,
    pub degraded: bool,
}
