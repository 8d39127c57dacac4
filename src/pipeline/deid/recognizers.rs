//! Recognizers: each one scans raw text and proposes candidate identifier
//! spans. The detector merges their output.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::types::{Entity, EntityKind};
use super::DeidError;

/// A source of candidate identifier spans.
pub trait Recognizer: Send + Sync {
    fn name(&self) -> &str;

    /// Statistical recognizers may be unavailable at runtime; the detector
    /// applies the configured degraded mode when they fail.
    fn is_statistical(&self) -> bool {
        false
    }

    fn detect(&self, text: &str) -> Result<Vec<Entity>, DeidError>;
}

// ═══════════════════════════════════════════════════════════
// Pattern recognizer
// ═══════════════════════════════════════════════════════════

struct PatternRule {
    kind: EntityKind,
    regex: Regex,
    score: f32,
    /// Capture group holding the identifier (0 = whole match).
    group: usize,
    validator: Option<fn(&str) -> bool>,
}

impl PatternRule {
    fn new(kind: EntityKind, pattern: &str, score: f32) -> Self {
        Self {
            kind,
            regex: Regex::new(pattern).expect("valid regex"),
            score,
            group: 0,
            validator: None,
        }
    }

    fn group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    fn validate(mut self, validator: fn(&str) -> bool) -> Self {
        self.validator = Some(validator);
        self
    }
}

const MONTHS: &str = r"(?:Jan(?:uary)?|Feb(?:ruary)?|Mar(?:ch)?|Apr(?:il)?|May|June?|July?|Aug(?:ust)?|Sep(?:t(?:ember)?)?|Oct(?:ober)?|Nov(?:ember)?|Dec(?:ember)?)";

static PATTERN_RULES: LazyLock<Vec<PatternRule>> = LazyLock::new(|| {
    vec![
        PatternRule::new(
            EntityKind::Email,
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            0.95,
        ),
        PatternRule::new(
            EntityKind::Url,
            r#"\b(?:https?://|www\.)[^\s<>"']*[^\s<>"'.,;:!?)\]]"#,
            0.85,
        ),
        PatternRule::new(EntityKind::Ssn, r"\b\d{3}-\d{2}-\d{4}\b", 0.85).validate(valid_ssn),
        PatternRule::new(EntityKind::CreditCard, r"\b(?:\d[ -]?){12,18}\d\b", 0.9)
            .validate(luhn_valid),
        PatternRule::new(
            EntityKind::Phone,
            r"(?:\+1[-.\s]?)?(?:\(\d{3}\)\s?|\b\d{3}[-.])\d{3}[-.]\d{4}\b",
            0.75,
        ),
        PatternRule::new(
            EntityKind::Date,
            r"\b(?:0?[1-9]|1[0-2])[/-](?:0?[1-9]|[12]\d|3[01])[/-](?:(?:19|20)\d{2}|\d{2})\b",
            0.8,
        ),
        PatternRule::new(
            EntityKind::Date,
            r"\b(?:19|20)\d{2}-(?:0[1-9]|1[0-2])-(?:0[1-9]|[12]\d|3[01])(?:T(?:[01]\d|2[0-3]):[0-5]\d(?::[0-5]\d(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?)?\b",
            0.8,
        ),
        PatternRule::new(
            EntityKind::Date,
            &format!(
                r"\b(?:{MONTHS}\.?[ \t]+\d{{1,2}}(?:st|nd|rd|th)?,?[ \t]+(?:19|20)\d{{2}}|\d{{1,2}}[ \t]+{MONTHS}\.?,?[ \t]+(?:19|20)\d{{2}})\b"
            ),
            0.75,
        ),
        PatternRule::new(
            EntityKind::IpAddress,
            r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b",
            0.85,
        ),
        PatternRule::new(
            EntityKind::MedicalRecord,
            r"(?i)\b(?:MRN|medical[ \t]+record(?:[ \t]+(?:number|no\.?|#))?|patient[ \t]+id|chart[ \t]+(?:number|no\.?|#))[ \t]*[:#]?[ \t]*([A-Z0-9][A-Z0-9-]{3,})",
            0.9,
        )
        .group(1)
        .validate(contains_digit),
        PatternRule::new(
            EntityKind::Location,
            r"\b\d{1,5}[ \t]+(?:[A-Z][a-z]+[ \t]+){1,3}(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr|Court|Ct|Way|Place|Pl|Terrace|Circle)\b",
            0.7,
        ),
    ]
});

/// SSN area, group and serial must not be all zeros; area 666 and 9xx are
/// never issued.
fn valid_ssn(s: &str) -> bool {
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() != 3 {
        return false;
    }
    let (area, group, serial) = (parts[0], parts[1], parts[2]);
    area != "000" && area != "666" && !area.starts_with('9') && group != "00" && serial != "0000"
}

fn contains_digit(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_digit())
}

fn luhn_valid(s: &str) -> bool {
    let digits: Vec<u32> = s.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Deterministic regex recognizer for structured identifiers.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternRecognizer;

impl PatternRecognizer {
    pub fn new() -> Self {
        Self
    }

    /// Scan without going through the trait object; never fails.
    pub fn scan(&self, text: &str) -> Vec<Entity> {
        let mut found = Vec::new();
        for rule in PATTERN_RULES.iter() {
            for caps in rule.regex.captures_iter(text) {
                let Some(m) = caps.get(rule.group) else {
                    continue;
                };
                if let Some(validator) = rule.validator {
                    if !validator(m.as_str()) {
                        continue;
                    }
                }
                if let Some(entity) = Entity::from_span(rule.kind, text, m.start(), m.end(), rule.score) {
                    found.push(entity);
                }
            }
        }
        found
    }
}

impl Recognizer for PatternRecognizer {
    fn name(&self) -> &str {
        "pattern"
    }

    fn detect(&self, text: &str) -> Result<Vec<Entity>, DeidError> {
        Ok(self.scan(text))
    }
}

// ═══════════════════════════════════════════════════════════
// Contextual name recognizer
// ═══════════════════════════════════════════════════════════

static HONORIFIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:Mr|Mrs|Ms|Miss|Mx|Dr|Prof)\.?[ \t]+([A-Z][a-z]+(?:[-'][A-Z][a-z]+)?(?:[ \t]+[A-Z][a-z]+(?:[-'][A-Z][a-z]+)?){0,2})",
    )
    .expect("valid regex")
});

static LABELLED_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:Patient(?:[ \t]+Name)?|Name|Guardian|Emergency[ \t]+Contact|Next[ \t]+of[ \t]+Kin|Attending|Physician|Provider)[ \t]*:[ \t]*([A-Z][A-Za-z'-]+(?:,?[ \t]+[A-Z][A-Za-z'-]+){0,3})",
    )
    .expect("valid regex")
});

static CAPITALIZED_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][a-z]+(?:-[A-Z][a-z]+)?\b").expect("valid regex")
});

/// Common given names used to anchor capitalized runs. Words that are more
/// often months or verbs (May, June, Will) are left out.
static GIVEN_NAMES: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "Aaron", "Abigail", "Adam", "Adrian", "Ahmed", "Aisha", "Alan", "Albert", "Alex", "Alexander",
        "Alice", "Alicia", "Allison", "Amanda", "Amber", "Amy", "Andrea", "Andrew", "Angela", "Ann",
        "Anna", "Anne", "Anthony", "Antonio", "Arthur", "Ashley", "Barbara", "Benjamin", "Betty", "Beverly",
        "Brandon", "Brenda", "Brian", "Bruce", "Carl", "Carlos", "Carol", "Caroline", "Catherine", "Charles",
        "Charlotte", "Cheryl", "Christina", "Christine", "Christopher", "Claire", "Cynthia", "Daniel", "David",
        "Deborah", "Debra", "Denise", "Dennis", "Diana", "Diane", "Donald", "Donna", "Dorothy", "Douglas",
        "Edward", "Elena", "Elizabeth", "Emily", "Emma", "Eric", "Ethan", "Evelyn", "Frances", "Frank",
        "Gary", "George", "Gloria", "Gregory", "Hannah", "Harold", "Heather", "Helen", "Henry", "Isabella",
        "Jack", "Jacob", "James", "Janet", "Janice", "Jason", "Jean", "Jeffrey", "Jennifer", "Jeremy",
        "Jerry", "Jessica", "Joan", "John", "Jonathan", "Jose", "Joseph", "Joshua", "Joyce", "Juan",
        "Judith", "Julia", "Julie", "Justin", "Karen", "Katherine", "Kathleen", "Kathryn", "Keith", "Kelly",
        "Kenneth", "Kevin", "Kimberly", "Kyle", "Larry", "Laura", "Lauren", "Lawrence", "Linda", "Lisa",
        "Louis", "Lucas", "Luis", "Margaret", "Maria", "Marie", "Marilyn", "Martha", "Mary", "Matthew",
        "Megan", "Melissa", "Michael", "Michelle", "Mohammed", "Nancy", "Natalie", "Nathan", "Nicholas",
        "Nicole", "Noah", "Olivia", "Pamela", "Patricia", "Patrick", "Paul", "Peter", "Philip", "Rachel",
        "Ralph", "Raymond", "Rebecca", "Richard", "Robert", "Roger", "Ronald", "Roy", "Russell", "Ruth",
        "Ryan", "Samantha", "Samuel", "Sandra", "Sara", "Sarah", "Scott", "Sean", "Sharon", "Shirley",
        "Sophia", "Stephanie", "Stephen", "Steven", "Susan", "Teresa", "Terry", "Theresa", "Thomas",
        "Timothy", "Tyler", "Victoria", "Vincent", "Virginia", "Walter", "Wayne", "William", "Zachary",
    ]
    .into_iter()
    .collect()
});

/// Capitalized words that end a name run (facility and anatomy words).
static NAME_STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "Hospital", "Clinic", "Center", "Centre", "Medical", "Health", "University", "Street", "Avenue",
        "Road", "Unit", "Ward", "Department", "Institute", "Memorial", "County", "General", "Regional",
        "Syndrome", "Disease", "Scale", "Score", "Test", "Note", "Notes",
    ]
    .into_iter()
    .collect()
});

/// Deterministic recognizer for personal names using honorifics, labelled
/// fields and runs of capitalized words anchored on a known given name.
pub struct ContextualNameRecognizer {
    extra_names: HashSet<String>,
}

impl ContextualNameRecognizer {
    pub fn new(extra_names: &[String]) -> Self {
        Self {
            extra_names: extra_names
                .iter()
                .map(|n| n.trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    fn is_anchor(&self, token: &str) -> bool {
        let head = token.split('-').next().unwrap_or(token);
        GIVEN_NAMES.contains(head)
            || GIVEN_NAMES.contains(token)
            || self.extra_names.contains(&token.to_lowercase())
    }

    fn capitalized_runs(&self, text: &str) -> Vec<Entity> {
        let tokens: Vec<(usize, usize)> = CAPITALIZED_TOKEN_RE
            .find_iter(text)
            .map(|m| (m.start(), m.end()))
            .collect();

        let mut found = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let (start, end) = tokens[i];
            if !self.is_anchor(&text[start..end]) {
                i += 1;
                continue;
            }

            let mut last = i;
            while last + 1 < tokens.len() && last - i < 2 {
                let (next_start, next_end) = tokens[last + 1];
                let gap = &text[tokens[last].1..next_start];
                let adjacent = !gap.is_empty() && gap.chars().all(|c| c == ' ' || c == '\t');
                if !adjacent || NAME_STOP_WORDS.contains(&text[next_start..next_end]) {
                    break;
                }
                last += 1;
            }

            let score = if last > i { 0.85 } else { 0.6 };
            if let Some(entity) = Entity::from_span(EntityKind::Person, text, start, tokens[last].1, score) {
                found.push(entity);
            }
            i = last + 1;
        }
        found
    }
}

impl Recognizer for ContextualNameRecognizer {
    fn name(&self) -> &str {
        "contextual_name"
    }

    fn detect(&self, text: &str) -> Result<Vec<Entity>, DeidError> {
        let mut found = Vec::new();

        for re in [&*HONORIFIC_RE, &*LABELLED_NAME_RE] {
            for caps in re.captures_iter(text) {
                if let Some(m) = caps.get(1) {
                    if let Some(entity) = Entity::from_span(EntityKind::Person, text, m.start(), m.end(), 0.9) {
                        found.push(entity);
                    }
                }
            }
        }

        found.extend(self.capitalized_runs(text));
        Ok(found)
    }
}

// ═══════════════════════════════════════════════════════════
// Statistical NER adapter
// ═══════════════════════════════════════════════════════════

/// A span proposed by an external NER model. Offsets are byte offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct NerSpan {
    pub label: String,
    pub start: usize,
    pub end: usize,
    pub score: f32,
}

/// External statistical entity-recognition capability.
pub trait NerBackend: Send + Sync {
    fn is_available(&self) -> bool;
    fn recognize(&self, text: &str) -> Result<Vec<NerSpan>, DeidError>;
}

/// Adapts a [`NerBackend`] into the recognizer collection.
pub struct NerRecognizer {
    backend: Box<dyn NerBackend>,
}

impl NerRecognizer {
    pub fn new(backend: Box<dyn NerBackend>) -> Self {
        Self { backend }
    }
}

impl Recognizer for NerRecognizer {
    fn name(&self) -> &str {
        "ner"
    }

    fn is_statistical(&self) -> bool {
        true
    }

    fn detect(&self, text: &str) -> Result<Vec<Entity>, DeidError> {
        if !self.backend.is_available() {
            return Err(DeidError::DetectionUnavailable {
                recognizer: self.name().to_string(),
            });
        }

        let spans = self.backend.recognize(text)?;
        let mut found = Vec::with_capacity(spans.len());
        let mut ignored = 0usize;
        for span in spans {
            let Some(kind) = EntityKind::from_ner_label(&span.label) else {
                ignored += 1;
                continue;
            };
            let entity = Entity::from_span(kind, text, span.start, span.end, span.score).ok_or_else(|| {
                DeidError::Recognizer {
                    recognizer: self.name().to_string(),
                    reason: format!("span {}..{} does not fit the text", span.start, span.end),
                }
            })?;
            found.push(entity);
        }
        if ignored > 0 {
            tracing::debug!(ignored, "NER spans with non-identifying labels ignored");
        }
        Ok(found)
    }
}
