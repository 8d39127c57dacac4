use super::types::ReportType;

/// Query used when a request carries no focus of its own.
pub const DEFAULT_QUERY: &str = "clinical summary patient history treatment progress assessment";

/// Retrieval keywords appended to every query for a report type.
pub fn report_keywords(report_type: ReportType) -> &'static [&'static str] {
    match report_type {
        ReportType::FullSummary => &["history", "diagnosis", "treatment", "assessment", "plan"],
        ReportType::ProgressNotes => &["progress", "status", "response", "interval", "update"],
        ReportType::AssessmentSummary => &["assessment", "evaluation", "findings", "impression", "risk"],
        ReportType::MedicationReview => &["medication", "dose", "mg", "prescribed", "adverse"],
        ReportType::DischargeSummary => &["discharge", "follow-up", "instructions", "disposition", "aftercare"],
    }
}

/// Query text for a report type when the request has none.
pub fn default_query(report_type: ReportType) -> String {
    match report_type {
        ReportType::FullSummary => DEFAULT_QUERY.to_string(),
        other => format!("{} {}", other.title().to_lowercase(), DEFAULT_QUERY),
    }
}

/// Append report-type keywords the query does not already mention.
pub fn augment_query(query: &str, report_type: ReportType) -> String {
    let base = if query.trim().is_empty() {
        default_query(report_type)
    } else {
        query.trim().to_string()
    };
    let lower = base.to_lowercase();
    let extra: Vec<&str> = report_keywords(report_type)
        .iter()
        .copied()
        .filter(|k| !lower.contains(k))
        .collect();
    if extra.is_empty() {
        base
    } else {
        format!("{base} {}", extra.join(" "))
    }
}

/// Coarse document category derived from a source label, used to group
/// structured report sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceCategory {
    Admission,
    Assessment,
    Treatment,
    Progress,
    Medication,
    Discharge,
    Other,
}

impl SourceCategory {
    pub fn heading(&self) -> &'static str {
        match self {
            Self::Admission => "Admission Information",
            Self::Assessment => "Assessment",
            Self::Treatment => "Treatment Plan",
            Self::Progress => "Progress Notes",
            Self::Medication => "Medications",
            Self::Discharge => "Discharge Information",
            Self::Other => "Additional Documentation",
        }
    }
}

/// Categorize a chunk by keywords in its source label. First match wins.
pub fn categorize_source(label: &str) -> SourceCategory {
    let lower = label.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if has(&["admission", "admit", "intake", "referral"]) {
        SourceCategory::Admission
    } else if has(&["discharge", "aftercare"]) {
        SourceCategory::Discharge
    } else if has(&["assessment", "evaluation", "eval", "screening"]) {
        SourceCategory::Assessment
    } else if has(&["treatment", "plan", "care plan"]) {
        SourceCategory::Treatment
    } else if has(&["progress", "session", "daily", "note"]) {
        SourceCategory::Progress
    } else if has(&["medication", "prescription", "pharmacy"]) {
        SourceCategory::Medication
    } else {
        SourceCategory::Other
    }
}
