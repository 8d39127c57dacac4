use super::classify::{categorize_source, SourceCategory};
use super::types::ReportType;
use crate::pipeline::storage::ScoredChunk;

pub const NO_DOCUMENTATION: &str = "No clinical documentation was retrieved for this patient.";

const CLOSING_NOTE: &str = "This report was assembled directly from retrieved documentation excerpts. \
With a generation backend connected, these excerpts are synthesized into a narrative report.";

/// Section order for each report type. Every category appears exactly once.
fn section_order(report_type: ReportType) -> [SourceCategory; 7] {
    use SourceCategory::*;
    match report_type {
        ReportType::FullSummary => [Admission, Assessment, Treatment, Medication, Progress, Discharge, Other],
        ReportType::ProgressNotes => [Progress, Treatment, Assessment, Medication, Admission, Discharge, Other],
        ReportType::AssessmentSummary => [Assessment, Admission, Treatment, Progress, Medication, Discharge, Other],
        ReportType::MedicationReview => [Medication, Treatment, Progress, Admission, Assessment, Discharge, Other],
        ReportType::DischargeSummary => [Discharge, Admission, Treatment, Medication, Progress, Assessment, Other],
    }
}

/// Deterministic report built from retrieved chunks alone.
///
/// Chunks are grouped into sections by source-label category. Within a
/// section they keep retrieval rank, except progress notes, which are
/// ordered by source label and chunk order.
pub fn structured_report(report_type: ReportType, chunks: &[ScoredChunk]) -> String {
    let mut out = format!("## {}\n\n", report_type.title());
    if chunks.is_empty() {
        out.push_str(NO_DOCUMENTATION);
        out.push('\n');
        return out;
    }

    for category in section_order(report_type) {
        let mut members: Vec<&ScoredChunk> = chunks
            .iter()
            .filter(|c| categorize_source(&c.chunk.source_label) == category)
            .collect();
        if members.is_empty() {
            continue;
        }
        if category == SourceCategory::Progress {
            members.sort_by(|a, b| {
                a.chunk
                    .source_label
                    .cmp(&b.chunk.source_label)
                    .then(a.chunk.order.cmp(&b.chunk.order))
            });
        }

        out.push_str(&format!("### {}\n\n", category.heading()));
        for member in members {
            out.push_str(&format!(
                "**From: {}**\n\n{}\n\n---\n\n",
                member.chunk.source_label,
                member.chunk.text.trim()
            ));
        }
    }

    out.push_str("### Note\n\n");
    out.push_str(CLOSING_NOTE);
    out.push('\n');
    out
}
