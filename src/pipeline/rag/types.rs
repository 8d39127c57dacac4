use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ollama::GenerationConfig;
use crate::pipeline::storage::ChunkFilter;
use super::retrieval::RetrievalConfig;
use super::RagError;

/// Kind of clinical report to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    FullSummary,
    ProgressNotes,
    AssessmentSummary,
    MedicationReview,
    DischargeSummary,
}

impl ReportType {
    pub const ALL: [ReportType; 5] = [
        ReportType::FullSummary,
        ReportType::ProgressNotes,
        ReportType::AssessmentSummary,
        ReportType::MedicationReview,
        ReportType::DischargeSummary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullSummary => "full_summary",
            Self::ProgressNotes => "progress_notes",
            Self::AssessmentSummary => "assessment_summary",
            Self::MedicationReview => "medication_review",
            Self::DischargeSummary => "discharge_summary",
        }
    }

    /// Human-readable heading.
    pub fn title(&self) -> &'static str {
        match self {
            Self::FullSummary => "Full Clinical Summary",
            Self::ProgressNotes => "Progress Notes Summary",
            Self::AssessmentSummary => "Assessment Summary",
            Self::MedicationReview => "Medication Review",
            Self::DischargeSummary => "Discharge Summary",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportType {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "full_summary" | "full" => Ok(Self::FullSummary),
            "progress_notes" | "progress_summary" | "progress" => Ok(Self::ProgressNotes),
            "assessment_summary" | "assessment" => Ok(Self::AssessmentSummary),
            "medication_review" | "medications" => Ok(Self::MedicationReview),
            "discharge_summary" | "discharge" => Ok(Self::DischargeSummary),
            other => Err(RagError::MalformedRequest(format!("unknown report type '{other}'"))),
        }
    }
}

/// A report request. `query` may contain identifiers; it is scrubbed before
/// it is used for anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub report_type: ReportType,
    pub query: String,
    pub top_k: usize,
    pub use_generation_backend: bool,
    /// Restricts retrieval to some documents or source labels, e.g. one
    /// patient's notes. A label needle is scrubbed like the query.
    #[serde(default)]
    pub filter: Option<ChunkFilter>,
}

impl ReportRequest {
    pub fn new(report_type: ReportType) -> Self {
        Self {
            report_type,
            query: String::new(),
            top_k: 5,
            use_generation_backend: true,
            filter: None,
        }
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = query.to_string();
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_filter(mut self, filter: ChunkFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn structured_only(mut self) -> Self {
        self.use_generation_backend = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMethod {
    Structured,
    Synthesized,
}

/// Why a report fell back to structured assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationReason {
    BackendUnavailable,
    Timeout,
    Connection,
    Model,
    EmptyOutput,
    OutputRejected,
}

/// Report generation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Idle,
    Retrieving,
    StructuredAssembly,
    PromptBuilding,
    Generating,
    Done,
    Failed,
}

impl GenerationState {
    pub fn can_transition_to(self, next: GenerationState) -> bool {
        use GenerationState::*;
        matches!(
            (self, next),
            (Idle, Retrieving)
                | (Retrieving, StructuredAssembly)
                | (Retrieving, PromptBuilding)
                | (PromptBuilding, Generating)
                | (Generating, StructuredAssembly)
                | (Generating, Done)
                | (StructuredAssembly, Done)
                | (_, Failed)
        ) && self != Done
            && self != Failed
    }
}

/// Where a piece of report content came from. Carries no text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAttribution {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub source_label: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub content: String,
    pub generation_method: GenerationMethod,
    pub source_attributions: Vec<SourceAttribution>,
    pub report_type: ReportType,
    pub degradation: Option<DegradationReason>,
    pub generated_at: DateTime<Utc>,
    pub trace: Vec<GenerationState>,
}

/// Prompt handed to a generation backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationPrompt {
    pub system_instructions: String,
    pub context_block: String,
    pub user_instructions: String,
}

impl GenerationPrompt {
    /// Context and instructions as a single user turn.
    pub fn user_message(&self) -> String {
        format!("{}\n\n{}", self.context_block, self.user_instructions)
    }
}

/// Context assembled for a prompt within a character budget.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    pub text: String,
    pub chunks_included: usize,
    pub chars_used: usize,
}

/// Report pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
    pub context_budget_chars: usize,
    pub max_focus_chars: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig::default(),
            context_budget_chars: 4000,
            max_focus_chars: 2000,
        }
    }
}
