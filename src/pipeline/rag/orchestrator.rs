use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;

use super::ollama::{AvailabilityCache, GenerationBackend};
use super::prompt::PromptBuilder;
use super::retrieval::Retriever;
use super::sanitize::clean_model_output;
use super::structured::structured_report;
use super::types::{
    DegradationReason, GenerationMethod, GenerationPrompt, GenerationState, RagConfig, Report, ReportRequest,
    SourceAttribution,
};
use super::{GenerationError, RagError};
use crate::pipeline::deid::{DeidError, MapScope, RedactionMap, Scrubber};
use crate::pipeline::storage::{ChunkFilter, EmbeddingModel, ScoredChunk, VectorIndex};

/// Ordered record of lifecycle states for one request.
struct StateTrace(Vec<GenerationState>);

impl StateTrace {
    fn new() -> Self {
        Self(vec![GenerationState::Idle])
    }

    fn advance(&mut self, next: GenerationState) {
        if let Some(&current) = self.0.last() {
            debug_assert!(current.can_transition_to(next), "{current:?} -> {next:?}");
        }
        self.0.push(next);
    }

    fn into_inner(self) -> Vec<GenerationState> {
        self.0
    }
}

/// Report orchestrator.
///
/// Coordinates: scrub query → retrieve → (structured | prompt → generate)
/// → re-scrub. Backend failures never surface as errors; they degrade the
/// report to structured assembly and are recorded on it.
pub struct ReportGenerator<'a, E: EmbeddingModel> {
    scrubber: &'a Scrubber,
    session_map: &'a Mutex<RedactionMap>,
    index: &'a VectorIndex<E>,
    availability: &'a AvailabilityCache,
    config: &'a RagConfig,
    backend: Option<Arc<dyn GenerationBackend>>,
}

impl<'a, E: EmbeddingModel> ReportGenerator<'a, E> {
    pub fn new(
        scrubber: &'a Scrubber,
        session_map: &'a Mutex<RedactionMap>,
        index: &'a VectorIndex<E>,
        availability: &'a AvailabilityCache,
        config: &'a RagConfig,
    ) -> Self {
        Self {
            scrubber,
            session_map,
            index,
            availability,
            config,
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: Option<Arc<dyn GenerationBackend>>) -> Self {
        self.backend = backend;
        self
    }

    pub fn generate(&self, request: &ReportRequest) -> Result<Report, RagError> {
        let started = Instant::now();
        let mut trace = StateTrace::new();
        trace.advance(GenerationState::Retrieving);

        let (query, chunks) = match self.retrieve(request) {
            Ok(retrieved) => retrieved,
            Err(e) => {
                trace.advance(GenerationState::Failed);
                tracing::warn!(
                    report_type = %request.report_type,
                    error = %e,
                    "Report generation failed during retrieval"
                );
                return Err(e);
            }
        };

        let outcome = self.produce(request, &query, &chunks, &mut trace);
        trace.advance(GenerationState::Done);

        let report = Report {
            content: outcome.content,
            generation_method: outcome.method,
            source_attributions: attributions(&chunks),
            report_type: request.report_type,
            degradation: outcome.degradation,
            generated_at: Utc::now(),
            trace: trace.into_inner(),
        };

        tracing::info!(
            report_type = %report.report_type,
            method = ?report.generation_method,
            chunks = chunks.len(),
            degradation = ?report.degradation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Report generated"
        );
        Ok(report)
    }

    /// Scrub the request query and fetch ranked chunks for it.
    fn retrieve(&self, request: &ReportRequest) -> Result<(String, Vec<ScoredChunk>), RagError> {
        let retriever = Retriever::new(self.index, &self.config.retrieval);
        retriever.validate_top_k(request.top_k)?;

        let query = if request.query.trim().is_empty() {
            String::new()
        } else {
            self.scrub(&request.query)?
        };
        let filter = match &request.filter {
            Some(filter) => Some(ChunkFilter {
                document_ids: filter.document_ids.clone(),
                source_label_contains: match &filter.source_label_contains {
                    Some(needle) => Some(self.scrub(needle)?),
                    None => None,
                },
            }),
            None => None,
        };
        let chunks = retriever.retrieve_filtered(&query, request.report_type, request.top_k, filter.as_ref())?;
        Ok((query, chunks))
    }

    fn scrub(&self, text: &str) -> Result<String, DeidError> {
        let result = match self.scrubber.policy().scope {
            MapScope::Session => {
                let mut map = self.session_map.lock().unwrap_or_else(PoisonError::into_inner);
                self.scrubber.scrub(text, &mut map)?
            }
            MapScope::Document => self.scrubber.scrub_standalone(text)?,
        };
        Ok(result.scrubbed_text)
    }

    fn produce(
        &self,
        request: &ReportRequest,
        query: &str,
        chunks: &[ScoredChunk],
        trace: &mut StateTrace,
    ) -> Outcome {
        let structured = |trace: &mut StateTrace, degradation: Option<DegradationReason>| {
            trace.advance(GenerationState::StructuredAssembly);
            Outcome {
                content: structured_report(request.report_type, chunks),
                method: GenerationMethod::Structured,
                degradation,
            }
        };

        if chunks.is_empty() {
            return structured(trace, None);
        }
        let backend = match (&self.backend, request.use_generation_backend) {
            (Some(backend), true) => Arc::clone(backend),
            _ => return structured(trace, None),
        };
        if !self.availability.is_available(backend.as_ref()) {
            tracing::info!("Generation backend unavailable, using structured report");
            return structured(trace, Some(DegradationReason::BackendUnavailable));
        }

        trace.advance(GenerationState::PromptBuilding);
        let prompt = PromptBuilder::new(self.config.context_budget_chars, self.config.max_focus_chars).build(
            request.report_type,
            chunks,
            query,
        );

        trace.advance(GenerationState::Generating);
        let raw = match self.run_backend(backend, prompt) {
            Ok(raw) => raw,
            Err(e) => {
                self.availability.invalidate();
                tracing::warn!(error = %e, "Generation failed, falling back to structured report");
                return structured(trace, Some(degradation_for(&e)));
            }
        };

        let cleaned = clean_model_output(&raw);
        if cleaned.is_empty() {
            self.availability.invalidate();
            tracing::warn!("Generation returned empty output, falling back to structured report");
            return structured(trace, Some(DegradationReason::EmptyOutput));
        }

        match self.scrub(&cleaned) {
            Ok(content) => Outcome {
                content,
                method: GenerationMethod::Synthesized,
                degradation: None,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Generated output failed re-scrubbing, falling back to structured report");
                structured(trace, Some(DegradationReason::OutputRejected))
            }
        }
    }

    /// Run the backend on a worker thread and wait up to the configured
    /// timeout. A timed-out worker is abandoned.
    fn run_backend(&self, backend: Arc<dyn GenerationBackend>, prompt: GenerationPrompt) -> Result<String, GenerationError> {
        let config = self.config.generation.clone();
        config.validate()?;
        let deadline = Duration::from_secs(config.timeout_secs);
        let timeout_secs = config.timeout_secs;

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            // Receiver is gone once the deadline passed.
            let _ = tx.send(backend.generate(&prompt, &config));
        });

        match rx.recv_timeout(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(GenerationError::Timeout(timeout_secs)),
            Err(RecvTimeoutError::Disconnected) => Err(GenerationError::Model("generation worker terminated".into())),
        }
    }
}

struct Outcome {
    content: String,
    method: GenerationMethod,
    degradation: Option<DegradationReason>,
}

fn degradation_for(error: &GenerationError) -> DegradationReason {
    match error {
        GenerationError::Timeout(_) => DegradationReason::Timeout,
        GenerationError::Connection(_) => DegradationReason::Connection,
        GenerationError::Model(_) | GenerationError::InvalidConfig(_) => DegradationReason::Model,
    }
}

fn attributions(chunks: &[ScoredChunk]) -> Vec<SourceAttribution> {
    chunks
        .iter()
        .map(|c| SourceAttribution {
            chunk_id: c.chunk.id,
            document_id: c.chunk.document_id,
            source_label: c.chunk.source_label.clone(),
            score: c.score,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::deid::{DetectionConfig, RedactionPolicy};
    use crate::pipeline::rag::ollama::{GenerationConfig, MockBackend};
    use crate::pipeline::rag::structured::NO_DOCUMENTATION;
    use crate::pipeline::rag::types::ReportType;
    use crate::pipeline::storage::{HashingEmbedder, TextChunker};
    use uuid::Uuid;

    struct Fixture {
        scrubber: Scrubber,
        map: Mutex<RedactionMap>,
        index: VectorIndex<HashingEmbedder>,
        availability: AvailabilityCache,
        config: RagConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                scrubber: Scrubber::new(DetectionConfig::default(), RedactionPolicy::default()).unwrap(),
                map: Mutex::new(RedactionMap::new()),
                index: VectorIndex::new(HashingEmbedder::new()),
                availability: AvailabilityCache::new(Duration::from_secs(60)),
                config: RagConfig::default(),
            }
        }

        fn ingest(&self, label: &str, raw: &str) -> Uuid {
            let scrubbed = self.scrubber.scrub(raw, &mut self.map.lock().unwrap()).unwrap();
            let label = self.scrubber.scrub(label, &mut self.map.lock().unwrap()).unwrap();
            let document_id = Uuid::new_v4();
            let chunks = TextChunker::new(200, 20)
                .unwrap()
                .chunk(&scrubbed.scrubbed_text, document_id, &label.scrubbed_text);
            self.index.add(&chunks).unwrap();
            document_id
        }

        fn with_notes() -> Self {
            let f = Self::new();
            f.ingest("Admission note", "John Smith admitted on 01/15/2024 with chest pain. SSN 123-45-6789.");
            f.ingest("Progress note", "Patient stable, metoprolol 25 mg continued. Sleeping well.");
            f.ingest("Discharge summary", "Discharged home on 01/20/2024. Follow-up with cardiology in two weeks.");
            f
        }

        fn generator(&self, backend: Option<Arc<dyn GenerationBackend>>) -> ReportGenerator<'_, HashingEmbedder> {
            ReportGenerator::new(&self.scrubber, &self.map, &self.index, &self.availability, &self.config).with_backend(backend)
        }
    }

    fn mock(backend: MockBackend) -> Option<Arc<dyn GenerationBackend>> {
        Some(Arc::new(backend))
    }

    // =================================================================
    // STRUCTURED PATH
    // =================================================================

    #[test]
    fn no_backend_yields_structured_report() {
        let f = Fixture::with_notes();
        let report = f.generator(None).generate(&ReportRequest::new(ReportType::FullSummary)).unwrap();
        assert_eq!(report.generation_method, GenerationMethod::Structured);
        assert!(report.degradation.is_none());
        assert_eq!(report.source_attributions.len(), 3);
        assert!(report.content.contains("**From: Admission note**"));
        assert!(report.content.contains("[PHI-PERSON]"));
        assert!(!report.content.contains("John Smith"));
        assert_eq!(
            report.trace,
            vec![
                GenerationState::Idle,
                GenerationState::Retrieving,
                GenerationState::StructuredAssembly,
                GenerationState::Done
            ]
        );
    }

    #[test]
    fn empty_index_yields_no_documentation_report() {
        let f = Fixture::new();
        let report = f
            .generator(mock(MockBackend::new("never used")))
            .generate(&ReportRequest::new(ReportType::ProgressNotes))
            .unwrap();
        assert_eq!(report.generation_method, GenerationMethod::Structured);
        assert!(report.content.contains(NO_DOCUMENTATION));
        assert!(report.source_attributions.is_empty());
    }

    #[test]
    fn request_can_opt_out_of_backend() {
        let f = Fixture::with_notes();
        let backend = Arc::new(MockBackend::new("synthesized"));
        let report = f
            .generator(Some(backend.clone()))
            .generate(&ReportRequest::new(ReportType::FullSummary).structured_only())
            .unwrap();
        assert_eq!(report.generation_method, GenerationMethod::Structured);
        assert!(report.degradation.is_none());
        assert_eq!(backend.availability_checks(), 0);
    }

    #[test]
    fn top_k_beyond_index_size_returns_all_chunks() {
        let f = Fixture::with_notes();
        let report = f
            .generator(None)
            .generate(&ReportRequest::new(ReportType::FullSummary).with_top_k(5))
            .unwrap();
        assert_eq!(report.source_attributions.len(), 3);
    }

    #[test]
    fn filter_scopes_report_to_selected_documents() {
        let f = Fixture::with_notes();
        let other = f.ingest("Progress note for Mary Jones", "Mary Jones ambulating independently.");
        let generator = f.generator(None);

        let by_id = ReportRequest::new(ReportType::FullSummary).with_filter(ChunkFilter::for_document(other));
        let report = generator.generate(&by_id).unwrap();
        assert_eq!(report.source_attributions.len(), 1);
        assert_eq!(report.source_attributions[0].document_id, other);

        // The label needle is scrubbed, so it matches the scrubbed label.
        let by_label = ReportRequest::new(ReportType::FullSummary).with_filter(ChunkFilter {
            source_label_contains: Some("Mary Jones".into()),
            ..Default::default()
        });
        let report = generator.generate(&by_label).unwrap();
        assert_eq!(report.source_attributions.len(), 1);
        assert_eq!(report.source_attributions[0].document_id, other);
        assert!(!report.content.contains("Mary"));
    }

    #[test]
    fn filter_matching_nothing_yields_no_documentation_report() {
        let f = Fixture::with_notes();
        let request = ReportRequest::new(ReportType::FullSummary).with_filter(ChunkFilter::for_document(Uuid::new_v4()));
        let report = f.generator(None).generate(&request).unwrap();
        assert!(report.content.contains(NO_DOCUMENTATION));
        assert!(report.source_attributions.is_empty());
    }

    #[test]
    fn malformed_top_k_is_an_error() {
        let f = Fixture::with_notes();
        let generator = f.generator(None);
        for top_k in [0, 51] {
            let err = generator
                .generate(&ReportRequest::new(ReportType::FullSummary).with_top_k(top_k))
                .unwrap_err();
            assert!(matches!(err, RagError::MalformedRequest(_)));
        }
    }

    // =================================================================
    // SYNTHESIZED PATH
    // =================================================================

    #[test]
    fn available_backend_yields_synthesized_report() {
        let f = Fixture::with_notes();
        let report = f
            .generator(mock(MockBackend::new("<think>draft</think>## Summary\nPatient stable.")))
            .generate(&ReportRequest::new(ReportType::FullSummary))
            .unwrap();
        assert_eq!(report.generation_method, GenerationMethod::Synthesized);
        assert_eq!(report.content, "## Summary\nPatient stable.");
        assert!(report.trace.contains(&GenerationState::Generating));
        assert_eq!(report.trace.last(), Some(&GenerationState::Done));
    }

    #[test]
    fn synthesized_output_is_rescrubbed() {
        let f = Fixture::with_notes();
        let report = f
            .generator(mock(MockBackend::new("Summary for John Smith, SSN 123-45-6789.")))
            .generate(&ReportRequest::new(ReportType::FullSummary))
            .unwrap();
        assert_eq!(report.generation_method, GenerationMethod::Synthesized);
        assert!(!report.content.contains("John Smith"));
        assert!(!report.content.contains("123-45-6789"));
        assert!(report.content.contains("[PHI-SSN]"));
    }

    #[test]
    fn query_is_scrubbed_before_prompting() {
        let f = Fixture::with_notes();
        let backend = Arc::new(MockBackend::new("ok"));
        f.generator(Some(backend.clone()))
            .generate(&ReportRequest::new(ReportType::FullSummary).with_query("How is John Smith sleeping?"))
            .unwrap();
        let prompt = backend.last_prompt().unwrap();
        assert!(prompt.user_instructions.contains("[PHI-PERSON]"));
        assert!(!prompt.user_instructions.contains("John Smith"));
        assert!(!prompt.context_block.contains("John Smith"));
        assert!(!prompt.context_block.contains("123-45-6789"));
    }

    // =================================================================
    // DEGRADATION
    // =================================================================

    #[test]
    fn unavailable_backend_degrades() {
        let f = Fixture::with_notes();
        let report = f
            .generator(mock(MockBackend::new("x").unavailable()))
            .generate(&ReportRequest::new(ReportType::DischargeSummary))
            .unwrap();
        assert_eq!(report.generation_method, GenerationMethod::Structured);
        assert_eq!(report.degradation, Some(DegradationReason::BackendUnavailable));
    }

    #[test]
    fn slow_backend_times_out_to_structured() {
        let mut f = Fixture::with_notes();
        f.config.generation = GenerationConfig {
            timeout_secs: 1,
            ..Default::default()
        };
        let backend = Arc::new(MockBackend::new("late").with_delay(Duration::from_secs(3)));
        let started = Instant::now();
        let report = f
            .generator(Some(backend.clone()))
            .generate(&ReportRequest::new(ReportType::FullSummary))
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(report.generation_method, GenerationMethod::Structured);
        assert_eq!(report.degradation, Some(DegradationReason::Timeout));
        assert!(report.content.starts_with("## Full Clinical Summary"));
    }

    #[test]
    fn failure_invalidates_availability_cache() {
        let f = Fixture::with_notes();
        let backend = Arc::new(MockBackend::new("").failing(GenerationError::Connection("local".into())));
        let generator = f.generator(Some(backend.clone()));

        let first = generator.generate(&ReportRequest::new(ReportType::FullSummary)).unwrap();
        assert_eq!(first.degradation, Some(DegradationReason::Connection));
        generator.generate(&ReportRequest::new(ReportType::FullSummary)).unwrap();
        assert_eq!(backend.availability_checks(), 2);
    }

    #[test]
    fn empty_output_degrades() {
        let f = Fixture::with_notes();
        let report = f
            .generator(mock(MockBackend::new("<unused1>thought\n   ")))
            .generate(&ReportRequest::new(ReportType::FullSummary))
            .unwrap();
        assert_eq!(report.degradation, Some(DegradationReason::EmptyOutput));
        assert_eq!(report.generation_method, GenerationMethod::Structured);
    }

    #[test]
    fn model_error_degrades() {
        let f = Fixture::with_notes();
        let report = f
            .generator(mock(MockBackend::new("").failing(GenerationError::Model("status 500".into()))))
            .generate(&ReportRequest::new(ReportType::MedicationReview))
            .unwrap();
        assert_eq!(report.degradation, Some(DegradationReason::Model));
        assert_eq!(
            report.trace,
            vec![
                GenerationState::Idle,
                GenerationState::Retrieving,
                GenerationState::PromptBuilding,
                GenerationState::Generating,
                GenerationState::StructuredAssembly,
                GenerationState::Done
            ]
        );
    }
}
