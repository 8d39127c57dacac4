//! Session facade over the de-identification and report pipeline.
//!
//! A `ReportSession` owns every stateful resource: the redaction map, the
//! vector index, the backend handle and its availability cache. Nothing is
//! global; dropping the session (or calling `reset`) releases it all.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::{ConfigError, EmbeddingProvider, PipelineConfig};
use crate::pipeline::deid::{
    DeidError, Detection, EntityKind, EntityReport, MapScope, NerBackend, RedactionMap, ScrubResult, Scrubber,
};
use crate::pipeline::rag::{
    AvailabilityCache, GenerationBackend, GenerationError, OllamaBackend, RagError, Report, ReportGenerator,
    ReportRequest,
};
use crate::pipeline::storage::{
    EmbeddingModel, HashingEmbedder, OllamaEmbedder, StorageError, TextChunker, VectorIndex,
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Deid(#[from] DeidError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Rag(#[from] RagError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Ingestion worker panicked")]
    WorkerPanicked,
}

/// Raw clinical text awaiting scrubbing. The text buffer is wiped on drop
/// and never printed.
pub struct RawDocument {
    pub id: Uuid,
    pub source_label: String,
    text: Zeroizing<String>,
}

impl RawDocument {
    pub fn new(source_label: &str, text: String) -> Self {
        Self::with_id(Uuid::new_v4(), source_label, text)
    }

    pub fn with_id(id: Uuid, source_label: &str, text: String) -> Self {
        Self {
            id,
            source_label: source_label.to_string(),
            text: Zeroizing::new(text),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Debug for RawDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDocument")
            .field("id", &self.id)
            .field("text", &format_args!("<{} chars>", self.text.chars().count()))
            .finish_non_exhaustive()
    }
}

/// Outcome of ingesting one document. Counts only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestSummary {
    pub document_id: Uuid,
    pub chunks: usize,
    pub counts_by_kind: BTreeMap<EntityKind, usize>,
    pub degraded: bool,
    /// Chunks removed from a previous ingestion of the same document id.
    pub replaced: usize,
}

pub struct ReportSession {
    config: PipelineConfig,
    scrubber: Scrubber,
    chunker: TextChunker,
    map: Mutex<RedactionMap>,
    index: VectorIndex<Box<dyn EmbeddingModel>>,
    backend: Option<Arc<dyn GenerationBackend>>,
    availability: AvailabilityCache,
}

impl ReportSession {
    /// Session with the local hashing embedder and no generation backend.
    pub fn new(config: PipelineConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let scrubber = Scrubber::new(config.detection.clone(), config.redaction.clone())?;
        let chunker = TextChunker::new(config.chunking.max_size, config.chunking.overlap)?;
        let embedder: Box<dyn EmbeddingModel> = Box::new(HashingEmbedder::with_dimension(config.embedding.dimension));
        let availability = AvailabilityCache::new(Duration::from_secs(config.backend.availability_ttl_secs));

        Ok(Self {
            config,
            scrubber,
            chunker,
            map: Mutex::new(RedactionMap::new()),
            index: VectorIndex::new(embedder),
            backend: None,
            availability,
        })
    }

    /// Session wired as the configuration describes: Ollama embedder and
    /// generation backend where enabled.
    pub fn from_config(config: PipelineConfig) -> Result<Self, SessionError> {
        let mut session = Self::new(config)?;
        let cfg = &session.config;

        if cfg.embedding.provider == EmbeddingProvider::Ollama {
            let embedder = OllamaEmbedder::new(
                &cfg.backend.base_url,
                &cfg.embedding.model,
                cfg.embedding.dimension,
                cfg.embedding.timeout_secs,
            )?;
            session = session.with_embedder(Box::new(embedder));
        }
        if session.config.backend.enabled {
            let backend = OllamaBackend::new(&session.config.backend.base_url)?;
            session = session.with_backend(Arc::new(backend));
        }

        tracing::info!(
            embedding = ?session.config.embedding.provider,
            generation = session.backend.is_some(),
            scope = ?session.config.redaction.scope,
            "Report session ready"
        );
        Ok(session)
    }

    /// Replace the embedder. The index is rebuilt empty.
    pub fn with_embedder(mut self, embedder: Box<dyn EmbeddingModel>) -> Self {
        self.index = VectorIndex::new(embedder);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backend = Some(backend);
        self.availability.invalidate();
        self
    }

    pub fn with_ner(mut self, backend: Box<dyn NerBackend>) -> Self {
        self.scrubber = self.scrubber.with_ner(backend);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn chunk_count(&self) -> usize {
        self.index.count()
    }

    pub fn chunk_count_for(&self, document_id: &Uuid) -> usize {
        self.index.count_for_document(document_id)
    }

    /// Distinct identifiers recorded in the session redaction map.
    pub fn redaction_map_len(&self) -> usize {
        self.lock_map().len()
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, RedactionMap> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ═══════════════════════════════════════════════════════════
    // Scrubbing
    // ═══════════════════════════════════════════════════════════

    /// Scrub text under the configured map scope.
    pub fn scrub(&self, text: &str) -> Result<ScrubResult, SessionError> {
        let result = match self.config.redaction.scope {
            MapScope::Session => self.scrubber.scrub(text, &mut self.lock_map())?,
            MapScope::Document => self.scrubber.scrub_standalone(text)?,
        };
        Ok(result)
    }

    fn redact_detected(&self, text: &str, detection: &Detection) -> Result<ScrubResult, SessionError> {
        let result = match self.config.redaction.scope {
            MapScope::Session => self.scrubber.redact(text, detection, &mut self.lock_map())?,
            MapScope::Document => self.scrubber.redact(text, detection, &mut RedactionMap::new())?,
        };
        Ok(result)
    }

    /// Audit summary of identifiers in `text`, without values.
    pub fn entity_report(&self, text: &str) -> Result<EntityReport, SessionError> {
        Ok(self.scrubber.entity_report(text)?)
    }

    // ═══════════════════════════════════════════════════════════
    // Ingestion
    // ═══════════════════════════════════════════════════════════

    /// Scrub, chunk and index one document. Re-ingesting a document id
    /// replaces its chunks.
    pub fn ingest(&self, document: &RawDocument) -> Result<IngestSummary, SessionError> {
        let scrubbed = self.scrub(document.text())?;
        let label = self.scrub(&document.source_label)?;
        self.index_scrubbed(document.id, &scrubbed, &label.scrubbed_text)
    }

    /// Ingest several documents. Detection and indexing run in parallel;
    /// redaction runs in input order so placeholder numbering does not
    /// depend on thread scheduling. One result per document, in order.
    pub fn ingest_batch(&self, documents: &[RawDocument]) -> Vec<Result<IngestSummary, SessionError>> {
        let detections: Vec<Result<(Detection, Detection), SessionError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = documents
                .iter()
                .map(|doc| {
                    scope.spawn(move || -> Result<(Detection, Detection), SessionError> {
                        Ok((self.scrubber.detect(doc.text())?, self.scrubber.detect(&doc.source_label)?))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(Err(SessionError::WorkerPanicked)))
                .collect()
        });

        let scrubbed: Vec<Result<(ScrubResult, ScrubResult), SessionError>> = documents
            .iter()
            .zip(detections)
            .map(|(doc, detected)| {
                let (text_detection, label_detection) = detected?;
                let text = self.redact_detected(doc.text(), &text_detection)?;
                let label = self.redact_detected(&doc.source_label, &label_detection)?;
                Ok((text, label))
            })
            .collect();

        let results: Vec<Result<IngestSummary, SessionError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = documents
                .iter()
                .zip(scrubbed)
                .map(|(doc, scrubbed)| {
                    scope.spawn(move || -> Result<IngestSummary, SessionError> {
                        let (text, label) = scrubbed?;
                        self.index_scrubbed(doc.id, &text, &label.scrubbed_text)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(Err(SessionError::WorkerPanicked)))
                .collect()
        });

        let failed = results.iter().filter(|r| r.is_err()).count();
        tracing::info!(documents = documents.len(), failed, "Batch ingestion complete");
        results
    }

    fn index_scrubbed(&self, document_id: Uuid, scrubbed: &ScrubResult, label: &str) -> Result<IngestSummary, SessionError> {
        let chunks = self.chunker.chunk(&scrubbed.scrubbed_text, document_id, label);
        let replaced = self.index.replace_document(&document_id, &chunks)?;
        let added = chunks.len();

        tracing::info!(
            document_id = %document_id,
            chunks = added,
            replaced,
            redacted = scrubbed.total_redacted(),
            degraded = scrubbed.degraded,
            "Document ingested"
        );
        Ok(IngestSummary {
            document_id,
            chunks: added,
            counts_by_kind: scrubbed.counts_by_kind.clone(),
            degraded: scrubbed.degraded,
            replaced,
        })
    }

    // ═══════════════════════════════════════════════════════════
    // Reports
    // ═══════════════════════════════════════════════════════════

    pub fn generate_report(&self, request: &ReportRequest) -> Result<Report, SessionError> {
        let generator = ReportGenerator::new(&self.scrubber, &self.map, &self.index, &self.availability, &self.config.rag)
            .with_backend(self.backend.clone());
        Ok(generator.generate(request)?)
    }

    // ═══════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════

    /// Drop all indexed chunks and redaction-map entries. Also clears an
    /// index corruption flag.
    pub fn reset(&self) {
        let chunks = self.index.count();
        self.index.clear();
        self.lock_map().clear();
        self.availability.invalidate();
        tracing::info!(chunks, "Session reset");
    }

    pub fn save_index(&self, path: &Path) -> Result<(), SessionError> {
        Ok(self.index.save_snapshot(path)?)
    }

    pub fn load_index(&self, path: &Path) -> Result<usize, SessionError> {
        Ok(self.index.load_snapshot(path)?)
    }
}
