use serde::{Deserialize, Serialize};

use super::classify::augment_query;
use super::types::ReportType;
use super::RagError;
use crate::pipeline::storage::{ChunkFilter, EmbeddingModel, ScoredChunk, VectorIndex};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub max_top_k: usize,
    /// Chunks scoring below this are dropped. `None` keeps everything.
    pub min_score: Option<f32>,
    /// Candidates fetched per requested result, before deduplication.
    pub overfetch_factor: usize,
    /// Same-document chunks sharing at least this fraction of the shorter
    /// chunk count as duplicates.
    pub dedup_overlap_ratio: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_top_k: 50,
            min_score: None,
            overfetch_factor: 3,
            dedup_overlap_ratio: 0.5,
        }
    }
}

/// Ranked chunk retrieval for report requests.
pub struct Retriever<'a, E: EmbeddingModel> {
    index: &'a VectorIndex<E>,
    config: &'a RetrievalConfig,
}

impl<'a, E: EmbeddingModel> Retriever<'a, E> {
    pub fn new(index: &'a VectorIndex<E>, config: &'a RetrievalConfig) -> Self {
        Self { index, config }
    }

    pub fn validate_top_k(&self, top_k: usize) -> Result<(), RagError> {
        if top_k == 0 || top_k > self.config.max_top_k {
            return Err(RagError::MalformedRequest(format!(
                "top_k must be between 1 and {}, got {top_k}",
                self.config.max_top_k
            )));
        }
        Ok(())
    }

    /// Retrieve up to `top_k` chunks for an already-scrubbed query.
    /// Returns fewer when the index holds fewer distinct chunks.
    pub fn retrieve(&self, query: &str, report_type: ReportType, top_k: usize) -> Result<Vec<ScoredChunk>, RagError> {
        self.retrieve_filtered(query, report_type, top_k, None)
    }

    pub fn retrieve_filtered(
        &self,
        query: &str,
        report_type: ReportType,
        top_k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        self.validate_top_k(top_k)?;

        let augmented = augment_query(query, report_type);
        let fetch = top_k.saturating_mul(self.config.overfetch_factor.max(1));
        let candidates = self.index.query(&augmented, fetch, filter)?;
        let fetched = candidates.len();

        let above_threshold = candidates
            .into_iter()
            .filter(|c| self.config.min_score.map_or(true, |min| c.score >= min));
        let mut results = dedup_overlapping(above_threshold, self.config.dedup_overlap_ratio);
        results.truncate(top_k);

        tracing::debug!(
            report_type = %report_type,
            top_k,
            fetched,
            returned = results.len(),
            "Chunks retrieved"
        );
        Ok(results)
    }
}

/// Drop candidates that duplicate a higher-ranked chunk of the same
/// document. Input must already be ranked best first.
pub fn dedup_overlapping(candidates: impl IntoIterator<Item = ScoredChunk>, ratio: f32) -> Vec<ScoredChunk> {
    let mut kept: Vec<ScoredChunk> = Vec::new();
    for candidate in candidates {
        let duplicate = kept.iter().any(|k| {
            if k.chunk.document_id != candidate.chunk.document_id {
                return false;
            }
            if k.chunk.text == candidate.chunk.text {
                return true;
            }
            let shorter = k.chunk.char_len().min(candidate.chunk.char_len());
            shorter > 0 && k.chunk.shared_chars(&candidate.chunk) as f32 >= ratio * shorter as f32
        });
        if !duplicate {
            kept.push(candidate);
        }
    }
    kept
}
