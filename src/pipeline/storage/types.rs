use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StorageError;

/// A bounded segment of scrubbed text. Offsets are character offsets into
/// the scrubbed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub source_label: String,
    pub order: usize,
    /// Characters at the start of this chunk repeated from the end of the
    /// previous chunk.
    pub overlap_with_previous: usize,
}

impl Chunk {
    /// Deterministic chunk id: UUID v5 in the document's namespace.
    pub fn derive_id(document_id: &Uuid, order: usize) -> Uuid {
        Uuid::new_v5(document_id, format!("chunk-{order}").as_bytes())
    }

    pub fn char_len(&self) -> usize {
        self.end_offset - self.start_offset
    }

    /// Characters shared with another chunk of the same document.
    pub fn shared_chars(&self, other: &Chunk) -> usize {
        if self.document_id != other.document_id {
            return 0;
        }
        let start = self.start_offset.max(other.start_offset);
        let end = self.end_offset.min(other.end_offset);
        end.saturating_sub(start)
    }
}

/// A chunk with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Query-time metadata filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkFilter {
    pub document_ids: Option<Vec<Uuid>>,
    pub source_label_contains: Option<String>,
}

impl ChunkFilter {
    pub fn for_document(document_id: Uuid) -> Self {
        Self {
            document_ids: Some(vec![document_id]),
            ..Default::default()
        }
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        let doc_ok = self
            .document_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&chunk.document_id));
        let label_ok = self.source_label_contains.as_ref().map_or(true, |needle| {
            chunk
                .source_label
                .to_lowercase()
                .contains(&needle.to_lowercase())
        });
        doc_ok && label_ok
    }
}

/// Embedding model abstraction
pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError>;
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, StorageError>;
    fn dimension(&self) -> usize;
}

/// Allow `Box<dyn EmbeddingModel>` to be used as `&impl EmbeddingModel`.
impl EmbeddingModel for Box<dyn EmbeddingModel> {
    fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError> {
        (**self).embed(text)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, StorageError> {
        (**self).embed_batch(texts)
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }
}
