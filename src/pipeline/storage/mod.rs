pub mod types;
pub mod chunker;
pub mod embedder;
pub mod vectordb;

pub use chunker::{chunk, TextChunker};
pub use embedder::{HashingEmbedder, OllamaEmbedder, EMBEDDING_DIM};
pub use types::{Chunk, ChunkFilter, EmbeddingModel, ScoredChunk};
pub use vectordb::VectorIndex;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Vector index corrupted ({chunks} chunks, {embeddings} embeddings); reset required")]
    IndexCorruption { chunks: usize, embeddings: usize },

    #[error("Invalid chunking parameters: {0}")]
    InvalidChunking(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index snapshot error: {0}")]
    Snapshot(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Snapshot(e.to_string())
    }
}
