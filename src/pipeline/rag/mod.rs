pub mod types;
pub mod classify;
pub mod retrieval;
pub mod context;
pub mod prompt;
pub mod sanitize;
pub mod structured;
pub mod ollama;
pub mod orchestrator;

pub use ollama::{AvailabilityCache, GenerationBackend, GenerationConfig, MockBackend, OllamaBackend};
pub use orchestrator::ReportGenerator;
pub use retrieval::{RetrievalConfig, Retriever};
pub use types::*;

use thiserror::Error;

use crate::pipeline::deid::DeidError;
use crate::pipeline::storage::StorageError;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Malformed report request: {0}")]
    MalformedRequest(String),

    #[error("De-identification failed: {0}")]
    Deid(#[from] DeidError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Backend failures. Always recovered inside the report generator; they
/// surface only as a `DegradationReason` on the report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Generation timed out after {0}s")]
    Timeout(u64),

    #[error("Cannot reach generation backend at {0}")]
    Connection(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Invalid generation config: {0}")]
    InvalidConfig(String),
}
