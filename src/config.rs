//! Pipeline configuration.
//!
//! Defaults come from `PipelineConfig::default()`. A JSON file (every field
//! optional) and `CLINREPORT_*` environment variables override them, in
//! that order.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::deid::{DegradedMode, DetectionConfig, MapScope, RedactionPolicy};
use crate::pipeline::rag::RagConfig;
use crate::pipeline::storage::{TextChunker, EMBEDDING_DIM};

pub const APP_NAME: &str = "clinreport";

/// Environment variable naming a JSON config file.
pub const CONFIG_FILE_VAR: &str = "CLINREPORT_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "clinreport=info"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            overlap: 200,
        }
    }
}

/// Generation backend connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub enabled: bool,
    pub base_url: String,
    pub availability_ttl_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:11434".to_string(),
            availability_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// Local feature-hashing embedder. No network.
    #[default]
    Hashing,
    /// Ollama `/api/embeddings` at the backend base URL.
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub dimension: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            model: "nomic-embed-text".to_string(),
            dimension: EMBEDDING_DIM,
            timeout_secs: 30,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection: DetectionConfig,
    pub redaction: RedactionPolicy,
    pub chunking: ChunkingConfig,
    pub rag: RagConfig,
    pub backend: BackendConfig,
    pub embedding: EmbeddingConfig,
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load from `CLINREPORT_CONFIG` (if set), apply environment overrides,
    /// then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `from_env` over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_FILE_VAR) {
            Some(path) => Self::from_json_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("CLINREPORT_OLLAMA_URL") {
            self.backend.base_url = v;
        }
        if let Some(v) = lookup("CLINREPORT_MODEL") {
            self.rag.generation.model = v;
        }
        if let Some(v) = lookup("CLINREPORT_GENERATION") {
            self.backend.enabled = parse_bool("CLINREPORT_GENERATION", &v)?;
        }
        if let Some(v) = lookup("CLINREPORT_TIMEOUT_SECS") {
            self.rag.generation.timeout_secs = parse_num("CLINREPORT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("CLINREPORT_TEMPERATURE") {
            self.rag.generation.temperature = parse_num("CLINREPORT_TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("CLINREPORT_CHUNK_SIZE") {
            self.chunking.max_size = parse_num("CLINREPORT_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = lookup("CLINREPORT_CHUNK_OVERLAP") {
            self.chunking.overlap = parse_num("CLINREPORT_CHUNK_OVERLAP", &v)?;
        }
        if let Some(v) = lookup("CLINREPORT_TOP_K") {
            self.rag.retrieval.top_k = parse_num("CLINREPORT_TOP_K", &v)?;
        }
        if let Some(v) = lookup("CLINREPORT_MIN_SCORE") {
            self.rag.retrieval.min_score = Some(parse_num("CLINREPORT_MIN_SCORE", &v)?);
        }
        if let Some(v) = lookup("CLINREPORT_MAP_SCOPE") {
            self.redaction.scope = match v.trim().to_ascii_lowercase().as_str() {
                "document" => MapScope::Document,
                "session" => MapScope::Session,
                _ => return Err(invalid("CLINREPORT_MAP_SCOPE", "expected 'document' or 'session'")),
            };
        }
        if let Some(v) = lookup("CLINREPORT_DEGRADED_MODE") {
            self.detection.degraded_mode = match v.trim().to_ascii_lowercase().as_str() {
                "fail_closed" => DegradedMode::FailClosed,
                "pattern_only" => DegradedMode::PatternOnly,
                _ => return Err(invalid("CLINREPORT_DEGRADED_MODE", "expected 'fail_closed' or 'pattern_only'")),
            };
        }
        if let Some(v) = lookup("CLINREPORT_EMBEDDING") {
            self.embedding.provider = match v.trim().to_ascii_lowercase().as_str() {
                "hashing" => EmbeddingProvider::Hashing,
                "ollama" => EmbeddingProvider::Ollama,
                _ => return Err(invalid("CLINREPORT_EMBEDDING", "expected 'hashing' or 'ollama'")),
            };
        }
        if let Some(v) = lookup("CLINREPORT_PLACEHOLDER") {
            self.redaction.placeholder_format = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.redaction
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        TextChunker::new(self.chunking.max_size, self.chunking.overlap)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.rag
            .generation
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let retrieval = &self.rag.retrieval;
        if retrieval.top_k == 0 || retrieval.top_k > retrieval.max_top_k {
            return Err(ConfigError::Invalid(format!(
                "retrieval.top_k must be between 1 and {}",
                retrieval.max_top_k
            )));
        }
        if !(0.0..=1.0).contains(&retrieval.dedup_overlap_ratio) {
            return Err(ConfigError::Invalid("retrieval.dedup_overlap_ratio must be within [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.detection.score_threshold) {
            return Err(ConfigError::Invalid("detection.score_threshold must be within [0, 1]".into()));
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::Invalid("embedding.dimension must be positive".into()));
        }
        if self.rag.context_budget_chars == 0 {
            return Err(ConfigError::Invalid("rag.context_budget_chars must be positive".into()));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, &format!("'{}' is not a number of the expected kind", value.trim())))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, "expected a boolean")),
    }
}
