use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::types::GenerationPrompt;
use super::GenerationError;

/// Generation backend contract. Implementations only ever receive scrubbed
/// text.
pub trait GenerationBackend: Send + Sync {
    fn is_available(&self) -> bool;
    fn list_models(&self) -> Result<Vec<String>, GenerationError>;
    fn generate(&self, prompt: &GenerationPrompt, config: &GenerationConfig) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "llama3.1:8b".to_string(),
            temperature: 0.3,
            max_tokens: 2000,
            timeout_secs: 300,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.model.trim().is_empty() {
            return Err(GenerationError::InvalidConfig("model must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(GenerationError::InvalidConfig(format!(
                "temperature must be within [0, 1], got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(GenerationError::InvalidConfig("max_tokens must be positive".into()));
        }
        if self.timeout_secs == 0 {
            return Err(GenerationError::InvalidConfig("timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Pick the configured model if installed (exact or tagged variant of the
/// same name), else the first installed model.
pub fn resolve_model(configured: &str, installed: &[String]) -> Option<String> {
    let tagged = format!("{configured}:");
    if installed.iter().any(|m| m == configured || m.starts_with(&tagged)) {
        return Some(configured.to_string());
    }
    let fallback = installed.first().cloned();
    if let Some(ref model) = fallback {
        tracing::warn!(
            configured = configured,
            fallback = %model,
            "Configured model not installed, using first installed model"
        );
    }
    fallback
}

// ═══════════════════════════════════════════════════════════
// Ollama
// ═══════════════════════════════════════════════════════════

/// Timeout for the `/api/tags` availability check.
const AVAILABILITY_TIMEOUT_SECS: u64 = 5;

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

/// Local Ollama instance over HTTP (`/api/tags`, `/api/chat`).
pub struct OllamaBackend {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl OllamaBackend {
    pub fn new(base_url: &str) -> Result<Self, GenerationError> {
        // Per-request timeouts are set on each call.
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| GenerationError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, e: reqwest::Error, timeout_secs: u64) -> GenerationError {
        if e.is_timeout() {
            GenerationError::Timeout(timeout_secs)
        } else if e.is_connect() {
            GenerationError::Connection(self.base_url.clone())
        } else {
            GenerationError::Model(e.to_string())
        }
    }

    fn fetch_tags(&self, timeout_secs: u64) -> Result<Vec<String>, GenerationError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .map_err(|e| self.map_send_error(e, timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Model(format!("Ollama returned status {}", status.as_u16())));
        }

        let parsed: TagsResponse = response
            .json()
            .map_err(|e| GenerationError::Model(format!("Response parsing: {e}")))?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }
}

impl GenerationBackend for OllamaBackend {
    fn is_available(&self) -> bool {
        match self.fetch_tags(AVAILABILITY_TIMEOUT_SECS) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Ollama availability check failed");
                false
            }
        }
    }

    fn list_models(&self) -> Result<Vec<String>, GenerationError> {
        self.fetch_tags(AVAILABILITY_TIMEOUT_SECS)
    }

    fn generate(&self, prompt: &GenerationPrompt, config: &GenerationConfig) -> Result<String, GenerationError> {
        config.validate()?;
        let installed = self.list_models()?;
        let model = resolve_model(&config.model, &installed)
            .ok_or_else(|| GenerationError::Model("no model installed".into()))?;

        let user = prompt.user_message();
        let body = ChatRequest {
            model: &model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system_instructions,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            stream: false,
            options: ChatOptions {
                temperature: config.temperature,
                num_predict: config.max_tokens,
            },
        };

        let url = format!("{}/api/chat", self.base_url);
        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(config.timeout_secs))
            .json(&body)
            .send()
            .map_err(|e| self.map_send_error(e, config.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Model(format!("Ollama returned status {}", status.as_u16())));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| GenerationError::Model(format!("Response parsing: {e}")))?;

        tracing::info!(
            model = %model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            output_chars = parsed.message.content.chars().count(),
            "Ollama generation complete"
        );
        Ok(parsed.message.content)
    }
}

// ═══════════════════════════════════════════════════════════
// Availability cache
// ═══════════════════════════════════════════════════════════

/// Caches backend availability for a short TTL. Invalidated after any
/// backend failure so the next request re-checks.
pub struct AvailabilityCache {
    ttl: Duration,
    cache: Mutex<Option<(bool, Instant)>>,
}

impl AvailabilityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(None),
        }
    }

    pub fn is_available(&self, backend: &dyn GenerationBackend) -> bool {
        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((available, checked_at)) = *cache {
                if checked_at.elapsed() < self.ttl {
                    return available;
                }
            }
        }

        let available = backend.is_available();
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = Some((available, Instant::now()));
        tracing::debug!(available, "Generation backend availability refreshed");
        available
    }

    pub fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Default for AvailabilityCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════
// Mock
// ═══════════════════════════════════════════════════════════

/// Configurable in-process backend for tests and offline runs.
pub struct MockBackend {
    response: String,
    available: bool,
    delay: Option<Duration>,
    failure: Option<GenerationError>,
    availability_checks: Mutex<usize>,
    last_prompt: Mutex<Option<GenerationPrompt>>,
}

impl MockBackend {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            available: true,
            delay: None,
            failure: None,
            availability_checks: Mutex::new(0),
            last_prompt: Mutex::new(None),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self, error: GenerationError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn availability_checks(&self) -> usize {
        *self.availability_checks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The most recent prompt passed to `generate`.
    pub fn last_prompt(&self) -> Option<GenerationPrompt> {
        self.last_prompt.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl GenerationBackend for MockBackend {
    fn is_available(&self) -> bool {
        *self.availability_checks.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        self.available
    }

    fn list_models(&self) -> Result<Vec<String>, GenerationError> {
        Ok(vec![GenerationConfig::default().model])
    }

    fn generate(&self, prompt: &GenerationPrompt, config: &GenerationConfig) -> Result<String, GenerationError> {
        config.validate()?;
        *self.last_prompt.lock().unwrap_or_else(PoisonError::into_inner) = Some(prompt.clone());
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(self.response.clone()),
        }
    }
}
