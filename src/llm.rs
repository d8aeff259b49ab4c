//! Generative model client
//!
//! [`GenerativeModel`] is the seam between the analyzer and a hosted model.
//! [`GeminiClient`] talks to the Gemini `generateContent` endpoint; wrappers
//! add retry with exponential backoff ([`Retrying`]) and ordered failover
//! between models ([`FallbackChain`]).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MODELS: &str = "gemini-flash-latest,gemini-flash-lite-latest";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Errors from a model call
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limited by {model}: {message}")]
    RateLimited { model: String, message: String },

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Model returned no content: {0}")]
    EmptyResponse(String),

    #[error("Not supported by {0}")]
    Unsupported(String),

    #[error("Invalid JSON in model response: {0}")]
    InvalidJson(String),

    #[error("Missing API key (set GOOGLE_API_KEY)")]
    MissingApiKey,
}

impl LlmError {
    /// Transient errors worth retrying against the same model
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. } | LlmError::Server { .. })
    }

    /// Errors after which the next model in a chain may still succeed
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            LlmError::ModelNotFound(_)
                | LlmError::RateLimited { .. }
                | LlmError::Server { .. }
                | LlmError::EmptyResponse(_)
        )
    }
}

/// A model that answers a prompt with JSON text
pub trait GenerativeModel: Send + Sync {
    /// Model identifier, e.g. "gemini-flash-latest"
    fn name(&self) -> &str;

    /// Send a text prompt
    fn generate(&self, prompt: &str) -> Result<String, LlmError>;

    /// Send a prompt together with a PDF document
    fn generate_with_pdf(&self, prompt: &str, pdf: &[u8]) -> Result<String, LlmError> {
        let _ = (prompt, pdf);
        Err(LlmError::Unsupported(format!(
            "{} (inline documents)",
            self.name()
        )))
    }
}

impl<M: GenerativeModel + ?Sized> GenerativeModel for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        (**self).generate(prompt)
    }

    fn generate_with_pdf(&self, prompt: &str, pdf: &[u8]) -> Result<String, LlmError> {
        (**self).generate_with_pdf(prompt, pdf)
    }
}

/// Model access settings
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    /// Models to try, in order
    pub models: Vec<String>,
    pub api_base: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl LlmConfig {
    /// Read `GOOGLE_API_KEY`, `OPTICLOAN_MODELS`, `OPTICLOAN_API_BASE` and `OPTICLOAN_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, LlmError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, LlmError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("GOOGLE_API_KEY")
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or(LlmError::MissingApiKey)?;

        let models: Vec<String> = lookup("OPTICLOAN_MODELS")
            .unwrap_or_else(|| DEFAULT_MODELS.to_string())
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        let models = if models.is_empty() {
            DEFAULT_MODELS.split(',').map(String::from).collect()
        } else {
            models
        };

        let api_base = lookup("OPTICLOAN_API_BASE")
            .map(|b| b.trim().trim_end_matches('/').to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let timeout_secs = match lookup("OPTICLOAN_TIMEOUT_SECS") {
            Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                log::warn!(
                    "Ignoring invalid OPTICLOAN_TIMEOUT_SECS '{}', using {}",
                    raw,
                    DEFAULT_TIMEOUT_SECS
                );
                DEFAULT_TIMEOUT_SECS
            }),
            None => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self {
            api_key,
            models,
            api_base,
            timeout: Duration::from_secs(timeout_secs),
            retry: RetryPolicy::default(),
        })
    }

    /// One retrying client per configured model, chained in order
    pub fn build_chain(&self) -> Result<FallbackChain, LlmError> {
        let mut models: Vec<Box<dyn GenerativeModel>> = Vec::with_capacity(self.models.len());
        for name in &self.models {
            let client = GeminiClient::new(&self.api_key, name, &self.api_base, self.timeout)?;
            models.push(Box::new(Retrying::new(client, self.retry.clone())));
        }
        FallbackChain::new(models)
    }
}

/// Client for the Gemini `generateContent` endpoint
pub struct GeminiClient {
    http: reqwest::blocking::Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl GeminiClient {
    pub fn new(
        api_key: &str,
        model: &str,
        api_base: &str,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Http(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.api_base, self.model
        )
    }

    fn send(&self, body: &Value) -> Result<String, LlmError> {
        log::debug!("POST {}", self.endpoint());

        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Server {
                        status: 504,
                        message: format!("request to {} timed out", self.model),
                    }
                } else if e.is_connect() {
                    LlmError::Http(format!("unable to reach {}: {}", self.api_base, e))
                } else {
                    LlmError::Http(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .map_err(|e| LlmError::Http(format!("failed to read response body: {}", e)))?;

        if !(200..300).contains(&status) {
            return Err(classify_status(status, &self.model, &text));
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::InvalidJson(format!("response envelope: {}", e)))?;
        extract_text(&body)
    }
}

impl GenerativeModel for GeminiClient {
    fn name(&self) -> &str {
        &self.model
    }

    fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.send(&request_body(prompt, None))
    }

    fn generate_with_pdf(&self, prompt: &str, pdf: &[u8]) -> Result<String, LlmError> {
        self.send(&request_body(prompt, Some(pdf)))
    }
}

/// Build a `generateContent` request asking for a JSON response
pub fn request_body(prompt: &str, pdf: Option<&[u8]>) -> Value {
    let mut parts = Vec::with_capacity(2);
    if let Some(pdf) = pdf {
        parts.push(json!({
            "inline_data": {
                "mime_type": "application/pdf",
                "data": BASE64.encode(pdf),
            }
        }));
    }
    parts.push(json!({ "text": prompt }));

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "temperature": 0.1,
        }
    })
}

/// Map a non-success HTTP status to an error
pub fn classify_status(status: u16, model: &str, body: &str) -> LlmError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| body.chars().take(300).collect());

    match status {
        429 => LlmError::RateLimited {
            model: model.to_string(),
            message,
        },
        401 | 403 => LlmError::Auth(message),
        404 => LlmError::ModelNotFound(format!("{}: {}", model, message)),
        500..=599 => LlmError::Server { status, message },
        _ => LlmError::Http(format!("status {}: {}", status, message)),
    }
}

/// Concatenate the text parts of the first candidate
pub fn extract_text(body: &Value) -> Result<String, LlmError> {
    if let Some(reason) = body
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(LlmError::EmptyResponse(format!("prompt blocked: {}", reason)));
    }

    let candidate = body
        .pointer("/candidates/0")
        .ok_or_else(|| LlmError::EmptyResponse("no candidates".to_string()))?;

    let text: String = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        let reason = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .unwrap_or("no text parts");
        return Err(LlmError::EmptyResponse(reason.to_string()));
    }
    Ok(text)
}

/// Exponential backoff for transient errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(self.multiplier.saturating_pow(attempt))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Result<T, LlmError>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{} failed ({}), retrying in {:?} (attempt {}/{})",
                        label,
                        e,
                        delay,
                        attempt + 1,
                        attempts
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A model whose calls are retried under a [`RetryPolicy`]
pub struct Retrying<M> {
    inner: M,
    policy: RetryPolicy,
}

impl<M: GenerativeModel> Retrying<M> {
    pub fn new(inner: M, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<M: GenerativeModel> GenerativeModel for Retrying<M> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.policy
            .run(self.inner.name(), || self.inner.generate(prompt))
    }

    fn generate_with_pdf(&self, prompt: &str, pdf: &[u8]) -> Result<String, LlmError> {
        self.policy
            .run(self.inner.name(), || self.inner.generate_with_pdf(prompt, pdf))
    }
}

/// Ordered failover across models
pub struct FallbackChain {
    models: Vec<Box<dyn GenerativeModel>>,
    last: AtomicUsize,
}

impl FallbackChain {
    pub fn new(models: Vec<Box<dyn GenerativeModel>>) -> Result<Self, LlmError> {
        if models.is_empty() {
            return Err(LlmError::ModelNotFound("no models configured".to_string()));
        }
        Ok(Self {
            models,
            last: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    fn call<F>(&self, mut op: F) -> Result<String, LlmError>
    where
        F: FnMut(&dyn GenerativeModel) -> Result<String, LlmError>,
    {
        let mut last_error = None;
        for (idx, model) in self.models.iter().enumerate() {
            match op(model.as_ref()) {
                Ok(text) => {
                    self.last.store(idx, Ordering::Relaxed);
                    return Ok(text);
                }
                Err(e) if e.allows_fallback() => {
                    if idx + 1 < self.models.len() {
                        log::warn!("{} failed ({}), falling back", model.name(), e);
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| LlmError::ModelNotFound("no models configured".into())))
    }
}

impl GenerativeModel for FallbackChain {
    /// The model that answered most recently
    fn name(&self) -> &str {
        let idx = self.last.load(Ordering::Relaxed);
        self.models[idx.min(self.models.len() - 1)].name()
    }

    fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.call(|m| m.generate(prompt))
    }

    fn generate_with_pdf(&self, prompt: &str, pdf: &[u8]) -> Result<String, LlmError> {
        self.call(|m| m.generate_with_pdf(prompt, pdf))
    }
}

/// Parse the JSON object in a model response
///
/// Tolerates markdown code fences and prose around the object.
pub fn parse_json_payload(text: &str) -> Result<Value, LlmError> {
    let trimmed = strip_code_fence(text.trim());
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Ok(value);
        }
    }

    let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) else {
        return Err(LlmError::InvalidJson(preview(text)));
    };
    if end < start {
        return Err(LlmError::InvalidJson(preview(text)));
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .map_err(|e| LlmError::InvalidJson(format!("{} in {}", e, preview(text))))
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // drop the language tag line
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

fn preview(text: &str) -> String {
    let snippet: String = text.chars().take(120).collect();
    if text.chars().count() > 120 {
        format!("{}…", snippet)
    } else {
        snippet
    }
}
