//! Generation stage
//!
//! Backends implement [`TextGenerator`] and report typed errors. The
//! [`Generator`] stage wraps a backend with its own deadline and turns every
//! failure into the configured fallback text, so generation never fails a
//! pipeline run.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{GenerationBackend, GenerationConfig, DEFAULT_FALLBACK_MESSAGE};
use crate::errors::{AtelierError, GenerationError};
use crate::telemetry::{TelemetryCollector, TelemetryEvent};

/// External text-generation service
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Backend label for logs
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, GenerationError>;
}

fn transport_error(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout { duration_ms: 0 }
    } else {
        GenerationError::Unreachable(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GenerationError::Http {
        status: status.as_u16(),
        body,
    })
}

fn non_empty(text: String) -> Result<String, GenerationError> {
    if text.trim().is_empty() {
        Err(GenerationError::Malformed("completion is empty".to_string()))
    } else {
        Ok(text)
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions backend
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    system_prompt: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiChat {
    pub fn new(config: &GenerationConfig) -> Result<Self, AtelierError> {
        let client = Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            base_url: config.base_url().trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiChat {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = check_status(request.send().await.map_err(transport_error)?).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| GenerationError::Malformed("response has no choices".to_string()))?;

        non_empty(text)
    }
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Local Ollama `/api/generate` backend (non-streaming)
#[derive(Debug, Clone)]
pub struct OllamaGenerator {
    client: Client,
    base_url: String,
    model: String,
    system_prompt: String,
    temperature: f32,
    max_tokens: u32,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self, AtelierError> {
        let client = Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            base_url: config.base_url().trim_end_matches('/').to_string(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl TextGenerator for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = OllamaGenerateRequest {
            model: &self.model,
            prompt,
            system: &self.system_prompt,
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        };

        let response = check_status(
            self.client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(transport_error)?,
        )
        .await?;

        let parsed: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;

        non_empty(parsed.response)
    }
}

/// Construct the configured backend
pub fn build_generator(config: &GenerationConfig) -> Result<Arc<dyn TextGenerator>, AtelierError> {
    let backend: Arc<dyn TextGenerator> = match config.backend {
        GenerationBackend::OpenAi => Arc::new(OpenAiChat::new(config)?),
        GenerationBackend::Ollama => Arc::new(OllamaGenerator::new(config)?),
    };
    Ok(backend)
}

/// Outcome of the generation stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// False when `text` is the fallback message
    pub generated: bool,
}

/// Generation stage with deadline and fallback
#[derive(Clone)]
pub struct Generator {
    backend: Arc<dyn TextGenerator>,
    timeout: Duration,
    fallback_message: String,
    telemetry: TelemetryCollector,
}

impl Generator {
    pub fn new(backend: Arc<dyn TextGenerator>, timeout: Duration, telemetry: TelemetryCollector) -> Self {
        Self {
            backend,
            timeout,
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            telemetry,
        }
    }

    pub fn with_fallback_message(mut self, message: impl Into<String>) -> Self {
        self.fallback_message = message.into();
        self
    }

    /// Completion text, or the fallback message on any failure
    pub async fn generate(&self, prompt: &str) -> String {
        self.complete(prompt).await.text
    }

    /// Like `generate`, but says whether the fallback was used
    pub async fn complete(&self, prompt: &str) -> Completion {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.backend.complete(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout {
                duration_ms: self.timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(text) => {
                debug!(
                    backend = self.backend.name(),
                    chars = text.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Generation complete"
                );
                Completion {
                    text,
                    generated: true,
                }
            }
            Err(err) => {
                warn!(backend = self.backend.name(), error = %err, "Generation failed, using fallback");
                self.telemetry.record(TelemetryEvent::GenerationFallback {
                    reason: err.to_string(),
                    timestamp: Instant::now(),
                });
                Completion {
                    text: self.fallback_message.clone(),
                    generated: false,
                }
            }
        }
    }

    pub fn fallback_message(&self) -> &str {
        &self.fallback_message
    }
}
