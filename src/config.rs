//! Configuration file handling
//!
//! Loaded once at startup from `~/.atelier/config.toml` (or `--config`),
//! then secrets are overlaid from the environment. Components receive the
//! relevant section by reference and never read the environment themselves.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::AtelierError;

pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_SUPABASE_URL: &str = "SUPABASE_URL";
pub const ENV_SUPABASE_KEY: &str = "SUPABASE_SERVICE_ROLE_KEY";

/// Fallback text returned when generation fails
pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "Unable to generate recommendations at this time. Please try again later.";

/// Upper bounds accepted by `validate`
pub const MAX_RESULT_TTL_SECS: u64 = 365 * 24 * 3600;
pub const MAX_TIME_LIMIT_SECS: u64 = 24 * 3600;
pub const MAX_RETRIES: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub results: ResultsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Job queue and worker pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub queue_capacity: usize,
    pub workers: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            workers: num_cpus::get(),
        }
    }
}

/// Result store expiry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            sweep_interval_secs: 60,
        }
    }
}

impl ResultsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Task execution limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub time_limit_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            time_limit_secs: 300,
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }
}

/// OpenAI-compatible embeddings endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-ada-002".to_string(),
            dimension: 1536,
            api_key: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    /// Process-local index, seeded from `seed_file`
    #[default]
    Memory,
    /// Supabase / PostgREST table plus similarity RPC
    Postgrest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub backend: VectorBackend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub rpc: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_file: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Memory,
            url: None,
            api_key: None,
            rpc: "match_fashion_trends".to_string(),
            table: "fashion_embeddings".to_string(),
            seed_file: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub limit: usize,
    /// Minimum cosine similarity
    pub threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationBackend {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub backend: GenerationBackend,
    /// Defaults per backend when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub fallback_message: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            backend: GenerationBackend::OpenAi,
            base_url: None,
            model: "gpt-3.5-turbo".to_string(),
            api_key: None,
            system_prompt: "You are an expert fashion stylist.".to_string(),
            temperature: 0.7,
            max_tokens: 500,
            timeout_secs: 60,
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
        }
    }
}

impl GenerationConfig {
    pub fn base_url(&self) -> &str {
        match (&self.base_url, self.backend) {
            (Some(url), _) => url,
            (None, GenerationBackend::OpenAi) => "https://api.openai.com/v1",
            (None, GenerationBackend::Ollama) => "http://127.0.0.1:11434",
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `tracing` filter directive, e.g. `info` or `atelier=debug`
    pub level: String,
    /// Emit JSON lines instead of human-readable logs
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from file, creating default if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            let config = Config::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path; the file must exist
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string).context("Failed to write config file")?;

        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;

        Ok(home.join(".atelier").join("config.toml"))
    }

    /// Overlay secrets from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay secrets from any key lookup
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(key) = non_empty(ENV_OPENAI_API_KEY) {
            self.embedding.api_key = Some(key.clone());
            if self.generation.backend == GenerationBackend::OpenAi {
                self.generation.api_key = Some(key);
            }
        }
        if let Some(url) = non_empty(ENV_SUPABASE_URL) {
            self.vector_store.url = Some(url);
        }
        if let Some(key) = non_empty(ENV_SUPABASE_KEY) {
            self.vector_store.api_key = Some(key);
        }
    }

    /// Reject values no component can run with
    pub fn validate(&self) -> std::result::Result<(), AtelierError> {
        let invalid = |msg: &str| Err(AtelierError::Config(msg.to_string()));

        if self.broker.workers == 0 {
            return invalid("broker.workers must be at least 1");
        }
        if self.broker.queue_capacity == 0 {
            return invalid("broker.queue_capacity must be at least 1");
        }
        if self.results.ttl_secs == 0 {
            return invalid("results.ttl_secs must be positive");
        }
        if self.results.ttl_secs > MAX_RESULT_TTL_SECS {
            return invalid("results.ttl_secs must be at most one year");
        }
        if self.results.sweep_interval_secs == 0 {
            return invalid("results.sweep_interval_secs must be positive");
        }
        if self.worker.time_limit_secs == 0 {
            return invalid("worker.time_limit_secs must be positive");
        }
        if self.worker.time_limit_secs > MAX_TIME_LIMIT_SECS {
            return invalid("worker.time_limit_secs must be at most one day");
        }
        if self.worker.max_retries > MAX_RETRIES {
            return invalid("worker.max_retries must be at most 100");
        }
        if self.embedding.dimension == 0 {
            return invalid("embedding.dimension must be positive");
        }
        if !(-1.0..=1.0).contains(&self.retrieval.threshold) {
            return invalid("retrieval.threshold must be within [-1, 1]");
        }
        if self.retrieval.limit == 0 {
            return invalid("retrieval.limit must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return invalid("generation.temperature must be within [0, 2]");
        }
        if self.vector_store.backend == VectorBackend::Postgrest && self.vector_store.url.is_none() {
            return invalid("vector_store.url (or SUPABASE_URL) is required for the postgrest backend");
        }
        Ok(())
    }

    /// Copy safe to print: every secret replaced with a mask
    pub fn redacted(&self) -> Self {
        let mask = |secret: &Option<String>| secret.as_ref().map(|_| "********".to_string());
        let mut copy = self.clone();
        copy.embedding.api_key = mask(&self.embedding.api_key);
        copy.vector_store.api_key = mask(&self.vector_store.api_key);
        copy.generation.api_key = mask(&self.generation.api_key);
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.results.ttl(), Duration::from_secs(3600));
        assert_eq!(config.worker.time_limit(), Duration::from_secs(300));
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.retrieval.limit, 5);
        assert_eq!(config.generation.max_tokens, 500);
        assert_eq!(config.generation.fallback_message, DEFAULT_FALLBACK_MESSAGE);
        assert!(config.broker.workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.retrieval.threshold = 0.5;
        config.generation.backend = GenerationBackend::Ollama;
        config.vector_store.seed_file = Some(PathBuf::from("trends.json"));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[retrieval]\nlimit = 3\n\n[generation]\nbackend = \"ollama\"\nmodel = \"llama3\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.retrieval.limit, 3);
        assert_eq!(config.retrieval.threshold, 0.7);
        assert_eq!(config.generation.backend, GenerationBackend::Ollama);
        assert_eq!(config.generation.base_url(), "http://127.0.0.1:11434");
        assert_eq!(config.generation.temperature, 0.7);
        assert_eq!(config.results.ttl_secs, 3600);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load_from(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = [
            (ENV_OPENAI_API_KEY, "sk-test"),
            (ENV_SUPABASE_URL, "https://db.example.com"),
            (ENV_SUPABASE_KEY, ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.embedding.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.generation.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.vector_store.url.as_deref(), Some("https://db.example.com"));
        assert!(config.vector_store.api_key.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.broker.workers = 0;
        assert!(matches!(config.validate(), Err(AtelierError::Config(_))));

        let mut config = Config::default();
        config.retrieval.threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.vector_store.backend = VectorBackend::Postgrest;
        assert!(config.validate().is_err());
        config.vector_store.url = Some("https://db.example.com".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_bounds_durations() {
        let mut config = Config::default();
        config.results.ttl_secs = 10_000_000_000_000;
        assert!(matches!(config.validate(), Err(AtelierError::Config(_))));
        config.results.ttl_secs = MAX_RESULT_TTL_SECS;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.worker.time_limit_secs = MAX_TIME_LIMIT_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.worker.max_retries = u32::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let mut config = Config::default();
        config.embedding.api_key = Some("sk-secret".to_string());
        let shown = toml::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("********"));
    }
}
