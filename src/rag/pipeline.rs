//! End-to-end recommendation pipeline: retrieve -> augment -> generate
//!
//! Stages run strictly in sequence for one query. The pipeline holds no
//! per-query state and is shared freely between concurrent callers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::{Config, RetrievalConfig, VectorBackend};
use crate::errors::{AtelierError, PipelineError};
use crate::rag::context::PromptBuilder;
use crate::rag::embedding::{EmbeddingService, OpenAiEmbeddings};
use crate::rag::generation::{build_generator, Generator};
use crate::rag::index::build_index;
use crate::rag::ingest::{load_documents, Ingestor};
use crate::rag::retrieval::{RetrievalHit, RetrievalMode, Retriever};
use crate::telemetry::TelemetryCollector;

/// Salient fields of one retrieved trend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub title: Option<String>,
    pub category: Option<String>,
    pub season: Option<String>,
    /// Similarity, absent for fallback results
    pub score: Option<f32>,
}

impl From<&RetrievalHit> for TrendSummary {
    fn from(hit: &RetrievalHit) -> Self {
        let field = |key: &str| hit.record.field(key).map(str::to_string);
        Self {
            title: field("title"),
            category: field("category"),
            season: field("season"),
            score: hit.score,
        }
    }
}

/// Pipeline output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    pub query: String,
    pub retrieved: Vec<TrendSummary>,
    pub retrieval_mode: RetrievalMode,
    pub recommendations: String,
    /// False when `recommendations` is the fallback message
    pub generated: bool,
}

/// Recommendation pipeline
pub struct RecommendationPipeline {
    retriever: Retriever,
    prompt_builder: PromptBuilder,
    generator: Generator,
    params: RetrievalConfig,
}

impl RecommendationPipeline {
    /// Create pipeline with default retrieval parameters
    pub fn new(retriever: Retriever, generator: Generator) -> Self {
        Self::with_params(retriever, generator, RetrievalConfig::default())
    }

    /// Create with custom retrieval parameters
    pub fn with_params(retriever: Retriever, generator: Generator, params: RetrievalConfig) -> Self {
        Self {
            retriever,
            prompt_builder: PromptBuilder::new(),
            generator,
            params,
        }
    }

    pub fn with_prompt_builder(mut self, prompt_builder: PromptBuilder) -> Self {
        self.prompt_builder = prompt_builder;
        self
    }

    /// Assemble every stage from configuration
    ///
    /// The in-memory backend is seeded from `vector_store.seed_file` when set.
    pub async fn from_config(config: &Config, telemetry: TelemetryCollector) -> Result<Self, AtelierError> {
        let embedder: Arc<dyn EmbeddingService> = Arc::new(OpenAiEmbeddings::new(&config.embedding)?);

        let index = build_index(&config.vector_store, config.embedding.dimension)?;
        if config.vector_store.backend == VectorBackend::Memory {
            if let Some(seed) = &config.vector_store.seed_file {
                let documents = load_documents(seed)?;
                let report = Ingestor::new(embedder.clone(), index.clone())
                    .ingest(&documents)
                    .await;
                info!(
                    stored = report.stored,
                    failed = report.failed.len(),
                    seed = %seed.display(),
                    "Seeded in-memory vector index"
                );
            }
        }

        let generator = Generator::new(
            build_generator(&config.generation)?,
            config.generation.timeout(),
            telemetry.clone(),
        )
        .with_fallback_message(config.generation.fallback_message.clone());

        Ok(Self::with_params(
            Retriever::new(embedder, index, telemetry),
            generator,
            config.retrieval.clone(),
        ))
    }

    /// Recommendations for `query` using the configured limit and threshold
    pub async fn get_recommendations(&self, query: &str) -> Result<Recommendations, PipelineError> {
        self.get_recommendations_with(query, self.params.limit, self.params.threshold)
            .await
    }

    /// Recommendations with explicit retrieval parameters
    pub async fn get_recommendations_with(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<Recommendations, PipelineError> {
        let started = Instant::now();
        info!(query, limit, threshold, "Processing recommendation query");

        // Step 1: Retrieve
        let retrieved = self.retriever.retrieve(query, limit, threshold).await?;
        if retrieved.is_fallback() {
            warn!(query, returned = retrieved.len(), "Continuing with unranked trends");
        }

        // Step 2: Augment
        let prompt = self.prompt_builder.augment(query, &retrieved);

        // Step 3: Generate
        let completion = self.generator.complete(&prompt).await;

        info!(
            query,
            retrieved = retrieved.len(),
            generated = completion.generated,
            duration_ms = started.elapsed().as_millis() as u64,
            "Recommendation pipeline complete"
        );

        Ok(Recommendations {
            query: query.to_string(),
            retrieved: retrieved.hits.iter().map(TrendSummary::from).collect(),
            retrieval_mode: retrieved.mode,
            recommendations: completion.text,
            generated: completion.generated,
        })
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn params(&self) -> &RetrievalConfig {
        &self.params
    }
}
