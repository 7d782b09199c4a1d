//! Retrieval stage: embed the query, then rank records by similarity
//!
//! If the similarity search fails the stage degrades to up to `limit`
//! unranked records. The degradation is never silent: the result carries
//! `RetrievalMode::Fallback`, a warning is logged and telemetry counts it.
//! An embedding failure aborts retrieval, since there is nothing to rank by.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::errors::{EmbeddingError, SearchError};
use crate::rag::embedding::{validate_vector, EmbeddingService};
use crate::rag::index::{RetrievedRecord, VectorIndex};
use crate::telemetry::{TelemetryCollector, TelemetryEvent};

/// How the records in a result were selected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Ranked by cosine similarity, filtered by threshold
    Ranked,
    /// Similarity search failed; records are arbitrary and unscored
    Fallback { reason: String },
}

/// One retrieved record; `score` is `None` in fallback mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub record: RetrievedRecord,
    pub score: Option<f32>,
}

/// Ordered retrieval output, best first when ranked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub mode: RetrievalMode,
    pub hits: Vec<RetrievalHit>,
}

impl RetrievalResult {
    pub fn is_fallback(&self) -> bool {
        matches!(self.mode, RetrievalMode::Fallback { .. })
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &RetrievedRecord> {
        self.hits.iter().map(|hit| &hit.record)
    }
}

/// Retrieval stage
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn EmbeddingService>,
    index: Arc<dyn VectorIndex>,
    telemetry: TelemetryCollector,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        index: Arc<dyn VectorIndex>,
        telemetry: TelemetryCollector,
    ) -> Self {
        Self {
            embedder,
            index,
            telemetry,
        }
    }

    /// Records similar to `query`, at most `limit`, similarity >= `threshold`
    pub async fn retrieve(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<RetrievalResult, EmbeddingError> {
        let vector = self.embedder.embed(query).await?;
        let vector = validate_vector(vector, self.embedder.dimension())?;

        let started = Instant::now();
        match self.index.search(&vector, limit, threshold).await {
            Ok(scored) => {
                debug!(
                    hits = scored.len(),
                    limit,
                    threshold,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Similarity search complete"
                );
                Ok(RetrievalResult {
                    mode: RetrievalMode::Ranked,
                    hits: scored
                        .into_iter()
                        .map(|s| RetrievalHit {
                            record: s.record,
                            score: Some(s.score),
                        })
                        .collect(),
                })
            }
            Err(err) => Ok(self.fallback(limit, err).await),
        }
    }

    async fn fallback(&self, limit: usize, search_error: SearchError) -> RetrievalResult {
        let (hits, reason) = match self.index.sample(limit).await {
            Ok(records) => (records, search_error.to_string()),
            Err(sample_error) => (
                Vec::new(),
                format!("{}; sampling also failed: {}", search_error, sample_error),
            ),
        };

        warn!(
            error = %reason,
            returned = hits.len(),
            "Similarity search failed, returning unranked records"
        );
        self.telemetry.record(TelemetryEvent::RetrievalFallback {
            reason: reason.clone(),
            timestamp: Instant::now(),
        });

        RetrievalResult {
            mode: RetrievalMode::Fallback { reason },
            hits: hits
                .into_iter()
                .take(limit)
                .map(|record| RetrievalHit { record, score: None })
                .collect(),
        }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingService> {
        &self.embedder
    }
}
