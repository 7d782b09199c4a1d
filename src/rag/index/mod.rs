//! Embedding records and vector indexes
//!
//! An index holds embedding records of one fixed dimension. It is
//! read-heavy and append-only from the pipeline's point of view; ingestion
//! is the only writer.

pub mod memory;
pub mod postgrest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::{VectorBackend, VectorStoreConfig};
use crate::errors::{AtelierError, SearchError};

pub use memory::InMemoryVectorIndex;
pub use postgrest::PostgrestIndex;

/// Index for the configured backend; the in-memory one starts empty
pub fn build_index(config: &VectorStoreConfig, dimension: usize) -> Result<Arc<dyn VectorIndex>, AtelierError> {
    let index: Arc<dyn VectorIndex> = match config.backend {
        VectorBackend::Memory => Arc::new(InMemoryVectorIndex::new(dimension)),
        VectorBackend::Postgrest => Arc::new(PostgrestIndex::new(config, dimension)?),
    };
    Ok(index)
}

/// One embedded domain record, immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    /// Text that was embedded
    pub content: String,
    /// Structured attributes (title, category, season, ...)
    pub metadata: Map<String, Value>,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    pub fn new(content: impl Into<String>, metadata: Map<String, Value>, vector: Vec<f32>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            metadata,
            vector,
            created_at: Utc::now(),
        }
    }

    /// The record without its vector
    pub fn to_retrieved(&self) -> RetrievedRecord {
        RetrievedRecord {
            id: self.id.clone(),
            content: self.content.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// A record as returned by an index; remote indexes do not return vectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedRecord {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RetrievedRecord {
    /// String metadata field, if present
    pub fn field(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// A record ranked by similarity to a query vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: RetrievedRecord,
    pub score: f32,
}

/// Similarity search over embedding records
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Vector length every record and query must have
    fn dimension(&self) -> usize;

    /// Records with cosine similarity >= `threshold`, best first, at most `limit`
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredRecord>, SearchError>;

    /// Up to `limit` records in no particular order
    async fn sample(&self, limit: usize) -> Result<Vec<RetrievedRecord>, SearchError>;

    async fn insert(&self, record: EmbeddingRecord) -> Result<(), SearchError>;

    async fn count(&self) -> Result<usize, SearchError>;
}

/// Cosine similarity in [-1, 1]; 0 when either vector has zero norm or the
/// lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    // Accumulate in f64 so identical vectors score exactly 1.0 after rounding
    let (dot, na, nb) = a.iter().zip(b.iter()).fold((0.0f64, 0.0f64, 0.0f64), |(d, x2, y2), (x, y)| {
        let (x, y) = (*x as f64, *y as f64);
        (d + x * y, x2 + x * x, y2 + y * y)
    });
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        ((dot / (na.sqrt() * nb.sqrt())) as f32).clamp(-1.0, 1.0)
    }
}

/// Sort best-first and cap at `limit`
pub(crate) fn rank(mut scored: Vec<ScoredRecord>, limit: usize) -> Vec<ScoredRecord> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use serde_json::json;

    fn to_vector(raw: &[i16]) -> Vec<f32> {
        raw.iter().map(|x| *x as f32).collect()
    }

    #[test]
    fn test_build_index_per_backend() {
        let index = build_index(&VectorStoreConfig::default(), 3).unwrap();
        assert_eq!(index.dimension(), 3);

        let remote = VectorStoreConfig {
            backend: VectorBackend::Postgrest,
            ..VectorStoreConfig::default()
        };
        assert!(matches!(build_index(&remote, 3), Err(AtelierError::Config(_))));
    }

    #[test]
    fn test_cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.1, 0.7, 0.3], &[0.1, 0.7, 0.3]), 1.0);
    }

    #[test]
    fn test_rank_orders_and_truncates() {
        let record = |id: &str| RetrievedRecord {
            id: id.to_string(),
            content: String::new(),
            metadata: Map::new(),
        };
        let ranked = rank(
            vec![
                ScoredRecord { record: record("a"), score: 0.2 },
                ScoredRecord { record: record("b"), score: 0.9 },
                ScoredRecord { record: record("c"), score: 0.5 },
            ],
            2,
        );
        let ids: Vec<&str> = ranked.iter().map(|s| s.record.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_field_reads_strings_only() {
        let mut metadata = Map::new();
        metadata.insert("title".to_string(), json!("Minimalist Chic"));
        metadata.insert("year".to_string(), json!(2025));
        let record = EmbeddingRecord::new("content", metadata, vec![1.0]).to_retrieved();
        assert_eq!(record.field("title"), Some("Minimalist Chic"));
        assert_eq!(record.field("year"), None);
        assert_eq!(record.field("season"), None);
    }

    #[quickcheck]
    fn prop_cosine_is_symmetric(a: Vec<i16>, b: Vec<i16>) -> bool {
        let n = a.len().min(b.len());
        let (a, b) = (to_vector(&a[..n]), to_vector(&b[..n]));
        (cosine_similarity(&a, &b) - cosine_similarity(&b, &a)).abs() < 1e-6
    }

    #[quickcheck]
    fn prop_cosine_is_bounded(a: Vec<i16>, b: Vec<i16>) -> bool {
        let n = a.len().min(b.len());
        let s = cosine_similarity(&to_vector(&a[..n]), &to_vector(&b[..n]));
        (-1.0..=1.0).contains(&s)
    }

    #[quickcheck]
    fn prop_self_similarity_is_one(a: Vec<i16>) -> bool {
        let v = to_vector(&a);
        if v.iter().all(|x| *x == 0.0) {
            return true;
        }
        cosine_similarity(&v, &v) == 1.0
    }
}
