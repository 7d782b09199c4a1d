use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{cosine_similarity, rank, EmbeddingRecord, RetrievedRecord, ScoredRecord, VectorIndex};
use crate::errors::SearchError;

/// In-memory vector index using brute-force cosine similarity.
/// Suitable for seeds, tests and small catalogues.
pub struct InMemoryVectorIndex {
    dimension: usize,
    records: RwLock<Vec<EmbeddingRecord>>,
}

impl InMemoryVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            records: RwLock::new(Vec::new()),
        }
    }

    fn check_dimension(&self, actual: usize) -> Result<(), SearchError> {
        if actual != self.dimension {
            return Err(SearchError::DimensionMismatch {
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredRecord>, SearchError> {
        self.check_dimension(vector.len())?;

        let records = self.records.read().await;
        let scored: Vec<ScoredRecord> = records
            .iter()
            .filter_map(|r| {
                let score = cosine_similarity(vector, &r.vector);
                (score >= threshold).then(|| ScoredRecord {
                    record: r.to_retrieved(),
                    score,
                })
            })
            .collect();

        Ok(rank(scored, limit))
    }

    async fn sample(&self, limit: usize) -> Result<Vec<RetrievedRecord>, SearchError> {
        let records = self.records.read().await;
        Ok(records.iter().take(limit).map(EmbeddingRecord::to_retrieved).collect())
    }

    async fn insert(&self, record: EmbeddingRecord) -> Result<(), SearchError> {
        self.check_dimension(record.vector.len())?;
        self.records.write().await.push(record);
        Ok(())
    }

    async fn count(&self) -> Result<usize, SearchError> {
        Ok(self.records.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn record(title: &str, vector: Vec<f32>) -> EmbeddingRecord {
        let mut metadata = Map::new();
        metadata.insert("title".to_string(), json!(title));
        EmbeddingRecord::new(format!("Title: {}", title), metadata, vector)
    }

    async fn seeded() -> InMemoryVectorIndex {
        let index = InMemoryVectorIndex::new(3);
        index.insert(record("Minimalist Chic", vec![1.0, 0.0, 0.0])).await.unwrap();
        index.insert(record("Y2K Revival", vec![0.0, 1.0, 0.0])).await.unwrap();
        index.insert(record("Cottagecore", vec![0.8, 0.6, 0.0])).await.unwrap();
        index
    }

    #[tokio::test]
    async fn test_identical_vector_ranks_first() {
        let index = seeded().await;
        let hits = index.search(&[1.0, 0.0, 0.0], 5, 0.0).await.unwrap();
        assert_eq!(hits[0].record.field("title"), Some("Minimalist Chic"));
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_threshold_filters() {
        let index = seeded().await;
        let hits = index.search(&[1.0, 0.0, 0.0], 5, 0.7).await.unwrap();
        let titles: Vec<_> = hits.iter().filter_map(|h| h.record.field("title")).collect();
        assert_eq!(titles, vec!["Minimalist Chic", "Cottagecore"]);
    }

    #[tokio::test]
    async fn test_limit_caps_results() {
        let index = seeded().await;
        assert_eq!(index.search(&[1.0, 1.0, 0.0], 1, -1.0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_result_is_ok() {
        let index = seeded().await;
        assert!(index.search(&[0.0, 0.0, 1.0], 5, 0.5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dimension_enforced() {
        let index = seeded().await;
        assert_eq!(
            index.insert(record("Wrong", vec![1.0])).await,
            Err(SearchError::DimensionMismatch { expected: 3, actual: 1 })
        );
        assert!(index.search(&[1.0, 0.0], 5, 0.0).await.is_err());
        assert_eq!(index.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_sample_respects_limit() {
        let index = seeded().await;
        assert_eq!(index.sample(2).await.unwrap().len(), 2);
        assert_eq!(index.sample(10).await.unwrap().len(), 3);
    }
}
