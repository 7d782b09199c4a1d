//! Ingestion: trend documents -> embedding records

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::AtelierError;
use crate::rag::embedding::{validate_vector, EmbeddingService};
use crate::rag::index::{EmbeddingRecord, VectorIndex};

/// One fashion trend as scraped or curated
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrendDocument {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub season: String,
    #[serde(default)]
    pub description: String,
    /// Any further attributes, kept in the record metadata
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TrendDocument {
    /// Text that gets embedded for this document
    pub fn content_string(&self) -> String {
        format!(
            "Title: {}\nCategory: {}\nSeason: {}\nDescription: {}",
            self.title, self.category, self.season, self.description
        )
    }

    /// The document as record metadata
    pub fn metadata(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Read a JSON array of trend documents
pub fn load_documents(path: &Path) -> Result<Vec<TrendDocument>, AtelierError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Outcome of one ingestion run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub stored: usize,
    /// (title, error) per document that could not be stored
    pub failed: Vec<(String, String)>,
}

impl IngestReport {
    pub fn total(&self) -> usize {
        self.stored + self.failed.len()
    }
}

/// Embeds documents and writes them to an index
pub struct Ingestor {
    embedder: Arc<dyn EmbeddingService>,
    index: Arc<dyn VectorIndex>,
}

impl Ingestor {
    pub fn new(embedder: Arc<dyn EmbeddingService>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, index }
    }

    /// Store every document; one failure does not stop the rest
    pub async fn ingest(&self, documents: &[TrendDocument]) -> IngestReport {
        let mut report = IngestReport::default();

        for document in documents {
            match self.ingest_one(document).await {
                Ok(()) => {
                    debug!(title = %document.title, "Stored trend embedding");
                    report.stored += 1;
                }
                Err(err) => {
                    warn!(title = %document.title, error = %err, "Failed to store trend embedding");
                    report.failed.push((document.title.clone(), err.to_string()));
                }
            }
        }
        report
    }

    async fn ingest_one(&self, document: &TrendDocument) -> Result<(), AtelierError> {
        let content = document.content_string();
        let vector = self.embedder.embed(&content).await?;
        let vector = validate_vector(vector, self.embedder.dimension())?;
        self.index
            .insert(EmbeddingRecord::new(content, document.metadata(), vector))
            .await?;
        Ok(())
    }
}
