//! Supabase / PostgREST vector index
//!
//! Similarity search goes through a SQL function exposed as an RPC
//! (`match_fashion_trends` by default) which receives the query embedding, a
//! distance threshold (`1 - similarity`) and a row cap. Sampling and inserts
//! go straight to the embeddings table.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use super::{rank, EmbeddingRecord, RetrievedRecord, ScoredRecord, VectorIndex};
use crate::config::VectorStoreConfig;
use crate::errors::{AtelierError, SearchError};

#[derive(Debug, Serialize)]
struct MatchRequest<'a> {
    query_embedding: &'a [f32],
    match_threshold: f32,
    match_count: usize,
}

#[derive(Debug, Deserialize)]
struct Row {
    id: Value,
    #[serde(default)]
    content: String,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
    #[serde(default)]
    similarity: Option<f32>,
}

impl Row {
    fn into_record(self) -> RetrievedRecord {
        let id = match self.id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        RetrievedRecord {
            id,
            content: self.content,
            metadata: self.metadata.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct InsertRow<'a> {
    content: &'a str,
    metadata: &'a Map<String, Value>,
    embedding: &'a [f32],
}

/// Remote index backed by a PostgREST endpoint
#[derive(Debug, Clone)]
pub struct PostgrestIndex {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rpc: String,
    table: String,
    dimension: usize,
}

impl PostgrestIndex {
    pub fn new(config: &VectorStoreConfig, dimension: usize) -> Result<Self, AtelierError> {
        let base_url = config
            .url
            .as_deref()
            .ok_or_else(|| AtelierError::Config("vector_store.url is not set".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            rpc: config.rpc.clone(),
            table: config.table.clone(),
            dimension,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SearchError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| SearchError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
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
impl VectorIndex for PostgrestIndex {
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

        let url = format!("{}/rest/v1/rpc/{}", self.base_url, self.rpc);
        let request = self.client.post(&url).json(&MatchRequest {
            query_embedding: vector,
            match_threshold: 1.0 - threshold,
            match_count: limit,
        });

        let rows: Vec<Row> = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| SearchError::Malformed(e.to_string()))?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let score = row.similarity.ok_or_else(|| {
                SearchError::Malformed("match row is missing `similarity`".to_string())
            })?;
            if score >= threshold {
                scored.push(ScoredRecord {
                    record: row.into_record(),
                    score,
                });
            }
        }

        Ok(rank(scored, limit))
    }

    async fn sample(&self, limit: usize) -> Result<Vec<RetrievedRecord>, SearchError> {
        let url = format!("{}/rest/v1/{}", self.base_url, self.table);
        let request = self.client.get(&url).query(&[
            ("select", "id,content,metadata".to_string()),
            ("limit", limit.to_string()),
        ]);

        let rows: Vec<Row> = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| SearchError::Malformed(e.to_string()))?;

        Ok(rows.into_iter().take(limit).map(Row::into_record).collect())
    }

    async fn insert(&self, record: EmbeddingRecord) -> Result<(), SearchError> {
        self.check_dimension(record.vector.len())?;

        let url = format!("{}/rest/v1/{}", self.base_url, self.table);
        let request = self
            .client
            .post(&url)
            .header("Prefer", "return=minimal")
            .json(&InsertRow {
                content: &record.content,
                metadata: &record.metadata,
                embedding: &record.vector,
            });

        self.send(request).await?;
        Ok(())
    }

    async fn count(&self) -> Result<usize, SearchError> {
        let url = format!("{}/rest/v1/{}", self.base_url, self.table);
        let request = self
            .client
            .get(&url)
            .header("Prefer", "count=exact")
            .header("Range", "0-0")
            .query(&[("select", "id")]);

        let response = self.send(request).await?;
        let range = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| SearchError::Malformed("missing Content-Range header".to_string()))?;

        parse_content_range_total(range)
            .ok_or_else(|| SearchError::Malformed(format!("unparseable Content-Range {:?}", range)))
    }
}

/// Total from a `Content-Range` value such as `0-0/42` or `*/0`
fn parse_content_range_total(value: &str) -> Option<usize> {
    value.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}
