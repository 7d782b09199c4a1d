//! Retrieval-augmented recommendation pipeline
//!
//! - Embedding: query text to vector
//! - Index: similarity search over embedded trend records
//! - Retrieval / Context / Generation: the three pipeline stages
//! - Pipeline: end-to-end orchestration
//! - Ingest: building the index from trend documents

pub mod context;
pub mod embedding;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod pipeline;
pub mod retrieval;

pub use context::PromptBuilder;
pub use embedding::{EmbeddingService, OpenAiEmbeddings};
pub use generation::{Generator, TextGenerator};
pub use index::{EmbeddingRecord, InMemoryVectorIndex, PostgrestIndex, VectorIndex};
pub use ingest::{Ingestor, TrendDocument};
pub use pipeline::{RecommendationPipeline, Recommendations, TrendSummary};
pub use retrieval::{RetrievalMode, RetrievalResult, Retriever};
