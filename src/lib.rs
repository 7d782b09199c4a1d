//! atelier - background task execution and trend-aware recommendations
//!
//! # Architecture
//!
//! - **tasks**: job queue, result store with TTL, worker pool, typed registry
//! - **rag**: retrieve -> augment -> generate recommendation pipeline
//! - **telemetry**: tracing setup and in-process event counters
//! - **config** / **cli**: TOML configuration and argument parsing

pub mod cli;
pub mod config;
pub mod errors;
pub mod rag;
pub mod tasks;
pub mod telemetry;

// Re-export commonly used types
pub use errors::{AtelierError, Result};
