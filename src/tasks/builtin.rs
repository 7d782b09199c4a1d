//! Built-in tasks

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::errors::{PipelineError, RegistryError, TaskError};
use crate::rag::pipeline::{RecommendationPipeline, Recommendations};
use crate::tasks::registry::{Task, TaskContext, TaskRegistry};

pub const HELLO_TASK: &str = "hello_task";
pub const RECOMMEND_TASK: &str = "recommend_task";

/// Greets after a simulated delay; used to verify the worker pool
#[derive(Debug, Clone)]
pub struct HelloTask {
    delay: Duration,
}

impl HelloTask {
    pub fn new() -> Self {
        Self::with_delay(Duration::from_secs(2))
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for HelloTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Task for HelloTask {
    type Args = (String,);
    type Output = String;

    fn name(&self) -> &'static str {
        HELLO_TASK
    }

    async fn run(&self, ctx: TaskContext, (name,): (String,)) -> Result<String, TaskError> {
        info!(task_id = %ctx.task_id, name = %name, "Hello, {}!", name);
        tokio::time::sleep(self.delay).await;
        Ok(format!(
            "Hello, {}! Task completed at {}",
            name,
            Utc::now().to_rfc3339()
        ))
    }
}

/// Runs the recommendation pipeline as a queued task
///
/// Transient embedding failures (network, 429, 5xx) are retried; anything
/// else fails the task.
pub struct RecommendTask {
    pipeline: Arc<RecommendationPipeline>,
}

impl RecommendTask {
    pub fn new(pipeline: Arc<RecommendationPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Task for RecommendTask {
    type Args = (String,);
    type Output = Recommendations;

    fn name(&self) -> &'static str {
        RECOMMEND_TASK
    }

    async fn run(&self, _ctx: TaskContext, (query,): (String,)) -> Result<Recommendations, TaskError> {
        self.pipeline
            .get_recommendations(&query)
            .await
            .map_err(|err| match err {
                PipelineError::Embedding(e) if e.is_transient() => TaskError::transient(e.to_string()),
                PipelineError::Embedding(e) => TaskError::failed("EmbeddingError", e.to_string()),
            })
    }
}

/// Registry with `hello_task`, plus `recommend_task` when a pipeline is given
pub fn default_registry(pipeline: Option<Arc<RecommendationPipeline>>) -> Result<TaskRegistry, RegistryError> {
    let mut registry = TaskRegistry::new();
    registry.register(HelloTask::new())?;
    if let Some(pipeline) = pipeline {
        registry.register(RecommendTask::new(pipeline))?;
    }
    Ok(registry)
}
