//! Task runtime coordinator
//!
//! Wires the result store, queue, worker pool and client together from
//! configuration and owns their lifecycles.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{Config, WorkerConfig};
use crate::tasks::client::{TaskClient, SUBMISSION_GRACE};
use crate::tasks::queue::JobQueue;
use crate::tasks::registry::TaskRegistry;
use crate::tasks::retry::RetryPolicy;
use crate::tasks::store::{InMemoryResultStore, ResultStore};
use crate::tasks::worker::{WorkerPool, WorkerSettings};
use crate::telemetry::TelemetryCollector;

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            default_time_limit: config.time_limit(),
            retry: RetryPolicy::with_config(config.max_retries, config.retry_base_delay_ms),
        }
    }
}

/// Running task layer: store + queue + workers
pub struct TaskRuntime {
    client: TaskClient,
    pool: WorkerPool,
    sweeper: JoinHandle<()>,
    telemetry: TelemetryCollector,
}

impl TaskRuntime {
    /// Start every component on the current tokio runtime
    pub fn start(config: &Config, registry: TaskRegistry, telemetry: TelemetryCollector) -> Self {
        let store = Arc::new(InMemoryResultStore::with_ttl(config.results.ttl()));
        let sweeper = store.spawn_sweeper(config.results.sweep_interval());
        let store: Arc<dyn ResultStore> = store;

        let queue = Arc::new(JobQueue::with_capacity(
            Arc::new(registry),
            store,
            config.broker.queue_capacity,
        ));

        let pool = WorkerPool::spawn(
            config.broker.workers,
            Arc::clone(&queue),
            WorkerSettings::from(&config.worker),
            telemetry.clone(),
        );

        info!(
            workers = pool.size(),
            capacity = queue.capacity(),
            tasks = ?queue.registry().task_names(),
            "Task runtime started"
        );

        Self {
            client: TaskClient::with_retention(
                queue,
                config.results.ttl().saturating_add(SUBMISSION_GRACE),
            ),
            pool,
            sweeper,
            telemetry,
        }
    }

    /// Producer-side handle
    pub fn client(&self) -> &TaskClient {
        &self.client
    }

    pub fn telemetry(&self) -> &TelemetryCollector {
        &self.telemetry
    }

    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    /// Close the queue, run everything already queued and stop the sweeper
    ///
    /// Retries whose countdown fires after this are recorded as FAILURE.
    pub async fn shutdown(self) {
        self.client.queue().close();
        self.pool.drain().await;
        self.sweeper.abort();
        info!("Task runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TaskError;
    use crate::tasks::registry::{Task, TaskContext};
    use crate::tasks::types::TaskState;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Shout;

    #[async_trait]
    impl Task for Shout {
        type Args = (String,);
        type Output = String;

        fn name(&self) -> &'static str {
            "shout"
        }

        async fn run(&self, _ctx: TaskContext, (text,): (String,)) -> Result<String, TaskError> {
            Ok(text.to_uppercase())
        }
    }

    fn small_config() -> Config {
        let mut config = Config::default();
        config.broker.workers = 2;
        config.broker.queue_capacity = 8;
        config
    }

    #[test]
    fn test_settings_from_worker_config() {
        let worker = WorkerConfig {
            time_limit_secs: 12,
            max_retries: 5,
            retry_base_delay_ms: 250,
        };
        let settings = WorkerSettings::from(&worker);
        assert_eq!(settings.default_time_limit, Duration::from_secs(12));
        assert_eq!(settings.retry.max_retries(), 5);
    }

    #[tokio::test]
    async fn test_runtime_round_trip() {
        let registry = TaskRegistry::new().with(Shout).unwrap();
        let runtime = TaskRuntime::start(&small_config(), registry, TelemetryCollector::new());
        assert_eq!(runtime.worker_count(), 2);

        let id = runtime.client().submit("shout", vec![json!("hi")]).await.unwrap();
        let record = runtime
            .client()
            .wait(id, Duration::from_millis(5), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(record.state, TaskState::Success);
        assert_eq!(record.result, Some(json!("HI")));

        let telemetry = runtime.telemetry().clone();
        runtime.shutdown().await;
        assert_eq!(telemetry.get_stats().tasks_succeeded, 1);
    }
}
