//! Worker loop and pool
//!
//! Each worker dequeues one invocation at a time, claims it (PENDING/RETRY ->
//! STARTED), runs the registered body under a hard wall-clock limit and
//! writes the outcome back to the result store. The body runs in its own
//! tokio task so that a panic or an overrun is contained: the worker aborts
//! the task and records FAILURE with kind `Panic` or `Timeout`.
//!
//! Workers share nothing but the queue and the store.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::errors::{StoreError, TaskError};
use crate::tasks::queue::JobQueue;
use crate::tasks::registry::{TaskCallError, TaskContext};
use crate::tasks::retry::{RetryDecision, RetryPolicy};
use crate::tasks::types::{ErrorKind, StatusUpdate, TaskFailure, TaskInvocation, TaskState};
use crate::telemetry::{TelemetryCollector, TelemetryEvent};

/// Default wall-clock limit per task (5 minutes)
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(300);

/// Per-worker execution settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Limit for tasks that do not declare their own
    pub default_time_limit: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            default_time_limit: DEFAULT_TIME_LIMIT,
            retry: RetryPolicy::new(),
        }
    }
}

enum Outcome {
    Unrunnable(TaskFailure),
    Returned(Result<serde_json::Value, TaskCallError>),
    Panicked(String),
    TimedOut(Duration),
}

/// A single execution unit
pub struct Worker {
    id: usize,
    queue: Arc<JobQueue>,
    settings: WorkerSettings,
    telemetry: TelemetryCollector,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<JobQueue>,
        settings: WorkerSettings,
        telemetry: TelemetryCollector,
    ) -> Self {
        Self {
            id,
            queue,
            settings,
            telemetry,
        }
    }

    /// Process invocations until shutdown is signalled or the queue drains
    ///
    /// Shutdown is only observed between invocations; a running body always
    /// finishes (or hits its limit) first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = self.id, "Worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                next = self.queue.dequeue() => next,
            };
            match next {
                Some(invocation) => self.process(invocation).await,
                None => break,
            }
        }
        debug!(worker = self.id, "Worker stopped");
    }

    /// Claim, execute and record one invocation
    pub async fn process(&self, invocation: TaskInvocation) {
        let id = invocation.id;
        let store = self.queue.store();

        match store.set_status(id, StatusUpdate::started(invocation.attempt)).await {
            Ok(_) => {}
            Err(StoreError::InvalidTransition {
                from: TaskState::Revoked,
                ..
            }) => {
                debug!(worker = self.id, task_id = %id, "Skipping revoked task");
                self.telemetry.record(TelemetryEvent::TaskRevoked {
                    task_id: id,
                    timestamp: Instant::now(),
                });
                return;
            }
            Err(err) => {
                // Redelivered or expired invocation; someone else owns the record
                warn!(worker = self.id, task_id = %id, error = %err, "Cannot claim task");
                return;
            }
        }

        self.telemetry.record(TelemetryEvent::TaskStarted {
            task_id: id,
            task: invocation.task_name.clone(),
            attempt: invocation.attempt,
            timestamp: Instant::now(),
        });
        info!(
            worker = self.id,
            task_id = %id,
            task = %invocation.task_name,
            attempt = invocation.attempt,
            "Task started"
        );

        let started = Instant::now();
        let outcome = self.execute(&invocation).await;

        match outcome {
            Outcome::Unrunnable(failure) => {
                self.record_failure(&invocation, failure, started).await;
            }
            Outcome::Returned(Ok(value)) => {
                self.record_success(&invocation, value, started).await;
            }
            Outcome::Returned(Err(TaskCallError::InvalidArguments(reason))) => {
                let failure = TaskFailure::new(ErrorKind::InvalidArguments, reason);
                self.record_failure(&invocation, failure, started).await;
            }
            Outcome::Returned(Err(TaskCallError::Task(TaskError::Failed { kind, message }))) => {
                let failure = TaskFailure::new(ErrorKind::Task(kind), message);
                self.record_failure(&invocation, failure, started).await;
            }
            Outcome::Returned(Err(TaskCallError::Task(TaskError::Transient { message }))) => {
                self.retry_or_fail(&invocation, message, started).await;
            }
            Outcome::Panicked(message) => {
                let failure = TaskFailure::new(ErrorKind::Panic, message);
                self.record_failure(&invocation, failure, started).await;
            }
            Outcome::TimedOut(limit) => {
                self.telemetry.record(TelemetryEvent::TaskTimedOut {
                    task_id: id,
                    task: invocation.task_name.clone(),
                    limit_ms: limit.as_millis() as u64,
                    timestamp: Instant::now(),
                });
                let failure = TaskFailure::new(
                    ErrorKind::Timeout,
                    format!("Task exceeded its time limit of {}ms", limit.as_millis()),
                );
                self.record_failure(&invocation, failure, started).await;
            }
        }
    }

    async fn execute(&self, invocation: &TaskInvocation) -> Outcome {
        let handle = match self.queue.registry().get(&invocation.task_name) {
            Some(handle) => handle.clone(),
            None => {
                return Outcome::Unrunnable(TaskFailure::new(
                    ErrorKind::UnknownTask,
                    format!("No task registered as {:?}", invocation.task_name),
                ));
            }
        };

        let limit = handle.time_limit().unwrap_or(self.settings.default_time_limit);
        let ctx = TaskContext::for_invocation(invocation, self.settings.retry.max_retries());
        let arguments = invocation.arguments.clone();

        let mut body: JoinHandle<_> = tokio::spawn(async move { handle.call(ctx, arguments).await });

        match tokio::time::timeout(limit, &mut body).await {
            Ok(Ok(returned)) => Outcome::Returned(returned),
            Ok(Err(join_error)) => Outcome::Panicked(panic_message(join_error)),
            Err(_) => {
                body.abort();
                Outcome::TimedOut(limit)
            }
        }
    }

    async fn record_success(
        &self,
        invocation: &TaskInvocation,
        value: serde_json::Value,
        started: Instant,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        if let Err(err) = self
            .queue
            .store()
            .set_status(invocation.id, StatusUpdate::success(value))
            .await
        {
            error!(task_id = %invocation.id, error = %err, "Failed to record task success");
            return;
        }

        self.telemetry.record(TelemetryEvent::TaskSucceeded {
            task_id: invocation.id,
            task: invocation.task_name.clone(),
            duration_ms,
            timestamp: Instant::now(),
        });
        info!(task_id = %invocation.id, task = %invocation.task_name, duration_ms, "Task succeeded");
    }

    async fn record_failure(&self, invocation: &TaskInvocation, failure: TaskFailure, started: Instant) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let kind = failure.kind.clone();
        warn!(
            task_id = %invocation.id,
            task = %invocation.task_name,
            error = %failure,
            duration_ms,
            "Task failed"
        );

        if let Err(err) = self
            .queue
            .store()
            .set_status(invocation.id, StatusUpdate::failure(failure))
            .await
        {
            error!(task_id = %invocation.id, error = %err, "Failed to record task failure");
            return;
        }

        self.telemetry.record(TelemetryEvent::TaskFailed {
            task_id: invocation.id,
            task: invocation.task_name.clone(),
            kind,
            duration_ms,
            timestamp: Instant::now(),
        });
    }

    async fn retry_or_fail(&self, invocation: &TaskInvocation, message: String, started: Instant) {
        let countdown = match self.settings.retry.decide(invocation.attempt) {
            RetryDecision::RetryAfter(countdown) => countdown,
            RetryDecision::GiveUp => {
                let failure = TaskFailure::new(ErrorKind::TransientError, message);
                self.record_failure(invocation, failure, started).await;
                return;
            }
        };

        if let Err(err) = self
            .queue
            .store()
            .set_status(invocation.id, StatusUpdate::retry())
            .await
        {
            error!(task_id = %invocation.id, error = %err, "Failed to record task retry");
            return;
        }

        self.telemetry.record(TelemetryEvent::TaskRetried {
            task_id: invocation.id,
            task: invocation.task_name.clone(),
            attempt: invocation.attempt,
            countdown_ms: countdown.as_millis() as u64,
            timestamp: Instant::now(),
        });
        info!(
            task_id = %invocation.id,
            task = %invocation.task_name,
            attempt = invocation.attempt,
            countdown_ms = countdown.as_millis() as u64,
            reason = %message,
            "Task will be retried"
        );

        let queue = Arc::clone(&self.queue);
        let telemetry = self.telemetry.clone();
        let next = invocation.next_attempt();
        tokio::spawn(async move {
            tokio::time::sleep(countdown).await;
            let (id, task) = (next.id, next.task_name.clone());
            let err = match queue.requeue(next).await {
                Ok(()) => return,
                Err(err) => err,
            };

            warn!(task_id = %id, error = %err, "Retry could not be requeued");
            let failure = TaskFailure::new(
                ErrorKind::TransientError,
                format!("{} (retry not delivered: {})", message, err),
            );
            match queue.store().set_status(id, StatusUpdate::failure(failure)).await {
                Ok(_) => telemetry.record(TelemetryEvent::TaskFailed {
                    task_id: id,
                    task,
                    kind: ErrorKind::TransientError,
                    duration_ms: started.elapsed().as_millis() as u64,
                    timestamp: Instant::now(),
                }),
                Err(err) => {
                    error!(task_id = %id, error = %err, "Failed to record dropped retry")
                }
            }
        });
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "Task execution was cancelled".to_string();
    }
    let payload: Box<dyn Any + Send> = match err.try_into_panic() {
        Ok(payload) => payload,
        Err(err) => return err.to_string(),
    };
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "Task panicked".to_string()
    }
}

/// A fixed-size set of workers sharing one queue
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one) onto the current runtime
    pub fn spawn(
        size: usize,
        queue: Arc<JobQueue>,
        settings: WorkerSettings,
        telemetry: TelemetryCollector,
    ) -> Self {
        let size = size.max(1);
        let (shutdown, receiver) = watch::channel(false);

        let handles = (0..size)
            .map(|id| {
                let worker = Worker::new(id, Arc::clone(&queue), settings.clone(), telemetry.clone());
                tokio::spawn(worker.run(receiver.clone()))
            })
            .collect();

        info!(workers = size, "Worker pool started");
        Self { shutdown, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker and wait for in-flight invocations to finish
    ///
    /// Invocations still queued are not started; use `drain` after closing the
    /// queue to run them first.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        Self::join(self.handles).await;
        info!("Worker pool stopped");
    }

    /// Wait for workers to empty a closed queue and exit
    pub async fn drain(self) {
        Self::join(self.handles).await;
        info!("Worker pool drained");
    }

    async fn join(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "Worker exited abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::registry::{Task, TaskRegistry};
    use crate::tasks::store::{InMemoryResultStore, ResultStore};
    use crate::tasks::types::{TaskId, TaskStatusRecord};
    use async_trait::async_trait;
    use serde_json::json;

    struct Double;

    #[async_trait]
    impl Task for Double {
        type Args = (i64,);
        type Output = i64;

        fn name(&self) -> &'static str {
            "double"
        }

        async fn run(&self, _ctx: TaskContext, (n,): (i64,)) -> Result<i64, TaskError> {
            if n < 0 {
                return Err(TaskError::failed("ValueError", "negative input"));
            }
            Ok(n * 2)
        }
    }

    struct Flaky;

    #[async_trait]
    impl Task for Flaky {
        type Args = (u32,);
        type Output = u32;

        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn run(&self, ctx: TaskContext, (succeed_on,): (u32,)) -> Result<u32, TaskError> {
            if ctx.attempt < succeed_on {
                Err(TaskError::transient("upstream busy"))
            } else {
                Ok(ctx.attempt)
            }
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Task for Sleepy {
        type Args = ();
        type Output = ();

        fn name(&self) -> &'static str {
            "sleepy"
        }

        fn time_limit(&self) -> Option<Duration> {
            Some(Duration::from_millis(50))
        }

        async fn run(&self, _ctx: TaskContext, _args: ()) -> Result<(), TaskError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }
    }

    struct Explodes;

    #[async_trait]
    impl Task for Explodes {
        type Args = ();
        type Output = ();

        fn name(&self) -> &'static str {
            "explodes"
        }

        async fn run(&self, _ctx: TaskContext, _args: ()) -> Result<(), TaskError> {
            panic!("kaboom");
        }
    }

    fn setup() -> (Arc<JobQueue>, Arc<InMemoryResultStore>) {
        let registry = TaskRegistry::new()
            .with(Double)
            .and_then(|r| r.with(Flaky))
            .and_then(|r| r.with(Sleepy))
            .and_then(|r| r.with(Explodes))
            .unwrap();
        let store = Arc::new(InMemoryResultStore::new());
        let queue = Arc::new(JobQueue::new(Arc::new(registry), store.clone()));
        (queue, store)
    }

    fn fast_settings() -> WorkerSettings {
        WorkerSettings {
            default_time_limit: Duration::from_secs(5),
            retry: RetryPolicy::with_config(2, 5).without_jitter(),
        }
    }

    async fn wait_terminal(store: &InMemoryResultStore, id: TaskId) -> TaskStatusRecord {
        for _ in 0..200 {
            let record = store.get_status(id).await.unwrap();
            if record.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached a terminal state", id);
    }

    #[tokio::test]
    async fn test_process_success() {
        let (queue, store) = setup();
        let telemetry = TelemetryCollector::new();
        let worker = Worker::new(0, queue.clone(), fast_settings(), telemetry.clone());

        let id = queue.enqueue("double", vec![json!(21)]).await.unwrap();
        let invocation = queue.dequeue().await.unwrap();
        worker.process(invocation).await;

        let record = store.get_status(id).await.unwrap();
        assert_eq!(record.state, TaskState::Success);
        assert_eq!(record.result, Some(json!(42)));
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());
        assert_eq!(telemetry.get_stats().tasks_succeeded, 1);
    }

    #[tokio::test]
    async fn test_plain_error_is_not_retried() {
        let (queue, store) = setup();
        let telemetry = TelemetryCollector::new();
        let worker = Worker::new(0, queue.clone(), fast_settings(), telemetry.clone());

        let id = queue.enqueue("double", vec![json!(-1)]).await.unwrap();
        worker.process(queue.dequeue().await.unwrap()).await;

        let record = store.get_status(id).await.unwrap();
        assert_eq!(record.state, TaskState::Failure);
        let error = record.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Task("ValueError".to_string()));
        assert_eq!(error.message, "negative input");
        assert_eq!(queue.depth(), 0);
        assert_eq!(telemetry.get_stats().tasks_retried, 0);
    }

    #[tokio::test]
    async fn test_panic_is_recorded() {
        let (queue, store) = setup();
        let worker = Worker::new(0, queue.clone(), fast_settings(), TelemetryCollector::new());

        let id = queue.enqueue("explodes", vec![]).await.unwrap();
        worker.process(queue.dequeue().await.unwrap()).await;

        let error = store.get_status(id).await.unwrap().error.unwrap();
        assert_eq!(error.kind, ErrorKind::Panic);
        assert_eq!(error.message, "kaboom");
    }

    #[tokio::test]
    async fn test_time_limit_enforced() {
        let (queue, store) = setup();
        let telemetry = TelemetryCollector::new();
        let worker = Worker::new(0, queue.clone(), fast_settings(), telemetry.clone());

        let id = queue.enqueue("sleepy", vec![]).await.unwrap();
        let started = Instant::now();
        worker.process(queue.dequeue().await.unwrap()).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        let error = store.get_status(id).await.unwrap().error.unwrap();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(telemetry.get_stats().tasks_timed_out, 1);
    }

    #[tokio::test]
    async fn test_revoked_invocation_is_skipped() {
        let (queue, store) = setup();
        let telemetry = TelemetryCollector::new();
        let worker = Worker::new(0, queue.clone(), fast_settings(), telemetry.clone());

        let id = queue.enqueue("double", vec![json!(1)]).await.unwrap();
        store.set_status(id, StatusUpdate::revoked()).await.unwrap();
        worker.process(queue.dequeue().await.unwrap()).await;

        let record = store.get_status(id).await.unwrap();
        assert_eq!(record.state, TaskState::Revoked);
        assert!(record.started_at.is_none());
        assert_eq!(telemetry.get_stats().tasks_revoked, 1);
        assert_eq!(telemetry.get_stats().tasks_started, 0);
    }

    #[tokio::test]
    async fn test_pool_retries_transient_until_success() {
        let (queue, store) = setup();
        let telemetry = TelemetryCollector::new();
        let pool = WorkerPool::spawn(2, queue.clone(), fast_settings(), telemetry.clone());

        let id = queue.enqueue("flaky", vec![json!(3)]).await.unwrap();
        let record = wait_terminal(&store, id).await;

        assert_eq!(record.state, TaskState::Success);
        assert_eq!(record.result, Some(json!(3)));
        assert_eq!(record.attempt, 3);
        assert_eq!(telemetry.get_stats().tasks_retried, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_gives_up_after_ceiling() {
        let (queue, store) = setup();
        let pool = WorkerPool::spawn(1, queue.clone(), fast_settings(), TelemetryCollector::new());

        let id = queue.enqueue("flaky", vec![json!(100)]).await.unwrap();
        let record = wait_terminal(&store, id).await;

        assert_eq!(record.state, TaskState::Failure);
        assert_eq!(record.attempt, 3);
        let error = record.error.unwrap();
        assert_eq!(error.kind, ErrorKind::TransientError);
        assert_eq!(error.message, "upstream busy");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_redelivered_invocation_leaves_record_unchanged() {
        let (queue, store) = setup();
        let telemetry = TelemetryCollector::new();
        let worker = Worker::new(0, queue.clone(), fast_settings(), telemetry.clone());

        let id = queue.enqueue("double", vec![json!(4)]).await.unwrap();
        let invocation = queue.dequeue().await.unwrap();
        worker.process(invocation.clone()).await;
        let finished = store.get_status(id).await.unwrap();

        worker.process(invocation).await;
        assert_eq!(store.get_status(id).await.unwrap(), finished);
        assert_eq!(telemetry.get_stats().tasks_started, 1);
        assert_eq!(telemetry.get_stats().tasks_succeeded, 1);
    }

    #[tokio::test]
    async fn test_invocation_already_started_elsewhere_is_not_run() {
        let (queue, store) = setup();
        let telemetry = TelemetryCollector::new();
        let worker = Worker::new(0, queue.clone(), fast_settings(), telemetry.clone());

        let id = queue.enqueue("double", vec![json!(4)]).await.unwrap();
        let invocation = queue.dequeue().await.unwrap();
        let claimed = store.set_status(id, StatusUpdate::started(1)).await.unwrap();

        worker.process(invocation).await;
        assert_eq!(store.get_status(id).await.unwrap(), claimed);
        assert_eq!(telemetry.get_stats().tasks_started, 0);
    }

    #[tokio::test]
    async fn test_undeliverable_retry_is_recorded_as_failure() {
        let (queue, store) = setup();
        let worker = Worker::new(0, queue.clone(), fast_settings(), TelemetryCollector::new());

        let id = queue.enqueue("flaky", vec![json!(2)]).await.unwrap();
        worker.process(queue.dequeue().await.unwrap()).await;
        assert_eq!(store.get_status(id).await.unwrap().state, TaskState::Retry);
        queue.close();

        let record = wait_terminal(&store, id).await;
        assert_eq!(record.state, TaskState::Failure);
        let error = record.error.unwrap();
        assert_eq!(error.kind, ErrorKind::TransientError);
        assert!(error.message.starts_with("upstream busy"));
    }

    #[tokio::test]
    async fn test_drain_runs_queued_invocations() {
        let (queue, store) = setup();
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(queue.enqueue("double", vec![json!(n)]).await.unwrap());
        }
        queue.close();

        let pool = WorkerPool::spawn(2, queue, fast_settings(), TelemetryCollector::new());
        tokio::time::timeout(Duration::from_secs(5), pool.drain())
            .await
            .expect("workers should exit once the queue is empty");

        for id in ids {
            assert_eq!(store.get_status(id).await.unwrap().state, TaskState::Success);
        }
    }

    #[tokio::test]
    async fn test_pool_shutdown_stops_idle_workers() {
        let (queue, _store) = setup();
        let pool = WorkerPool::spawn(3, queue, fast_settings(), TelemetryCollector::new());
        assert_eq!(pool.size(), 3);
        tokio::time::timeout(Duration::from_secs(1), pool.shutdown())
            .await
            .expect("idle workers should stop promptly");
    }
}
