//! Producer-facing task client
//!
//! `submit` returns a task id immediately; `poll` is the only way to observe
//! progress. The client remembers the ids it submitted so that a missing
//! record can be reported as `Expired` (evicted after TTL) rather than
//! `NotFound` (never submitted here).
//!
//! The ledger is bounded in time: an id not observed for the retention
//! window is forgotten, after which a missing record reads as `NotFound`.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::errors::{ClientError, StoreError};
use crate::tasks::queue::JobQueue;
use crate::tasks::store::{ResultStore, DEFAULT_RESULT_TTL};
use crate::tasks::types::{StatusUpdate, TaskId, TaskState, TaskStatusRecord};

/// Grace period kept on top of the result TTL before a submitted id is forgotten
pub const SUBMISSION_GRACE: Duration = Duration::from_secs(3600);

/// Ids this client submitted, with the last time their record was seen
struct Submissions {
    seen: HashMap<TaskId, Instant>,
    last_pruned: Instant,
}

impl Submissions {
    fn prune(&mut self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.seen.len();
        self.seen
            .retain(|_, seen| now.saturating_duration_since(*seen) < retention);
        self.last_pruned = now;
        before - self.seen.len()
    }
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was still PENDING and will never run
    Revoked,
    /// A worker already claimed it; its outcome will still be recorded
    TooLate(TaskState),
    /// The task had already finished
    AlreadyFinished(TaskState),
}

/// Handle used by producers to submit and observe tasks
#[derive(Clone)]
pub struct TaskClient {
    queue: Arc<JobQueue>,
    submitted: Arc<Mutex<Submissions>>,
    retention: Duration,
}

impl TaskClient {
    /// Client for a store using the default result TTL
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self::with_retention(queue, DEFAULT_RESULT_TTL.saturating_add(SUBMISSION_GRACE))
    }

    /// Forget submitted ids whose record has not been seen for `retention`
    ///
    /// Should exceed the store's TTL so evicted records still read as `Expired`.
    pub fn with_retention(queue: Arc<JobQueue>, retention: Duration) -> Self {
        Self {
            queue,
            submitted: Arc::new(Mutex::new(Submissions {
                seen: HashMap::new(),
                last_pruned: Instant::now(),
            })),
            retention,
        }
    }

    fn store(&self) -> &Arc<dyn ResultStore> {
        self.queue.store()
    }

    fn ledger(&self) -> MutexGuard<'_, Submissions> {
        self.submitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remember(&self, id: TaskId) {
        let mut ledger = self.ledger();
        if ledger.last_pruned.elapsed() >= self.retention / 4 {
            let forgotten = ledger.prune(self.retention);
            if forgotten > 0 {
                debug!(forgotten, "Forgot stale submitted task ids");
            }
        }
        ledger.seen.insert(id, Instant::now());
    }

    /// Refresh the last-seen time of an id this client submitted
    fn touch(&self, id: TaskId) {
        if let Some(seen) = self.ledger().seen.get_mut(&id) {
            *seen = Instant::now();
        }
    }

    fn was_submitted(&self, id: TaskId) -> bool {
        self.ledger().seen.contains_key(&id)
    }

    /// Drop every submitted id not seen within the retention window
    pub fn prune_submitted(&self) -> usize {
        self.ledger().prune(self.retention)
    }

    /// Number of submitted ids currently remembered
    pub fn tracked(&self) -> usize {
        self.ledger().seen.len()
    }

    /// Enqueue a named task; unknown names fail here and create no record
    pub async fn submit(&self, task_name: &str, arguments: Vec<Value>) -> Result<TaskId, ClientError> {
        let id = self.queue.enqueue(task_name, arguments).await?;
        self.remember(id);
        info!(task_id = %id, task = task_name, "Task submitted");
        Ok(id)
    }

    /// Current status record
    pub async fn poll(&self, id: TaskId) -> Result<TaskStatusRecord, ClientError> {
        match self.store().get_status(id).await {
            Ok(record) => {
                self.touch(id);
                Ok(record)
            }
            Err(StoreError::NotFound(_)) if self.was_submitted(id) => Err(ClientError::Expired(id)),
            Err(StoreError::NotFound(_)) => Err(ClientError::NotFound(id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Revoke a task that no worker has claimed yet
    ///
    /// Best-effort once STARTED: the worker keeps running and its outcome is
    /// recorded as usual.
    pub async fn cancel(&self, id: TaskId) -> Result<CancelOutcome, ClientError> {
        match self.store().set_status(id, StatusUpdate::revoked()).await {
            Ok(_) => {
                info!(task_id = %id, "Task revoked");
                Ok(CancelOutcome::Revoked)
            }
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                Ok(CancelOutcome::AlreadyFinished(from))
            }
            Err(StoreError::InvalidTransition { from, .. }) => {
                debug!(task_id = %id, state = %from, "Cancel arrived after the task started");
                Ok(CancelOutcome::TooLate(from))
            }
            Err(StoreError::NotFound(_)) if self.was_submitted(id) => Err(ClientError::Expired(id)),
            Err(StoreError::NotFound(_)) => Err(ClientError::NotFound(id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Poll every `interval` until the task is terminal or `timeout` elapses
    pub async fn wait(
        &self,
        id: TaskId,
        interval: Duration,
        timeout: Duration,
    ) -> Result<TaskStatusRecord, ClientError> {
        let started = Instant::now();
        loop {
            let record = self.poll(id).await?;
            if record.is_terminal() {
                return Ok(record);
            }
            if started.elapsed() >= timeout {
                return Err(ClientError::WaitTimeout {
                    id,
                    waited_ms: started.elapsed().as_millis() as u64,
                    last_state: record.state,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{QueueError, RegistryError, TaskError};
    use crate::tasks::registry::{Task, TaskContext, TaskRegistry};
    use crate::tasks::store::InMemoryResultStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct Greet;

    #[async_trait]
    impl Task for Greet {
        type Args = (String,);
        type Output = String;

        fn name(&self) -> &'static str {
            "greet"
        }

        async fn run(&self, _ctx: TaskContext, (name,): (String,)) -> Result<String, TaskError> {
            Ok(format!("Hi {}", name))
        }
    }

    fn client_with_ttl(ttl: Duration) -> (TaskClient, Arc<InMemoryResultStore>) {
        let registry = Arc::new(TaskRegistry::new().with(Greet).unwrap());
        let store = Arc::new(InMemoryResultStore::with_ttl(ttl));
        let queue = Arc::new(JobQueue::new(registry, store.clone()));
        (TaskClient::new(queue), store)
    }

    fn client_with_retention(ttl: Duration, retention: Duration) -> TaskClient {
        let registry = Arc::new(TaskRegistry::new().with(Greet).unwrap());
        let store = Arc::new(InMemoryResultStore::with_ttl(ttl));
        TaskClient::with_retention(Arc::new(JobQueue::new(registry, store)), retention)
    }

    #[tokio::test]
    async fn test_submit_then_poll_pending() {
        let (client, _store) = client_with_ttl(Duration::from_secs(60));
        let id = client.submit("greet", vec![json!("Ada")]).await.unwrap();
        let record = client.poll(id).await.unwrap();
        assert_eq!(record.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_submit_unknown_task() {
        let (client, store) = client_with_ttl(Duration::from_secs(60));
        let err = client.submit("nonexistent_task", vec![]).await.unwrap_err();
        assert_eq!(
            err,
            ClientError::Queue(QueueError::Registry(RegistryError::UnknownTask(
                "nonexistent_task".to_string()
            )))
        );
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_poll_never_submitted() {
        let (client, _store) = client_with_ttl(Duration::from_secs(60));
        let id = TaskId::new();
        assert_eq!(client.poll(id).await, Err(ClientError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let (client, _store) = client_with_ttl(Duration::from_secs(60));
        let id = client.submit("greet", vec![json!("Ada")]).await.unwrap();

        assert_eq!(client.cancel(id).await.unwrap(), CancelOutcome::Revoked);
        assert_eq!(client.poll(id).await.unwrap().state, TaskState::Revoked);
        assert_eq!(
            client.cancel(id).await.unwrap(),
            CancelOutcome::AlreadyFinished(TaskState::Revoked)
        );
    }

    #[tokio::test]
    async fn test_cancel_after_start_is_too_late() {
        let (client, store) = client_with_ttl(Duration::from_secs(60));
        let id = client.submit("greet", vec![json!("Ada")]).await.unwrap();
        store.set_status(id, StatusUpdate::started(1)).await.unwrap();

        assert_eq!(
            client.cancel(id).await.unwrap(),
            CancelOutcome::TooLate(TaskState::Started)
        );
        assert_eq!(client.poll(id).await.unwrap().state, TaskState::Started);
    }

    #[tokio::test]
    async fn test_expired_is_distinct_from_not_found() {
        let (client, _store) = client_with_ttl(Duration::from_millis(20));
        let id = client.submit("greet", vec![json!("Ada")]).await.unwrap();
        client.cancel(id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.poll(id).await, Err(ClientError::Expired(id)));
    }

    #[tokio::test]
    async fn test_wait_times_out_on_pending() {
        let (client, _store) = client_with_ttl(Duration::from_secs(60));
        let id = client.submit("greet", vec![json!("Ada")]).await.unwrap();

        let err = client
            .wait(id, Duration::from_millis(5), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::WaitTimeout {
                last_state: TaskState::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stale_ids_are_forgotten() {
        let client = client_with_retention(Duration::from_millis(20), Duration::from_millis(300));
        let old = client.submit("greet", vec![json!("Ada")]).await.unwrap();
        client.cancel(old).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let recent = client.submit("greet", vec![json!("Grace")]).await.unwrap();
        client.cancel(recent).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Both records are evicted; only the recent id is still remembered
        client.prune_submitted();
        assert_eq!(client.tracked(), 1);
        assert_eq!(client.poll(recent).await, Err(ClientError::Expired(recent)));
        assert_eq!(client.poll(old).await, Err(ClientError::NotFound(old)));
    }

    #[tokio::test]
    async fn test_polling_keeps_an_id_remembered() {
        let client = client_with_retention(Duration::from_secs(60), Duration::from_millis(100));
        let id = client.submit("greet", vec![json!("Ada")]).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            client.poll(id).await.unwrap();
        }
        assert_eq!(client.prune_submitted(), 0);
        assert_eq!(client.tracked(), 1);
    }
}
