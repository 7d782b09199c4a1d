//! Job queue (broker)
//!
//! FIFO channel carrying task invocations from producers to workers.
//! Invocations from one producer are delivered in submission order; no
//! ordering holds across concurrent producers. Capacity is bounded, so
//! `enqueue` waits when the channel is full.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

use crate::errors::QueueError;
use crate::tasks::registry::TaskRegistry;
use crate::tasks::store::ResultStore;
use crate::tasks::types::{TaskId, TaskInvocation};

/// Default channel capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Job queue shared by producers and workers
pub struct JobQueue {
    sender: mpsc::Sender<TaskInvocation>,
    receiver: Mutex<mpsc::Receiver<TaskInvocation>>,
    registry: Arc<TaskRegistry>,
    store: Arc<dyn ResultStore>,
    capacity: usize,
    closed: watch::Sender<bool>,
}

impl JobQueue {
    /// Create queue with default capacity
    pub fn new(registry: Arc<TaskRegistry>, store: Arc<dyn ResultStore>) -> Self {
        Self::with_capacity(registry, store, DEFAULT_QUEUE_CAPACITY)
    }

    /// Create queue with a bounded capacity (minimum 1)
    pub fn with_capacity(
        registry: Arc<TaskRegistry>,
        store: Arc<dyn ResultStore>,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let (closed, _) = watch::channel(false);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            registry,
            store,
            capacity,
            closed,
        }
    }

    /// Validate, record PENDING and enqueue a new invocation
    ///
    /// Unknown task names and undecodable arguments are rejected before any
    /// status record exists.
    pub async fn enqueue(&self, task_name: &str, arguments: Vec<Value>) -> Result<TaskId, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        self.registry.validate(task_name, &arguments)?;

        let invocation = TaskInvocation::new(task_name, arguments);
        let id = invocation.id;
        self.store.create(&invocation).await?;

        if self.sender.send(invocation).await.is_err() {
            self.store.discard(id).await;
            return Err(QueueError::Closed);
        }

        debug!(task_id = %id, task = task_name, "Task enqueued");
        Ok(id)
    }

    /// Put an existing invocation back on the queue (retries)
    pub async fn requeue(&self, invocation: TaskInvocation) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        self.sender
            .send(invocation)
            .await
            .map_err(|_| QueueError::Closed)
    }

    /// Wait for the next invocation; `None` once closed and drained
    ///
    /// Cancel-safe: dropping the future never loses an invocation.
    pub async fn dequeue(&self) -> Option<TaskInvocation> {
        let mut closed = self.closed.subscribe();
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            biased;
            next = receiver.recv() => next,
            _ = closed.wait_for(|closed| *closed) => receiver.try_recv().ok(),
        }
    }

    /// Stop accepting new invocations; queued ones are still delivered
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            info!("Job queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Number of invocations waiting for a worker
    pub fn depth(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }
}
