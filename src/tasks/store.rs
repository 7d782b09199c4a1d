//! Result store: task id -> status record, with TTL expiry
//!
//! The store is the single source of truth for task status. Every transition
//! is validated and applied under one write lock, so concurrent workers and
//! pollers never observe a torn or out-of-order record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::StoreError;
use crate::tasks::types::{StatusUpdate, TaskId, TaskInvocation, TaskState, TaskStatusRecord};

/// Default time-to-live for finished records (1 hour)
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(3600);

/// Storage backend for task status records
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create the PENDING record for a freshly submitted invocation
    async fn create(&self, invocation: &TaskInvocation) -> Result<TaskStatusRecord, StoreError>;

    /// Apply a state transition atomically
    async fn set_status(
        &self,
        id: TaskId,
        update: StatusUpdate,
    ) -> Result<TaskStatusRecord, StoreError>;

    /// Read the current record; expired records read as `NotFound`
    async fn get_status(&self, id: TaskId) -> Result<TaskStatusRecord, StoreError>;

    /// Remove a record that was created but never enqueued
    async fn discard(&self, id: TaskId) -> bool;

    /// Evict every expired record, returning how many were removed
    async fn purge_expired(&self) -> usize;
}

struct StoredRecord {
    record: TaskStatusRecord,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// In-process result store
pub struct InMemoryResultStore {
    records: RwLock<HashMap<TaskId, StoredRecord>>,
    ttl: chrono::Duration,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_RESULT_TTL)
    }

    /// Records expire `ttl` after reaching a terminal state
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl.to_std().unwrap_or(DEFAULT_RESULT_TTL)
    }

    /// Number of records currently held, expired or not
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Run `purge_expired` every `interval` until the handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = store.purge_expired().await;
                if evicted > 0 {
                    debug!(evicted, "Evicted expired task records");
                }
            }
        })
    }
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn create(&self, invocation: &TaskInvocation) -> Result<TaskStatusRecord, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&invocation.id) {
            return Err(StoreError::AlreadyExists(invocation.id));
        }

        let record = TaskStatusRecord::pending(invocation);
        records.insert(
            invocation.id,
            StoredRecord {
                record: record.clone(),
                expires_at: None,
            },
        );
        Ok(record)
    }

    async fn set_status(
        &self,
        id: TaskId,
        update: StatusUpdate,
    ) -> Result<TaskStatusRecord, StoreError> {
        let now = Utc::now();
        let mut records = self.records.write().await;

        let stored = match records.get_mut(&id) {
            Some(stored) if !stored.is_expired(now) => stored,
            _ => return Err(StoreError::NotFound(id)),
        };

        let from = stored.record.state;
        if !from.can_transition_to(update.state) {
            return Err(StoreError::InvalidTransition {
                id,
                from,
                to: update.state,
            });
        }

        let record = &mut stored.record;
        record.state = update.state;
        record.result = if update.state == TaskState::Success {
            update.result
        } else {
            None
        };
        record.error = if update.state == TaskState::Failure {
            update.error
        } else {
            None
        };
        if let Some(attempt) = update.attempt {
            record.attempt = attempt;
        }

        match update.state {
            TaskState::Started => {
                record.started_at = Some(now);
            }
            state if state.is_terminal() => {
                record.finished_at = Some(now);
                // A TTL past the representable range means "keep forever"
                stored.expires_at = Some(
                    now.checked_add_signed(self.ttl)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                );
            }
            _ => {}
        }

        Ok(stored.record.clone())
    }

    async fn get_status(&self, id: TaskId) -> Result<TaskStatusRecord, StoreError> {
        let records = self.records.read().await;
        match records.get(&id) {
            Some(stored) if !stored.is_expired(Utc::now()) => Ok(stored.record.clone()),
            _ => Err(StoreError::NotFound(id)),
        }
    }

    async fn discard(&self, id: TaskId) -> bool {
        self.records.write().await.remove(&id).is_some()
    }

    async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, stored| !stored.is_expired(now));
        before - records.len()
    }
}
