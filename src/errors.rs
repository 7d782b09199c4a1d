//! Error types for Atelier
//!
//! One closed enum per component. Producer-facing errors (registry) surface
//! synchronously from `submit`; worker-side failures are recorded in the
//! result store as a [`TaskFailure`](crate::tasks::TaskFailure) instead.

use thiserror::Error;

use crate::tasks::types::{TaskId, TaskState};

/// Task registry errors (rejected at registration or submission)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No task registered under this name
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// A task with the same name is already registered
    #[error("Task already registered: {0}")]
    DuplicateTask(String),

    /// Names must be non-empty and free of whitespace
    #[error("Invalid task name: {0:?}")]
    InvalidName(String),

    /// Arguments do not decode into the task's argument type
    #[error("Invalid arguments for task {task}: {reason}")]
    InvalidArguments { task: String, reason: String },
}

/// Result store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record for this id (never created, or evicted after TTL)
    #[error("No status record for task {0}")]
    NotFound(TaskId),

    /// A record for this id already exists
    #[error("Status record already exists for task {0}")]
    AlreadyExists(TaskId),

    /// State machine violation
    #[error("Invalid state transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },
}

/// Job queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The queue no longer accepts invocations
    #[error("Job queue is closed")]
    Closed,
}

/// Errors returned to pollers through the task client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// This client never submitted the id and the store has no record
    #[error("Task {0} not found")]
    NotFound(TaskId),

    /// The id was submitted through this client but its record was evicted
    #[error("Task {0} result has expired")]
    Expired(TaskId),

    /// `wait` gave up before the task reached a terminal state
    #[error("Timed out waiting for task {id} after {waited_ms}ms (last state: {last_state})")]
    WaitTimeout {
        id: TaskId,
        waited_ms: u64,
        last_state: TaskState,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of the external embedding service
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("Embedding service unreachable: {0}")]
    Unreachable(String),

    #[error("Embedding service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Malformed embedding response: {0}")]
    Malformed(String),

    #[error("Embedding has dimension {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl EmbeddingError {
    /// Whether a retry of the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            EmbeddingError::Unreachable(_) => true,
            EmbeddingError::Http { status, .. } => *status == 429 || *status >= 500,
            EmbeddingError::Malformed(_) | EmbeddingError::DimensionMismatch { .. } => false,
        }
    }
}

/// Failures of the vector index (similarity search, sampling, inserts)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    #[error("Vector index unavailable: {0}")]
    Unavailable(String),

    #[error("Vector index returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Malformed vector index response: {0}")]
    Malformed(String),

    #[error("Vector has dimension {actual}, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Failures of the text generation service (never surfaced by the pipeline)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("Generation service unreachable: {0}")]
    Unreachable(String),

    #[error("Generation service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Malformed generation response: {0}")]
    Malformed(String),

    #[error("Generation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
}

/// Failures that abort a recommendation pipeline run
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// No query vector means no meaningful retrieval
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// Error a task body returns to the worker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Permanent failure, recorded as FAILURE with this kind and message
    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },

    /// Retryable failure, triggers RETRY until the attempt ceiling
    #[error("Transient failure: {message}")]
    Transient { message: String },
}

impl TaskError {
    /// Permanent failure with an explicit kind
    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Retryable failure
    pub fn transient(message: impl Into<String>) -> Self {
        TaskError::Transient {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::Transient { .. })
    }
}

/// Crate-level error type
#[derive(Error, Debug)]
pub enum AtelierError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Search(#[from] SearchError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP client construction errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{0}")]
    Generic(String),
}

/// Result type alias for crate operations
pub type Result<T> = std::result::Result<T, AtelierError>;

impl From<anyhow::Error> for AtelierError {
    fn from(err: anyhow::Error) -> Self {
        AtelierError::Generic(format!("{:#}", err))
    }
}
