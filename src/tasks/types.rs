//! Task invocation and status record types
//!
//! State machine for a status record:
//!
//! ```text
//! PENDING -> STARTED -> SUCCESS
//!    |          |   \-> FAILURE
//!    |          \-> RETRY -> STARTED
//!    \-> REVOKED
//! ```
//!
//! SUCCESS, FAILURE and REVOKED are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Globally unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Fresh random id (v4), never reused
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A single request to run a named task asynchronously
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub id: TaskId,
    pub task_name: String,
    pub arguments: Vec<Value>,
    pub submitted_at: DateTime<Utc>,
    /// 1 on first delivery, incremented on every retry
    pub attempt: u32,
}

impl TaskInvocation {
    pub fn new(task_name: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            id: TaskId::new(),
            task_name: task_name.into(),
            arguments,
            submitted_at: Utc::now(),
            attempt: 1,
        }
    }

    /// Same invocation, next attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Status of a task as seen by pollers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Enqueued, not yet claimed by a worker
    Pending,

    /// Claimed by a worker and running
    Started,

    /// Transient failure; re-enqueued for another attempt
    Retry,

    /// Finished with a result (terminal)
    Success,

    /// Finished with an error (terminal)
    Failure,

    /// Cancelled by the producer before any worker claimed it (terminal)
    Revoked,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Revoked
        )
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Started)
                | (Pending, Revoked)
                | (Started, Success)
                | (Started, Failure)
                | (Started, Retry)
                | (Retry, Started)
                | (Retry, Failure)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Retry => "RETRY",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
            TaskState::Revoked => "REVOKED",
        };
        f.write_str(name)
    }
}

/// Classification of a recorded failure
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Wall-clock limit exceeded
    Timeout,

    /// Transient failures exhausted the retry ceiling
    TransientError,

    /// Task body panicked
    Panic,

    /// Arguments could not be decoded at execution time
    InvalidArguments,

    /// No handler for the task name at execution time
    UnknownTask,

    /// Kind named by the task body itself
    Task(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => f.write_str("Timeout"),
            ErrorKind::TransientError => f.write_str("TransientError"),
            ErrorKind::Panic => f.write_str("Panic"),
            ErrorKind::InvalidArguments => f.write_str("InvalidArguments"),
            ErrorKind::UnknownTask => f.write_str("UnknownTask"),
            ErrorKind::Task(kind) => f.write_str(kind),
        }
    }
}

/// Error recorded on a FAILURE status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Status record kept in the result store, one per task id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub id: TaskId,
    pub task_name: String,
    pub state: TaskState,
    /// Present only in SUCCESS
    pub result: Option<Value>,
    /// Present only in FAILURE
    pub error: Option<TaskFailure>,
    pub attempt: u32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatusRecord {
    /// Fresh PENDING record for an invocation
    pub fn pending(invocation: &TaskInvocation) -> Self {
        Self {
            id: invocation.id,
            task_name: invocation.task_name.clone(),
            state: TaskState::Pending,
            result: None,
            error: None,
            attempt: invocation.attempt,
            submitted_at: invocation.submitted_at,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// A requested status change
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<TaskFailure>,
    pub attempt: Option<u32>,
}

impl StatusUpdate {
    pub fn started(attempt: u32) -> Self {
        Self {
            state: TaskState::Started,
            result: None,
            error: None,
            attempt: Some(attempt),
        }
    }

    pub fn success(result: Value) -> Self {
        Self {
            state: TaskState::Success,
            result: Some(result),
            error: None,
            attempt: None,
        }
    }

    pub fn failure(error: TaskFailure) -> Self {
        Self {
            state: TaskState::Failure,
            result: None,
            error: Some(error),
            attempt: None,
        }
    }

    pub fn retry() -> Self {
        Self {
            state: TaskState::Retry,
            result: None,
            error: None,
            attempt: None,
        }
    }

    pub fn revoked() -> Self {
        Self {
            state: TaskState::Revoked,
            result: None,
            error: None,
            attempt: None,
        }
    }
}
