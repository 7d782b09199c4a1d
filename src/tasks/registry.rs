//! Typed task registry
//!
//! Maps a task name to a strongly-typed [`Task`] implementation. Producers
//! use it to reject unknown names and undecodable arguments before anything
//! is enqueued; workers use it to dispatch.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{RegistryError, TaskError};
use crate::tasks::types::{TaskId, TaskInvocation};

/// Execution context handed to a task body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_name: String,
    /// 1 on first delivery
    pub attempt: u32,
    pub max_retries: u32,
}

impl TaskContext {
    pub fn for_invocation(invocation: &TaskInvocation, max_retries: u32) -> Self {
        Self {
            task_id: invocation.id,
            task_name: invocation.task_name.clone(),
            attempt: invocation.attempt,
            max_retries,
        }
    }

    /// Whether a transient failure on this attempt will be retried
    pub fn can_retry(&self) -> bool {
        self.attempt <= self.max_retries
    }
}

/// A named unit of background work
///
/// `Args` is decoded from the invocation's ordered argument list, so a task
/// taking one string uses `(String,)` and is submitted with `["World"]`.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    type Args: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    /// Registry key
    fn name(&self) -> &'static str;

    /// Wall-clock limit overriding the worker default
    fn time_limit(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, ctx: TaskContext, args: Self::Args) -> Result<Self::Output, TaskError>;
}

#[async_trait]
trait ErasedTask: Send + Sync {
    fn time_limit(&self) -> Option<Duration>;
    fn check_args(&self, args: &[Value]) -> Result<(), String>;
    async fn call(&self, ctx: TaskContext, args: Vec<Value>) -> Result<Value, TaskCallError>;
}

/// Why a dispatched call did not produce a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCallError {
    /// Arguments failed to decode at execution time
    InvalidArguments(String),
    /// The body returned an error
    Task(TaskError),
}

struct Typed<T: Task>(T);

/// An empty argument list also decodes as `()`
fn decode_args<A: DeserializeOwned>(args: Vec<Value>) -> Result<A, String> {
    let empty = args.is_empty();
    match serde_json::from_value(Value::Array(args)) {
        Ok(decoded) => Ok(decoded),
        Err(_) if empty => serde_json::from_value(Value::Null).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    }
}

#[async_trait]
impl<T: Task> ErasedTask for Typed<T> {
    fn time_limit(&self) -> Option<Duration> {
        self.0.time_limit()
    }

    fn check_args(&self, args: &[Value]) -> Result<(), String> {
        decode_args::<T::Args>(args.to_vec()).map(|_| ())
    }

    async fn call(&self, ctx: TaskContext, args: Vec<Value>) -> Result<Value, TaskCallError> {
        let decoded = decode_args::<T::Args>(args).map_err(TaskCallError::InvalidArguments)?;
        let output = self.0.run(ctx, decoded).await.map_err(TaskCallError::Task)?;
        serde_json::to_value(output)
            .map_err(|e| TaskCallError::Task(TaskError::failed("SerializationError", e.to_string())))
    }
}

/// Cheap, cloneable handle to a registered task
#[derive(Clone)]
pub struct TaskHandle {
    name: String,
    inner: Arc<dyn ErasedTask>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.inner.time_limit()
    }

    /// Decode arguments and run the task body
    pub async fn call(&self, ctx: TaskContext, args: Vec<Value>) -> Result<Value, TaskCallError> {
        self.inner.call(ctx, args).await
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("time_limit", &self.time_limit())
            .finish()
    }
}

/// Task registry
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskHandle>,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a task under its own name
    pub fn register<T: Task>(&mut self, task: T) -> Result<(), RegistryError> {
        let name = task.name();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        if self.tasks.contains_key(name) {
            return Err(RegistryError::DuplicateTask(name.to_string()));
        }

        self.tasks.insert(
            name.to_string(),
            TaskHandle {
                name: name.to_string(),
                inner: Arc::new(Typed(task)),
            },
        );
        Ok(())
    }

    /// Builder-style registration
    pub fn with<T: Task>(mut self, task: T) -> Result<Self, RegistryError> {
        self.register(task)?;
        Ok(self)
    }

    /// Check that `name` exists and `args` decode into its argument type
    pub fn validate(&self, name: &str, args: &[Value]) -> Result<(), RegistryError> {
        let handle = self
            .tasks
            .get(name)
            .ok_or_else(|| RegistryError::UnknownTask(name.to_string()))?;

        handle
            .inner
            .check_args(args)
            .map_err(|reason| RegistryError::InvalidArguments {
                task: name.to_string(),
                reason,
            })
    }

    /// Get task handle by name
    pub fn get(&self, name: &str) -> Option<&TaskHandle> {
        self.tasks.get(name)
    }

    /// Check if task exists
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.task_names())
            .finish()
    }
}
