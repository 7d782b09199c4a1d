//! Asynchronous task execution
//!
//! Producers submit named invocations through a [`TaskClient`]; the
//! [`JobQueue`] carries them to a [`WorkerPool`]; every state transition is
//! written to the [`ResultStore`], which is the only place progress can be
//! observed.

pub mod builtin;
pub mod client;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod types;
pub mod worker;

pub use client::{CancelOutcome, TaskClient};
pub use queue::JobQueue;
pub use registry::{Task, TaskContext, TaskRegistry};
pub use retry::RetryPolicy;
pub use runtime::TaskRuntime;
pub use store::{InMemoryResultStore, ResultStore};
pub use types::{ErrorKind, TaskFailure, TaskId, TaskInvocation, TaskState, TaskStatusRecord};
pub use worker::{WorkerPool, WorkerSettings};
