//! Error taxonomy for the workflow engine.

use crate::types::{InstanceId, TaskId, TaskStatus, WorkflowStatus};
use serde::{Deserialize, Serialize};

/// Well-known error kinds produced by the engine itself.
///
/// Task runtimes are free to report any other kind; retry policies map kinds
/// to a retry decision.
pub mod kind {
    /// The task did not finish before its deadline.
    pub const TIMEOUT: &str = "timeout";
    /// The task runtime panicked while executing the task.
    pub const PANIC: &str = "panic";
    /// The process driving the task went away before an outcome was recorded.
    pub const INTERRUPTED: &str = "interrupted";
    /// The state store could not be reached.
    pub const UNAVAILABLE: &str = "unavailable";
    /// The state store rejected the write as conflicting with the log.
    pub const CONFLICT: &str = "conflict";
    /// A transition could not be encoded or decoded.
    pub const SERIALIZATION: &str = "serialization";
    /// Any other storage backend failure.
    pub const BACKEND: &str = "backend";
}

/// Rejection of a workflow definition. Raised before any instance exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("workflow contains a dependency cycle: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("task id {0} is declared more than once")]
    DuplicateTaskId(TaskId),

    #[error("workflow {name} v{version} declares no tasks")]
    EmptyDefinition { name: String, version: u32 },

    #[error("workflow {name} v{version} is already registered with a different definition")]
    VersionConflict { name: String, version: u32 },
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failure reported by the task runtime for one execution or compensation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskExecutionError {
    pub kind: String,
    pub message: String,
}

impl TaskExecutionError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The deadline of a dispatch expired before the runtime answered.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(kind::TIMEOUT, message)
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == kind::TIMEOUT
    }
}

/// Failure of the state store adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("conflicting transition for instance {instance_id} at sequence {sequence}")]
    Conflict {
        instance_id: InstanceId,
        sequence: u64,
    },

    #[error("failed to encode or decode transition: {0}")]
    Serialization(String),

    #[error("state store error: {0}")]
    Backend(String),
}

impl PersistenceError {
    /// Error kind used to classify this failure against a retry policy.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => kind::UNAVAILABLE,
            Self::Conflict { .. } => kind::CONFLICT,
            Self::Serialization(_) => kind::SERIALIZATION,
            Self::Backend(_) => kind::BACKEND,
        }
    }
}

impl From<anyhow::Error> for PersistenceError {
    fn from(err: anyhow::Error) -> Self {
        Self::Backend(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A compensating action that did not succeed. Recorded, never escalated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("compensation of task {task_id} failed: {error}")]
pub struct CompensationError {
    pub task_id: TaskId,
    pub error: TaskExecutionError,
}

/// Errors returned by the engine API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid workflow definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("workflow instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("workflow instance {0} is not being driven by this engine")]
    InstanceNotActive(InstanceId),

    #[error("workflow instance {instance_id} is {status:?}, cannot {action}")]
    InvalidState {
        instance_id: InstanceId,
        status: WorkflowStatus,
        action: &'static str,
    },

    #[error("invalid transition {event} for task {task_id} in status {status:?}")]
    InvalidTransition {
        task_id: TaskId,
        status: TaskStatus,
        event: &'static str,
    },

    #[error("invalid transition {event} for instance in status {status:?}")]
    InvalidInstanceTransition {
        status: WorkflowStatus,
        event: &'static str,
    },

    #[error("workflow instance {0} has unfinished tasks but nothing runnable")]
    Stalled(InstanceId),

    #[error("driver of workflow instance {instance_id} panicked: {message}")]
    DriverPanicked {
        instance_id: InstanceId,
        message: String,
    },

    #[error("transition log of instance {instance_id} is corrupt: {reason}")]
    CorruptLog {
        instance_id: InstanceId,
        reason: String,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;
