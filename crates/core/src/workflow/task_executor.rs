use super::runtime::TaskRuntime;
use crate::error::{kind, TaskExecutionError};
use crate::types::{TaskInput, TaskSpec};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::timeout;
use tokio_util::task::AbortOnDropHandle;

/// Runs single task actions with deadline enforcement
///
/// Every runtime call runs in its own tokio task so that a panicking runtime
/// is reported as a task failure instead of tearing down the instance driver.
/// Dropping an `execute` or `compensate` future aborts that task, so a call
/// never outlives the dispatch that started it.
#[derive(Clone)]
pub struct TaskExecutor {
    runtime: Arc<dyn TaskRuntime>,
}

impl TaskExecutor {
    pub fn new(runtime: Arc<dyn TaskRuntime>) -> Self {
        Self { runtime }
    }

    /// Execute the forward action of a task
    pub async fn execute(
        &self,
        task: &TaskSpec,
        input: TaskInput,
        limit: Duration,
        deadline: DateTime<Utc>,
    ) -> Result<Value, TaskExecutionError> {
        tracing::debug!("Executing task {} (action {})", task.id, task.action_name());

        let runtime = self.runtime.clone();
        let spec = task.clone();
        let handle = AbortOnDropHandle::new(tokio::spawn(async move {
            runtime.execute(&spec, &input, deadline).await
        }));

        self.await_call(task, handle, limit).await
    }

    /// Run the compensating `action` of a completed task
    pub async fn compensate(
        &self,
        task: &TaskSpec,
        action: &str,
        original_output: &Value,
        limit: Duration,
    ) -> Result<(), TaskExecutionError> {
        tracing::debug!("Compensating task {} (action {})", task.id, action);

        let runtime = self.runtime.clone();
        let spec = task.clone();
        let action = action.to_string();
        let output = original_output.clone();
        let handle = AbortOnDropHandle::new(tokio::spawn(async move {
            runtime.compensate(&spec, &action, &output).await
        }));

        self.await_call(task, handle, limit).await
    }

    async fn await_call<T>(
        &self,
        task: &TaskSpec,
        mut handle: AbortOnDropHandle<Result<T, TaskExecutionError>>,
        limit: Duration,
    ) -> Result<T, TaskExecutionError> {
        match timeout(limit, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(Self::join_failure(task, join_error)),
            Err(_) => {
                handle.abort();
                tracing::warn!("Task {} timed out after {:?}", task.id, limit);
                Err(TaskExecutionError::timeout(format!(
                    "task {} did not finish within {} ms",
                    task.id,
                    limit.as_millis()
                )))
            }
        }
    }

    fn join_failure(task: &TaskSpec, error: JoinError) -> TaskExecutionError {
        if error.is_panic() {
            let payload = error.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());

            tracing::warn!("Task runtime panicked while running {}: {}", task.id, message);
            TaskExecutionError::new(kind::PANIC, message)
        } else {
            TaskExecutionError::new(kind::INTERRUPTED, format!("task {} was aborted", task.id))
        }
    }
}
