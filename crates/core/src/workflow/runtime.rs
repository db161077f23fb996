use crate::error::TaskExecutionError;
use crate::types::{TaskInput, TaskSpec};
use chrono::{DateTime, Utc};

/// Executes the actions named by task specs
///
/// The engine never interprets actions itself. Implementations should honour
/// `deadline`, but the engine enforces it regardless: a call still running at
/// the deadline is abandoned and reported as a `timeout` failure.
#[async_trait::async_trait]
pub trait TaskRuntime: Send + Sync {
    /// Run the forward action of `task`, returning its output payload
    async fn execute(
        &self,
        task: &TaskSpec,
        input: &TaskInput,
        deadline: DateTime<Utc>,
    ) -> Result<serde_json::Value, TaskExecutionError>;

    /// Undo a completed task. `original_output` is what `execute` returned.
    async fn compensate(
        &self,
        task: &TaskSpec,
        action: &str,
        original_output: &serde_json::Value,
    ) -> Result<(), TaskExecutionError>;
}
