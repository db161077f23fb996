use chrono::{DateTime, Utc};
use sagaflow_core::{TaskExecutionError, TaskInput, TaskSpec};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Runs task actions as shell commands
///
/// The action string is passed to `<shell> -c`. The forward action receives
/// its [`TaskInput`] as JSON on stdin and its stdout becomes the task output,
/// parsed as JSON when possible. A compensating action receives the original
/// output on stdin. A non-zero exit fails with error kind `exit_<code>`.
pub struct CommandRuntime {
    shell: String,
    working_dir: Option<PathBuf>,
}

impl CommandRuntime {
    pub fn new(shell: String, working_dir: Option<PathBuf>) -> Self {
        Self { shell, working_dir }
    }

    async fn run(
        &self,
        task: &TaskSpec,
        action: &str,
        stdin: &Value,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<String, TaskExecutionError> {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(action)
            .env("SAGAFLOW_TASK_ID", task.id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(deadline) = deadline {
            command.env("SAGAFLOW_DEADLINE", deadline.to_rfc3339());
        }
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            TaskExecutionError::new("spawn", format!("failed to start `{}`: {}", action, e))
        })?;

        let payload = serde_json::to_vec(stdin)
            .map_err(|e| TaskExecutionError::new("serialization", e.to_string()))?;
        if let Some(mut pipe) = child.stdin.take() {
            // Commands that ignore stdin may close it early
            if let Err(e) = pipe.write_all(&payload).await {
                tracing::debug!("Task {} did not read its input: {}", task.id, e);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TaskExecutionError::new("io", e.to_string()))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let kind = match output.status.code() {
            Some(code) => format!("exit_{}", code),
            None => "signal".to_string(),
        };
        Err(TaskExecutionError::new(kind, stderr))
    }
}

#[async_trait::async_trait]
impl sagaflow_core::TaskRuntime for CommandRuntime {
    async fn execute(
        &self,
        task: &TaskSpec,
        input: &TaskInput,
        deadline: DateTime<Utc>,
    ) -> Result<Value, TaskExecutionError> {
        let input = serde_json::to_value(input)
            .map_err(|e| TaskExecutionError::new("serialization", e.to_string()))?;
        let stdout = self
            .run(task, task.action_name(), &input, Some(deadline))
            .await?;

        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&stdout).unwrap_or(Value::String(stdout)))
    }

    async fn compensate(
        &self,
        task: &TaskSpec,
        action: &str,
        original_output: &Value,
    ) -> Result<(), TaskExecutionError> {
        self.run(task, action, original_output, None).await.map(|_| ())
    }
}
