use crate::error::{CompensationError, TaskExecutionError};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a task within a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Status of a workflow instance
///
/// `Pending -> Running -> {Succeeded | Compensating -> Compensated}`.
/// `Failed` marks an instance whose log violated the state machine, and
/// `RecoveryRequired` is an in-memory marker for an instance whose
/// transitions could no longer be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensating,
    Compensated,
    RecoveryRequired,
}

impl WorkflowStatus {
    /// No further transitions will be recorded for the instance.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Compensated)
    }
}

/// Status of a single task within an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Blocked,
    Ready,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Compensating,
    Compensated,
    Skipped,
}

impl TaskStatus {
    /// Dependents of a task in this status may run.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

/// Specification for a single task in a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Forward action understood by the task runtime. Defaults to the task id.
    #[serde(default)]
    pub action: Option<String>,
    /// Compensating action invoked if the workflow has to be rolled back.
    #[serde(default)]
    pub compensation: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Deadline for a single dispatch; the engine default applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(id),
            depends_on: Vec::new(),
            action: None,
            compensation: None,
            retry: RetryPolicy::default(),
            timeout_ms: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(TaskId::new));
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn compensate_with(mut self, action: impl Into<String>) -> Self {
        self.compensation = Some(action.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Name of the forward action passed to the runtime.
    pub fn action_name(&self) -> &str {
        self.action.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Immutable workflow definition, identified by name and version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: u32,
    pub tasks: Vec<TaskSpec>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, version: u32, tasks: Vec<TaskSpec>) -> Self {
        Self {
            name: name.into(),
            version,
            tasks,
        }
    }

    pub fn key(&self) -> DefinitionKey {
        DefinitionKey {
            name: self.name.clone(),
            version: self.version,
        }
    }
}

/// Reference to a definition by name and version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionKey {
    pub name: String,
    pub version: u32,
}

impl std::fmt::Display for DefinitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

/// Execution state of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    /// Retries scheduled so far; 0 while the first dispatch is pending or running.
    pub attempt: u32,
    pub last_error: Option<TaskExecutionError>,
    pub output: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
}

impl TaskState {
    pub fn blocked() -> Self {
        Self {
            status: TaskStatus::Blocked,
            attempt: 0,
            last_error: None,
            output: None,
            started_at: None,
            finished_at: None,
            deadline: None,
            retry_at: None,
        }
    }
}

/// Outcome of a compensating action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompensationOutcome {
    Succeeded,
    Failed { error: TaskExecutionError },
    /// The engine stopped while the action was running; it is not attempted again.
    Interrupted,
}

/// Compensation bookkeeping for one completed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub action: Option<String>,
    pub attempted: bool,
    pub outcome: Option<CompensationOutcome>,
}

/// Why an instance started compensating
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompensationReason {
    TaskFailed {
        task_id: TaskId,
        error: TaskExecutionError,
    },
    Cancelled {
        reason: String,
    },
}

/// Input handed to the task runtime for one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    /// Input the workflow instance was submitted with.
    pub workflow: serde_json::Value,
    /// Outputs of the task's direct dependencies.
    pub upstream: BTreeMap<TaskId, serde_json::Value>,
}

/// Read-only snapshot of a workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub definition: DefinitionKey,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub tasks: BTreeMap<TaskId, TaskState>,
    pub compensations: BTreeMap<TaskId, CompensationRecord>,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    pub compensation_reason: Option<CompensationReason>,
    /// Set when the instance ended in `Failed` or `RecoveryRequired`.
    pub error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_sequence: u64,
}

impl WorkflowInstance {
    pub fn task(&self, task_id: &TaskId) -> Option<&TaskState> {
        self.tasks.get(task_id)
    }

    /// Summary of the compensation phase, including failed compensations.
    pub fn compensation_report(&self) -> CompensationReport {
        let mut report = CompensationReport::default();

        for (task_id, record) in &self.compensations {
            match &record.outcome {
                Some(CompensationOutcome::Succeeded) => report.compensated.push(task_id.clone()),
                Some(CompensationOutcome::Failed { error }) => {
                    report.failures.push(CompensationError {
                        task_id: task_id.clone(),
                        error: error.clone(),
                    })
                }
                Some(CompensationOutcome::Interrupted) => report.interrupted.push(task_id.clone()),
                None if record.action.is_none() => report.not_required.push(task_id.clone()),
                None => {}
            }
        }

        report
    }
}

/// Partial-success report of a saga rollback
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationReport {
    pub compensated: Vec<TaskId>,
    pub failures: Vec<CompensationError>,
    pub interrupted: Vec<TaskId>,
    pub not_required: Vec<TaskId>,
}

impl CompensationReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.interrupted.is_empty()
    }
}
