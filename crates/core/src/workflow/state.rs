//! Per-instance state machine.
//!
//! Every change to a [`WorkflowInstance`] goes through [`InstanceState::apply`],
//! both while an instance is driven live and when its log is replayed, so the
//! two views cannot disagree.

use super::dag::WorkflowDag;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventType};
use crate::types::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Whether [`InstanceState::apply`] changed anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Applied,
    /// The sequence number was already applied
    Duplicate,
}

/// Mutable state of one workflow instance plus the DAG it runs
#[derive(Debug, Clone)]
pub struct InstanceState {
    dag: Arc<WorkflowDag>,
    instance: WorkflowInstance,
}

impl InstanceState {
    pub fn new(instance_id: InstanceId, dag: Arc<WorkflowDag>) -> Self {
        let tasks = dag
            .tasks()
            .iter()
            .map(|t| (t.id.clone(), TaskState::blocked()))
            .collect();

        let instance = WorkflowInstance {
            id: instance_id,
            definition: dag.definition().key(),
            status: WorkflowStatus::Pending,
            input: serde_json::Value::Null,
            tasks,
            compensations: BTreeMap::new(),
            cancel_requested: false,
            cancel_reason: None,
            compensation_reason: None,
            error: None,
            created_at: None,
            updated_at: None,
            last_sequence: 0,
        };

        Self { dag, instance }
    }

    /// Rebuild an instance from its transition log
    pub fn replay(instance_id: InstanceId, dag: Arc<WorkflowDag>, events: &[Event]) -> EngineResult<Self> {
        let mut state = Self::new(instance_id, dag);
        for event in events {
            state.apply(event)?;
        }
        Ok(state)
    }

    pub fn id(&self) -> InstanceId {
        self.instance.id
    }

    pub fn dag(&self) -> &Arc<WorkflowDag> {
        &self.dag
    }

    pub fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    pub fn snapshot(&self) -> WorkflowInstance {
        self.instance.clone()
    }

    pub fn status(&self) -> WorkflowStatus {
        self.instance.status
    }

    pub fn cancel_requested(&self) -> bool {
        self.instance.cancel_requested
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.instance.cancel_reason.as_deref()
    }

    pub fn tasks(&self) -> &BTreeMap<TaskId, TaskState> {
        &self.instance.tasks
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskState> {
        self.instance.tasks.get(task_id)
    }

    pub fn next_sequence(&self) -> u64 {
        self.instance.last_sequence + 1
    }

    /// Ids of tasks currently in `status`, ascending
    pub fn tasks_in(&self, status: TaskStatus) -> Vec<TaskId> {
        self.instance
            .tasks
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every task Succeeded or Skipped
    pub fn all_tasks_settled(&self) -> bool {
        self.instance
            .tasks
            .values()
            .all(|s| s.status.satisfies_dependents())
    }

    /// Workflow input plus the outputs of the task's direct dependencies
    pub fn task_input(&self, task_id: &TaskId) -> TaskInput {
        let upstream = self
            .dag
            .dependencies(task_id)
            .into_iter()
            .filter_map(|dep| {
                let output = self.instance.tasks.get(&dep)?.output.clone()?;
                Some((dep, output))
            })
            .collect();

        TaskInput {
            workflow: self.instance.input.clone(),
            upstream,
        }
    }

    /// Degraded marker for an instance whose transitions can no longer be
    /// persisted. Not a transition: the log is left untouched.
    pub fn mark_recovery_required(&mut self, error: impl Into<String>) {
        self.instance.status = WorkflowStatus::RecoveryRequired;
        self.instance.error = Some(error.into());
    }

    /// Apply a persisted transition
    pub fn apply(&mut self, event: &Event) -> EngineResult<Applied> {
        if event.instance_id != self.instance.id {
            return Err(self.corrupt(format!(
                "event {} belongs to instance {}",
                event.id, event.instance_id
            )));
        }

        if event.sequence <= self.instance.last_sequence {
            return Ok(Applied::Duplicate);
        }

        if event.sequence != self.next_sequence() {
            return Err(self.corrupt(format!(
                "expected sequence {}, found {}",
                self.next_sequence(),
                event.sequence
            )));
        }

        self.validate(&event.event_type)?;
        self.transition(event);

        self.instance.last_sequence = event.sequence;
        self.instance.updated_at = Some(event.timestamp);

        Ok(Applied::Applied)
    }

    /// Check that a transition is legal in the current state
    pub fn validate(&self, event_type: &EventType) -> EngineResult<()> {
        use TaskStatus as T;
        use WorkflowStatus as W;

        let name = event_type.name();

        match event_type {
            EventType::InstanceCreated { definition, .. } => {
                if self.instance.last_sequence != 0 {
                    return Err(self.invalid_instance(name));
                }
                if definition.key() != self.instance.definition {
                    return Err(self.corrupt(format!(
                        "log was written for {}, not {}",
                        definition.key(),
                        self.instance.definition
                    )));
                }
                Ok(())
            }
            EventType::InstanceStarted => self.expect_instance(&[W::Pending], name),
            EventType::InstanceSucceeded => {
                self.expect_instance(&[W::Running], name)?;
                if !self.all_tasks_settled() {
                    return Err(self.invalid_instance(name));
                }
                Ok(())
            }
            EventType::InstanceFailed { .. } => {
                if self.instance.status.is_terminal() {
                    return Err(self.invalid_instance(name));
                }
                Ok(())
            }
            EventType::CancelRequested { .. } => {
                self.expect_instance(&[W::Pending, W::Running], name)
            }
            EventType::TaskReady { task_id } => {
                self.expect_forward_progress(name)?;
                self.expect_task(task_id, &[T::Blocked, T::Retrying], name)
            }
            EventType::TaskStarted { task_id, .. } => {
                self.expect_forward_progress(name)?;
                self.expect_task(task_id, &[T::Ready], name)
            }
            EventType::TaskSucceeded { task_id, .. } | EventType::TaskFailed { task_id, .. } => {
                self.expect_instance(&[W::Running, W::Compensating], name)?;
                self.expect_task(task_id, &[T::Running], name)
            }
            EventType::TaskRetrying { task_id, .. } => {
                self.expect_forward_progress(name)?;
                self.expect_task(task_id, &[T::Failed], name)
            }
            EventType::TaskInterrupted { task_id } => {
                self.expect_instance(&[W::Running], name)?;
                self.expect_task(task_id, &[T::Running], name)
            }
            EventType::TaskSkipped { task_id, .. } => {
                self.expect_instance(&[W::Running, W::Compensating], name)?;
                self.expect_task(task_id, &[T::Blocked, T::Ready], name)
            }
            EventType::RetryAbandoned { task_id } => {
                self.expect_instance(&[W::Running, W::Compensating], name)?;
                self.expect_task(task_id, &[T::Retrying], name)
            }
            EventType::CompensationStarted { .. } => self.expect_instance(&[W::Running], name),
            EventType::TaskCompensating { task_id, .. } => {
                self.expect_instance(&[W::Compensating], name)?;
                self.expect_task(task_id, &[T::Succeeded], name)?;
                self.expect_no_record(task_id, name)
            }
            EventType::TaskCompensated { task_id, .. } => {
                self.expect_instance(&[W::Compensating], name)?;
                self.expect_task(task_id, &[T::Compensating], name)
            }
            EventType::CompensationNotRequired { task_id } => {
                self.expect_instance(&[W::Compensating], name)?;
                self.expect_task(task_id, &[T::Succeeded], name)?;
                self.expect_no_record(task_id, name)
            }
            EventType::InstanceCompensated => {
                self.expect_instance(&[W::Compensating], name)?;
                let busy = self
                    .instance
                    .tasks
                    .values()
                    .any(|s| matches!(s.status, T::Running | T::Compensating));
                if busy {
                    return Err(self.invalid_instance(name));
                }
                Ok(())
            }
        }
    }

    fn transition(&mut self, event: &Event) {
        let at = event.timestamp;
        let instance = &mut self.instance;

        match &event.event_type {
            EventType::InstanceCreated { input, .. } => {
                instance.input = input.clone();
                instance.created_at = Some(at);
            }
            EventType::InstanceStarted => instance.status = WorkflowStatus::Running,
            EventType::InstanceSucceeded => instance.status = WorkflowStatus::Succeeded,
            EventType::InstanceFailed { reason } => {
                instance.status = WorkflowStatus::Failed;
                instance.error = Some(reason.clone());
            }
            EventType::CancelRequested { reason } => {
                instance.cancel_requested = true;
                instance.cancel_reason = Some(reason.clone());
            }
            EventType::TaskReady { task_id } | EventType::TaskInterrupted { task_id } => {
                if let Some(task) = instance.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Ready;
                    task.retry_at = None;
                    task.deadline = None;
                }
            }
            EventType::TaskStarted {
                task_id,
                attempt,
                deadline,
            } => {
                if let Some(task) = instance.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Running;
                    task.attempt = *attempt;
                    task.started_at = Some(at);
                    task.finished_at = None;
                    task.deadline = Some(*deadline);
                }
            }
            EventType::TaskSucceeded { task_id, output } => {
                if let Some(task) = instance.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Succeeded;
                    task.output = Some(output.clone());
                    task.finished_at = Some(at);
                    task.deadline = None;
                }
            }
            EventType::TaskFailed { task_id, error, .. } => {
                if let Some(task) = instance.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Failed;
                    task.last_error = Some(error.clone());
                    task.finished_at = Some(at);
                    task.deadline = None;
                }
            }
            EventType::TaskRetrying {
                task_id,
                attempt,
                retry_at,
            } => {
                if let Some(task) = instance.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Retrying;
                    task.attempt = *attempt;
                    task.retry_at = Some(*retry_at);
                }
            }
            EventType::TaskSkipped { task_id, .. } => {
                if let Some(task) = instance.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Skipped;
                    task.finished_at = Some(at);
                }
            }
            EventType::RetryAbandoned { task_id } => {
                if let Some(task) = instance.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Failed;
                    task.retry_at = None;
                }
            }
            EventType::CompensationStarted { reason } => {
                instance.status = WorkflowStatus::Compensating;
                instance.compensation_reason = Some(reason.clone());
            }
            EventType::TaskCompensating { task_id, action } => {
                if let Some(task) = instance.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Compensating;
                }
                instance.compensations.insert(
                    task_id.clone(),
                    CompensationRecord {
                        action: Some(action.clone()),
                        attempted: true,
                        outcome: None,
                    },
                );
            }
            EventType::TaskCompensated { task_id, outcome } => {
                if let Some(task) = instance.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Compensated;
                }
                let record = instance
                    .compensations
                    .entry(task_id.clone())
                    .or_insert(CompensationRecord {
                        action: None,
                        attempted: true,
                        outcome: None,
                    });
                record.outcome = Some(outcome.clone());
            }
            EventType::CompensationNotRequired { task_id } => {
                instance.compensations.insert(
                    task_id.clone(),
                    CompensationRecord {
                        action: None,
                        attempted: false,
                        outcome: None,
                    },
                );
            }
            EventType::InstanceCompensated => instance.status = WorkflowStatus::Compensated,
        }
    }

    fn expect_instance(&self, allowed: &[WorkflowStatus], event: &'static str) -> EngineResult<()> {
        if allowed.contains(&self.instance.status) {
            Ok(())
        } else {
            Err(self.invalid_instance(event))
        }
    }

    /// New forward work may only start while running and not cancelled
    fn expect_forward_progress(&self, event: &'static str) -> EngineResult<()> {
        self.expect_instance(&[WorkflowStatus::Running], event)?;
        if self.instance.cancel_requested {
            return Err(self.invalid_instance(event));
        }
        Ok(())
    }

    fn expect_task(&self, task_id: &TaskId, allowed: &[TaskStatus], event: &'static str) -> EngineResult<()> {
        let task = self
            .instance
            .tasks
            .get(task_id)
            .ok_or_else(|| self.corrupt(format!("unknown task {} in {}", task_id, event)))?;

        if allowed.contains(&task.status) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                task_id: task_id.clone(),
                status: task.status,
                event,
            })
        }
    }

    fn expect_no_record(&self, task_id: &TaskId, event: &'static str) -> EngineResult<()> {
        if self.instance.compensations.contains_key(task_id) {
            return Err(EngineError::InvalidTransition {
                task_id: task_id.clone(),
                status: self.instance.tasks[task_id].status,
                event,
            });
        }
        Ok(())
    }

    fn invalid_instance(&self, event: &'static str) -> EngineError {
        EngineError::InvalidInstanceTransition {
            status: self.instance.status,
            event,
        }
    }

    fn corrupt(&self, reason: String) -> EngineError {
        EngineError::CorruptLog {
            instance_id: self.instance.id,
            reason,
        }
    }
}
