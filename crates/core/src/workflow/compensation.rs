//! Saga rollback of completed tasks.

use super::journal::Journal;
use super::state::InstanceState;
use super::task_executor::TaskExecutor;
use crate::error::{EngineError, EngineResult};
use crate::events::EventType;
use crate::types::{CompensationOutcome, TaskId, TaskSpec, TaskStatus, WorkflowStatus};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Work decided under the instance lock, performed outside it
enum Pending {
    Invoke {
        spec: TaskSpec,
        action: String,
        output: Value,
    },
    Done,
}

/// Runs compensating actions in reverse topological order
///
/// Each compensation is attempted at most once: `TaskCompensating` is
/// persisted before the runtime is called, and a task found in that status on
/// a later run is closed as interrupted instead of being invoked again.
pub struct CompensationEngine {
    journal: Arc<Journal>,
    executor: TaskExecutor,
    default_timeout: Duration,
}

impl CompensationEngine {
    pub fn new(journal: Arc<Journal>, executor: TaskExecutor, default_timeout: Duration) -> Self {
        Self {
            journal,
            executor,
            default_timeout,
        }
    }

    /// Compensate every succeeded task of an instance in `Compensating`,
    /// then record `InstanceCompensated`
    pub async fn compensate(&self, state: &Mutex<InstanceState>) -> EngineResult<()> {
        let (dag, instance_id) = {
            let state = state.lock().await;
            if state.status() != WorkflowStatus::Compensating {
                return Err(EngineError::InvalidState {
                    instance_id: state.id(),
                    status: state.status(),
                    action: "compensate",
                });
            }
            (state.dag().clone(), state.id())
        };

        tracing::info!("Compensating instance {}", instance_id);

        for task_id in dag.reverse_topological_order() {
            let pending = {
                let mut state = state.lock().await;
                self.prepare(&mut state, task_id).await?
            };

            let Pending::Invoke {
                spec,
                action,
                output,
            } = pending
            else {
                continue;
            };

            let limit = spec
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.default_timeout);

            let outcome = match self.executor.compensate(&spec, &action, &output, limit).await {
                Ok(()) => {
                    tracing::info!("Compensated task {} of instance {}", task_id, instance_id);
                    CompensationOutcome::Succeeded
                }
                Err(error) => {
                    tracing::warn!(
                        "Compensation {} of task {} in instance {} failed: {}",
                        action,
                        task_id,
                        instance_id,
                        error
                    );
                    CompensationOutcome::Failed { error }
                }
            };

            let mut state = state.lock().await;
            self.journal
                .record(
                    &mut state,
                    EventType::TaskCompensated {
                        task_id: task_id.clone(),
                        outcome,
                    },
                )
                .await?;
        }

        let mut state = state.lock().await;
        self.journal
            .record(&mut state, EventType::InstanceCompensated)
            .await?;

        let report = state.instance().compensation_report();
        if report.is_complete() {
            tracing::info!(
                "Instance {} compensated ({} tasks rolled back)",
                instance_id,
                report.compensated.len()
            );
        } else {
            tracing::warn!(
                "Instance {} compensated with {} failed and {} interrupted compensations",
                instance_id,
                report.failures.len(),
                report.interrupted.len()
            );
        }

        Ok(())
    }

    async fn prepare(&self, state: &mut InstanceState, task_id: &TaskId) -> EngineResult<Pending> {
        let Some(status) = state.task(task_id).map(|t| t.status) else {
            return Ok(Pending::Done);
        };

        match status {
            TaskStatus::Compensating => {
                tracing::warn!(
                    "Compensation of task {} in instance {} was interrupted, not retrying it",
                    task_id,
                    state.id()
                );
                self.journal
                    .record(
                        state,
                        EventType::TaskCompensated {
                            task_id: task_id.clone(),
                            outcome: CompensationOutcome::Interrupted,
                        },
                    )
                    .await?;
                return Ok(Pending::Done);
            }
            TaskStatus::Succeeded => {}
            _ => return Ok(Pending::Done),
        }

        if state.instance().compensations.contains_key(task_id) {
            return Ok(Pending::Done);
        }

        let spec = state
            .dag()
            .task(task_id)
            .cloned()
            .ok_or_else(|| EngineError::CorruptLog {
                instance_id: state.id(),
                reason: format!("task {} is not part of the definition", task_id),
            })?;

        let Some(action) = spec.compensation.clone() else {
            self.journal
                .record(
                    state,
                    EventType::CompensationNotRequired {
                        task_id: task_id.clone(),
                    },
                )
                .await?;
            return Ok(Pending::Done);
        };

        self.journal
            .record(
                state,
                EventType::TaskCompensating {
                    task_id: task_id.clone(),
                    action: action.clone(),
                },
            )
            .await?;

        let output = state
            .task(task_id)
            .and_then(|t| t.output.clone())
            .unwrap_or(Value::Null);

        Ok(Pending::Invoke {
            spec,
            action,
            output,
        })
    }
}
