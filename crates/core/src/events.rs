use crate::error::TaskExecutionError;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted state transition of one workflow instance
///
/// `sequence` starts at 1 and increases by one per transition of the
/// instance. Appending the same event twice is a no-op for the store and
/// applying it twice is a no-op for the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub instance_id: InstanceId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(instance_id: InstanceId, sequence: u64, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id,
            sequence,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of transitions recorded for an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Instance lifecycle
    InstanceCreated {
        definition: WorkflowDefinition,
        input: serde_json::Value,
    },
    InstanceStarted,
    InstanceSucceeded,
    InstanceFailed {
        reason: String,
    },
    CancelRequested {
        reason: String,
    },

    // Forward execution
    TaskReady {
        task_id: TaskId,
    },
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
        deadline: DateTime<Utc>,
    },
    TaskSucceeded {
        task_id: TaskId,
        output: serde_json::Value,
    },
    TaskFailed {
        task_id: TaskId,
        attempt: u32,
        error: TaskExecutionError,
    },
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    /// The dispatch was in flight when the previous driver stopped
    TaskInterrupted {
        task_id: TaskId,
    },
    TaskSkipped {
        task_id: TaskId,
        reason: String,
    },
    RetryAbandoned {
        task_id: TaskId,
    },

    // Compensation
    CompensationStarted {
        reason: CompensationReason,
    },
    TaskCompensating {
        task_id: TaskId,
        action: String,
    },
    TaskCompensated {
        task_id: TaskId,
        outcome: CompensationOutcome,
    },
    CompensationNotRequired {
        task_id: TaskId,
    },
    InstanceCompensated,
}

impl EventType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InstanceCreated { .. } => "instance_created",
            Self::InstanceStarted => "instance_started",
            Self::InstanceSucceeded => "instance_succeeded",
            Self::InstanceFailed { .. } => "instance_failed",
            Self::CancelRequested { .. } => "cancel_requested",
            Self::TaskReady { .. } => "task_ready",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskSucceeded { .. } => "task_succeeded",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskRetrying { .. } => "task_retrying",
            Self::TaskInterrupted { .. } => "task_interrupted",
            Self::TaskSkipped { .. } => "task_skipped",
            Self::RetryAbandoned { .. } => "retry_abandoned",
            Self::CompensationStarted { .. } => "compensation_started",
            Self::TaskCompensating { .. } => "task_compensating",
            Self::TaskCompensated { .. } => "task_compensated",
            Self::CompensationNotRequired { .. } => "compensation_not_required",
            Self::InstanceCompensated => "instance_compensated",
        }
    }

    /// Task the transition applies to, if any
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskReady { task_id }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskSucceeded { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskRetrying { task_id, .. }
            | Self::TaskInterrupted { task_id }
            | Self::TaskSkipped { task_id, .. }
            | Self::RetryAbandoned { task_id }
            | Self::TaskCompensating { task_id, .. }
            | Self::TaskCompensated { task_id, .. }
            | Self::CompensationNotRequired { task_id } => Some(task_id),
            Self::InstanceCreated { .. }
            | Self::InstanceStarted
            | Self::InstanceSucceeded
            | Self::InstanceFailed { .. }
            | Self::CancelRequested { .. }
            | Self::CompensationStarted { .. }
            | Self::InstanceCompensated => None,
        }
    }
}
