use crate::error::kind;
use crate::retry::{ErrorAction, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently running tasks of one instance
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Deadline for tasks that do not declare `timeout_ms`
    #[serde(default = "default_task_timeout_ms")]
    pub default_task_timeout_ms: u64,

    /// Applied to failed appends to the state store
    #[serde(default = "default_persistence_retry")]
    pub persistence_retry: RetryPolicy,

    /// Hand the log of every instance that reaches a terminal status to the
    /// store's cold storage
    #[serde(default)]
    pub archive_completed: bool,
}

fn default_max_in_flight() -> usize {
    8
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_persistence_retry() -> RetryPolicy {
    RetryPolicy::exponential(5, 50, 2_000)
        .with_jitter(25)
        .on(kind::CONFLICT, ErrorAction::FailFast)
        .on(kind::SERIALIZATION, ErrorAction::FailFast)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            default_task_timeout_ms: default_task_timeout_ms(),
            persistence_retry: default_persistence_retry(),
            archive_completed: false,
        }
    }
}

impl EngineConfig {
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_persistence_retry(mut self, policy: RetryPolicy) -> Self {
        self.persistence_retry = policy;
        self
    }

    pub fn with_archive_completed(mut self, archive: bool) -> Self {
        self.archive_completed = archive;
        self
    }
}
