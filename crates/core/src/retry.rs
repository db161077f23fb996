//! Retry decisions for failed task dispatches and failed store writes.
//!
//! A [`RetryPolicy`] classifies an error kind as retryable or fatal and shapes
//! the delay before the next attempt. Decisions are pure: the jitter added to
//! a delay is derived from a hash of the retry key and attempt number rather
//! than from a random source, so replaying a transition log re-derives the
//! same decision, while sibling tasks (different keys) still spread apart.

use crate::error::TaskExecutionError;
use crate::types::TaskId;
use crate::workflow::dag::WorkflowDag;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// What to do with an error of a given kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    #[default]
    Retry,
    FailFast,
}

/// Shape of the delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        delay_ms: u64,
        #[serde(default)]
        jitter_ms: u64,
    },
    /// `min(base_ms * 2^attempt, max_ms)` plus jitter
    Exponential {
        base_ms: u64,
        max_ms: u64,
        #[serde(default)]
        jitter_ms: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 1_000,
            max_ms: 30_000,
            jitter_ms: 250,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt + 1`, where `attempt` is 0-based.
    pub fn delay(&self, key: &str, attempt: u32) -> Duration {
        let (base, jitter_bound) = match *self {
            Self::Fixed {
                delay_ms,
                jitter_ms,
            } => (delay_ms, jitter_ms),
            Self::Exponential {
                base_ms,
                max_ms,
                jitter_ms,
            } => {
                let scaled = 2u64
                    .checked_pow(attempt)
                    .and_then(|factor| base_ms.checked_mul(factor))
                    .unwrap_or(u64::MAX);
                (scaled.min(max_ms), jitter_ms)
            }
        };

        Duration::from_millis(base.saturating_add(jitter(key, attempt, jitter_bound)))
    }
}

/// Deterministic jitter in `[0, bound]` milliseconds.
fn jitter(key: &str, attempt: u32, bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(attempt.to_be_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let raw = u64::from_be_bytes(bytes);
    // A bound of u64::MAX admits every value
    bound.checked_add(1).map_or(raw, |modulus| raw % modulus)
}

/// Retry policy declared on a task (or used for store writes)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt. 0 disables retries.
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Per error kind override of `default_action`.
    #[serde(default)]
    pub on_error: BTreeMap<String, ErrorAction>,
    #[serde(default)]
    pub default_action: ErrorAction,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            backoff: Backoff::default(),
            on_error: BTreeMap::new(),
            default_action: ErrorAction::Retry,
        }
    }

    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                delay_ms,
                jitter_ms: 0,
            },
            ..Self::none()
        }
    }

    pub fn exponential(max_attempts: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base_ms,
                max_ms,
                jitter_ms: 0,
            },
            ..Self::none()
        }
    }

    pub fn with_jitter(mut self, bound_ms: u64) -> Self {
        match &mut self.backoff {
            Backoff::Fixed { jitter_ms, .. } | Backoff::Exponential { jitter_ms, .. } => {
                *jitter_ms = bound_ms
            }
        }
        self
    }

    /// Classify errors of `kind` with `action`.
    pub fn on(mut self, kind: impl Into<String>, action: ErrorAction) -> Self {
        self.on_error.insert(kind.into(), action);
        self
    }

    /// Action for error kinds without an explicit mapping.
    pub fn otherwise(mut self, action: ErrorAction) -> Self {
        self.default_action = action;
        self
    }

    pub fn action_for(&self, kind: &str) -> ErrorAction {
        self.on_error
            .get(kind)
            .copied()
            .unwrap_or(self.default_action)
    }

    /// Decide whether the attempt numbered `attempt` (0-based) that failed
    /// with `kind` is retried.
    pub fn decide(&self, key: &str, attempt: u32, kind: &str) -> RetryDecision {
        match self.action_for(kind) {
            ErrorAction::FailFast => RetryDecision::FailFast,
            ErrorAction::Retry if attempt < self.max_attempts => RetryDecision::Retry {
                delay: self.backoff.delay(key, attempt),
            },
            ErrorAction::Retry => RetryDecision::FailFast,
        }
    }
}

/// Result of classifying a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    FailFast,
}

/// Applies the retry policies declared on a definition's tasks
pub struct RetryManager<'a> {
    dag: &'a WorkflowDag,
}

impl<'a> RetryManager<'a> {
    pub fn new(dag: &'a WorkflowDag) -> Self {
        Self { dag }
    }

    /// `attempt` is the task's retry counter at the time of the failure.
    pub fn decide(
        &self,
        task_id: &TaskId,
        attempt: u32,
        error: &TaskExecutionError,
    ) -> RetryDecision {
        match self.dag.task(task_id) {
            Some(spec) => spec.retry.decide(task_id.as_str(), attempt, &error.kind),
            None => RetryDecision::FailFast,
        }
    }
}
