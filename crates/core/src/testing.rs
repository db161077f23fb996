//! Test doubles for the task runtime and the state store.

use crate::error::{PersistenceError, TaskExecutionError};
use crate::events::Event;
use crate::storage::{MemoryStateStore, StateStore};
use crate::types::{InstanceId, TaskInput, TaskSpec};
use crate::workflow::TaskRuntime;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Barrier, Notify};

/// What one execution of a task does
#[derive(Clone)]
pub enum Step {
    Succeed(Value),
    Fail(TaskExecutionError),
    /// Never returns; only the deadline ends it
    Hang,
    Panic,
    Delay(Duration, Value),
    /// Meet the other parties at the barrier, then finish with the result
    Barrier(Arc<Barrier>, Result<Value, TaskExecutionError>),
    /// Wait until notified, then succeed
    Gate(Arc<Notify>, Value),
}

impl Step {
    pub fn fail(kind: &str) -> Self {
        Self::Fail(TaskExecutionError::new(kind, format!("{} failure", kind)))
    }
}

/// Task runtime driven by per-task scripts
///
/// Each execution consumes the next step of the task's script; the last step
/// repeats. Tasks without a script succeed with `{"task": <id>}`.
#[derive(Default)]
pub struct ScriptedRuntime {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    failing_compensations: Mutex<HashMap<String, TaskExecutionError>>,
    executed: Mutex<Vec<String>>,
    compensated: Mutex<Vec<(String, Value)>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    // Per task: (running now, most ever running at once)
    per_task: Mutex<HashMap<String, (usize, usize)>>,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, task: &str, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(task.to_string(), steps.into_iter().collect());
    }

    pub fn fail_compensation(&self, task: &str, error: TaskExecutionError) {
        self.failing_compensations
            .lock()
            .unwrap()
            .insert(task.to_string(), error);
    }

    /// Task ids in dispatch order, one entry per execution
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn executions_of(&self, task: &str) -> usize {
        self.executed().iter().filter(|t| *t == task).count()
    }

    /// Task ids in compensation order
    pub fn compensated(&self) -> Vec<String> {
        self.compensated
            .lock()
            .unwrap()
            .iter()
            .map(|(task, _)| task.clone())
            .collect()
    }

    pub fn compensation_input(&self, task: &str) -> Option<Value> {
        self.compensated
            .lock()
            .unwrap()
            .iter()
            .find(|(t, _)| t == task)
            .map(|(_, output)| output.clone())
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Executions in progress right now, across all tasks
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Most executions of `task` ever in progress at the same time
    pub fn max_concurrent_of(&self, task: &str) -> usize {
        self.per_task
            .lock()
            .unwrap()
            .get(task)
            .map_or(0, |(_, max)| *max)
    }

    fn enter(&self, task: &str) -> RunningGuard<'_> {
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        let mut per_task = self.per_task.lock().unwrap();
        let (current, max) = per_task.entry(task.to_string()).or_default();
        *current += 1;
        *max = (*max).max(*current);

        RunningGuard {
            runtime: self,
            task: task.to_string(),
        }
    }

    fn next_step(&self, task: &str) -> Step {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(task) {
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap(),
            Some(steps) => steps
                .front()
                .cloned()
                .unwrap_or_else(|| Step::Succeed(json!({ "task": task }))),
            None => Step::Succeed(json!({ "task": task })),
        }
    }
}

struct RunningGuard<'a> {
    runtime: &'a ScriptedRuntime,
    task: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.runtime.running.fetch_sub(1, Ordering::SeqCst);
        if let Some((current, _)) = self.runtime.per_task.lock().unwrap().get_mut(&self.task) {
            *current -= 1;
        }
    }
}

#[async_trait::async_trait]
impl TaskRuntime for ScriptedRuntime {
    async fn execute(
        &self,
        task: &TaskSpec,
        _input: &TaskInput,
        _deadline: DateTime<Utc>,
    ) -> Result<Value, TaskExecutionError> {
        let id = task.id.as_str();
        self.executed.lock().unwrap().push(id.to_string());

        let _guard = self.enter(id);

        match self.next_step(id) {
            Step::Succeed(value) => Ok(value),
            Step::Fail(error) => Err(error),
            Step::Hang => std::future::pending().await,
            Step::Panic => panic!("scripted panic in {}", id),
            Step::Delay(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Step::Barrier(barrier, result) => {
                barrier.wait().await;
                result
            }
            Step::Gate(gate, value) => {
                gate.notified().await;
                Ok(value)
            }
        }
    }

    async fn compensate(
        &self,
        task: &TaskSpec,
        _action: &str,
        original_output: &Value,
    ) -> Result<(), TaskExecutionError> {
        let id = task.id.as_str();
        self.compensated
            .lock()
            .unwrap()
            .push((id.to_string(), original_output.clone()));

        match self.failing_compensations.lock().unwrap().get(id) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// In-memory store whose appends can be made to fail
pub struct FlakyStore {
    inner: MemoryStateStore,
    fail_next: AtomicU32,
    /// Appends accepted before every further append fails
    allowance: AtomicU64,
    attempts: AtomicUsize,
    load_gate: Mutex<Option<Arc<Notify>>>,
    loads_waiting: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStateStore::new(),
            fail_next: AtomicU32::new(0),
            allowance: AtomicU64::new(u64::MAX),
            attempts: AtomicUsize::new(0),
            load_gate: Mutex::new(None),
            loads_waiting: AtomicUsize::new(0),
        })
    }

    /// Fail the next `n` appends, then recover
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Accept `n` more appends, then fail until healed
    pub fn fail_after(&self, n: u64) {
        self.allowance.store(n, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail_next.store(0, Ordering::SeqCst);
        self.allowance.store(u64::MAX, Ordering::SeqCst);
    }

    /// Make every `load_all` wait until [`FlakyStore::release_loads`]
    pub fn hold_loads(&self) {
        *self.load_gate.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    /// Let held loads, and every later one, through
    pub fn release_loads(&self) {
        if let Some(gate) = self.load_gate.lock().unwrap().take() {
            gate.notify_waiters();
        }
    }

    /// Loads currently held by [`FlakyStore::hold_loads`]
    pub fn loads_waiting(&self) -> usize {
        self.loads_waiting.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        let transient = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return true;
        }

        self.allowance
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                u64::MAX => Some(n),
                0 => None,
                n => Some(n - 1),
            })
            .is_err()
    }
}

#[async_trait::async_trait]
impl StateStore for FlakyStore {
    async fn append(&self, instance_id: InstanceId, event: &Event) -> Result<(), PersistenceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail() {
            return Err(PersistenceError::Unavailable("injected failure".to_string()));
        }
        self.inner.append(instance_id, event).await
    }

    async fn load_all(&self, instance_id: InstanceId) -> Result<Vec<Event>, PersistenceError> {
        let gate = self.load_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.loads_waiting.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
            self.loads_waiting.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.load_all(instance_id).await
    }

    async fn list_instances(&self) -> Result<Vec<InstanceId>, PersistenceError> {
        self.inner.list_instances().await
    }
}
