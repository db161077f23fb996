use super::compensation::CompensationEngine;
use super::dag::WorkflowDag;
use super::journal::Journal;
use super::runtime::TaskRuntime;
use super::state::InstanceState;
use super::task_executor::TaskExecutor;
use crate::config::EngineConfig;
use crate::error::{kind, DefinitionError, EngineError, EngineResult, TaskExecutionError};
use crate::events::{Event, EventType};
use crate::retry::{RetryDecision, RetryManager};
use crate::storage::StateStore;
use crate::types::*;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Handle on an instance driven by this engine
struct InstanceHandle {
    state: Arc<Mutex<InstanceState>>,
    cancel: CancellationToken,
    status: watch::Sender<WorkflowStatus>,
}

struct EngineInner {
    journal: Arc<Journal>,
    executor: TaskExecutor,
    compensation: CompensationEngine,
    config: EngineConfig,
    definitions: RwLock<HashMap<DefinitionKey, Arc<WorkflowDag>>>,
    active: RwLock<HashMap<InstanceId, Arc<InstanceHandle>>>,
}

/// Durable workflow engine
///
/// Every submitted or resumed instance gets its own driver task that advances
/// it to a terminal status. Transitions are persisted before they take
/// effect, so any instance can be rebuilt from the store with [`resume`].
///
/// [`resume`]: WorkflowEngine::resume
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn TaskRuntime>,
        config: EngineConfig,
    ) -> Self {
        let journal = Arc::new(Journal::new(store, config.persistence_retry.clone()));
        let executor = TaskExecutor::new(runtime);
        let compensation = CompensationEngine::new(
            journal.clone(),
            executor.clone(),
            config.default_task_timeout(),
        );

        Self {
            inner: Arc::new(EngineInner {
                journal,
                executor,
                compensation,
                config,
                definitions: RwLock::new(HashMap::new()),
                active: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validate a definition and cache its graph under name and version
    pub async fn register(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDag>, DefinitionError> {
        let key = definition.key();
        let mut definitions = self.inner.definitions.write().await;

        if let Some(dag) = definitions.get(&key) {
            if dag.definition() == &definition {
                return Ok(dag.clone());
            }
            return Err(DefinitionError::VersionConflict {
                name: key.name,
                version: key.version,
            });
        }

        let dag = Arc::new(WorkflowDag::build(definition)?);
        definitions.insert(key, dag.clone());
        Ok(dag)
    }

    /// Start a new instance of `definition`
    ///
    /// An invalid definition is rejected before anything is persisted.
    pub async fn submit(
        &self,
        definition: WorkflowDefinition,
        input: serde_json::Value,
    ) -> EngineResult<InstanceId> {
        let dag = self.register(definition).await?;

        let instance_id = InstanceId::new();
        let mut state = InstanceState::new(instance_id, dag.clone());
        self.inner
            .journal
            .record(
                &mut state,
                EventType::InstanceCreated {
                    definition: dag.definition().clone(),
                    input,
                },
            )
            .await?;

        tracing::info!(
            "Submitted instance {} of {}",
            instance_id,
            dag.definition().key()
        );

        let mut active = self.inner.active.write().await;
        self.spawn_driver(&mut active, state);

        Ok(instance_id)
    }

    /// Rebuild an instance from its log and drive it to a terminal status
    ///
    /// Resuming an instance that is already being driven waits for it.
    pub async fn resume(&self, instance_id: InstanceId) -> EngineResult<WorkflowStatus> {
        let status = self.drive(instance_id).await?;
        if status.is_terminal() {
            return Ok(status);
        }
        Ok(self.wait(instance_id).await?.status)
    }

    /// Make sure a driver is advancing the instance, without waiting for it
    ///
    /// Returns the status the instance has right now. An instance marked
    /// `RecoveryRequired` is rebuilt from its log.
    pub async fn drive(&self, instance_id: InstanceId) -> EngineResult<WorkflowStatus> {
        let seen = self.inner.active.read().await.get(&instance_id).cloned();
        if let Some(handle) = &seen {
            let status = *handle.status.borrow();
            if status != WorkflowStatus::RecoveryRequired {
                return Ok(status);
            }
        }

        // Replay without holding the engine-wide lock
        let state = self.load(instance_id).await?;
        let status = state.status();
        if status.is_terminal() {
            return Ok(status);
        }

        let mut active = self.inner.active.write().await;
        if let Some(current) = active.get(&instance_id) {
            let replaced = seen.as_ref().is_some_and(|seen| Arc::ptr_eq(seen, current));
            if !replaced {
                // Another caller started a driver while the log was replayed
                return Ok(*current.status.borrow());
            }
        }

        tracing::info!(
            "Resuming instance {} at sequence {} ({:?})",
            instance_id,
            state.instance().last_sequence,
            status
        );
        self.spawn_driver(&mut active, state);
        Ok(status)
    }

    /// Resume every non-terminal instance in the store
    pub async fn recover_all(&self) -> EngineResult<Vec<InstanceId>> {
        let mut resumed = Vec::new();

        for instance_id in self.inner.journal.store().list_instances().await? {
            if self.inner.active.read().await.contains_key(&instance_id) {
                continue;
            }

            let state = match self.load(instance_id).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!("Skipping recovery of instance {}: {}", instance_id, e);
                    continue;
                }
            };
            if state.status().is_terminal() {
                continue;
            }

            let mut active = self.inner.active.write().await;
            if active.contains_key(&instance_id) {
                continue;
            }
            tracing::info!("Recovering instance {} ({:?})", instance_id, state.status());
            self.spawn_driver(&mut active, state);
            resumed.push(instance_id);
        }

        Ok(resumed)
    }

    /// Snapshot of an instance, live if it is being driven
    pub async fn status(&self, instance_id: InstanceId) -> EngineResult<WorkflowInstance> {
        let handle = self.inner.active.read().await.get(&instance_id).cloned();
        let snapshot = match handle {
            Some(handle) => handle.state.lock().await.snapshot(),
            None => self.load(instance_id).await?.snapshot(),
        };
        Ok(snapshot)
    }

    /// Wait until an instance is terminal or needs recovery
    pub async fn wait(&self, instance_id: InstanceId) -> EngineResult<WorkflowInstance> {
        let handle = self.inner.active.read().await.get(&instance_id).cloned();
        let Some(handle) = handle else {
            return self.status(instance_id).await;
        };

        let mut status = handle.status.subscribe();
        // The handle owns the sender, so the channel outlives this wait
        let _ = status
            .wait_for(|s| s.is_terminal() || *s == WorkflowStatus::RecoveryRequired)
            .await;

        let snapshot = handle.state.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Request cancellation: no new dispatch, in-flight tasks drain, then
    /// completed tasks are compensated
    pub async fn cancel(&self, instance_id: InstanceId, reason: impl Into<String>) -> EngineResult<()> {
        let handle = self.inner.active.read().await.get(&instance_id).cloned();
        let Some(handle) = handle else {
            let snapshot = self.status(instance_id).await?;
            if snapshot.status.is_terminal() {
                return Err(EngineError::InvalidState {
                    instance_id,
                    status: snapshot.status,
                    action: "cancel",
                });
            }
            return Err(EngineError::InstanceNotActive(instance_id));
        };

        {
            let mut state = handle.state.lock().await;
            let status = state.status();
            if state.cancel_requested() && !status.is_terminal() {
                return Ok(());
            }
            match status {
                WorkflowStatus::Pending | WorkflowStatus::Running => {}
                status => {
                    return Err(EngineError::InvalidState {
                        instance_id,
                        status,
                        action: "cancel",
                    })
                }
            }

            let reason = reason.into();
            tracing::info!("Cancelling instance {}: {}", instance_id, reason);
            self.inner
                .journal
                .record(&mut state, EventType::CancelRequested { reason })
                .await?;
        }

        handle.cancel.cancel();
        Ok(())
    }

    /// Raw transition log of an instance
    pub async fn events(&self, instance_id: InstanceId) -> EngineResult<Vec<Event>> {
        let events = self.inner.journal.store().load_all(instance_id).await?;
        if events.is_empty() {
            return Err(EngineError::InstanceNotFound(instance_id));
        }
        Ok(events)
    }

    pub async fn list_instances(&self) -> EngineResult<Vec<InstanceId>> {
        Ok(self.inner.journal.store().list_instances().await?)
    }

    /// Replay an instance from the store
    async fn load(&self, instance_id: InstanceId) -> EngineResult<InstanceState> {
        let events = self.inner.journal.store().load_all(instance_id).await?;

        let definition = match events.first().map(|e| &e.event_type) {
            Some(EventType::InstanceCreated { definition, .. }) => definition.clone(),
            Some(other) => {
                return Err(EngineError::CorruptLog {
                    instance_id,
                    reason: format!("log starts with {}", other.name()),
                })
            }
            None => return Err(EngineError::InstanceNotFound(instance_id)),
        };

        let dag = self.dag_for(instance_id, definition).await?;
        InstanceState::replay(instance_id, dag, &events)
    }

    /// Graph for a definition read back from a log
    ///
    /// The log carries its own definition; one that conflicts with the
    /// registered version is still used for this instance.
    async fn dag_for(
        &self,
        instance_id: InstanceId,
        definition: WorkflowDefinition,
    ) -> EngineResult<Arc<WorkflowDag>> {
        let corrupt = |e: DefinitionError| EngineError::CorruptLog {
            instance_id,
            reason: e.to_string(),
        };

        match self.register(definition.clone()).await {
            Ok(dag) => Ok(dag),
            Err(DefinitionError::VersionConflict { .. }) => {
                Ok(Arc::new(WorkflowDag::build(definition).map_err(corrupt)?))
            }
            Err(e) => Err(corrupt(e)),
        }
    }

    fn spawn_driver(
        &self,
        active: &mut HashMap<InstanceId, Arc<InstanceHandle>>,
        state: InstanceState,
    ) {
        let instance_id = state.id();
        let (status, _) = watch::channel(state.status());
        let handle = Arc::new(InstanceHandle {
            state: Arc::new(Mutex::new(state)),
            cancel: CancellationToken::new(),
            status,
        });
        active.insert(instance_id, handle.clone());

        let driver = Driver::new(instance_id, self.inner.clone(), handle.clone());
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let error = match tokio::spawn(driver.run()).await {
                Err(error) if error.is_panic() => error,
                _ => return,
            };
            let message = panic_message(error);
            tracing::error!("Driver of instance {} panicked: {}", instance_id, message);
            let outcome = Err(EngineError::DriverPanicked {
                instance_id,
                message,
            });
            settle(&inner, &handle, instance_id, outcome).await;
        });
    }
}

/// Result of one dispatch
struct Completion {
    task_id: TaskId,
    attempt: u32,
    result: Result<serde_json::Value, TaskExecutionError>,
}

enum Step {
    Continue,
    Wait,
    Compensate,
    Done,
}

/// Advances one instance until it is terminal
struct Driver {
    instance_id: InstanceId,
    inner: Arc<EngineInner>,
    handle: Arc<InstanceHandle>,
    permits: Arc<Semaphore>,
    in_flight: JoinSet<Completion>,
    retry_timers: JoinSet<TaskId>,
    cancel_seen: bool,
}

impl Driver {
    fn new(instance_id: InstanceId, inner: Arc<EngineInner>, handle: Arc<InstanceHandle>) -> Self {
        let permits = Arc::new(Semaphore::new(inner.config.max_in_flight.max(1)));
        Self {
            instance_id,
            inner,
            handle,
            permits,
            in_flight: JoinSet::new(),
            retry_timers: JoinSet::new(),
            cancel_seen: false,
        }
    }

    async fn run(mut self) {
        let outcome = self.drive().await;

        self.retry_timers.abort_all();
        // Runtime calls still in flight are aborted along with their dispatch
        self.in_flight.shutdown().await;

        settle(&self.inner, &self.handle, self.instance_id, outcome).await;
    }

    async fn drive(&mut self) -> EngineResult<()> {
        self.recover().await?;

        loop {
            match self.step().await? {
                Step::Continue => {}
                Step::Wait => self.wait_for_progress().await?,
                Step::Compensate => {
                    self.inner
                        .compensation
                        .compensate(&self.handle.state)
                        .await?
                }
                Step::Done => return Ok(()),
            }
        }
    }

    fn publish(&self, status: WorkflowStatus) {
        self.handle.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    /// Pick up tasks that were in flight when the previous driver stopped
    async fn recover(&mut self) -> EngineResult<()> {
        let mut state = self.handle.state.clone().lock_owned().await;

        match state.status() {
            WorkflowStatus::Running => {
                for task_id in state.tasks_in(TaskStatus::Running) {
                    if state.cancel_requested() {
                        self.fail_interrupted(&mut state, task_id).await?;
                    } else {
                        tracing::info!("Re-dispatching interrupted task {}", task_id);
                        self.inner
                            .journal
                            .record(&mut state, EventType::TaskInterrupted { task_id })
                            .await?;
                    }
                }

                for task_id in state.tasks_in(TaskStatus::Retrying) {
                    let retry_at = state.task(&task_id).and_then(|t| t.retry_at);
                    let delay = retry_at
                        .and_then(|at| (at - Utc::now()).to_std().ok())
                        .unwrap_or(Duration::ZERO);
                    self.arm_retry(task_id, delay);
                }

                for task_id in state.tasks_in(TaskStatus::Failed) {
                    let Some(task) = state.task(&task_id) else {
                        continue;
                    };
                    let attempt = task.attempt;
                    let error = task.last_error.clone().unwrap_or_else(|| {
                        TaskExecutionError::new(kind::INTERRUPTED, "failure without error")
                    });
                    self.decide(&mut state, &task_id, attempt, error).await?;
                }
            }
            WorkflowStatus::Compensating => {
                for task_id in state.tasks_in(TaskStatus::Running) {
                    self.fail_interrupted(&mut state, task_id).await?;
                }
                self.settle_for_compensation(&mut state).await?;
            }
            _ => {}
        }

        Ok(())
    }

    async fn fail_interrupted(&mut self, state: &mut InstanceState, task_id: TaskId) -> EngineResult<()> {
        let attempt = state.task(&task_id).map(|t| t.attempt).unwrap_or(0);
        tracing::warn!("Task {} was interrupted and will not be re-run", task_id);
        self.inner
            .journal
            .record(
                state,
                EventType::TaskFailed {
                    task_id,
                    attempt,
                    error: TaskExecutionError::new(
                        kind::INTERRUPTED,
                        "dispatch was in flight when the engine stopped",
                    ),
                },
            )
            .await
    }

    async fn step(&mut self) -> EngineResult<Step> {
        let mut state = self.handle.state.clone().lock_owned().await;
        let step = self.advance(&mut state).await;
        self.publish(state.status());
        step
    }

    async fn advance(&mut self, state: &mut InstanceState) -> EngineResult<Step> {
        match state.status() {
            WorkflowStatus::Pending => {
                self.inner
                    .journal
                    .record(state, EventType::InstanceStarted)
                    .await?;
                tracing::info!("Instance {} started", state.id());
                Ok(Step::Continue)
            }
            WorkflowStatus::Running if state.cancel_requested() => {
                self.abandon_retry_timers();
                if !self.in_flight.is_empty() {
                    return Ok(Step::Wait);
                }

                let reason = state.cancel_reason().unwrap_or("cancelled").to_string();
                self.enter_compensation(state, CompensationReason::Cancelled { reason })
                    .await?;
                Ok(Step::Continue)
            }
            WorkflowStatus::Running => {
                let ready = state.dag().ready_set(state.tasks());
                for task_id in ready {
                    self.inner
                        .journal
                        .record(state, EventType::TaskReady { task_id })
                        .await?;
                }

                for task_id in state.tasks_in(TaskStatus::Ready) {
                    let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                        break;
                    };
                    self.dispatch(state, task_id, permit).await?;
                }

                if state.all_tasks_settled() {
                    self.inner
                        .journal
                        .record(state, EventType::InstanceSucceeded)
                        .await?;
                    tracing::info!("Instance {} succeeded", state.id());
                    return Ok(Step::Done);
                }

                if self.in_flight.is_empty() && self.retry_timers.is_empty() {
                    return Err(EngineError::Stalled(state.id()));
                }

                Ok(Step::Wait)
            }
            WorkflowStatus::Compensating => {
                if !self.in_flight.is_empty() {
                    return Ok(Step::Wait);
                }
                Ok(Step::Compensate)
            }
            WorkflowStatus::Succeeded
            | WorkflowStatus::Failed
            | WorkflowStatus::Compensated
            | WorkflowStatus::RecoveryRequired => Ok(Step::Done),
        }
    }

    async fn wait_for_progress(&mut self) -> EngineResult<()> {
        let cancel = self.handle.cancel.clone();

        tokio::select! {
            Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                self.on_completion(joined).await
            }
            Some(fired) = self.retry_timers.join_next(), if !self.retry_timers.is_empty() => {
                self.on_retry_timer(fired).await
            }
            _ = cancel.cancelled(), if !self.cancel_seen => {
                self.cancel_seen = true;
                Ok(())
            }
            else => Ok(()),
        }
    }

    async fn dispatch(
        &mut self,
        state: &mut InstanceState,
        task_id: TaskId,
        permit: OwnedSemaphorePermit,
    ) -> EngineResult<()> {
        let spec = state
            .dag()
            .task(&task_id)
            .cloned()
            .ok_or_else(|| EngineError::CorruptLog {
                instance_id: state.id(),
                reason: format!("task {} is not part of the definition", task_id),
            })?;

        let attempt = state.task(&task_id).map(|t| t.attempt).unwrap_or(0);
        let limit = spec
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.inner.config.default_task_timeout());
        let deadline = deadline_after(limit);
        let input = state.task_input(&task_id);

        self.inner
            .journal
            .record(
                state,
                EventType::TaskStarted {
                    task_id: task_id.clone(),
                    attempt,
                    deadline,
                },
            )
            .await?;

        tracing::info!(
            "Dispatching task {} of instance {} (attempt {})",
            task_id,
            state.id(),
            attempt
        );

        let executor = self.inner.executor.clone();
        self.in_flight.spawn(async move {
            let result = executor.execute(&spec, input, limit, deadline).await;
            drop(permit);
            Completion {
                task_id,
                attempt,
                result,
            }
        });

        Ok(())
    }

    async fn on_completion(&mut self, joined: Result<Completion, JoinError>) -> EngineResult<()> {
        let completion = match joined {
            Ok(completion) => completion,
            Err(e) => {
                // Only reachable if the dispatch future itself was torn down
                tracing::error!("Dispatch of instance {} was lost: {}", self.instance_id, e);
                return Ok(());
            }
        };

        let mut state = self.handle.state.clone().lock_owned().await;
        let Completion {
            task_id,
            attempt,
            result,
        } = completion;

        match result {
            Ok(output) => {
                tracing::info!("Task {} of instance {} succeeded", task_id, state.id());
                self.inner
                    .journal
                    .record(&mut state, EventType::TaskSucceeded { task_id, output })
                    .await
            }
            Err(error) => {
                tracing::warn!(
                    "Task {} of instance {} failed on attempt {}: {}",
                    task_id,
                    state.id(),
                    attempt,
                    error
                );
                self.inner
                    .journal
                    .record(
                        &mut state,
                        EventType::TaskFailed {
                            task_id: task_id.clone(),
                            attempt,
                            error: error.clone(),
                        },
                    )
                    .await?;
                self.decide(&mut state, &task_id, attempt, error).await
            }
        }
    }

    /// Consult the retry policy for a failed task
    async fn decide(
        &mut self,
        state: &mut InstanceState,
        task_id: &TaskId,
        attempt: u32,
        error: TaskExecutionError,
    ) -> EngineResult<()> {
        // Once compensating or cancelled the failure simply stands
        if state.status() != WorkflowStatus::Running || state.cancel_requested() {
            return Ok(());
        }

        let dag = state.dag().clone();
        match RetryManager::new(&dag).decide(task_id, attempt, &error) {
            RetryDecision::Retry { delay } => {
                let retry_at = deadline_after(delay);
                tracing::info!(
                    "Retrying task {} of instance {} in {:?} (attempt {})",
                    task_id,
                    state.id(),
                    delay,
                    attempt + 1
                );
                self.inner
                    .journal
                    .record(
                        state,
                        EventType::TaskRetrying {
                            task_id: task_id.clone(),
                            attempt: attempt + 1,
                            retry_at,
                        },
                    )
                    .await?;
                self.arm_retry(task_id.clone(), delay);
                Ok(())
            }
            RetryDecision::FailFast => {
                tracing::warn!(
                    "Task {} of instance {} failed permanently, compensating",
                    task_id,
                    state.id()
                );
                self.enter_compensation(
                    state,
                    CompensationReason::TaskFailed {
                        task_id: task_id.clone(),
                        error,
                    },
                )
                .await
            }
        }
    }

    fn arm_retry(&mut self, task_id: TaskId, delay: Duration) {
        self.retry_timers.spawn(async move {
            tokio::time::sleep(delay).await;
            task_id
        });
    }

    fn abandon_retry_timers(&mut self) {
        // Dropping the set aborts its timers
        self.retry_timers = JoinSet::new();
    }

    async fn on_retry_timer(&mut self, fired: Result<TaskId, JoinError>) -> EngineResult<()> {
        // Aborted timers belong to abandoned retries
        let Ok(task_id) = fired else {
            return Ok(());
        };

        let mut state = self.handle.state.clone().lock_owned().await;
        let retrying = state
            .task(&task_id)
            .is_some_and(|t| t.status == TaskStatus::Retrying);

        if retrying && state.status() == WorkflowStatus::Running && !state.cancel_requested() {
            self.inner
                .journal
                .record(&mut state, EventType::TaskReady { task_id })
                .await?;
        }

        Ok(())
    }

    async fn enter_compensation(
        &mut self,
        state: &mut InstanceState,
        reason: CompensationReason,
    ) -> EngineResult<()> {
        self.abandon_retry_timers();
        self.inner
            .journal
            .record(state, EventType::CompensationStarted { reason })
            .await?;
        tracing::info!("Instance {} is compensating", state.id());

        self.settle_for_compensation(state).await?;
        self.publish(state.status());
        Ok(())
    }

    /// Close out every task that will never run: pending tasks are skipped
    /// and pending retries abandoned
    async fn settle_for_compensation(&mut self, state: &mut InstanceState) -> EngineResult<()> {
        let mut pending = state.tasks_in(TaskStatus::Blocked);
        pending.extend(state.tasks_in(TaskStatus::Ready));
        pending.sort();

        for task_id in pending {
            self.inner
                .journal
                .record(
                    state,
                    EventType::TaskSkipped {
                        task_id,
                        reason: "instance is compensating".to_string(),
                    },
                )
                .await?;
        }

        for task_id in state.tasks_in(TaskStatus::Retrying) {
            self.inner
                .journal
                .record(state, EventType::RetryAbandoned { task_id })
                .await?;
        }

        Ok(())
    }
}

/// Record how driving ended and publish the final status
async fn settle(
    inner: &EngineInner,
    handle: &InstanceHandle,
    instance_id: InstanceId,
    outcome: EngineResult<()>,
) {
    let status = {
        let mut state = handle.state.lock().await;

        match outcome {
            Ok(()) => {}
            Err(EngineError::Persistence(err)) => {
                tracing::error!(
                    "Instance {} can no longer be persisted, recovery required: {}",
                    instance_id,
                    err
                );
                state.mark_recovery_required(err.to_string());
            }
            Err(err) => {
                tracing::error!("Instance {} failed: {}", instance_id, err);
                let failed = EventType::InstanceFailed {
                    reason: err.to_string(),
                };
                if let Err(e) = inner.journal.record(&mut state, failed).await {
                    tracing::error!("Could not record failure of instance {}: {}", instance_id, e);
                    state.mark_recovery_required(e.to_string());
                }
            }
        }

        state.status()
    };

    if status.is_terminal() && inner.config.archive_completed {
        match inner.journal.store().archive(instance_id).await {
            Ok(()) => tracing::debug!("Archived log of instance {}", instance_id),
            Err(e) => tracing::warn!("Could not archive log of instance {}: {}", instance_id, e),
        }
    }

    tracing::info!("Instance {} finished driving with status {:?}", instance_id, status);
    handle.status.send_replace(status);

    if status.is_terminal() {
        inner.active.write().await.remove(&instance_id);
    }
}

fn panic_message(error: JoinError) -> String {
    let payload = error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

fn deadline_after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use crate::retry::RetryPolicy;
    use crate::storage::MemoryStateStore;
    use crate::testing::{FlakyStore, ScriptedRuntime, Step};
    use serde_json::json;
    use tokio::sync::{Barrier, Notify};

    fn engine(store: Arc<dyn StateStore>, runtime: &Arc<ScriptedRuntime>) -> WorkflowEngine {
        WorkflowEngine::new(store, runtime.clone(), EngineConfig::default())
    }

    fn task(id: &str) -> TaskId {
        TaskId::new(id)
    }

    fn event_names(events: &[Event]) -> Vec<&'static str> {
        events.iter().map(|e| e.event_type.name()).collect()
    }

    #[tokio::test]
    async fn test_linear_workflow_succeeds() {
        let runtime = ScriptedRuntime::new();
        let engine = engine(Arc::new(MemoryStateStore::new()), &runtime);

        let definition = WorkflowDefinition::new(
            "pipeline",
            1,
            vec![
                TaskSpec::new("extract"),
                TaskSpec::new("transform").depends_on(["extract"]),
                TaskSpec::new("load").depends_on(["transform"]),
            ],
        );
        let id = engine.submit(definition, json!({"batch": 1})).await.unwrap();
        let instance = engine.wait(id).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::Succeeded);
        assert_eq!(runtime.executed(), vec!["extract", "transform", "load"]);
        assert_eq!(
            instance.tasks[&task("load")].output,
            Some(json!({"task": "load"}))
        );
        assert!(instance.compensations.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_failure_compensates_in_reverse_order() {
        let runtime = ScriptedRuntime::new();
        runtime.script("d", [Step::fail("validation")]);
        let engine = engine(Arc::new(MemoryStateStore::new()), &runtime);

        let definition = WorkflowDefinition::new(
            "saga",
            1,
            vec![
                TaskSpec::new("a").compensate_with("undo-a"),
                TaskSpec::new("b").depends_on(["a"]).compensate_with("undo-b"),
                TaskSpec::new("c").depends_on(["b"]).compensate_with("undo-c"),
                TaskSpec::new("d").depends_on(["c"]).compensate_with("undo-d"),
            ],
        );
        let id = engine.submit(definition, json!(null)).await.unwrap();
        let instance = engine.wait(id).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::Compensated);
        assert_eq!(runtime.compensated(), vec!["c", "b", "a"]);
        assert_eq!(instance.tasks[&task("d")].status, TaskStatus::Failed);
        assert!(!instance.compensations.contains_key(&task("d")));
        assert!(matches!(
            instance.compensation_reason,
            Some(CompensationReason::TaskFailed { ref task_id, .. }) if *task_id == task("d")
        ));
    }

    #[tokio::test]
    async fn test_parallel_branch_failure() {
        let runtime = ScriptedRuntime::new();
        // Both branches must be running at once to pass the barrier
        let barrier = Arc::new(Barrier::new(2));
        runtime.script(
            "x",
            [Step::Barrier(
                barrier.clone(),
                Err(TaskExecutionError::new("validation", "bad input")),
            )],
        );
        runtime.script("y", [Step::Barrier(barrier, Ok(json!("y-done")))]);
        let engine = engine(Arc::new(MemoryStateStore::new()), &runtime);

        let definition = WorkflowDefinition::new(
            "fanout",
            1,
            vec![
                TaskSpec::new("r").compensate_with("undo-r"),
                TaskSpec::new("x").depends_on(["r"]).compensate_with("undo-x"),
                TaskSpec::new("y").depends_on(["r"]).compensate_with("undo-y"),
            ],
        );
        let id = engine.submit(definition, json!(null)).await.unwrap();
        let instance = engine.wait(id).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::Compensated);
        assert_eq!(instance.tasks[&task("x")].status, TaskStatus::Failed);
        assert_eq!(instance.tasks[&task("y")].status, TaskStatus::Compensated);
        assert_eq!(instance.tasks[&task("r")].status, TaskStatus::Compensated);
        assert_eq!(runtime.compensated(), vec!["y", "r"]);
        assert!(!instance.compensations.contains_key(&task("x")));
        assert_eq!(runtime.compensation_input("y"), Some(json!("y-done")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_with_next_attempt() {
        let runtime = ScriptedRuntime::new();
        runtime.script("slow", [Step::Hang, Step::Succeed(json!("finally"))]);
        let engine = engine(Arc::new(MemoryStateStore::new()), &runtime);

        let definition = WorkflowDefinition::new(
            "timeouts",
            1,
            vec![TaskSpec::new("slow")
                .timeout_ms(100)
                .retry(RetryPolicy::fixed(1, 1_000))],
        );
        let id = engine.submit(definition, json!(null)).await.unwrap();
        let instance = engine.wait(id).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::Succeeded);
        assert_eq!(runtime.executions_of("slow"), 2);

        let events = engine.events(id).await.unwrap();
        let task_events: Vec<&EventType> = events
            .iter()
            .map(|e| &e.event_type)
            .filter(|t| t.task_id().is_some())
            .collect();

        assert!(matches!(
            task_events[2],
            EventType::TaskFailed { attempt: 0, error, .. } if error.is_timeout()
        ));
        assert!(matches!(task_events[3], EventType::TaskRetrying { attempt: 1, .. }));
        assert!(matches!(task_events[4], EventType::TaskReady { .. }));
        assert!(matches!(task_events[5], EventType::TaskStarted { attempt: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_after_max_attempts() {
        let runtime = ScriptedRuntime::new();
        runtime.script("flaky", [Step::fail("io")]);
        let engine = engine(Arc::new(MemoryStateStore::new()), &runtime);

        let definition = WorkflowDefinition::new(
            "retries",
            1,
            vec![TaskSpec::new("flaky").retry(RetryPolicy::exponential(3, 10, 100))],
        );
        let id = engine.submit(definition, json!(null)).await.unwrap();
        let instance = engine.wait(id).await.unwrap();

        assert_eq!(runtime.executions_of("flaky"), 4);
        assert_eq!(instance.status, WorkflowStatus::Compensated);
        let flaky = &instance.tasks[&task("flaky")];
        assert_eq!(flaky.status, TaskStatus::Failed);
        assert_eq!(flaky.attempt, 3);
        assert_eq!(flaky.last_error.as_ref().unwrap().kind, "io");
    }

    #[tokio::test]
    async fn test_cancel_drains_then_compensates() {
        let runtime = ScriptedRuntime::new();
        let gate = Arc::new(Notify::new());
        runtime.script("charge", [Step::Gate(gate.clone(), json!("charged"))]);
        let engine = engine(Arc::new(MemoryStateStore::new()), &runtime);

        let definition = WorkflowDefinition::new(
            "checkout",
            1,
            vec![
                TaskSpec::new("charge").compensate_with("refund"),
                TaskSpec::new("ship").depends_on(["charge"]),
            ],
        );
        let id = engine.submit(definition, json!(null)).await.unwrap();

        while runtime.executions_of("charge") == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        engine.cancel(id, "customer changed their mind").await.unwrap();
        gate.notify_one();

        let instance = engine.wait(id).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Compensated);
        assert!(instance.cancel_requested);
        assert_eq!(instance.tasks[&task("charge")].status, TaskStatus::Compensated);
        assert_eq!(instance.tasks[&task("ship")].status, TaskStatus::Skipped);
        assert_eq!(runtime.executed(), vec!["charge"]);
        assert_eq!(runtime.compensated(), vec!["charge"]);
        assert_eq!(
            instance.compensation_reason,
            Some(CompensationReason::Cancelled {
                reason: "customer changed their mind".into()
            })
        );

        assert!(matches!(
            engine.cancel(id, "again").await,
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_compensation_still_completes() {
        let runtime = ScriptedRuntime::new();
        runtime.script("notify", [Step::fail("validation")]);
        runtime.fail_compensation("book", TaskExecutionError::new("io", "hotel api down"));
        let engine = engine(Arc::new(MemoryStateStore::new()), &runtime);

        let definition = WorkflowDefinition::new(
            "travel",
            1,
            vec![
                TaskSpec::new("book").compensate_with("cancel-booking"),
                TaskSpec::new("notify").depends_on(["book"]),
            ],
        );
        let id = engine.submit(definition, json!(null)).await.unwrap();
        let instance = engine.wait(id).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::Compensated);
        let report = instance.compensation_report();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].task_id, task("book"));
        assert_eq!(report.failures[0].error.message, "hotel api down");
    }

    #[tokio::test]
    async fn test_invalid_definition_persists_nothing() {
        let runtime = ScriptedRuntime::new();
        let store = Arc::new(MemoryStateStore::new());
        let engine = engine(store.clone(), &runtime);

        let cyclic = WorkflowDefinition::new(
            "loop",
            1,
            vec![
                TaskSpec::new("a").depends_on(["b"]),
                TaskSpec::new("b").depends_on(["a"]),
            ],
        );
        let err = engine.submit(cyclic, json!(null)).await.unwrap_err();

        assert!(matches!(
            err,
            EngineError::Definition(DefinitionError::CyclicDependency { .. })
        ));
        assert!(store.list_instances().await.unwrap().is_empty());
        assert!(runtime.executed().is_empty());
    }

    #[tokio::test]
    async fn test_version_conflict_rejected() {
        let runtime = ScriptedRuntime::new();
        let engine = engine(Arc::new(MemoryStateStore::new()), &runtime);

        let v1 = WorkflowDefinition::new("report", 1, vec![TaskSpec::new("render")]);
        engine.register(v1.clone()).await.unwrap();
        engine.register(v1).await.unwrap();

        let changed = WorkflowDefinition::new("report", 1, vec![TaskSpec::new("print")]);
        assert_eq!(
            engine.register(changed).await.unwrap_err(),
            DefinitionError::VersionConflict {
                name: "report".into(),
                version: 1
            }
        );
    }

    #[tokio::test]
    async fn test_in_flight_bound() {
        let runtime = ScriptedRuntime::new();
        let ids: Vec<String> = (0..6).map(|i| format!("shard-{}", i)).collect();
        for id in &ids {
            runtime.script(id, [Step::Delay(Duration::from_millis(20), json!(id))]);
        }
        let engine = WorkflowEngine::new(
            Arc::new(MemoryStateStore::new()),
            runtime.clone(),
            EngineConfig::default().with_max_in_flight(2),
        );

        let definition = WorkflowDefinition::new(
            "shards",
            1,
            ids.iter().map(|id| TaskSpec::new(id.as_str())).collect(),
        );
        let id = engine.submit(definition, json!(null)).await.unwrap();
        let instance = engine.wait(id).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::Succeeded);
        assert_eq!(runtime.executed().len(), 6);
        assert_eq!(runtime.max_running(), 2);
    }

    #[tokio::test]
    async fn test_upstream_outputs_reach_dependents() {
        struct EchoRuntime;

        #[async_trait::async_trait]
        impl TaskRuntime for EchoRuntime {
            async fn execute(
                &self,
                task: &TaskSpec,
                input: &TaskInput,
                _deadline: DateTime<Utc>,
            ) -> Result<serde_json::Value, TaskExecutionError> {
                Ok(json!({
                    "task": task.id,
                    "workflow": input.workflow,
                    "upstream": input.upstream,
                }))
            }

            async fn compensate(
                &self,
                _task: &TaskSpec,
                _action: &str,
                _original_output: &serde_json::Value,
            ) -> Result<(), TaskExecutionError> {
                Ok(())
            }
        }

        let engine = WorkflowEngine::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(EchoRuntime),
            EngineConfig::default(),
        );
        let definition = WorkflowDefinition::new(
            "echo",
            1,
            vec![TaskSpec::new("first"), TaskSpec::new("second").depends_on(["first"])],
        );
        let id = engine.submit(definition, json!({"seed": 9})).await.unwrap();
        let instance = engine.wait(id).await.unwrap();

        let second = instance.tasks[&task("second")].output.clone().unwrap();
        assert_eq!(second["workflow"], json!({"seed": 9}));
        assert_eq!(second["upstream"]["first"]["task"], json!("first"));
    }

    /// Write the log of an instance that crashed while `b` was running
    async fn crashed_instance(store: Arc<dyn StateStore>) -> InstanceId {
        let dag = Arc::new(
            WorkflowDag::build(WorkflowDefinition::new(
                "crash",
                1,
                vec![
                    TaskSpec::new("a").compensate_with("undo-a"),
                    TaskSpec::new("b").depends_on(["a"]),
                    TaskSpec::new("c").depends_on(["b"]),
                ],
            ))
            .unwrap(),
        );
        let journal = Journal::new(store, RetryPolicy::none());
        let mut state = InstanceState::new(InstanceId::new(), dag.clone());

        let transitions = vec![
            EventType::InstanceCreated {
                definition: dag.definition().clone(),
                input: json!(null),
            },
            EventType::InstanceStarted,
            EventType::TaskReady { task_id: task("a") },
            EventType::TaskStarted {
                task_id: task("a"),
                attempt: 0,
                deadline: Utc::now(),
            },
            EventType::TaskSucceeded {
                task_id: task("a"),
                output: json!("a-out"),
            },
            EventType::TaskReady { task_id: task("b") },
            EventType::TaskStarted {
                task_id: task("b"),
                attempt: 0,
                deadline: Utc::now(),
            },
        ];
        for transition in transitions {
            journal.record(&mut state, transition).await.unwrap();
        }

        state.id()
    }

    #[tokio::test]
    async fn test_resume_redispatches_only_interrupted_tasks() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let id = crashed_instance(store.clone()).await;

        let runtime = ScriptedRuntime::new();
        let engine = engine(store, &runtime);

        assert_eq!(engine.resume(id).await.unwrap(), WorkflowStatus::Succeeded);
        assert_eq!(runtime.executed(), vec!["b", "c"]);

        let names = event_names(&engine.events(id).await.unwrap());
        assert!(names.contains(&"task_interrupted"));
        assert_eq!(names.last(), Some(&"instance_succeeded"));
    }

    #[tokio::test]
    async fn test_replay_is_deterministic() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let runtime = ScriptedRuntime::new();
        runtime.script("b", [Step::fail("validation")]);

        let definition = WorkflowDefinition::new(
            "replay",
            1,
            vec![
                TaskSpec::new("a").compensate_with("undo-a"),
                TaskSpec::new("b").depends_on(["a"]),
            ],
        );
        let live = engine(store.clone(), &runtime);
        let id = live.submit(definition, json!(null)).await.unwrap();
        live.wait(id).await.unwrap();

        // A fresh engine reads the instance back from the log only
        let fresh = engine(store, &runtime);
        let first = fresh.status(id).await.unwrap();
        let second = fresh.status(id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.status, WorkflowStatus::Compensated);

        assert_eq!(fresh.resume(id).await.unwrap(), WorkflowStatus::Compensated);
        assert_eq!(runtime.compensated(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_store_failures_are_retried() {
        let store = FlakyStore::new();
        let runtime = ScriptedRuntime::new();
        let engine = WorkflowEngine::new(
            store.clone(),
            runtime.clone(),
            EngineConfig::default().with_persistence_retry(RetryPolicy::fixed(3, 5)),
        );

        store.fail_next(3);
        let definition = WorkflowDefinition::new("durable", 1, vec![TaskSpec::new("only")]);
        let id = engine.submit(definition, json!(null)).await.unwrap();
        let instance = engine.wait(id).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::Succeeded);
        assert_eq!(
            store.attempts(),
            store.load_all(id).await.unwrap().len() + 3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_requires_recovery() {
        let store = FlakyStore::new();
        let runtime = ScriptedRuntime::new();
        let engine = WorkflowEngine::new(
            store.clone(),
            runtime.clone(),
            EngineConfig::default().with_persistence_retry(RetryPolicy::fixed(2, 5)),
        );

        // Created and started are persisted, nothing after that
        store.fail_after(2);
        let definition = WorkflowDefinition::new(
            "outage",
            1,
            vec![TaskSpec::new("first"), TaskSpec::new("second").depends_on(["first"])],
        );
        let id = engine.submit(definition, json!(null)).await.unwrap();
        let instance = engine.wait(id).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::RecoveryRequired);
        assert!(instance.error.unwrap().contains("injected failure"));
        assert_eq!(store.load_all(id).await.unwrap().len(), 2);

        store.heal();
        assert_eq!(engine.resume(id).await.unwrap(), WorkflowStatus::Succeeded);
        assert_eq!(engine.status(id).await.unwrap().status, WorkflowStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_resume_after_outage_never_runs_a_task_twice_at_once() {
        let store = FlakyStore::new();
        let runtime = ScriptedRuntime::new();
        let gate = Arc::new(Notify::new());
        runtime.script("ship", [Step::Gate(gate.clone(), json!("shipped"))]);
        let engine = WorkflowEngine::new(
            store.clone(),
            runtime.clone(),
            EngineConfig::default().with_persistence_retry(RetryPolicy::none()),
        );

        // Created, started, two ready and two dispatches; the success of
        // "bill" is the first append that fails
        store.fail_after(6);
        let definition = WorkflowDefinition::new(
            "fulfil",
            1,
            vec![TaskSpec::new("bill"), TaskSpec::new("ship")],
        );
        let id = engine.submit(definition, json!(null)).await.unwrap();
        let instance = engine.wait(id).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::RecoveryRequired);
        assert_eq!(instance.tasks[&task("ship")].status, TaskStatus::Running);

        store.heal();
        engine.drive(id).await.unwrap();
        while runtime.executions_of("ship") < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        gate.notify_one();

        let instance = engine.wait(id).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Succeeded);
        assert_eq!(runtime.executions_of("ship"), 2);
        assert_eq!(runtime.max_concurrent_of("ship"), 1);
    }

    #[tokio::test]
    async fn test_replay_does_not_block_other_instances() {
        let store = FlakyStore::new();
        let runtime = ScriptedRuntime::new();
        let gate = Arc::new(Notify::new());
        runtime.script("hold", [Step::Gate(gate.clone(), json!("held"))]);
        let engine = engine(store.clone(), &runtime);

        let running = engine
            .submit(
                WorkflowDefinition::new("busy", 1, vec![TaskSpec::new("hold")]),
                json!(null),
            )
            .await
            .unwrap();
        let crashed = crashed_instance(store.clone()).await;

        store.hold_loads();
        let resuming = tokio::spawn({
            let engine = engine.clone();
            async move { engine.drive(crashed).await }
        });
        while store.loads_waiting() == 0 {
            tokio::task::yield_now().await;
        }

        let snapshot = tokio::time::timeout(Duration::from_secs(5), engine.status(running))
            .await
            .expect("status blocked behind a replay")
            .unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Running);

        store.release_loads();
        resuming.await.unwrap().unwrap();
        while runtime.executions_of("hold") == 0 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        assert_eq!(engine.wait(crashed).await.unwrap().status, WorkflowStatus::Succeeded);
        assert_eq!(engine.wait(running).await.unwrap().status, WorkflowStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extreme_retry_jitter_still_terminates() {
        let runtime = ScriptedRuntime::new();
        runtime.script("flaky", [Step::fail("io"), Step::Succeed(json!("ok"))]);
        let engine = engine(Arc::new(MemoryStateStore::new()), &runtime);

        let flaky = TaskSpec::new("flaky").retry(RetryPolicy {
            max_attempts: 1,
            backoff: crate::retry::Backoff::Fixed {
                delay_ms: 0,
                jitter_ms: u64::MAX,
            },
            ..RetryPolicy::none()
        });
        let definition = WorkflowDefinition::new("jitter", 1, vec![flaky]);

        let id = engine.submit(definition, json!(null)).await.unwrap();
        let instance = engine.wait(id).await.unwrap();

        assert_eq!(instance.status, WorkflowStatus::Succeeded);
        assert_eq!(runtime.executions_of("flaky"), 2);
    }

    #[tokio::test]
    async fn test_completed_instances_are_archived() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(
            crate::storage::JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap(),
        );
        let runtime = ScriptedRuntime::new();
        let engine = WorkflowEngine::new(
            store.clone(),
            runtime.clone(),
            EngineConfig::default().with_archive_completed(true),
        );

        let definition = WorkflowDefinition::new(
            "nightly",
            1,
            vec![TaskSpec::new("dump"), TaskSpec::new("upload").depends_on(["dump"])],
        );
        let id = engine.submit(definition, json!(null)).await.unwrap();
        assert_eq!(engine.wait(id).await.unwrap().status, WorkflowStatus::Succeeded);

        let live = temp_dir
            .path()
            .join("instances")
            .join(format!("{}.jsonl", id));
        assert!(!live.exists());
        assert!(temp_dir.path().join("archive").exists());

        let events = engine.events(id).await.unwrap();
        assert_eq!(event_names(&events).last(), Some(&"instance_succeeded"));
        assert_eq!(store.list_instances().await.unwrap(), vec![id]);
        assert_eq!(engine.drive(id).await.unwrap(), WorkflowStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let runtime = ScriptedRuntime::new();
        let engine = engine(Arc::new(MemoryStateStore::new()), &runtime);
        let missing = InstanceId::new();

        assert!(matches!(
            engine.status(missing).await,
            Err(EngineError::InstanceNotFound(id)) if id == missing
        ));
        assert!(matches!(
            engine.resume(missing).await,
            Err(EngineError::InstanceNotFound(_))
        ));
        assert!(matches!(
            engine.events(missing).await,
            Err(EngineError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_recover_all_resumes_unfinished_instances() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let id = crashed_instance(store.clone()).await;

        let runtime = ScriptedRuntime::new();
        let engine = engine(store, &runtime);

        assert_eq!(engine.recover_all().await.unwrap(), vec![id]);
        assert_eq!(engine.wait(id).await.unwrap().status, WorkflowStatus::Succeeded);
        assert!(engine.recover_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_persistence_error_is_transparent() {
        let err = EngineError::from(PersistenceError::Unavailable("down".into()));
        assert_eq!(err.to_string(), "state store unavailable: down");
    }
}
