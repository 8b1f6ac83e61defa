//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Starting new workflow runs
//! - Processing workflow and timer tasks by replaying history
//! - Recording activity outcomes (idempotently) and scheduling retries
//! - Appending external events: signals and cancellation requests
//! - Answering read-only queries

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::{self, NonDeterminismError, Replay, ReplayError};
use crate::activity::ActivityError;
use crate::persistence::{
    chrono_duration, ActivityInvocation, ClaimedTask, ExpiryReason, HistoryCommit, InstanceClose,
    InstanceId, NewInstance, StoreError, TaskDefinition, TaskKind, WorkflowEventStore,
    WorkflowInfo, WorkflowStatus, EXECUTION_TIMEOUT_TIMER_ID,
};
use crate::workflow::{
    engine_codes, HistoryEvent, TimeoutType, WorkflowCommand, WorkflowError, WorkflowEvent,
    WorkflowSignal,
};

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Times a commit is replayed after losing an optimistic append
    pub max_conflict_retries: usize,

    /// Runs whose history reaches this length are failed
    pub max_history_events: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 16,
            max_history_events: 10_000,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_conflict_retries(mut self, retries: usize) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_max_history_events(mut self, events: usize) -> Self {
        self.max_history_events = events;
        self
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// History diverged from the workflow code; the run has been failed
    #[error(transparent)]
    NonDeterminism(#[from] NonDeterminismError),

    /// Workflow id has no run
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Run is closed and accepts no more events
    #[error("workflow {instance} is closed ({status})")]
    WorkflowClosed {
        instance: InstanceId,
        status: WorkflowStatus,
    },

    /// Workflow does not answer this query
    #[error("unknown query: {0}")]
    UnknownQuery(String),

    /// Task handed to the wrong entry point
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("corrupt history: {0}")]
    CorruptHistory(String),

    /// Kept losing the optimistic append
    #[error("gave up on {0} after repeated history conflicts")]
    ConflictRetriesExhausted(InstanceId),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ReplayError> for ExecutorError {
    fn from(err: ReplayError) -> Self {
        match err {
            ReplayError::NonDeterminism(e) => Self::NonDeterminism(e),
            ReplayError::Registry(e) => Self::Registry(e),
            ReplayError::CorruptHistory(msg) => Self::CorruptHistory(msg),
        }
    }
}

/// Options for starting a workflow run
#[derive(Debug, Clone)]
pub struct StartWorkflowOptions {
    pub task_queue: String,
    /// Run is timed out when still open after this long
    pub execution_timeout: Option<Duration>,
}

impl StartWorkflowOptions {
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            execution_timeout: None,
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

/// Result of processing a workflow or timer task
#[derive(Debug, Default)]
pub struct ProcessResult {
    /// Number of new events written
    pub events_written: usize,

    /// Number of tasks enqueued
    pub tasks_enqueued: usize,

    /// Events applied from already-recorded history
    pub replayed: usize,

    /// Status if the run is closed after this task
    pub closed: Option<WorkflowStatus>,
}

/// What happened to a reported activity outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    /// Outcome appended to history; the workflow resumes
    Recorded,
    /// Attempt failed with attempts left; the task is queued again
    RetryScheduled(Duration),
    /// The activity was already settled or its run closed; nothing recorded
    Duplicate,
}

/// Workflow executor
///
/// Drives workflow state machines by replaying history and committing the
/// commands that come out past its end. Every write goes through one
/// [`HistoryCommit`] guarded by the expected next sequence; on a conflict the
/// executor rereads and replays.
///
/// # Example
///
/// ```ignore
/// use keel_durable::prelude::*;
///
/// let store = Arc::new(InMemoryWorkflowEventStore::new());
/// let mut registry = WorkflowRegistry::new();
/// registry.register::<GreetingWorkflow>()?;
/// let executor = WorkflowExecutor::new(store, registry);
///
/// let run_id = executor
///     .start_workflow("GreetingWorkflow", "greet-1", json!("Temporal"), StartWorkflowOptions::new("greetings"))
///     .await?;
/// ```
pub struct WorkflowExecutor<S: WorkflowEventStore + ?Sized = dyn WorkflowEventStore> {
    store: Arc<S>,
    registry: WorkflowRegistry,
    config: ExecutorConfig,
}

impl<S: WorkflowEventStore + ?Sized> WorkflowExecutor<S> {
    /// Create a new executor with default configuration
    pub fn new(store: Arc<S>, registry: WorkflowRegistry) -> Self {
        Self::with_config(store, registry, ExecutorConfig::default())
    }

    pub fn with_config(store: Arc<S>, registry: WorkflowRegistry, config: ExecutorConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    // =========================================================================
    // Client operations
    // =========================================================================

    /// Start a new run of `workflow_type` under `workflow_id`
    #[instrument(skip(self, input, options), fields(queue = %options.task_queue))]
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        input: Value,
        options: StartWorkflowOptions,
    ) -> Result<Uuid, ExecutorError> {
        if !self.registry.contains(workflow_type) {
            return Err(RegistryError::UnknownWorkflowType(workflow_type.to_string()).into());
        }

        let run_id = Uuid::now_v7();
        self.store
            .create_instance(NewInstance {
                instance: InstanceId::new(workflow_id, run_id),
                workflow_type: workflow_type.to_string(),
                task_queue: options.task_queue,
                input,
                execution_timeout: options.execution_timeout,
                continued_from: None,
            })
            .await?;

        info!(%workflow_id, %run_id, "started workflow");
        Ok(run_id)
    }

    /// Append a signal to the current run and wake it
    #[instrument(skip(self, payload))]
    pub async fn signal_workflow(
        &self,
        workflow_id: &str,
        name: &str,
        payload: Value,
    ) -> Result<(), ExecutorError> {
        let signal = WorkflowSignal::new(name, payload);
        self.append_external(workflow_id, WorkflowEvent::SignalReceived { signal })
            .await?;
        info!(%workflow_id, signal = name, "signal delivered");
        Ok(())
    }

    /// Ask the current run to cancel; the workflow decides how to stop
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, workflow_id: &str, reason: &str) -> Result<(), ExecutorError> {
        self.append_external(
            workflow_id,
            WorkflowEvent::CancelRequested {
                reason: reason.to_string(),
            },
        )
        .await?;
        info!(%workflow_id, reason, "cancellation requested");
        Ok(())
    }

    /// Replay the current run and answer a query against its state
    ///
    /// Never writes to the store.
    #[instrument(skip(self, args))]
    pub async fn query_workflow(
        &self,
        workflow_id: &str,
        query: &str,
        args: &Value,
    ) -> Result<Value, ExecutorError> {
        let instance = self.current_run(workflow_id).await?;
        let history = self.store.read_events(&instance, 1).await?;
        let replay = replay::replay(&self.registry, &instance, &history)?;

        replay
            .workflow
            .query(query, args)
            .ok_or_else(|| ExecutorError::UnknownQuery(query.to_string()))
    }

    /// Metadata of the current run
    pub async fn describe(&self, workflow_id: &str) -> Result<WorkflowInfo, ExecutorError> {
        let instance = self.current_run(workflow_id).await?;
        Ok(self.store.get_workflow_info(&instance).await?)
    }

    /// Metadata of a specific run
    pub async fn describe_run(&self, instance: &InstanceId) -> Result<WorkflowInfo, ExecutorError> {
        Ok(self.store.get_workflow_info(instance).await?)
    }

    /// Full history of the current run
    pub async fn history(&self, workflow_id: &str) -> Result<Vec<HistoryEvent>, ExecutorError> {
        let instance = self.current_run(workflow_id).await?;
        Ok(self.store.read_events(&instance, 1).await?)
    }

    pub async fn current_run(&self, workflow_id: &str) -> Result<InstanceId, ExecutorError> {
        match self.store.current_run(workflow_id).await {
            Ok(instance) => Ok(instance),
            Err(StoreError::WorkflowNotFound(id)) => Err(ExecutorError::WorkflowNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_external(&self, workflow_id: &str, event: WorkflowEvent) -> Result<(), ExecutorError> {
        for _ in 0..=self.config.max_conflict_retries {
            let instance = self.current_run(workflow_id).await?;
            let info = self.store.get_workflow_info(&instance).await?;
            if info.status.is_terminal() {
                return Err(ExecutorError::WorkflowClosed {
                    instance,
                    status: info.status,
                });
            }

            let commit = HistoryCommit::new(instance.clone(), info.history_length + 1)
                .with_event(event.clone())
                .with_task(TaskDefinition::workflow(
                    &info.task_queue,
                    instance.clone(),
                    &info.workflow_type,
                ));

            match self.store.commit(commit).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict { .. }) => {
                    debug!(%instance, "history moved, retrying append");
                }
                Err(StoreError::InstanceClosed(instance)) => {
                    let status = self.store.get_workflow_info(&instance).await?.status;
                    return Err(ExecutorError::WorkflowClosed { instance, status });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ExecutorError::ConflictRetriesExhausted(
            self.current_run(workflow_id).await?,
        ))
    }

    // =========================================================================
    // Workflow-side tasks
    // =========================================================================

    /// Process a claimed workflow or timer task
    ///
    /// Returns [`ExecutorError::NonDeterminism`] after failing the run when
    /// history no longer matches the workflow code.
    #[instrument(skip(self, task), fields(task_id = %task.id, instance = %task.instance, attempt = task.attempt))]
    pub async fn process_workflow_task(&self, task: &ClaimedTask) -> Result<ProcessResult, ExecutorError> {
        match task.kind() {
            TaskKind::Workflow => self.run_workflow_task(task).await,
            TaskKind::Timer => self.fire_timer(task).await,
            TaskKind::Activity => Err(ExecutorError::InvalidTask(format!(
                "activity task {} sent to the workflow executor",
                task.id
            ))),
        }
    }

    async fn run_workflow_task(&self, task: &ClaimedTask) -> Result<ProcessResult, ExecutorError> {
        for _ in 0..=self.config.max_conflict_retries {
            let history = self.store.read_events(&task.instance, 1).await?;

            if history.len() >= self.config.max_history_events && !is_closed(&history) {
                warn!(events = history.len(), "history limit reached");
                let error = WorkflowError::new(format!(
                    "history reached {} events",
                    self.config.max_history_events
                ))
                .with_code(engine_codes::HISTORY_LIMIT);
                return self.fail_run(task, error).await;
            }

            let replay = match replay::replay(&self.registry, &task.instance, &history) {
                Ok(replay) => replay,
                Err(ReplayError::NonDeterminism(e)) => {
                    error!(sequence = e.sequence, message = %e.message, "non-determinism detected, failing run");
                    let error = WorkflowError::new(e.to_string()).with_code(engine_codes::NON_DETERMINISM);
                    self.fail_run(task, error).await?;
                    return Err(e.into());
                }
                Err(ReplayError::Registry(RegistryError::Deserialization(e))) => {
                    let error = WorkflowError::new(format!("invalid workflow input: {e}"))
                        .with_code(engine_codes::INVALID_INPUT);
                    return self.fail_run(task, error).await;
                }
                Err(e) => return Err(e.into()),
            };

            if let Some(status) = replay.closed_status() {
                self.ack(task, replay.next_sequence).await?;
                return Ok(ProcessResult {
                    replayed: replay.replayed,
                    closed: Some(status),
                    ..Default::default()
                });
            }

            let planned = self.plan_commit(task, &replay);
            let result = ProcessResult {
                events_written: planned.events.len(),
                tasks_enqueued: planned.tasks.len(),
                replayed: replay.replayed,
                closed: planned.close.as_ref().map(|c| c.status),
            };

            match self.store.commit(planned).await {
                Ok(committed) => {
                    if let Some(status) = result.closed {
                        info!(%status, "workflow closed");
                    }
                    debug!(
                        last_sequence = committed.last_sequence,
                        events = result.events_written,
                        tasks = result.tasks_enqueued,
                        acked = committed.acked,
                        "workflow task committed"
                    );
                    return Ok(result);
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!("history moved during workflow task, replaying again");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ExecutorError::ConflictRetriesExhausted(task.instance.clone()))
    }

    /// Turn the commands past the end of history into one commit
    fn plan_commit(&self, task: &ClaimedTask, replay: &Replay) -> HistoryCommit {
        let now = Utc::now();
        let instance = &task.instance;
        let started = &replay.started;
        let mut commit = HistoryCommit::new(instance.clone(), replay.next_sequence)
            .with_ack(task.id, task.lease_token);

        for command in &replay.new_commands {
            match command {
                WorkflowCommand::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    debug!(%activity_id, %activity_type, "scheduling activity");
                    commit.events.push(WorkflowEvent::ActivityScheduled {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        options: options.clone(),
                    });
                    commit.tasks.push(TaskDefinition::activity(
                        &started.task_queue,
                        instance.clone(),
                        &started.workflow_type,
                        ActivityInvocation {
                            activity_id: activity_id.clone(),
                            activity_type: activity_type.clone(),
                            input: input.clone(),
                            options: options.clone(),
                        },
                    ));
                }
                WorkflowCommand::StartTimer { timer_id, duration } => {
                    let fire_at = now + chrono_duration(*duration);
                    debug!(%timer_id, ?duration, "starting timer");
                    commit.events.push(WorkflowEvent::TimerStarted {
                        timer_id: timer_id.clone(),
                        duration_ms: duration.as_millis() as u64,
                        fire_at,
                    });
                    commit.tasks.push(
                        TaskDefinition::timer(
                            &started.task_queue,
                            instance.clone(),
                            &started.workflow_type,
                            timer_id,
                        )
                        .visible_at(fire_at),
                    );
                }
                WorkflowCommand::CancelTimer { timer_id } => {
                    commit.events.push(WorkflowEvent::TimerCancelled {
                        timer_id: timer_id.clone(),
                    });
                    commit.cancel_timers.push(timer_id.clone());
                }
                WorkflowCommand::RequestCancelActivity { activity_id } => {
                    commit.events.push(WorkflowEvent::ActivityCancelRequested {
                        activity_id: activity_id.clone(),
                    });
                    commit.cancel_activities.push(activity_id.clone());
                }
                WorkflowCommand::CompleteWorkflow { result } => {
                    commit.events.push(WorkflowEvent::WorkflowCompleted {
                        result: result.clone(),
                    });
                    commit.close = Some(InstanceClose {
                        status: WorkflowStatus::Completed,
                        result: Some(result.clone()),
                        error: None,
                    });
                }
                WorkflowCommand::FailWorkflow { error } => {
                    commit.events.push(WorkflowEvent::WorkflowFailed {
                        error: error.clone(),
                    });
                    commit.close = Some(InstanceClose {
                        status: WorkflowStatus::Failed,
                        result: None,
                        error: Some(error.clone()),
                    });
                }
                WorkflowCommand::CancelWorkflow { reason } => {
                    commit.events.push(WorkflowEvent::WorkflowCancelled {
                        reason: reason.clone(),
                    });
                    commit.close = Some(InstanceClose {
                        status: WorkflowStatus::Cancelled,
                        result: None,
                        error: None,
                    });
                }
                WorkflowCommand::ContinueAsNew { input } => {
                    let new_run_id = Uuid::now_v7();
                    commit.events.push(WorkflowEvent::WorkflowContinuedAsNew {
                        input: input.clone(),
                        new_run_id,
                    });
                    commit.close = Some(InstanceClose {
                        status: WorkflowStatus::ContinuedAsNew,
                        result: None,
                        error: None,
                    });
                    commit.continue_as = Some(NewInstance {
                        instance: InstanceId::new(instance.workflow_id.clone(), new_run_id),
                        workflow_type: started.workflow_type.clone(),
                        task_queue: started.task_queue.clone(),
                        input: input.clone(),
                        execution_timeout: started.execution_timeout,
                        continued_from: Some(instance.run_id),
                    });
                }
            }
        }

        commit.drop_tasks_of_closing_run();
        commit
    }

    async fn fire_timer(&self, task: &ClaimedTask) -> Result<ProcessResult, ExecutorError> {
        let timer_id = task
            .timer_id()
            .ok_or_else(|| ExecutorError::InvalidTask(format!("task {} carries no timer", task.id)))?;

        for _ in 0..=self.config.max_conflict_retries {
            let history = self.store.read_events(&task.instance, 1).await?;
            let next = history.len() as u64 + 1;

            let commit = if is_closed(&history) {
                HistoryCommit::new(task.instance.clone(), next)
            } else if timer_id == EXECUTION_TIMEOUT_TIMER_ID {
                info!("execution timeout reached");
                HistoryCommit::new(task.instance.clone(), next)
                    .with_event(WorkflowEvent::WorkflowTimedOut)
                    .with_close(InstanceClose {
                        status: WorkflowStatus::TimedOut,
                        result: None,
                        error: None,
                    })
            } else if timer_is_open(&history, timer_id) {
                debug!(%timer_id, "timer fired");
                HistoryCommit::new(task.instance.clone(), next)
                    .with_event(WorkflowEvent::TimerFired {
                        timer_id: timer_id.to_string(),
                    })
                    .with_task(TaskDefinition::workflow(
                        &task.task_queue,
                        task.instance.clone(),
                        &task.workflow_type,
                    ))
            } else {
                HistoryCommit::new(task.instance.clone(), next)
            };
            let commit = commit.with_ack(task.id, task.lease_token);

            let result = ProcessResult {
                events_written: commit.events.len(),
                tasks_enqueued: commit.tasks.len(),
                replayed: 0,
                closed: commit.close.as_ref().map(|c| c.status),
            };

            match self.store.commit(commit).await {
                Ok(_) => return Ok(result),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ExecutorError::ConflictRetriesExhausted(task.instance.clone()))
    }

    /// Append an engine-imposed failure and close the run
    async fn fail_run(&self, task: &ClaimedTask, error: WorkflowError) -> Result<ProcessResult, ExecutorError> {
        for _ in 0..=self.config.max_conflict_retries {
            let history = self.store.read_events(&task.instance, 1).await?;
            let next = history.len() as u64 + 1;

            if is_closed(&history) {
                self.ack(task, next).await?;
                return Ok(ProcessResult {
                    closed: Some(self.store.get_workflow_info(&task.instance).await?.status),
                    ..Default::default()
                });
            }

            let commit = HistoryCommit::new(task.instance.clone(), next)
                .with_event(WorkflowEvent::WorkflowFailed {
                    error: error.clone(),
                })
                .with_close(InstanceClose {
                    status: WorkflowStatus::Failed,
                    result: None,
                    error: Some(error.clone()),
                })
                .with_ack(task.id, task.lease_token);

            match self.store.commit(commit).await {
                Ok(_) => {
                    warn!(code = ?error.code, "run failed by the engine: {}", error.message);
                    return Ok(ProcessResult {
                        events_written: 1,
                        closed: Some(WorkflowStatus::Failed),
                        ..Default::default()
                    });
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ExecutorError::ConflictRetriesExhausted(task.instance.clone()))
    }

    /// Ack through a commit so the ack is ordered with history writes
    async fn ack(&self, task: &ClaimedTask, next_sequence: u64) -> Result<(), ExecutorError> {
        let commit = HistoryCommit::new(task.instance.clone(), next_sequence).with_ack(task.id, task.lease_token);
        match self.store.commit(commit).await {
            Ok(_) | Err(StoreError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Activity outcomes
    // =========================================================================

    /// Record a successful attempt
    ///
    /// The first outcome recorded for an activity wins; later reports for it
    /// return [`ActivityOutcome::Duplicate`].
    #[instrument(skip(self, task, result), fields(task_id = %task.id, instance = %task.instance, attempt = task.attempt))]
    pub async fn complete_activity(
        &self,
        task: &ClaimedTask,
        result: Value,
    ) -> Result<ActivityOutcome, ExecutorError> {
        let invocation = activity_of(task)?;
        let event = WorkflowEvent::ActivityCompleted {
            activity_id: invocation.activity_id.clone(),
            result,
            attempt: task.attempt,
        };
        self.record_activity_outcome(task, &invocation.activity_id, event).await
    }

    /// Handle a failed attempt: retry per policy or record a terminal failure
    #[instrument(skip(self, task, error), fields(task_id = %task.id, instance = %task.instance, attempt = task.attempt))]
    pub async fn fail_activity(
        &self,
        task: &ClaimedTask,
        error: ActivityError,
    ) -> Result<ActivityOutcome, ExecutorError> {
        let invocation = activity_of(task)?;

        if let Some(delay) = invocation.options.retry_policy.next_retry(task.attempt, &error) {
            return match self
                .store
                .retry_task(task.id, task.lease_token, delay, &error.to_string())
                .await
            {
                Ok(()) => {
                    debug!(activity_id = %invocation.activity_id, ?delay, %error, "activity attempt failed, retrying");
                    Ok(ActivityOutcome::RetryScheduled(delay))
                }
                // Someone else owns the task now.
                Err(StoreError::LeaseExpired(_) | StoreError::TaskNotFound(_)) => {
                    Ok(ActivityOutcome::Duplicate)
                }
                Err(e) => Err(e.into()),
            };
        }

        warn!(activity_id = %invocation.activity_id, %error, "activity failed terminally");
        let event = WorkflowEvent::ActivityFailed {
            activity_id: invocation.activity_id.clone(),
            error,
            attempts: task.attempt,
        };
        self.record_activity_outcome(task, &invocation.activity_id, event).await
    }

    async fn record_activity_outcome(
        &self,
        task: &ClaimedTask,
        activity_id: &str,
        event: WorkflowEvent,
    ) -> Result<ActivityOutcome, ExecutorError> {
        for _ in 0..=self.config.max_conflict_retries {
            let history = self.store.read_events(&task.instance, 1).await?;
            let next = history.len() as u64 + 1;

            if is_closed(&history) || activity_settled(&history, activity_id) {
                debug!(%activity_id, "activity already settled, dropping outcome");
                let removal = HistoryCommit::new(task.instance.clone(), next).with_removal(task.id);
                match self.store.commit(removal).await {
                    Ok(_) | Err(StoreError::Conflict { .. }) => return Ok(ActivityOutcome::Duplicate),
                    Err(e) => return Err(e.into()),
                }
            }

            let commit = HistoryCommit::new(task.instance.clone(), next)
                .with_event(event.clone())
                .with_task(TaskDefinition::workflow(
                    &task.task_queue,
                    task.instance.clone(),
                    &task.workflow_type,
                ))
                .with_removal(task.id);

            match self.store.commit(commit).await {
                Ok(_) => return Ok(ActivityOutcome::Recorded),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ExecutorError::ConflictRetriesExhausted(task.instance.clone()))
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// Release expired leases and record failures for exhausted activities
    ///
    /// Returns the number of tasks reclaimed.
    #[instrument(skip(self))]
    pub async fn reclaim_expired_tasks(&self) -> Result<usize, ExecutorError> {
        let expired = self.store.reclaim_expired_tasks().await?;

        for entry in &expired {
            if !entry.exhausted {
                debug!(task_id = %entry.task.id, reason = ?entry.reason, "lease reclaimed");
                continue;
            }
            let Some(invocation) = entry.task.activity() else {
                continue;
            };

            let timeout = match entry.reason {
                ExpiryReason::HeartbeatTimeout => TimeoutType::Heartbeat,
                ExpiryReason::LeaseExpired => TimeoutType::StartToClose,
            };
            warn!(
                task_id = %entry.task.id,
                activity_id = %invocation.activity_id,
                timeout = timeout.as_str(),
                "activity timed out with no attempts left"
            );
            let event = WorkflowEvent::ActivityFailed {
                activity_id: invocation.activity_id.clone(),
                error: ActivityError::timeout(timeout),
                attempts: entry.task.attempt,
            };
            self.record_activity_outcome(&entry.task, &invocation.activity_id, event)
                .await?;
        }

        Ok(expired.len())
    }

    /// Delete runs closed longer than `retention` ago
    pub async fn purge_closed(&self, retention: Duration) -> Result<u64, ExecutorError> {
        let cutoff = Utc::now() - chrono_duration(retention);
        Ok(self.store.purge_closed_before(cutoff).await?)
    }
}

fn activity_of(task: &ClaimedTask) -> Result<&ActivityInvocation, ExecutorError> {
    task.activity()
        .ok_or_else(|| ExecutorError::InvalidTask(format!("task {} is not an activity task", task.id)))
}

fn is_closed(history: &[HistoryEvent]) -> bool {
    history.last().is_some_and(|e| e.event.is_terminal())
}

fn activity_settled(history: &[HistoryEvent], id: &str) -> bool {
    history.iter().any(|e| {
        matches!(
            &e.event,
            WorkflowEvent::ActivityCompleted { activity_id, .. }
                | WorkflowEvent::ActivityFailed { activity_id, .. } if activity_id == id
        )
    })
}

fn timer_is_open(history: &[HistoryEvent], id: &str) -> bool {
    let mut open = false;
    for event in history {
        match &event.event {
            WorkflowEvent::TimerStarted { timer_id, .. } if timer_id == id => open = true,
            WorkflowEvent::TimerFired { timer_id } | WorkflowEvent::TimerCancelled { timer_id }
                if timer_id == id =>
            {
                open = false
            }
            _ => {}
        }
    }
    open
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryWorkflowEventStore, PollRequest, TaskQueue};
    use crate::reliability::RetryPolicy;
    use crate::workflow::{ActivityOptions, Workflow, WorkflowContext};
    use serde_json::json;

    const QUEUE: &str = "test-queue";

    /// Runs one activity and completes with its result
    struct OneStep;

    impl Workflow for OneStep {
        const TYPE: &'static str = "one_step";
        type Input = u32;
        type Output = Value;

        fn new(_: u32) -> Self {
            Self
        }

        fn on_start(&mut self, ctx: &mut WorkflowContext) {
            ctx.schedule_activity(
                "step",
                "work",
                json!({}),
                ActivityOptions::default()
                    .with_retry(RetryPolicy::fixed(Duration::ZERO, 2)),
            );
        }

        fn on_activity_completed(&mut self, ctx: &mut WorkflowContext, _: &str, result: Value) {
            ctx.complete(&result);
        }

        fn on_activity_failed(&mut self, ctx: &mut WorkflowContext, _: &str, error: &ActivityError) {
            ctx.fail(error.clone().into());
        }
    }

    fn executor() -> (Arc<InMemoryWorkflowEventStore>, WorkflowExecutor<InMemoryWorkflowEventStore>) {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let mut registry = WorkflowRegistry::new();
        registry.register::<OneStep>().unwrap();
        (store.clone(), WorkflowExecutor::new(store, registry))
    }

    async fn claim_workflow(store: &InMemoryWorkflowEventStore) -> ClaimedTask {
        store
            .claim_task(&PollRequest::workflow_tasks(
                QUEUE,
                "w1",
                vec![OneStep::TYPE.to_string()],
                Duration::from_secs(30),
            ))
            .await
            .unwrap()
            .expect("workflow task")
    }

    async fn claim_activity(store: &InMemoryWorkflowEventStore) -> ClaimedTask {
        store
            .claim_task(&PollRequest::activity_tasks(
                QUEUE,
                "w1",
                vec!["work".to_string()],
                Duration::from_secs(30),
            ))
            .await
            .unwrap()
            .expect("activity task")
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_type() {
        let (_, executor) = executor();
        let result = executor
            .start_workflow("nope", "wf-1", json!(1), StartWorkflowOptions::new(QUEUE))
            .await;
        assert!(matches!(
            result,
            Err(ExecutorError::Registry(RegistryError::UnknownWorkflowType(_)))
        ));
    }

    #[tokio::test]
    async fn test_workflow_task_schedules_activity() {
        let (store, executor) = executor();
        executor
            .start_workflow(OneStep::TYPE, "wf-1", json!(1), StartWorkflowOptions::new(QUEUE))
            .await
            .unwrap();

        let task = claim_workflow(&store).await;
        let result = executor.process_workflow_task(&task).await.unwrap();

        assert_eq!(result.events_written, 1);
        assert_eq!(result.tasks_enqueued, 1);
        assert!(result.closed.is_none());
        assert_eq!(store.pending_task_count(QUEUE, TaskKind::Activity), 1);
        assert_eq!(store.pending_task_count(QUEUE, TaskKind::Workflow), 0);
    }

    /// Schedules an activity and completes in the same handler
    struct ScheduleAndFinish;

    impl Workflow for ScheduleAndFinish {
        const TYPE: &'static str = "schedule_and_finish";
        type Input = u32;
        type Output = String;

        fn new(_: u32) -> Self {
            Self
        }

        fn on_start(&mut self, ctx: &mut WorkflowContext) {
            ctx.schedule_activity("side", "work", json!({}), ActivityOptions::default());
            ctx.start_timer("later", Duration::from_millis(1));
            ctx.complete(&"done");
        }

        fn on_activity_completed(&mut self, _: &mut WorkflowContext, _: &str, _: Value) {}

        fn on_activity_failed(&mut self, _: &mut WorkflowContext, _: &str, _: &ActivityError) {}
    }

    #[tokio::test]
    async fn test_closing_task_dispatches_nothing_it_scheduled() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let mut registry = WorkflowRegistry::new();
        registry.register::<ScheduleAndFinish>().unwrap();
        let executor = WorkflowExecutor::new(store.clone(), registry);
        executor
            .start_workflow(
                ScheduleAndFinish::TYPE,
                "wf-1",
                json!(1),
                StartWorkflowOptions::new(QUEUE),
            )
            .await
            .unwrap();

        let task = store
            .claim_task(&PollRequest::workflow_tasks(
                QUEUE,
                "w1",
                vec![ScheduleAndFinish::TYPE.to_string()],
                Duration::from_secs(30),
            ))
            .await
            .unwrap()
            .expect("workflow task");
        let result = executor.process_workflow_task(&task).await.unwrap();

        assert_eq!(result.closed, Some(WorkflowStatus::Completed));
        assert_eq!(result.tasks_enqueued, 0);
        assert_eq!(store.pending_task_count(QUEUE, TaskKind::Activity), 0);
        assert_eq!(store.pending_task_count(QUEUE, TaskKind::Timer), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let activity = store
            .claim_task(&PollRequest::activity_tasks(
                QUEUE,
                "w1",
                vec!["work".to_string()],
                Duration::from_secs(30),
            ))
            .await
            .unwrap();
        assert!(activity.is_none());

        let kinds: Vec<&str> = executor
            .history("wf-1")
            .await
            .unwrap()
            .iter()
            .map(|e| e.event.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "workflow_started",
                "activity_scheduled",
                "timer_started",
                "workflow_completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_activity_completion_resumes_and_completes() {
        let (store, executor) = executor();
        executor
            .start_workflow(OneStep::TYPE, "wf-1", json!(1), StartWorkflowOptions::new(QUEUE))
            .await
            .unwrap();
        executor
            .process_workflow_task(&claim_workflow(&store).await)
            .await
            .unwrap();

        let activity = claim_activity(&store).await;
        let outcome = executor.complete_activity(&activity, json!("ok")).await.unwrap();
        assert_eq!(outcome, ActivityOutcome::Recorded);

        let again = executor.complete_activity(&activity, json!("late")).await.unwrap();
        assert_eq!(again, ActivityOutcome::Duplicate);

        let result = executor
            .process_workflow_task(&claim_workflow(&store).await)
            .await
            .unwrap();
        assert_eq!(result.closed, Some(WorkflowStatus::Completed));

        let info = executor.describe("wf-1").await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result, Some(json!("ok")));

        let completions = executor
            .history("wf-1")
            .await
            .unwrap()
            .iter()
            .filter(|e| matches!(e.event, WorkflowEvent::ActivityCompleted { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_activity_failure_retries_then_records() {
        let (store, executor) = executor();
        executor
            .start_workflow(OneStep::TYPE, "wf-1", json!(1), StartWorkflowOptions::new(QUEUE))
            .await
            .unwrap();
        executor
            .process_workflow_task(&claim_workflow(&store).await)
            .await
            .unwrap();

        let first = claim_activity(&store).await;
        let outcome = executor
            .fail_activity(&first, ActivityError::retryable("flaky"))
            .await
            .unwrap();
        assert_eq!(outcome, ActivityOutcome::RetryScheduled(Duration::ZERO));

        let second = claim_activity(&store).await;
        assert_eq!(second.attempt, 2);
        let outcome = executor
            .fail_activity(&second, ActivityError::retryable("flaky"))
            .await
            .unwrap();
        assert_eq!(outcome, ActivityOutcome::Recorded);

        let result = executor
            .process_workflow_task(&claim_workflow(&store).await)
            .await
            .unwrap();
        assert_eq!(result.closed, Some(WorkflowStatus::Failed));
    }

    #[tokio::test]
    async fn test_signal_and_cancel_rejected_after_close() {
        let (store, executor) = executor();
        executor
            .start_workflow(OneStep::TYPE, "wf-1", json!(1), StartWorkflowOptions::new(QUEUE))
            .await
            .unwrap();
        executor
            .process_workflow_task(&claim_workflow(&store).await)
            .await
            .unwrap();
        let activity = claim_activity(&store).await;
        executor
            .fail_activity(&activity, ActivityError::non_retryable("fatal"))
            .await
            .unwrap();
        executor
            .process_workflow_task(&claim_workflow(&store).await)
            .await
            .unwrap();

        let signal = executor.signal_workflow("wf-1", "poke", json!(null)).await;
        assert!(matches!(
            signal,
            Err(ExecutorError::WorkflowClosed {
                status: WorkflowStatus::Failed,
                ..
            })
        ));
        let cancel = executor.cancel_workflow("wf-1", "too late").await;
        assert!(matches!(cancel, Err(ExecutorError::WorkflowClosed { .. })));
    }

    #[tokio::test]
    async fn test_invalid_input_fails_run() {
        let (store, executor) = executor();
        executor
            .start_workflow(OneStep::TYPE, "wf-1", json!("not a number"), StartWorkflowOptions::new(QUEUE))
            .await
            .unwrap();

        let result = executor
            .process_workflow_task(&claim_workflow(&store).await)
            .await
            .unwrap();
        assert_eq!(result.closed, Some(WorkflowStatus::Failed));

        let info = executor.describe("wf-1").await.unwrap();
        assert_eq!(
            info.error.and_then(|e| e.code).as_deref(),
            Some(engine_codes::INVALID_INPUT)
        );
    }

    #[tokio::test]
    async fn test_history_limit_fails_run() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let mut registry = WorkflowRegistry::new();
        registry.register::<OneStep>().unwrap();
        let executor = WorkflowExecutor::with_config(
            store.clone(),
            registry,
            ExecutorConfig::default().with_max_history_events(1),
        );
        executor
            .start_workflow(OneStep::TYPE, "wf-1", json!(1), StartWorkflowOptions::new(QUEUE))
            .await
            .unwrap();

        executor
            .process_workflow_task(&claim_workflow(&store).await)
            .await
            .unwrap();

        let info = executor.describe("wf-1").await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Failed);
        assert_eq!(
            info.error.and_then(|e| e.code).as_deref(),
            Some(engine_codes::HISTORY_LIMIT)
        );
    }

    #[test]
    fn test_timer_is_open() {
        let history = vec![
            HistoryEvent::new(
                1,
                WorkflowEvent::TimerStarted {
                    timer_id: "t".into(),
                    duration_ms: 1,
                    fire_at: Utc::now(),
                },
            ),
            HistoryEvent::new(2, WorkflowEvent::TimerCancelled { timer_id: "t".into() }),
        ];
        assert!(timer_is_open(&history[..1], "t"));
        assert!(!timer_is_open(&history, "t"));
        assert!(!timer_is_open(&history, "other"));
    }
}
