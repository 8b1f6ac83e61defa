//! Storage contracts: history log, task queue and instance metadata

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ActivityOptions, HistoryEvent, WorkflowError, WorkflowEvent};

/// Timer id reserved for a run's execution timeout
pub const EXECUTION_TIMEOUT_TIMER_ID: &str = "__execution_timeout";

/// Upper bound on the lease granted past an activity's start-to-close timeout
pub const ACTIVITY_LEASE_GRACE_MAX: Duration = Duration::from_secs(5);

/// Lease for one activity attempt
///
/// Outlives the start-to-close timeout by half of it (at most
/// [`ACTIVITY_LEASE_GRACE_MAX`]), so a worker reports its own timeout while it
/// still holds the task. Lease expiry is left for workers that went away.
pub fn activity_lease(start_to_close: Duration) -> Duration {
    start_to_close + (start_to_close / 2).min(ACTIVITY_LEASE_GRACE_MAX)
}

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No run exists for this workflow id
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Instance (workflow id + run id) not found
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// The workflow id already has a run that is not closed
    #[error("workflow {workflow_id} already has a running instance (run {run_id})")]
    AlreadyRunning { workflow_id: String, run_id: Uuid },

    /// History already ends with a terminal event
    #[error("workflow instance {0} is closed")]
    InstanceClosed(InstanceId),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Optimistic append lost: someone else advanced the history
    #[error("history conflict on {instance}: expected next sequence {expected}, found {actual}")]
    Conflict {
        instance: InstanceId,
        expected: u64,
        actual: u64,
    },

    /// Lease token no longer owns the task
    #[error("lease expired for task {0}")]
    LeaseExpired(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// =============================================================================
// Instances
// =============================================================================

/// Identity of one workflow run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    pub workflow_id: String,
    pub run_id: Uuid,
}

impl InstanceId {
    pub fn new(workflow_id: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
        }
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

/// Workflow run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    ContinuedAsNew,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::ContinuedAsNew => "continued_as_new",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "cancelled" => Ok(Self::Cancelled),
            "continued_as_new" => Ok(Self::ContinuedAsNew),
            other => Err(StoreError::Serialization(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

/// Instance metadata, a projection of the history kept for lookups
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub instance: InstanceId,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    /// Number of events in history (also the last sequence number)
    pub history_length: u64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Request to create a new run
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub instance: InstanceId,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub execution_timeout: Option<Duration>,
    /// Previous run when created through continue-as-new
    pub continued_from: Option<Uuid>,
}

impl NewInstance {
    /// First history event of the run
    pub fn started_event(&self) -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            workflow_type: self.workflow_type.clone(),
            task_queue: self.task_queue.clone(),
            input: self.input.clone(),
            execution_timeout_ms: self.execution_timeout.map(|d| d.as_millis() as u64),
            continued_from: self.continued_from,
        }
    }

    /// Tasks enqueued together with the started event
    pub fn initial_tasks(&self, now: DateTime<Utc>) -> Vec<TaskDefinition> {
        let mut tasks = vec![TaskDefinition::workflow(
            &self.task_queue,
            self.instance.clone(),
            &self.workflow_type,
        )];
        if let Some(timeout) = self.execution_timeout {
            tasks.push(
                TaskDefinition::timer(
                    &self.task_queue,
                    self.instance.clone(),
                    &self.workflow_type,
                    EXECUTION_TIMEOUT_TIMER_ID,
                )
                .visible_at(now + chrono_duration(timeout)),
            );
        }
        tasks
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// Task kind in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Replay the instance and run workflow code
    Workflow,
    /// Execute one activity attempt
    Activity,
    /// Fire a durable timer
    Timer,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Activity => "activity",
            Self::Timer => "timer",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(Self::Workflow),
            "activity" => Ok(Self::Activity),
            "timer" => Ok(Self::Timer),
            other => Err(StoreError::Serialization(format!("unknown task kind: {other}"))),
        }
    }
}

/// One scheduled activity call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInvocation {
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
}

/// Kind-specific task data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Workflow,
    Activity(ActivityInvocation),
    Timer { timer_id: String },
}

/// Definition of a task to be enqueued
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub task_queue: String,
    pub instance: InstanceId,
    pub workflow_type: String,
    pub payload: TaskPayload,
    /// Not claimable before this time (None = now)
    pub visible_at: Option<DateTime<Utc>>,
}

impl TaskDefinition {
    pub fn workflow(
        task_queue: impl Into<String>,
        instance: InstanceId,
        workflow_type: impl Into<String>,
    ) -> Self {
        Self {
            task_queue: task_queue.into(),
            instance,
            workflow_type: workflow_type.into(),
            payload: TaskPayload::Workflow,
            visible_at: None,
        }
    }

    pub fn activity(
        task_queue: impl Into<String>,
        instance: InstanceId,
        workflow_type: impl Into<String>,
        invocation: ActivityInvocation,
    ) -> Self {
        Self {
            task_queue: task_queue.into(),
            instance,
            workflow_type: workflow_type.into(),
            payload: TaskPayload::Activity(invocation),
            visible_at: None,
        }
    }

    pub fn timer(
        task_queue: impl Into<String>,
        instance: InstanceId,
        workflow_type: impl Into<String>,
        timer_id: impl Into<String>,
    ) -> Self {
        Self {
            task_queue: task_queue.into(),
            instance,
            workflow_type: workflow_type.into(),
            payload: TaskPayload::Timer {
                timer_id: timer_id.into(),
            },
            visible_at: None,
        }
    }

    pub fn visible_at(mut self, at: DateTime<Utc>) -> Self {
        self.visible_at = Some(at);
        self
    }

    pub fn kind(&self) -> TaskKind {
        payload_kind(&self.payload)
    }

    /// Name matched against a poller's registered types
    pub fn type_name(&self) -> &str {
        match &self.payload {
            TaskPayload::Activity(invocation) => &invocation.activity_type,
            _ => &self.workflow_type,
        }
    }

    /// Activity id or timer id; workflow tasks have none
    pub fn item_id(&self) -> Option<&str> {
        payload_item_id(&self.payload)
    }

    /// Lease length fixed by the task itself (see [`activity_lease`])
    pub fn lease_override(&self) -> Option<Duration> {
        match &self.payload {
            TaskPayload::Activity(invocation) => {
                Some(activity_lease(invocation.options.start_to_close_timeout))
            }
            _ => None,
        }
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        match &self.payload {
            TaskPayload::Activity(invocation) => invocation.options.heartbeat_timeout,
            _ => None,
        }
    }

    /// Delivery limit; only activities have one
    pub fn max_attempts(&self) -> Option<u32> {
        match &self.payload {
            TaskPayload::Activity(invocation) => Some(invocation.options.retry_policy.max_attempts),
            _ => None,
        }
    }
}

fn payload_kind(payload: &TaskPayload) -> TaskKind {
    match payload {
        TaskPayload::Workflow => TaskKind::Workflow,
        TaskPayload::Activity(_) => TaskKind::Activity,
        TaskPayload::Timer { .. } => TaskKind::Timer,
    }
}

fn payload_item_id(payload: &TaskPayload) -> Option<&str> {
    match payload {
        TaskPayload::Workflow => None,
        TaskPayload::Activity(invocation) => Some(&invocation.activity_id),
        TaskPayload::Timer { timer_id } => Some(timer_id),
    }
}

/// What a poller is willing to take
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub task_queue: String,
    pub kinds: Vec<TaskKind>,
    /// Workflow types served (workflow and timer tasks)
    pub workflow_types: Vec<String>,
    /// Activity types served (activity tasks)
    pub activity_types: Vec<String>,
    pub worker_id: String,
    /// Lease for tasks that do not carry their own
    pub lease: Duration,
}

impl PollRequest {
    /// Poll workflow and timer tasks of the given workflow types
    pub fn workflow_tasks(
        task_queue: impl Into<String>,
        worker_id: impl Into<String>,
        workflow_types: Vec<String>,
        lease: Duration,
    ) -> Self {
        Self {
            task_queue: task_queue.into(),
            kinds: vec![TaskKind::Workflow, TaskKind::Timer],
            workflow_types,
            activity_types: vec![],
            worker_id: worker_id.into(),
            lease,
        }
    }

    /// Poll activity tasks of the given activity types
    pub fn activity_tasks(
        task_queue: impl Into<String>,
        worker_id: impl Into<String>,
        activity_types: Vec<String>,
        lease: Duration,
    ) -> Self {
        Self {
            task_queue: task_queue.into(),
            kinds: vec![TaskKind::Activity],
            workflow_types: vec![],
            activity_types,
            worker_id: worker_id.into(),
            lease,
        }
    }

    /// Check if a task with this kind and type name may be handed out
    pub fn accepts(&self, kind: TaskKind, type_name: &str) -> bool {
        if !self.kinds.contains(&kind) {
            return false;
        }
        let types = match kind {
            TaskKind::Activity => &self.activity_types,
            TaskKind::Workflow | TaskKind::Timer => &self.workflow_types,
        };
        types.iter().any(|t| t == type_name)
    }
}

/// A task leased to a worker
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    /// Proof of ownership; required to ack, extend or retry
    pub lease_token: Uuid,
    pub worker_id: String,
    pub task_queue: String,
    pub instance: InstanceId,
    pub workflow_type: String,
    pub payload: TaskPayload,
    /// Delivery attempt (1-based)
    pub attempt: u32,
    pub lease_expires_at: DateTime<Utc>,
}

impl ClaimedTask {
    pub fn kind(&self) -> TaskKind {
        payload_kind(&self.payload)
    }

    pub fn activity(&self) -> Option<&ActivityInvocation> {
        match &self.payload {
            TaskPayload::Activity(invocation) => Some(invocation),
            _ => None,
        }
    }

    pub fn timer_id(&self) -> Option<&str> {
        match &self.payload {
            TaskPayload::Timer { timer_id } => Some(timer_id),
            _ => None,
        }
    }

    pub fn item_id(&self) -> Option<&str> {
        payload_item_id(&self.payload)
    }
}

/// Response from heartbeat operation
#[derive(Debug, Clone)]
pub struct HeartbeatResponse {
    /// Whether the heartbeat was accepted
    pub accepted: bool,

    /// Whether cancellation was requested
    pub should_cancel: bool,
}

/// Why a lease was reclaimed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    LeaseExpired,
    HeartbeatTimeout,
}

/// A leased task whose owner went silent
#[derive(Debug, Clone)]
pub struct ExpiredTask {
    /// The task as it was leased
    pub task: ClaimedTask,
    pub reason: ExpiryReason,
    /// True when no attempts remain; the task is parked until the failure is recorded
    pub exhausted: bool,
}

// =============================================================================
// Commits
// =============================================================================

/// Final state written when a run closes
#[derive(Debug, Clone)]
pub struct InstanceClose {
    pub status: WorkflowStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
}

/// Task removal performed by a commit
#[derive(Debug, Clone, Copy)]
pub struct TaskAck {
    pub task_id: Uuid,
    /// Only remove while this lease still owns the task; None removes unconditionally
    pub lease_token: Option<Uuid>,
}

/// Everything one engine step writes, applied atomically
///
/// The history append is guarded by `expected_next`; if it loses, nothing
/// else in the commit is applied.
#[derive(Debug, Clone)]
pub struct HistoryCommit {
    pub instance: InstanceId,
    pub expected_next: u64,
    pub events: Vec<WorkflowEvent>,
    pub tasks: Vec<TaskDefinition>,
    /// Timer ids whose pending timer tasks are removed
    pub cancel_timers: Vec<String>,
    /// Activity ids whose tasks are flagged for cooperative cancellation
    pub cancel_activities: Vec<String>,
    pub close: Option<InstanceClose>,
    /// Next run created by continue-as-new
    pub continue_as: Option<NewInstance>,
    pub ack: Option<TaskAck>,
}

impl HistoryCommit {
    pub fn new(instance: InstanceId, expected_next: u64) -> Self {
        Self {
            instance,
            expected_next,
            events: vec![],
            tasks: vec![],
            cancel_timers: vec![],
            cancel_activities: vec![],
            close: None,
            continue_as: None,
            ack: None,
        }
    }

    pub fn with_event(mut self, event: WorkflowEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_close(mut self, close: InstanceClose) -> Self {
        self.close = Some(close);
        self
    }

    /// Drop tasks addressed to this run when the commit also closes it
    ///
    /// A closed run dispatches nothing, including work scheduled by the
    /// same workflow task that closed it.
    pub fn drop_tasks_of_closing_run(&mut self) {
        if self.close.is_some() {
            let instance = &self.instance;
            self.tasks.retain(|task| task.instance != *instance);
        }
    }

    /// Ack the task only if `lease_token` still owns it
    pub fn with_ack(mut self, task_id: Uuid, lease_token: Uuid) -> Self {
        self.ack = Some(TaskAck {
            task_id,
            lease_token: Some(lease_token),
        });
        self
    }

    /// Remove the task whoever holds it
    pub fn with_removal(mut self, task_id: Uuid) -> Self {
        self.ack = Some(TaskAck {
            task_id,
            lease_token: None,
        });
        self
    }
}

/// Result of a successful commit
#[derive(Debug, Clone)]
pub struct CommitResult {
    /// Sequence of the last event in history after the commit
    pub last_sequence: u64,
    /// Ids of enqueued tasks (existing ids when deduplicated)
    pub enqueued: Vec<Uuid>,
    /// Whether the acked task was removed
    pub acked: bool,
}

// =============================================================================
// Workers
// =============================================================================

/// Worker registration (ephemeral, for observability only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub task_queue: String,
    pub workflow_types: Vec<String>,
    pub activity_types: Vec<String>,
    pub max_concurrent_workflow_tasks: usize,
    pub max_concurrent_activities: usize,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

// =============================================================================
// Traits
// =============================================================================

/// Append-only, per-instance ordered event log
#[async_trait]
pub trait HistoryLog: Send + Sync {
    /// Append events if the next free sequence equals `expected_next`
    ///
    /// Returns the sequence of the last appended event. Fails with
    /// [`StoreError::Conflict`] when the expectation is stale and with
    /// [`StoreError::InstanceClosed`] once history ends in a terminal event.
    async fn append_events(
        &self,
        instance: &InstanceId,
        expected_next: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError>;

    /// Read events with `sequence >= from_sequence`, in order
    async fn read_events(
        &self,
        instance: &InstanceId,
        from_sequence: u64,
    ) -> Result<Vec<HistoryEvent>, StoreError>;
}

/// Durable queue of leased tasks
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task, returning its id
    ///
    /// Activity and timer tasks are unique per instance and item id, and an
    /// instance has at most one pending workflow task; duplicates return the
    /// existing id.
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError>;

    /// Lease the next visible task matching the request, if any
    ///
    /// Never leases a workflow task for an instance whose workflow task is
    /// already leased. Leases that ran out are released first, so an expired
    /// task is redelivered with its attempt incremented.
    async fn claim_task(&self, request: &PollRequest) -> Result<Option<ClaimedTask>, StoreError>;

    /// Suspend until a task may be available on `task_queue` or `max_wait` passes
    async fn wait_for_task(&self, task_queue: &str, max_wait: Duration) {
        let _ = task_queue;
        tokio::time::sleep(max_wait).await;
    }

    /// Remove a finished task
    async fn ack_task(&self, task_id: Uuid, lease_token: Uuid) -> Result<(), StoreError>;

    /// Push the lease expiry to `now + extension`
    async fn extend_lease(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        extension: Duration,
    ) -> Result<DateTime<Utc>, StoreError>;

    /// Record an activity heartbeat, pushing its heartbeat deadline forward
    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError>;

    /// Release the task for another attempt after `delay`
    async fn retry_task(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        delay: Duration,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Release every lease whose deadline passed
    ///
    /// Tasks with attempts left become claimable again; activity tasks with
    /// none left are parked and reported as exhausted.
    async fn reclaim_expired_tasks(&self) -> Result<Vec<ExpiredTask>, StoreError>;
}

/// Full store used by the engine
#[async_trait]
pub trait WorkflowEventStore: HistoryLog + TaskQueue + 'static {
    // =========================================================================
    // Instance Lifecycle
    // =========================================================================

    /// Create a run: instance row, `WorkflowStarted` at sequence 1 and its
    /// initial tasks, atomically
    ///
    /// Fails with [`StoreError::AlreadyRunning`] when the workflow id has an
    /// open run other than `continued_from`. Creating an existing run id is a
    /// no-op.
    async fn create_instance(&self, instance: NewInstance) -> Result<(), StoreError>;

    /// Latest run of a workflow id
    async fn current_run(&self, workflow_id: &str) -> Result<InstanceId, StoreError>;

    async fn get_workflow_info(&self, instance: &InstanceId) -> Result<WorkflowInfo, StoreError>;

    /// Apply a [`HistoryCommit`] atomically
    async fn commit(&self, commit: HistoryCommit) -> Result<CommitResult, StoreError>;

    /// Delete closed runs (history, tasks, metadata) closed before `cutoff`
    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // Worker Registry (optional)
    // =========================================================================

    async fn register_worker(&self, _worker: WorkerInfo) -> Result<(), StoreError> {
        Ok(())
    }

    async fn deregister_worker(&self, _worker_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        Ok(vec![])
    }
}

/// Backoff before a task whose lease ran out becomes claimable again
pub(crate) fn redelivery_delay(payload: &TaskPayload, attempt: u32) -> Duration {
    match payload {
        TaskPayload::Activity(invocation) => {
            invocation.options.retry_policy.delay_for_attempt(attempt + 1)
        }
        _ => Duration::ZERO,
    }
}

/// `std::time::Duration` to `chrono::Duration`, capped at a century
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::RetryPolicy;

    fn invocation() -> ActivityInvocation {
        ActivityInvocation {
            activity_id: "compose".into(),
            activity_type: "compose_greeting".into(),
            input: serde_json::json!({}),
            options: ActivityOptions::with_timeout(Duration::from_secs(10))
                .with_retry(RetryPolicy::exponential().with_max_attempts(3)),
        }
    }

    #[test]
    fn test_task_definition_accessors() {
        let instance = InstanceId::new("greet-1", Uuid::now_v7());
        let task = TaskDefinition::activity("q", instance, "GreetingWorkflow", invocation());

        assert_eq!(task.kind(), TaskKind::Activity);
        assert_eq!(task.type_name(), "compose_greeting");
        assert_eq!(task.item_id(), Some("compose"));
        assert_eq!(task.lease_override(), Some(Duration::from_secs(15)));
        assert_eq!(task.max_attempts(), Some(3));
    }

    #[test]
    fn test_activity_lease_outlives_timeout() {
        assert_eq!(activity_lease(Duration::from_millis(200)), Duration::from_millis(300));
        assert_eq!(activity_lease(Duration::from_secs(60)), Duration::from_secs(65));
        assert_eq!(activity_lease(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_poll_request_filters_by_kind_and_type() {
        let request = PollRequest::workflow_tasks(
            "q",
            "w1",
            vec!["GreetingWorkflow".into()],
            Duration::from_secs(10),
        );

        assert!(request.accepts(TaskKind::Workflow, "GreetingWorkflow"));
        assert!(request.accepts(TaskKind::Timer, "GreetingWorkflow"));
        assert!(!request.accepts(TaskKind::Workflow, "OtherWorkflow"));
        assert!(!request.accepts(TaskKind::Activity, "GreetingWorkflow"));
    }

    #[test]
    fn test_new_instance_initial_tasks() {
        let new = NewInstance {
            instance: InstanceId::new("wf", Uuid::now_v7()),
            workflow_type: "T".into(),
            task_queue: "q".into(),
            input: serde_json::json!(null),
            execution_timeout: Some(Duration::from_secs(60)),
            continued_from: None,
        };

        let now = Utc::now();
        let tasks = new.initial_tasks(now);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].kind(), TaskKind::Workflow);
        assert_eq!(tasks[1].item_id(), Some(EXECUTION_TIMEOUT_TIMER_ID));
        assert_eq!(tasks[1].visible_at, Some(now + chrono::Duration::seconds(60)));

        match new.started_event() {
            WorkflowEvent::WorkflowStarted {
                execution_timeout_ms,
                ..
            } => assert_eq!(execution_timeout_ms, Some(60_000)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_status_roundtrip_and_terminal() {
        for status in [
            WorkflowStatus::Running,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::TimedOut,
            WorkflowStatus::Cancelled,
            WorkflowStatus::ContinuedAsNew,
        ] {
            let parsed: WorkflowStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
            assert_eq!(status.is_terminal(), status != WorkflowStatus::Running);
        }
    }
}
