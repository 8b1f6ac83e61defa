//! In-memory implementation of WorkflowEventStore

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use super::store::*;
use crate::workflow::{HistoryEvent, WorkflowEvent};

struct InstanceRecord {
    info: WorkflowInfo,
    events: Vec<HistoryEvent>,
}

impl InstanceRecord {
    fn next_sequence(&self) -> u64 {
        self.events.len() as u64 + 1
    }

    fn is_closed(&self) -> bool {
        self.events.last().is_some_and(|e| e.event.is_terminal())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Leased,
    /// Activity out of attempts, waiting for the failure to be recorded
    Parked,
}

struct Lease {
    token: Uuid,
    worker_id: String,
    expires_at: DateTime<Utc>,
    heartbeat_deadline: Option<DateTime<Utc>>,
}

impl Lease {
    fn expiry(&self, now: DateTime<Utc>) -> Option<ExpiryReason> {
        if self.heartbeat_deadline.is_some_and(|d| d <= now) {
            Some(ExpiryReason::HeartbeatTimeout)
        } else if self.expires_at <= now {
            Some(ExpiryReason::LeaseExpired)
        } else {
            None
        }
    }
}

struct TaskRecord {
    id: Uuid,
    definition: TaskDefinition,
    state: TaskState,
    attempt: u32,
    visible_at: DateTime<Utc>,
    order: u64,
    lease: Option<Lease>,
    cancel_requested: bool,
    last_error: Option<String>,
    heartbeat_details: Option<serde_json::Value>,
    parked_reason: Option<ExpiryReason>,
}

impl TaskRecord {
    fn snapshot(&self, lease: &Lease) -> ClaimedTask {
        ClaimedTask {
            id: self.id,
            lease_token: lease.token,
            worker_id: lease.worker_id.clone(),
            task_queue: self.definition.task_queue.clone(),
            instance: self.definition.instance.clone(),
            workflow_type: self.definition.workflow_type.clone(),
            payload: self.definition.payload.clone(),
            attempt: self.attempt,
            lease_expires_at: lease.expires_at,
        }
    }

    fn is_exhausted(&self) -> bool {
        self.definition
            .max_attempts()
            .is_some_and(|max| self.attempt >= max)
    }

    fn same_item(&self, instance: &InstanceId, kind: TaskKind, item_id: Option<&str>) -> bool {
        self.definition.instance == *instance
            && self.definition.kind() == kind
            && self.definition.item_id() == item_id
    }
}

#[derive(Default)]
struct MemoryState {
    instances: HashMap<InstanceId, InstanceRecord>,
    current_runs: HashMap<String, Uuid>,
    tasks: HashMap<Uuid, TaskRecord>,
    next_order: u64,
    workers: HashMap<String, WorkerInfo>,
}

impl MemoryState {
    fn instance(&self, instance: &InstanceId) -> Result<&InstanceRecord, StoreError> {
        self.instances
            .get(instance)
            .ok_or_else(|| StoreError::InstanceNotFound(instance.clone()))
    }

    fn check_append(
        &self,
        instance: &InstanceId,
        expected_next: u64,
        appending: bool,
    ) -> Result<(), StoreError> {
        let record = self.instance(instance)?;
        let actual = record.next_sequence();
        if actual != expected_next {
            return Err(StoreError::Conflict {
                instance: instance.clone(),
                expected: expected_next,
                actual,
            });
        }
        if appending && record.is_closed() {
            return Err(StoreError::InstanceClosed(instance.clone()));
        }
        Ok(())
    }

    fn push_events(
        &mut self,
        instance: &InstanceId,
        events: Vec<WorkflowEvent>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let record = self
            .instances
            .get_mut(instance)
            .ok_or_else(|| StoreError::InstanceNotFound(instance.clone()))?;

        for event in events {
            let sequence = record.next_sequence();
            record.events.push(HistoryEvent {
                sequence,
                timestamp: now,
                event,
            });
        }
        record.info.history_length = record.events.len() as u64;
        Ok(record.info.history_length)
    }

    fn check_create(&self, new: &NewInstance) -> Result<(), StoreError> {
        if self.instances.contains_key(&new.instance) {
            return Ok(());
        }
        if let Some(run_id) = self.current_runs.get(&new.instance.workflow_id) {
            let current = InstanceId::new(new.instance.workflow_id.clone(), *run_id);
            let open = self
                .instances
                .get(&current)
                .is_some_and(|r| !r.info.status.is_terminal());
            if open && new.continued_from != Some(*run_id) {
                return Err(StoreError::AlreadyRunning {
                    workflow_id: new.instance.workflow_id.clone(),
                    run_id: *run_id,
                });
            }
        }
        Ok(())
    }

    fn create(&mut self, new: NewInstance, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_create(&new)?;
        if self.instances.contains_key(&new.instance) {
            return Ok(());
        }

        let info = WorkflowInfo {
            instance: new.instance.clone(),
            workflow_type: new.workflow_type.clone(),
            task_queue: new.task_queue.clone(),
            status: WorkflowStatus::Running,
            input: new.input.clone(),
            result: None,
            error: None,
            history_length: 1,
            created_at: now,
            closed_at: None,
        };
        let started = HistoryEvent {
            sequence: 1,
            timestamp: now,
            event: new.started_event(),
        };
        self.instances.insert(
            new.instance.clone(),
            InstanceRecord {
                info,
                events: vec![started],
            },
        );
        self.current_runs
            .insert(new.instance.workflow_id.clone(), new.instance.run_id);

        for task in new.initial_tasks(now) {
            self.insert_task(task, now);
        }
        Ok(())
    }

    fn insert_task(&mut self, task: TaskDefinition, now: DateTime<Utc>) -> Uuid {
        let visible_at = task.visible_at.unwrap_or(now);

        let existing = match task.kind() {
            TaskKind::Workflow => self.tasks.values_mut().find(|t| {
                t.state == TaskState::Pending
                    && t.same_item(&task.instance, TaskKind::Workflow, None)
            }),
            kind => self
                .tasks
                .values_mut()
                .find(|t| t.same_item(&task.instance, kind, task.item_id())),
        };
        if let Some(existing) = existing {
            if existing.state == TaskState::Pending && visible_at < existing.visible_at {
                existing.visible_at = visible_at;
            }
            return existing.id;
        }

        let id = Uuid::now_v7();
        self.next_order += 1;
        self.tasks.insert(
            id,
            TaskRecord {
                id,
                definition: task,
                state: TaskState::Pending,
                attempt: 0,
                visible_at,
                order: self.next_order,
                lease: None,
                cancel_requested: false,
                last_error: None,
                heartbeat_details: None,
                parked_reason: None,
            },
        );
        id
    }

    fn close(&mut self, instance: &InstanceId, close: InstanceClose, now: DateTime<Utc>) {
        if let Some(record) = self.instances.get_mut(instance) {
            record.info.status = close.status;
            record.info.result = close.result;
            record.info.error = close.error;
            record.info.closed_at = Some(now);
        }

        self.tasks.retain(|_, t| {
            t.definition.instance != *instance || t.state == TaskState::Leased
        });
        for task in self.tasks.values_mut() {
            if task.definition.instance == *instance && task.definition.kind() == TaskKind::Activity {
                task.cancel_requested = true;
            }
        }
    }

    fn is_open(&self, instance: &InstanceId) -> bool {
        self.instances
            .get(instance)
            .is_some_and(|r| !r.info.status.is_terminal())
    }

    fn leased_workflow_task(&self, instance: &InstanceId, now: DateTime<Utc>) -> bool {
        self.tasks.values().any(|t| {
            t.state == TaskState::Leased
                && t.definition.kind() == TaskKind::Workflow
                && t.definition.instance == *instance
                && t.lease.as_ref().is_some_and(|l| l.expiry(now).is_none())
        })
    }

    /// Release expired leases; returns newly expired and all parked tasks
    fn reclaim(&mut self, now: DateTime<Utc>) -> Vec<ExpiredTask> {
        let expired: Vec<(Uuid, ExpiryReason)> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Leased)
            .filter_map(|t| {
                t.lease
                    .as_ref()
                    .and_then(|l| l.expiry(now))
                    .map(|reason| (t.id, reason))
            })
            .collect();

        let mut reclaimed = Vec::new();
        for (id, reason) in expired {
            let (instance, kind) = match self.tasks.get(&id) {
                Some(t) => (t.definition.instance.clone(), t.definition.kind()),
                None => continue,
            };

            if !self.is_open(&instance) {
                self.tasks.remove(&id);
                continue;
            }

            let coalesce = kind == TaskKind::Workflow
                && self.tasks.values().any(|t| {
                    t.id != id
                        && t.state == TaskState::Pending
                        && t.same_item(&instance, TaskKind::Workflow, None)
                });

            if coalesce {
                if let Some(mut task) = self.tasks.remove(&id) {
                    if let Some(lease) = task.lease.take() {
                        reclaimed.push(ExpiredTask {
                            task: task.snapshot(&lease),
                            reason,
                            exhausted: false,
                        });
                    }
                }
                continue;
            }

            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            let Some(lease) = task.lease.take() else {
                continue;
            };
            task.last_error = Some(format!("{reason:?}"));

            if task.is_exhausted() {
                task.state = TaskState::Parked;
                task.parked_reason = Some(reason);
            } else {
                let delay = redelivery_delay(&task.definition.payload, task.attempt);
                task.state = TaskState::Pending;
                task.visible_at = now + chrono_duration(delay);
                reclaimed.push(ExpiredTask {
                    task: task.snapshot(&lease),
                    reason,
                    exhausted: false,
                });
            }
        }

        for task in self.tasks.values().filter(|t| t.state == TaskState::Parked) {
            let reason = task.parked_reason.unwrap_or(ExpiryReason::LeaseExpired);
            let lease = Lease {
                token: Uuid::nil(),
                worker_id: String::new(),
                expires_at: now,
                heartbeat_deadline: None,
            };
            reclaimed.push(ExpiredTask {
                task: task.snapshot(&lease),
                reason,
                exhausted: true,
            });
        }

        reclaimed
    }

    fn claim(&mut self, request: &PollRequest, now: DateTime<Utc>) -> Option<ClaimedTask> {
        self.reclaim(now);

        let candidate = self
            .tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Pending
                    && t.visible_at <= now
                    && t.definition.task_queue == request.task_queue
                    && request.accepts(t.definition.kind(), t.definition.type_name())
            })
            .filter(|t| {
                t.definition.kind() != TaskKind::Workflow
                    || !self.leased_workflow_task(&t.definition.instance, now)
            })
            .min_by_key(|t| (t.visible_at, t.order))
            .map(|t| t.id)?;

        let task = self.tasks.get_mut(&candidate)?;
        let lease_for = task.definition.lease_override().unwrap_or(request.lease);
        let lease = Lease {
            token: Uuid::now_v7(),
            worker_id: request.worker_id.clone(),
            expires_at: now + chrono_duration(lease_for),
            heartbeat_deadline: task
                .definition
                .heartbeat_timeout()
                .map(|hb| now + chrono_duration(hb)),
        };
        task.state = TaskState::Leased;
        task.attempt += 1;
        let claimed = task.snapshot(&lease);
        task.lease = Some(lease);
        Some(claimed)
    }

    fn owned_task(
        &mut self,
        task_id: Uuid,
        lease_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<&mut TaskRecord, StoreError> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        let owns = task.state == TaskState::Leased
            && task
                .lease
                .as_ref()
                .is_some_and(|l| l.token == lease_token && l.expiry(now).is_none());
        if owns {
            Ok(task)
        } else {
            Err(StoreError::LeaseExpired(task_id))
        }
    }
}

/// In-memory implementation of WorkflowEventStore
///
/// Used by tests and single-process runs. A single mutex guards all state,
/// so every operation (including [`WorkflowEventStore::commit`]) is atomic,
/// matching the transactional semantics of the Postgres store.
///
/// # Example
///
/// ```
/// use keel_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.instance_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowEventStore {
    state: Mutex<MemoryState>,
    notifiers: DashMap<String, Arc<Notify>>,
}

impl InMemoryWorkflowEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workflow runs
    pub fn instance_count(&self) -> usize {
        self.state.lock().instances.len()
    }

    /// Number of tasks in any state
    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Number of pending tasks of a kind on a queue
    pub fn pending_task_count(&self, task_queue: &str, kind: TaskKind) -> usize {
        self.state
            .lock()
            .tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Pending
                    && t.definition.task_queue == task_queue
                    && t.definition.kind() == kind
            })
            .count()
    }

    /// Last heartbeat details recorded for a task
    pub fn heartbeat_details(&self, task_id: Uuid) -> Option<serde_json::Value> {
        self.state
            .lock()
            .tasks
            .get(&task_id)
            .and_then(|t| t.heartbeat_details.clone())
    }

    fn notifier(&self, task_queue: &str) -> Arc<Notify> {
        self.notifiers
            .entry(task_queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn notify<'a>(&self, queues: impl IntoIterator<Item = &'a str>) {
        for queue in queues {
            if let Some(notify) = self.notifiers.get(queue) {
                notify.notify_waiters();
            }
        }
    }
}

#[async_trait]
impl HistoryLog for InMemoryWorkflowEventStore {
    async fn append_events(
        &self,
        instance: &InstanceId,
        expected_next: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        state.check_append(instance, expected_next, !events.is_empty())?;
        state.push_events(instance, events, Utc::now())
    }

    async fn read_events(
        &self,
        instance: &InstanceId,
        from_sequence: u64,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        let state = self.state.lock();
        let record = state.instance(instance)?;
        Ok(record
            .events
            .iter()
            .filter(|e| e.sequence >= from_sequence)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TaskQueue for InMemoryWorkflowEventStore {
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let queue = task.task_queue.clone();
        let id = self.state.lock().insert_task(task, Utc::now());
        self.notify([queue.as_str()]);
        Ok(id)
    }

    async fn claim_task(&self, request: &PollRequest) -> Result<Option<ClaimedTask>, StoreError> {
        Ok(self.state.lock().claim(request, Utc::now()))
    }

    async fn wait_for_task(&self, task_queue: &str, max_wait: Duration) {
        let notify = self.notifier(task_queue);
        let _ = tokio::time::timeout(max_wait, notify.notified()).await;
    }

    async fn ack_task(&self, task_id: Uuid, lease_token: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.owned_task(task_id, lease_token, Utc::now())?;
        state.tasks.remove(&task_id);
        Ok(())
    }

    async fn extend_lease(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        extension: Duration,
    ) -> Result<DateTime<Utc>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let task = state.owned_task(task_id, lease_token, now)?;
        let expires_at = now + chrono_duration(extension);
        if let Some(lease) = task.lease.as_mut() {
            lease.expires_at = expires_at;
        }
        Ok(expires_at)
    }

    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let task = state.owned_task(task_id, lease_token, now)?;
        let heartbeat_timeout = task.definition.heartbeat_timeout();
        if let Some(lease) = task.lease.as_mut() {
            lease.heartbeat_deadline = heartbeat_timeout.map(|hb| now + chrono_duration(hb));
        }
        if details.is_some() {
            task.heartbeat_details = details;
        }
        Ok(HeartbeatResponse {
            accepted: true,
            should_cancel: task.cancel_requested,
        })
    }

    async fn retry_task(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        delay: Duration,
        error: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let queue = {
            let mut state = self.state.lock();
            let task = state.owned_task(task_id, lease_token, now)?;
            task.state = TaskState::Pending;
            task.lease = None;
            task.visible_at = now + chrono_duration(delay);
            task.last_error = Some(error.to_string());
            task.definition.task_queue.clone()
        };
        self.notify([queue.as_str()]);
        Ok(())
    }

    async fn reclaim_expired_tasks(&self) -> Result<Vec<ExpiredTask>, StoreError> {
        let expired = self.state.lock().reclaim(Utc::now());
        self.notify(
            expired
                .iter()
                .filter(|e| !e.exhausted)
                .map(|e| e.task.task_queue.as_str()),
        );
        Ok(expired)
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_instance(&self, instance: NewInstance) -> Result<(), StoreError> {
        let queue = instance.task_queue.clone();
        self.state.lock().create(instance, Utc::now())?;
        self.notify([queue.as_str()]);
        Ok(())
    }

    async fn current_run(&self, workflow_id: &str) -> Result<InstanceId, StoreError> {
        self.state
            .lock()
            .current_runs
            .get(workflow_id)
            .map(|run_id| InstanceId::new(workflow_id, *run_id))
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn get_workflow_info(&self, instance: &InstanceId) -> Result<WorkflowInfo, StoreError> {
        Ok(self.state.lock().instance(instance)?.info.clone())
    }

    async fn commit(&self, mut commit: HistoryCommit) -> Result<CommitResult, StoreError> {
        commit.drop_tasks_of_closing_run();
        let now = Utc::now();
        let mut queues: Vec<String> = commit.tasks.iter().map(|t| t.task_queue.clone()).collect();

        let result = {
            let mut state = self.state.lock();

            // Validate everything before the first write.
            state.check_append(&commit.instance, commit.expected_next, !commit.events.is_empty())?;
            if let Some(next) = &commit.continue_as {
                if commit.close.is_none() {
                    state.check_create(next)?;
                }
            }

            let last_sequence = state.push_events(&commit.instance, commit.events, now)?;

            if let Some(close) = commit.close {
                state.close(&commit.instance, close, now);
            }

            for timer_id in &commit.cancel_timers {
                state.tasks.retain(|_, t| {
                    t.state == TaskState::Leased
                        || !t.same_item(&commit.instance, TaskKind::Timer, Some(timer_id))
                });
            }
            for activity_id in &commit.cancel_activities {
                for task in state.tasks.values_mut() {
                    if task.same_item(&commit.instance, TaskKind::Activity, Some(activity_id)) {
                        task.cancel_requested = true;
                    }
                }
            }

            let enqueued = commit
                .tasks
                .into_iter()
                .map(|task| state.insert_task(task, now))
                .collect();

            if let Some(next) = commit.continue_as {
                queues.push(next.task_queue.clone());
                state.create(next, now)?;
            }

            let acked = match commit.ack {
                Some(ack) => {
                    let owned = state.tasks.get(&ack.task_id).is_some_and(|t| match ack.lease_token {
                        None => true,
                        Some(token) => t.lease.as_ref().is_some_and(|l| l.token == token),
                    });
                    if owned {
                        state.tasks.remove(&ack.task_id);
                    }
                    owned
                }
                None => false,
            };

            CommitResult {
                last_sequence,
                enqueued,
                acked,
            }
        };

        self.notify(queues.iter().map(String::as_str));
        Ok(result)
    }

    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        let purged: Vec<InstanceId> = state
            .instances
            .values()
            .filter(|r| r.info.status.is_terminal() && r.info.closed_at.is_some_and(|at| at < cutoff))
            .map(|r| r.info.instance.clone())
            .collect();

        for instance in &purged {
            state.instances.remove(instance);
            state.tasks.retain(|_, t| t.definition.instance != *instance);
            if state.current_runs.get(&instance.workflow_id) == Some(&instance.run_id) {
                state.current_runs.remove(&instance.workflow_id);
            }
        }
        Ok(purged.len() as u64)
    }

    async fn register_worker(&self, worker: WorkerInfo) -> Result<(), StoreError> {
        self.state.lock().workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        self.state.lock().workers.remove(worker_id);
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        Ok(self.state.lock().workers.values().cloned().collect())
    }
}
