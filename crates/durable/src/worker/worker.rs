//! Stateless worker: workflow and activity poll loops plus housekeeping

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::activity::ActivityExecutor;
use super::limiter::{ConcurrencyLimiter, SlotGuard};
use super::poller::{ErrorBackoff, PollerConfig};
use crate::activity::ActivityRegistry;
use crate::engine::{
    ExecutorConfig, ExecutorError, MatchingService, RegistryError, WorkflowExecutor,
    WorkflowRegistry,
};
use crate::persistence::{ClaimedTask, PollRequest, StoreError, WorkerInfo, WorkflowEventStore};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker ID
    pub worker_id: String,

    /// Queue this worker polls
    pub task_queue: String,

    /// Workflow tasks (and timers) run at once
    pub max_concurrent_workflow_tasks: usize,

    /// Activities run at once
    pub max_concurrent_activities: usize,

    /// Lease for workflow and timer tasks; renewed while a task runs
    pub workflow_task_lease: Duration,

    pub poller: PollerConfig,

    /// Interval of the lease reaper and registration refresh
    pub housekeeping_interval: Duration,

    /// Purge runs closed longer ago than this
    pub retention: Option<Duration>,

    /// Maximum wait for in-flight tasks on shutdown
    pub shutdown_timeout: Duration,

    pub executor: ExecutorConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: "default".to_string(),
            max_concurrent_workflow_tasks: 100,
            max_concurrent_activities: 100,
            workflow_task_lease: Duration::from_secs(30),
            poller: PollerConfig::default(),
            housekeeping_interval: Duration::from_secs(5),
            retention: None,
            shutdown_timeout: Duration::from_secs(30),
            executor: ExecutorConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create config for a task queue
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrent_workflow_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_workflow_tasks = max;
        self
    }

    pub fn with_max_concurrent_activities(mut self, max: usize) -> Self {
        self.max_concurrent_activities = max;
        self
    }

    pub fn with_workflow_task_lease(mut self, lease: Duration) -> Self {
        self.workflow_task_lease = lease;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_executor(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    fn validate(&self) -> Result<(), WorkerError> {
        if self.task_queue.is_empty() {
            return Err(WorkerError::InvalidConfig("task queue must not be empty".into()));
        }
        if self.worker_id.is_empty() {
            return Err(WorkerError::InvalidConfig("worker id must not be empty".into()));
        }
        if self.max_concurrent_workflow_tasks == 0 || self.max_concurrent_activities == 0 {
            return Err(WorkerError::InvalidConfig(
                "concurrency limits must be at least 1".into(),
            ));
        }
        if self.workflow_task_lease.is_zero() {
            return Err(WorkerError::InvalidConfig(
                "workflow task lease must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Built but not polling
    Idle,
    /// Polling and running tasks
    Running,
    /// Draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid worker configuration: {0}")]
    InvalidConfig(String),

    /// Worker already running
    #[error("worker is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// A stateless worker process
///
/// Holds no durable state: everything it knows comes from the store, so any
/// number of workers can poll the same queue and a crashed worker's tasks are
/// redelivered once their leases run out.
///
/// # Example
///
/// ```ignore
/// let mut workflows = WorkflowRegistry::new();
/// workflows.register::<GreetingWorkflow>()?;
/// let mut activities = ActivityRegistry::new();
/// activities.register(ComposeGreeting)?;
///
/// let worker = Worker::new(store, workflows, activities, WorkerConfig::new("greetings"))?;
/// worker.start().await?;
/// // ...
/// worker.shutdown().await?;
/// ```
pub struct Worker<S: WorkflowEventStore + ?Sized = dyn WorkflowEventStore> {
    executor: Arc<WorkflowExecutor<S>>,
    matching: Arc<MatchingService<S>>,
    activities: Arc<ActivityExecutor<S>>,
    config: WorkerConfig,
    status: RwLock<WorkerStatus>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

impl<S: WorkflowEventStore + ?Sized> Worker<S> {
    /// Build a worker, validating registrations and limits
    pub fn new(
        store: Arc<S>,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        if workflows.is_empty() && activities.is_empty() {
            return Err(RegistryError::Empty.into());
        }

        let executor = Arc::new(WorkflowExecutor::with_config(
            store.clone(),
            workflows,
            config.executor.clone(),
        ));

        Ok(Self {
            matching: Arc::new(MatchingService::new(store)),
            activities: Arc::new(ActivityExecutor::new(executor.clone(), activities)),
            executor,
            config,
            status: RwLock::new(WorkerStatus::Idle),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started_at: RwLock::new(None),
        })
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor<S>> {
        &self.executor
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    /// Register with the store and spawn the poll and housekeeping loops
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if *status != WorkerStatus::Idle {
                return Err(WorkerError::AlreadyRunning);
            }
            *status = WorkerStatus::Running;
        }

        let workflow_types = self.executor.registry().workflow_types();
        let activity_types = self.activities.registry().activity_types();
        info!(
            task_queue = %self.config.task_queue,
            ?workflow_types,
            ?activity_types,
            max_concurrent_workflow_tasks = self.config.max_concurrent_workflow_tasks,
            max_concurrent_activities = self.config.max_concurrent_activities,
            "Starting worker"
        );

        *self.started_at.write() = Some(Utc::now());
        if let Err(e) = self.register().await {
            *self.status.write() = WorkerStatus::Idle;
            return Err(e);
        }

        if !workflow_types.is_empty() {
            self.spawn_workflow_loop(workflow_types);
        }
        if !activity_types.is_empty() {
            self.spawn_activity_loop(activity_types);
        }
        self.spawn_housekeeping_loop();

        Ok(())
    }

    /// Stop polling, drain in-flight tasks and deregister
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if matches!(*status, WorkerStatus::Stopped | WorkerStatus::Draining) {
                return Ok(());
            }
            *status = WorkerStatus::Draining;
        }

        info!("Initiating graceful shutdown");
        self.shutdown.cancel();
        self.tracker.close();

        let drained = tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(remaining_tasks = self.tracker.len(), "Shutdown timeout reached");
        }

        self.executor
            .store()
            .deregister_worker(&self.config.worker_id)
            .await?;
        *self.status.write() = WorkerStatus::Stopped;

        if !drained {
            return Err(WorkerError::ShutdownTimeout);
        }
        info!("Worker stopped");
        Ok(())
    }

    async fn register(&self) -> Result<(), WorkerError> {
        let info = worker_info(&self.config, &self.executor, &self.activities, *self.started_at.read());
        self.executor.store().register_worker(info).await?;
        Ok(())
    }

    fn spawn_workflow_loop(&self, workflow_types: Vec<String>) {
        let request = PollRequest::workflow_tasks(
            &self.config.task_queue,
            &self.config.worker_id,
            workflow_types,
            self.config.workflow_task_lease,
        );
        let limiter = ConcurrencyLimiter::new(self.config.max_concurrent_workflow_tasks);
        let executor = self.executor.clone();
        let lease = self.config.workflow_task_lease;

        self.spawn_poll_loop("workflow", request, limiter, move |task, slot| {
            let executor = executor.clone();
            async move {
                run_workflow_task(executor, task, lease).await;
                drop(slot);
            }
        });
    }

    fn spawn_activity_loop(&self, activity_types: Vec<String>) {
        let request = PollRequest::activity_tasks(
            &self.config.task_queue,
            &self.config.worker_id,
            activity_types,
            self.config.workflow_task_lease,
        );
        let limiter = ConcurrencyLimiter::new(self.config.max_concurrent_activities);
        let activities = self.activities.clone();

        self.spawn_poll_loop("activity", request, limiter, move |task, slot| {
            let activities = activities.clone();
            async move {
                let task_id = task.id;
                if let Err(e) = activities.execute(task).await {
                    error!(%task_id, "Activity task failed: {}", e);
                }
                drop(slot);
            }
        });
    }

    /// Poll while a slot is free and hand each task to `run` on the tracker
    fn spawn_poll_loop<F, Fut>(
        &self,
        side: &'static str,
        request: PollRequest,
        limiter: ConcurrencyLimiter,
        run: F,
    ) where
        F: Fn(ClaimedTask, SlotGuard) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let matching = self.matching.clone();
        let shutdown = self.shutdown.clone();
        let tracker = self.tracker.clone();
        let poller = self.config.poller.clone();

        self.tracker.spawn(async move {
            let mut backoff = ErrorBackoff::new(poller.clone());

            loop {
                let slot = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    slot = limiter.acquire() => match slot {
                        Some(slot) => slot,
                        None => break,
                    },
                };

                match matching.poll(&request, poller.poll_timeout, &shutdown).await {
                    Ok(Some(task)) => {
                        backoff.reset();
                        tracker.spawn(run(task, slot));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let delay = backoff.next_delay();
                        if e.is_transient() {
                            warn!(side, ?delay, "Poll failed: {}", e);
                        } else {
                            error!(side, ?delay, "Poll failed: {}", e);
                        }
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }

            debug!(side, "Poll loop exited");
        });
    }

    fn spawn_housekeeping_loop(&self) {
        let executor = self.executor.clone();
        let activities = self.activities.clone();
        let config = self.config.clone();
        let started_at = *self.started_at.read();
        let shutdown = self.shutdown.clone();

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(config.housekeeping_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match executor.reclaim_expired_tasks().await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "Reclaimed expired tasks"),
                            Err(e) => error!("Lease reaper failed: {}", e),
                        }

                        if let Some(retention) = config.retention {
                            match executor.purge_closed(retention).await {
                                Ok(0) => {}
                                Ok(purged) => info!(purged, "Purged closed workflows"),
                                Err(e) => error!("Retention purge failed: {}", e),
                            }
                        }

                        let info = worker_info(&config, &executor, &activities, started_at);
                        if let Err(e) = executor.store().register_worker(info).await {
                            warn!("Worker registration refresh failed: {}", e);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }

            debug!("Housekeeping loop exited");
        });
    }
}

/// Process one workflow or timer task, renewing its lease while it runs
async fn run_workflow_task<S: WorkflowEventStore + ?Sized>(
    executor: Arc<WorkflowExecutor<S>>,
    task: ClaimedTask,
    lease: Duration,
) {
    let keeper = tokio::spawn(keep_lease(executor.clone(), task.id, task.lease_token, lease));

    match executor.process_workflow_task(&task).await {
        Ok(result) => debug!(
            task_id = %task.id,
            events = result.events_written,
            tasks = result.tasks_enqueued,
            closed = ?result.closed,
            "Workflow task done"
        ),
        Err(ExecutorError::NonDeterminism(e)) => {
            error!(task_id = %task.id, instance = %task.instance, "Run failed: {}", e)
        }
        Err(e) => error!(task_id = %task.id, instance = %task.instance, "Workflow task failed: {}", e),
    }

    keeper.abort();
}

async fn keep_lease<S: WorkflowEventStore + ?Sized>(
    executor: Arc<WorkflowExecutor<S>>,
    task_id: Uuid,
    lease_token: Uuid,
    lease: Duration,
) {
    let mut ticker = tokio::time::interval(lease / 2);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = executor.store().extend_lease(task_id, lease_token, lease).await {
            debug!(%task_id, "Stopped renewing lease: {}", e);
            return;
        }
    }
}

fn worker_info<S: WorkflowEventStore + ?Sized>(
    config: &WorkerConfig,
    executor: &WorkflowExecutor<S>,
    activities: &ActivityExecutor<S>,
    started_at: Option<DateTime<Utc>>,
) -> WorkerInfo {
    let now = Utc::now();
    WorkerInfo {
        id: config.worker_id.clone(),
        task_queue: config.task_queue.clone(),
        workflow_types: executor.registry().workflow_types(),
        activity_types: activities.registry().activity_types(),
        max_concurrent_workflow_tasks: config.max_concurrent_workflow_tasks,
        max_concurrent_activities: config.max_concurrent_activities,
        started_at: started_at.unwrap_or(now),
        last_seen_at: now,
    }
}
