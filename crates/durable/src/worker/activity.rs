//! Runs one claimed activity task and reports its outcome

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::activity::{ActivityContext, ActivityError, ActivityRegistry, HeartbeatPayload};
use crate::engine::{ActivityOutcome, ExecutorError, WorkflowExecutor};
use crate::persistence::{ClaimedTask, StoreError, WorkflowEventStore};
use crate::workflow::TimeoutType;

/// Error type for activities a worker cannot run
pub const UNKNOWN_ACTIVITY_ERROR: &str = "unknown_activity";

/// Heartbeats buffered between the activity and the forwarder
const HEARTBEAT_BUFFER: usize = 16;

/// Executes activity tasks against the registered handlers
///
/// Each attempt runs under its start-to-close timeout with panics caught.
/// Heartbeats from the activity are forwarded to the task queue; a
/// cancel-requested response or a lost lease fires the context's
/// cancellation token.
pub struct ActivityExecutor<S: WorkflowEventStore + ?Sized = dyn WorkflowEventStore> {
    executor: Arc<WorkflowExecutor<S>>,
    registry: ActivityRegistry,
}

impl<S: WorkflowEventStore + ?Sized> ActivityExecutor<S> {
    pub fn new(executor: Arc<WorkflowExecutor<S>>, registry: ActivityRegistry) -> Self {
        Self { executor, registry }
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Run one attempt and record the result
    #[instrument(skip(self, task), fields(task_id = %task.id, instance = %task.instance, attempt = task.attempt))]
    pub async fn execute(&self, task: ClaimedTask) -> Result<ActivityOutcome, ExecutorError> {
        let invocation = task.activity().cloned().ok_or_else(|| {
            ExecutorError::InvalidTask(format!("task {} is not an activity task", task.id))
        })?;

        let Some(handler) = self.registry.get(&invocation.activity_type) else {
            warn!(activity_type = %invocation.activity_type, "no handler registered");
            let error = ActivityError::non_retryable(format!(
                "no handler registered for activity type {}",
                invocation.activity_type
            ))
            .with_type(UNKNOWN_ACTIVITY_ERROR);
            return self.executor.fail_activity(&task, error).await;
        };

        let cancellation = CancellationToken::new();
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(HEARTBEAT_BUFFER);
        let forwarder = tokio::spawn(forward_heartbeats(
            self.executor.clone(),
            task.clone(),
            heartbeat_rx,
            cancellation.clone(),
        ));

        let ctx = ActivityContext::new(
            task.instance.clone(),
            &invocation.activity_id,
            task.attempt,
            invocation.options.retry_policy.max_attempts,
        )
        .with_task_id(task.id)
        .with_heartbeat(heartbeat_tx)
        .with_cancellation(cancellation);

        debug!(activity_type = %invocation.activity_type, activity_id = %invocation.activity_id, "running activity");
        let attempt = AssertUnwindSafe(handler(ctx, invocation.input.clone())).catch_unwind();
        let result =
            match tokio::time::timeout(invocation.options.start_to_close_timeout, attempt).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(ActivityError::retryable(format!(
                    "activity panicked: {}",
                    panic_message(panic.as_ref())
                ))
                .with_type("panic")),
                Err(_) => Err(ActivityError::timeout(TimeoutType::StartToClose)),
            };
        forwarder.abort();

        let outcome = match result {
            Ok(output) => self.executor.complete_activity(&task, output).await?,
            Err(error) => self.executor.fail_activity(&task, error).await?,
        };
        info!(
            activity_type = %invocation.activity_type,
            activity_id = %invocation.activity_id,
            ?outcome,
            "activity attempt finished"
        );
        Ok(outcome)
    }
}

async fn forward_heartbeats<S: WorkflowEventStore + ?Sized>(
    executor: Arc<WorkflowExecutor<S>>,
    task: ClaimedTask,
    mut heartbeats: mpsc::Receiver<HeartbeatPayload>,
    cancellation: CancellationToken,
) {
    while let Some(heartbeat) = heartbeats.recv().await {
        match executor
            .store()
            .heartbeat_task(task.id, task.lease_token, heartbeat.details)
            .await
        {
            Ok(response) if response.should_cancel => {
                debug!(task_id = %task.id, "cancellation requested");
                cancellation.cancel();
            }
            Ok(_) => {}
            Err(StoreError::LeaseExpired(_) | StoreError::TaskNotFound(_)) => {
                debug!(task_id = %task.id, "lease lost, cancelling activity");
                cancellation.cancel();
                return;
            }
            Err(e) => warn!(task_id = %task.id, "heartbeat failed: {}", e),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{StartWorkflowOptions, WorkflowRegistry};
    use crate::persistence::{
        HistoryLog, InMemoryWorkflowEventStore, PollRequest, TaskKind, TaskQueue,
    };
    use crate::reliability::RetryPolicy;
    use crate::workflow::{ActivityOptions, Workflow, WorkflowContext, WorkflowEvent};
    use serde_json::{json, Value};
    use std::time::Duration;

    const QUEUE: &str = "q";

    /// Like [`CallOnce`], but a start-to-close timeout is not retried
    struct CallNoTimeoutRetry {
        activity_type: String,
    }

    impl Workflow for CallNoTimeoutRetry {
        const TYPE: &'static str = "call_no_timeout_retry";
        type Input = String;
        type Output = Value;

        fn new(activity_type: String) -> Self {
            Self { activity_type }
        }

        fn on_start(&mut self, ctx: &mut WorkflowContext) {
            ctx.schedule_activity(
                "call",
                self.activity_type.clone(),
                json!("in"),
                ActivityOptions::with_timeout(Duration::from_millis(100)).with_retry(
                    RetryPolicy::fixed(Duration::ZERO, 3)
                        .with_non_retryable_error(TimeoutType::StartToClose.error_type()),
                ),
            );
        }

        fn on_activity_completed(&mut self, _: &mut WorkflowContext, _: &str, _: Value) {}

        fn on_activity_failed(&mut self, ctx: &mut WorkflowContext, _: &str, error: &ActivityError) {
            ctx.fail(error.clone().into());
        }
    }

    /// Calls the activity type named by its input once
    struct CallOnce {
        activity_type: String,
    }

    impl Workflow for CallOnce {
        const TYPE: &'static str = "call_once";
        type Input = String;
        type Output = Value;

        fn new(activity_type: String) -> Self {
            Self { activity_type }
        }

        fn on_start(&mut self, ctx: &mut WorkflowContext) {
            ctx.schedule_activity(
                "call",
                self.activity_type.clone(),
                json!("in"),
                ActivityOptions::with_timeout(Duration::from_millis(200))
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

    async fn setup(
        activity_type: &str,
        registry: ActivityRegistry,
    ) -> (Arc<InMemoryWorkflowEventStore>, ActivityExecutor<InMemoryWorkflowEventStore>) {
        setup_with(CallOnce::TYPE, activity_type, registry).await
    }

    async fn setup_with(
        workflow_type: &str,
        activity_type: &str,
        registry: ActivityRegistry,
    ) -> (Arc<InMemoryWorkflowEventStore>, ActivityExecutor<InMemoryWorkflowEventStore>) {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let mut workflows = WorkflowRegistry::new();
        workflows.register::<CallOnce>().unwrap();
        workflows.register::<CallNoTimeoutRetry>().unwrap();
        let executor = Arc::new(WorkflowExecutor::new(store.clone(), workflows));

        executor
            .start_workflow(
                workflow_type,
                "wf-1",
                json!(activity_type),
                StartWorkflowOptions::new(QUEUE),
            )
            .await
            .unwrap();
        let task = store
            .claim_task(&PollRequest::workflow_tasks(
                QUEUE,
                "w",
                vec![workflow_type.into()],
                Duration::from_secs(30),
            ))
            .await
            .unwrap()
            .unwrap();
        executor.process_workflow_task(&task).await.unwrap();

        (store, ActivityExecutor::new(executor, registry))
    }

    async fn claim(store: &InMemoryWorkflowEventStore, activity_type: &str) -> ClaimedTask {
        store
            .claim_task(&PollRequest::activity_tasks(
                QUEUE,
                "w",
                vec![activity_type.into()],
                Duration::from_secs(30),
            ))
            .await
            .unwrap()
            .expect("activity task")
    }

    #[tokio::test]
    async fn test_success_is_recorded() {
        let mut registry = ActivityRegistry::new();
        registry
            .register_fn("echo", |_ctx, input| async move { Ok(input) })
            .unwrap();
        let (store, activities) = setup("echo", registry).await;

        let outcome = activities.execute(claim(&store, "echo").await).await.unwrap();
        assert_eq!(outcome, ActivityOutcome::Recorded);
        assert_eq!(store.pending_task_count(QUEUE, TaskKind::Workflow), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable_failure() {
        let mut registry = ActivityRegistry::new();
        registry
            .register_fn("slow", |_ctx, input| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(input)
            })
            .unwrap();
        let (store, activities) = setup("slow", registry).await;

        // The worker still holds the lease when its own timeout fires.
        let outcome = activities.execute(claim(&store, "slow").await).await.unwrap();
        assert_eq!(outcome, ActivityOutcome::RetryScheduled(Duration::ZERO));

        let outcome = activities.execute(claim(&store, "slow").await).await.unwrap();
        assert_eq!(outcome, ActivityOutcome::Recorded);

        let instance = store.current_run("wf-1").await.unwrap();
        let history = store.read_events(&instance, 1).await.unwrap();
        let failure = history
            .iter()
            .find_map(|e| match &e.event {
                WorkflowEvent::ActivityFailed { error, attempts, .. } => Some((error.clone(), *attempts)),
                _ => None,
            })
            .expect("terminal failure");
        assert_eq!(failure.0.timeout_type(), Some(TimeoutType::StartToClose));
        assert_eq!(failure.1, 2);
    }

    #[tokio::test]
    async fn test_timeout_listed_as_non_retryable_fails_terminally() {
        let mut registry = ActivityRegistry::new();
        registry
            .register_fn("slow", |_ctx, input| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(input)
            })
            .unwrap();
        let (store, activities) = setup_with(CallNoTimeoutRetry::TYPE, "slow", registry).await;

        let outcome = activities.execute(claim(&store, "slow").await).await.unwrap();
        assert_eq!(outcome, ActivityOutcome::Recorded);
        assert_eq!(store.task_count(), 1, "only the workflow task remains");

        let instance = store.current_run("wf-1").await.unwrap();
        let attempts = store
            .read_events(&instance, 1)
            .await
            .unwrap()
            .iter()
            .find_map(|e| match &e.event {
                WorkflowEvent::ActivityFailed { error, attempts, .. } => {
                    assert_eq!(error.timeout_type(), Some(TimeoutType::StartToClose));
                    Some(*attempts)
                }
                _ => None,
            });
        assert_eq!(attempts, Some(1));
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let mut registry = ActivityRegistry::new();
        registry
            .register_fn("boom", |_ctx, _input| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            })
            .unwrap();
        let (store, activities) = setup("boom", registry).await;

        let outcome = activities.execute(claim(&store, "boom").await).await.unwrap();
        assert_eq!(outcome, ActivityOutcome::RetryScheduled(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_unknown_activity_fails_terminally() {
        let (store, activities) = setup("missing", ActivityRegistry::new()).await;

        let outcome = activities.execute(claim(&store, "missing").await).await.unwrap();
        assert_eq!(outcome, ActivityOutcome::Recorded);
    }

    #[tokio::test]
    async fn test_heartbeat_reaches_store() {
        let mut registry = ActivityRegistry::new();
        registry
            .register_fn("beat", |ctx, _input| async move {
                ctx.heartbeat(Some(json!({"progress": 1}))).await.ok();
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(Value::Null)
            })
            .unwrap();
        let (store, activities) = setup("beat", registry).await;

        let task = claim(&store, "beat").await;
        let task_id = task.id;
        let handle = tokio::spawn({
            let store = store.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                store.heartbeat_details(task_id)
            }
        });
        activities.execute(task).await.unwrap();

        assert_eq!(handle.await.unwrap(), Some(json!({"progress": 1})));
    }
}
