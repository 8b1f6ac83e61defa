//! Client API: start, signal, query, cancel and await workflows

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::instrument;
use uuid::Uuid;

use crate::engine::{ExecutorError, StartWorkflowOptions, WorkflowExecutor};
use crate::persistence::{WorkflowEventStore, WorkflowInfo, WorkflowStatus};
use crate::workflow::{HistoryEvent, Workflow, WorkflowError};

/// Errors returned to client callers
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Run closed as failed
    #[error("workflow failed: {0}")]
    Failed(WorkflowError),

    #[error("workflow cancelled")]
    Cancelled,

    #[error("workflow timed out")]
    TimedOut,

    /// Run was still open when the wait ended
    #[error("workflow {0} did not finish in time")]
    WaitTimeout(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Front door for applications
///
/// ```ignore
/// let client = WorkflowClient::new(worker.executor().clone());
/// client
///     .start::<GreetingWorkflow>("greet-1", &"Temporal".to_string(), StartWorkflowOptions::new("greetings"))
///     .await?;
/// let greeting = client.result::<GreetingWorkflow>("greet-1", Duration::from_secs(30)).await?;
/// ```
pub struct WorkflowClient<S: WorkflowEventStore + ?Sized = dyn WorkflowEventStore> {
    executor: Arc<WorkflowExecutor<S>>,
    poll_interval: Duration,
}

impl<S: WorkflowEventStore + ?Sized> Clone for WorkflowClient<S> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

impl<S: WorkflowEventStore + ?Sized> WorkflowClient<S> {
    pub fn new(executor: Arc<WorkflowExecutor<S>>) -> Self {
        Self {
            executor,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// How often `result` checks the run while waiting
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Start a typed workflow
    pub async fn start<W: Workflow>(
        &self,
        workflow_id: &str,
        input: &W::Input,
        options: StartWorkflowOptions,
    ) -> Result<Uuid, ClientError> {
        let input = serde_json::to_value(input)?;
        self.start_untyped(W::TYPE, workflow_id, input, options).await
    }

    pub async fn start_untyped(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        input: Value,
        options: StartWorkflowOptions,
    ) -> Result<Uuid, ClientError> {
        Ok(self
            .executor
            .start_workflow(workflow_type, workflow_id, input, options)
            .await?)
    }

    pub async fn signal<T: Serialize>(
        &self,
        workflow_id: &str,
        name: &str,
        payload: &T,
    ) -> Result<(), ClientError> {
        let payload = serde_json::to_value(payload)?;
        Ok(self.executor.signal_workflow(workflow_id, name, payload).await?)
    }

    /// Query the current run's replayed state
    pub async fn query<T: DeserializeOwned>(
        &self,
        workflow_id: &str,
        name: &str,
        args: &Value,
    ) -> Result<T, ClientError> {
        let value = self.executor.query_workflow(workflow_id, name, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn cancel(&self, workflow_id: &str, reason: &str) -> Result<(), ClientError> {
        Ok(self.executor.cancel_workflow(workflow_id, reason).await?)
    }

    pub async fn describe(&self, workflow_id: &str) -> Result<WorkflowInfo, ClientError> {
        Ok(self.executor.describe(workflow_id).await?)
    }

    pub async fn history(&self, workflow_id: &str) -> Result<Vec<HistoryEvent>, ClientError> {
        Ok(self.executor.history(workflow_id).await?)
    }

    /// Wait for a typed workflow's final result
    pub async fn result<W: Workflow>(
        &self,
        workflow_id: &str,
        wait: Duration,
    ) -> Result<W::Output, ClientError> {
        let value = self.result_json(workflow_id, wait).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Wait for the workflow to close and return its result
    ///
    /// Follows continue-as-new: a run that continued is not final, so the
    /// wait goes on with the workflow id's newest run.
    #[instrument(skip(self))]
    pub async fn result_json(&self, workflow_id: &str, wait: Duration) -> Result<Value, ClientError> {
        let deadline = Instant::now() + wait;

        loop {
            let info = self.executor.describe(workflow_id).await?;
            match info.status {
                WorkflowStatus::Completed => return Ok(info.result.unwrap_or(Value::Null)),
                WorkflowStatus::Failed => {
                    return Err(ClientError::Failed(
                        info.error
                            .unwrap_or_else(|| WorkflowError::new("workflow failed")),
                    ))
                }
                WorkflowStatus::Cancelled => return Err(ClientError::Cancelled),
                WorkflowStatus::TimedOut => return Err(ClientError::TimedOut),
                WorkflowStatus::Running | WorkflowStatus::ContinuedAsNew => {}
            }

            if Instant::now() >= deadline {
                return Err(ClientError::WaitTimeout(workflow_id.to_string()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WorkflowRegistry;
    use crate::persistence::InMemoryWorkflowEventStore;
    use crate::workflow::WorkflowContext;
    use crate::ActivityError;
    use serde_json::json;

    /// Completes immediately with its input
    struct Echo;

    impl Workflow for Echo {
        const TYPE: &'static str = "echo";
        type Input = String;
        type Output = String;

        fn new(_: String) -> Self {
            Self
        }

        fn on_start(&mut self, _: &mut WorkflowContext) {}

        fn on_activity_completed(&mut self, _: &mut WorkflowContext, _: &str, _: Value) {}

        fn on_activity_failed(&mut self, _: &mut WorkflowContext, _: &str, _: &ActivityError) {}

        fn query(&self, name: &str, _: &Value) -> Option<Value> {
            (name == "ping").then(|| json!("pong"))
        }
    }

    fn client() -> WorkflowClient<InMemoryWorkflowEventStore> {
        let mut registry = WorkflowRegistry::new();
        registry.register::<Echo>().unwrap();
        let executor = WorkflowExecutor::new(Arc::new(InMemoryWorkflowEventStore::new()), registry);
        WorkflowClient::new(Arc::new(executor)).with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_start_and_describe() {
        let client = client();
        let run_id = client
            .start::<Echo>("e-1", &"hi".to_string(), StartWorkflowOptions::new("q"))
            .await
            .unwrap();

        let info = client.describe("e-1").await.unwrap();
        assert_eq!(info.instance.run_id, run_id);
        assert_eq!(info.status, WorkflowStatus::Running);
        assert_eq!(info.input, json!("hi"));
        assert_eq!(client.history("e-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_query_replays_without_writing() {
        let client = client();
        client
            .start::<Echo>("e-1", &"hi".to_string(), StartWorkflowOptions::new("q"))
            .await
            .unwrap();

        let answer: String = client.query("e-1", "ping", &Value::Null).await.unwrap();
        assert_eq!(answer, "pong");
        assert_eq!(client.history("e-1").await.unwrap().len(), 1);

        let unknown = client.query::<String>("e-1", "nope", &Value::Null).await;
        assert!(matches!(
            unknown,
            Err(ClientError::Executor(ExecutorError::UnknownQuery(_)))
        ));
    }

    #[tokio::test]
    async fn test_result_wait_times_out() {
        let client = client();
        client
            .start::<Echo>("e-1", &"hi".to_string(), StartWorkflowOptions::new("q"))
            .await
            .unwrap();

        let result = client.result::<Echo>("e-1", Duration::from_millis(30)).await;
        assert!(matches!(result, Err(ClientError::WaitTimeout(id)) if id == "e-1"));
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let client = client();
        let result = client.describe("missing").await;
        assert!(matches!(
            result,
            Err(ClientError::Executor(ExecutorError::WorkflowNotFound(_)))
        ));
    }
}
