//! Activity execution context

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::persistence::InstanceId;

/// Payload sent with heartbeats
#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    /// Optional progress details
    pub details: Option<serde_json::Value>,
}

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Heartbeat channel closed (the attempt already finished or timed out)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    /// Cancellation was requested for this activity
    #[error("activity was cancelled")]
    Cancelled,
}

/// Context provided to activities during execution
///
/// Carries the attempt being executed, a heartbeat channel that the worker
/// forwards to the task queue, and a cancellation token that fires when the
/// owning workflow asks for this activity to stop or the lease is lost.
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     for i in 0..100 {
///         if ctx.is_cancelled() {
///             return Err(ActivityError::non_retryable("cancelled"));
///         }
///
///         do_work(i).await?;
///
///         ctx.heartbeat(Some(json!({"progress": i}))).await?;
///     }
///
///     Ok(Output { ... })
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Queue task carrying this attempt
    pub task_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed by the retry policy
    pub max_attempts: u32,

    /// Workflow instance that scheduled this activity
    pub instance: InstanceId,

    /// Activity ID within the workflow
    pub activity_id: String,

    heartbeat_tx: Option<mpsc::Sender<HeartbeatPayload>>,

    cancellation: CancellationToken,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        instance: InstanceId,
        activity_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            task_id: Uuid::nil(),
            attempt,
            max_attempts,
            instance,
            activity_id: activity_id.into(),
            heartbeat_tx: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_task_id(mut self, task_id: Uuid) -> Self {
        self.task_id = task_id;
        self
    }

    /// Create a context with heartbeat support
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Token that cancels this activity when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Record a heartbeat
    ///
    /// Heartbeats push the heartbeat deadline forward and carry optional
    /// progress details.
    ///
    /// # Errors
    ///
    /// Returns an error if the activity has been cancelled or the
    /// heartbeat channel is closed.
    pub async fn heartbeat(
        &self,
        details: Option<serde_json::Value>,
    ) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(HeartbeatPayload { details })
                .await
                .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => {
    ///         return Err(ActivityError::non_retryable("cancelled"));
    ///     }
    /// }
    /// ```
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
