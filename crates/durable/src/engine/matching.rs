//! Matching: hands queued tasks to long-polling workers
//!
//! Claims go through the store, which enforces leases and the one in-flight
//! workflow task per instance rule. This layer adds the long poll.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

use crate::persistence::{ClaimedTask, HeartbeatResponse, PollRequest, StoreError, WorkflowEventStore};

/// Longest single wait between claim attempts
///
/// Bounds how late a poller notices a task that became visible by time
/// (retry delays, timers) rather than by an enqueue notification.
const WAIT_SLICE: Duration = Duration::from_millis(100);

pub struct MatchingService<S: WorkflowEventStore + ?Sized = dyn WorkflowEventStore> {
    store: Arc<S>,
}

impl<S: WorkflowEventStore + ?Sized> MatchingService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Long-poll for a task matching `request`
    ///
    /// Returns `Ok(None)` when `timeout` elapses or `shutdown` fires first.
    pub async fn poll(
        &self,
        request: &PollRequest,
        timeout: Duration,
        shutdown: &CancellationToken,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        let deadline = Instant::now() + timeout;

        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }
            if let Some(task) = self.store.claim_task(request).await? {
                trace!(task_id = %task.id, kind = task.kind().as_str(), "matched task");
                return Ok(Some(task));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = self.store.wait_for_task(&request.task_queue, remaining.min(WAIT_SLICE)) => {}
            }
        }
    }

    pub async fn heartbeat(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError> {
        self.store.heartbeat_task(task_id, lease_token, details).await
    }

    pub async fn extend_lease(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        extension: Duration,
    ) -> Result<DateTime<Utc>, StoreError> {
        self.store.extend_lease(task_id, lease_token, extension).await
    }
}
