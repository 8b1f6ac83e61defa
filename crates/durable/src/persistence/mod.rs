//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`HistoryLog`] and [`TaskQueue`], the two storage contracts
//! - [`WorkflowEventStore`], the full store the engine runs against
//! - [`InMemoryWorkflowEventStore`] for tests and single-process runs
//! - [`PostgresWorkflowEventStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use postgres::PostgresWorkflowEventStore;
pub use store::{
    activity_lease, ActivityInvocation, ClaimedTask, CommitResult, ExpiredTask, ExpiryReason, HeartbeatResponse,
    HistoryCommit, HistoryLog, InstanceClose, InstanceId, NewInstance, PollRequest, StoreError,
    TaskAck, TaskDefinition, TaskKind, TaskPayload, TaskQueue, WorkerInfo, WorkflowEventStore,
    WorkflowInfo, WorkflowStatus, ACTIVITY_LEASE_GRACE_MAX, EXECUTION_TIMEOUT_TIMER_ID,
};
pub(crate) use store::chrono_duration;
