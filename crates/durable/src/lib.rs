//! # Durable Execution Engine
//!
//! An event-sourced workflow engine for reliable, distributed execution of
//! long-running business logic.
//!
//! ## Features
//!
//! - **Event-sourced workflows**: every state change is an event in an append-only history; state is rebuilt by replay
//! - **Deterministic replay**: commands re-emitted by workflow code are checked against history, and divergence fails the run
//! - **Leased task queues**: at-least-once delivery, redelivery after lease expiry, one in-flight workflow task per instance
//! - **Automatic retries**: per-activity retry policies with exponential backoff and jitter
//! - **Heartbeats and timeouts**: start-to-close and heartbeat timeouts, cooperative cancellation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowClient                          │
//! │          (start, signal, query, cancel, result)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │    (replays history, commits commands atomically)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (history log + task queue: in-memory or PostgreSQL)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Worker                               │
//! │  (polls workflow and activity tasks, runs the reaper)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use keel_durable::prelude::*;
//!
//! struct GreetingWorkflow {
//!     name: String,
//! }
//!
//! impl Workflow for GreetingWorkflow {
//!     const TYPE: &'static str = "GreetingWorkflow";
//!     type Input = String;
//!     type Output = String;
//!
//!     fn new(name: String) -> Self {
//!         Self { name }
//!     }
//!
//!     fn on_start(&mut self, ctx: &mut WorkflowContext) {
//!         ctx.schedule::<ComposeGreeting>("compose", &GreetingInput::new("Hello", &self.name));
//!     }
//!
//!     fn on_activity_completed(&mut self, ctx: &mut WorkflowContext, _id: &str, result: Value) {
//!         ctx.complete(&result);
//!     }
//!
//!     fn on_activity_failed(&mut self, ctx: &mut WorkflowContext, _id: &str, error: &ActivityError) {
//!         ctx.fail(error.clone().into());
//!     }
//! }
//! ```

pub mod activity;
pub mod client;
pub mod engine;
pub mod persistence;
pub mod reliability;
mod serde_millis;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
    pub use crate::client::{ClientError, WorkflowClient};
    pub use crate::engine::{
        ExecutorConfig, ExecutorError, StartWorkflowOptions, WorkflowExecutor, WorkflowRegistry,
    };
    pub use crate::persistence::{
        InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StoreError, WorkflowEventStore,
        WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{Worker, WorkerConfig, WorkerError};
    pub use crate::workflow::{
        ActivityOptions, Workflow, WorkflowContext, WorkflowError, WorkflowEvent, WorkflowSignal,
    };
    pub use async_trait::async_trait;
    pub use serde_json::Value;
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
pub use client::{ClientError, WorkflowClient};
pub use engine::{
    ExecutorConfig, ExecutorError, StartWorkflowOptions, WorkflowExecutor, WorkflowRegistry,
};
pub use persistence::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StoreError, WorkflowEventStore,
    WorkflowStatus,
};
pub use reliability::RetryPolicy;
pub use worker::{Worker, WorkerConfig, WorkerError};
pub use workflow::{
    ActivityOptions, Workflow, WorkflowContext, WorkflowError, WorkflowEvent, WorkflowSignal,
};
