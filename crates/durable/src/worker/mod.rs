//! Worker runtime
//!
//! This module provides:
//! - [`Worker`] - stateless worker with workflow and activity poll loops
//! - [`ActivityExecutor`] - runs one activity attempt with timeout, heartbeats and panic capture
//! - [`ConcurrencyLimiter`] - per-loop bound on in-flight tasks
//! - [`PollerConfig`] - long-poll length and error backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Worker                              │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌────────────┐  │
//! │  │ workflow poller  │  │ activity poller  │  │ housekeep  │  │
//! │  │ (workflow+timer) │  │                  │  │ reap/purge │  │
//! │  └────────┬─────────┘  └────────┬─────────┘  └────────────┘  │
//! │           ▼                     ▼                            │
//! │  ┌──────────────────┐  ┌──────────────────┐                  │
//! │  │ limiter (N wf)   │  │ limiter (M act)  │                  │
//! │  └────────┬─────────┘  └────────┬─────────┘                  │
//! │           ▼                     ▼                            │
//! │  WorkflowExecutor         ActivityExecutor                   │
//! │  (replay + commit)        (run + report)                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod activity;
mod limiter;
mod poller;
#[allow(clippy::module_inception)]
mod worker;

pub use activity::{ActivityExecutor, UNKNOWN_ACTIVITY_ERROR};
pub use limiter::{ConcurrencyLimiter, SlotGuard};
pub use poller::{ErrorBackoff, PollerConfig};
pub use worker::{Worker, WorkerConfig, WorkerError, WorkerStatus};
