//! Workflow abstractions and types
//!
//! - [`Workflow`] trait for defining deterministic workflow state machines
//! - [`WorkflowContext`] handed to every handler to record commands
//! - [`WorkflowCommand`] enum for what workflow code asks the engine to do
//! - [`WorkflowEvent`] / [`HistoryEvent`] for persisted history
//! - [`WorkflowSignal`] for external communication

mod command;
mod context;
mod definition;
mod event;
mod signal;

pub use command::{ActivityOptions, WorkflowCommand};
pub use context::WorkflowContext;
pub use definition::{engine_codes, Workflow, WorkflowError};
pub use event::{HistoryEvent, TimeoutType, WorkflowEvent};
pub use signal::WorkflowSignal;
