//! Workflow execution engine
//!
//! The engine module provides the `WorkflowExecutor` which drives workflow
//! state machines through history replay, the `MatchingService` that hands
//! tasks to pollers, and the typed `WorkflowRegistry`.

mod executor;
mod matching;
mod registry;
mod replay;

pub use executor::{
    ActivityOutcome, ExecutorConfig, ExecutorError, ProcessResult, StartWorkflowOptions,
    WorkflowExecutor,
};
pub use matching::MatchingService;
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
pub use replay::{replay, NonDeterminismError, Replay, ReplayError, ReplayState, StartedRun};
