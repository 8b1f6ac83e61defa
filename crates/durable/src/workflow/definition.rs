//! Workflow trait definition

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{WorkflowContext, WorkflowSignal};
use crate::activity::ActivityError;

/// Error codes the engine uses when it fails a run on the workflow's behalf
pub mod engine_codes {
    /// History no longer matches what the workflow code emits
    pub const NON_DETERMINISM: &str = "engine.non_determinism";

    /// Workflow input does not deserialize into the registered input type
    pub const INVALID_INPUT: &str = "engine.invalid_input";

    /// Workflow emitted a command that can never be valid (duplicate ids)
    pub const INVALID_COMMAND: &str = "engine.invalid_command";

    /// History grew past the executor's limit
    pub const HISTORY_LIMIT: &str = "engine.history_limit";

    /// Prefix shared by every engine-imposed failure
    pub const PREFIX: &str = "engine.";
}

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    #[serde(default)]
    pub code: Option<String>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Check if the engine, not workflow code, produced this failure
    pub fn is_engine_failure(&self) -> bool {
        self.code
            .as_deref()
            .is_some_and(|code| code.starts_with(engine_codes::PREFIX))
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

impl From<ActivityError> for WorkflowError {
    fn from(error: ActivityError) -> Self {
        let code = error.error_type.clone();
        Self {
            message: error.message,
            code,
        }
    }
}

/// A workflow is a deterministic state machine driven by history events
///
/// Each handler receives the explicit [`WorkflowContext`] and records
/// commands on it: schedule an activity, start a timer, complete, fail,
/// continue as new. Handlers run again on every replay, so they must be
/// deterministic: given the same events in the same order they must record
/// the same commands. Use `ctx.now()` instead of the system clock, and keep
/// I/O inside activities.
///
/// # Example
///
/// ```ignore
/// use keel_durable::prelude::*;
///
/// struct GreetingWorkflow {
///     name: String,
/// }
///
/// impl Workflow for GreetingWorkflow {
///     const TYPE: &'static str = "GreetingWorkflow";
///     type Input = String;
///     type Output = String;
///
///     fn new(name: Self::Input) -> Self {
///         Self { name }
///     }
///
///     fn on_start(&mut self, ctx: &mut WorkflowContext) {
///         ctx.schedule::<ComposeGreeting>(
///             "compose",
///             &GreetingInput { greeting: "Hello".into(), name: self.name.clone() },
///         );
///     }
///
///     fn on_activity_completed(&mut self, ctx: &mut WorkflowContext, _id: &str, result: Value) {
///         ctx.complete(&result);
///     }
///
///     fn on_activity_failed(&mut self, ctx: &mut WorkflowContext, _id: &str, error: &ActivityError) {
///         ctx.fail(error.clone().into());
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier, used to look the workflow up during replay
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type when the workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Create a workflow instance from input
    ///
    /// Called for every replay, not just the first execution.
    fn new(input: Self::Input) -> Self;

    /// Called for the `WorkflowStarted` event
    fn on_start(&mut self, ctx: &mut WorkflowContext);

    /// Called when an activity completes successfully
    fn on_activity_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        result: serde_json::Value,
    );

    /// Called when an activity fails terminally (retries exhausted or non-retryable)
    fn on_activity_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    );

    /// Called when a timer fires
    fn on_timer_fired(&mut self, ctx: &mut WorkflowContext, timer_id: &str) {
        let _ = (ctx, timer_id);
    }

    /// Called when an external signal is received
    fn on_signal(&mut self, ctx: &mut WorkflowContext, signal: &WorkflowSignal) {
        let _ = (ctx, signal);
    }

    /// Called when a client requests cancellation
    ///
    /// The default stops the workflow right away. Override to clean up first
    /// (for example by scheduling a compensating activity) and call
    /// `ctx.cancel` later.
    fn on_cancel_requested(&mut self, ctx: &mut WorkflowContext, reason: &str) {
        ctx.cancel(reason);
    }

    /// Answer a read-only query against the replayed state
    ///
    /// Returns `None` for unknown query names.
    fn query(&self, name: &str, args: &serde_json::Value) -> Option<serde_json::Value> {
        let _ = (name, args);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        let error = WorkflowError::new("something went wrong");
        assert_eq!(error.to_string(), "something went wrong");
    }

    #[test]
    fn test_workflow_error_with_code() {
        let error = WorkflowError::new("not found").with_code("NOT_FOUND");
        assert_eq!(error.code, Some("NOT_FOUND".to_string()));
        assert!(!error.is_engine_failure());
    }

    #[test]
    fn test_engine_failure_detection() {
        let error = WorkflowError::new("history diverged").with_code(engine_codes::NON_DETERMINISM);
        assert!(error.is_engine_failure());
        assert!(!WorkflowError::new("plain").is_engine_failure());
    }

    #[test]
    fn test_from_activity_error() {
        let error: WorkflowError = ActivityError::non_retryable("card declined")
            .with_type("payment")
            .into();

        assert_eq!(error.message, "card declined");
        assert_eq!(error.code.as_deref(), Some("payment"));
    }
}
