//! Workflow registry for type-erased workflow creation
//!
//! The registry maps workflow type names to factories that build workflow
//! instances from JSON input, so the replayer can drive a run knowing only
//! the type name stored in its `WorkflowStarted` event.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::activity::ActivityError;
use crate::workflow::{Workflow, WorkflowContext, WorkflowSignal};

/// Type-erased workflow interface
///
/// Mirrors [`Workflow`] with JSON at the boundaries.
pub trait AnyWorkflow: Send {
    fn workflow_type(&self) -> &'static str;

    fn on_start(&mut self, ctx: &mut WorkflowContext);

    fn on_activity_completed(&mut self, ctx: &mut WorkflowContext, activity_id: &str, result: Value);

    fn on_activity_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    );

    fn on_timer_fired(&mut self, ctx: &mut WorkflowContext, timer_id: &str);

    fn on_signal(&mut self, ctx: &mut WorkflowContext, signal: &WorkflowSignal);

    fn on_cancel_requested(&mut self, ctx: &mut WorkflowContext, reason: &str);

    fn query(&self, name: &str, args: &Value) -> Option<Value>;
}

/// Wrapper to implement AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn on_start(&mut self, ctx: &mut WorkflowContext) {
        self.inner.on_start(ctx)
    }

    fn on_activity_completed(&mut self, ctx: &mut WorkflowContext, activity_id: &str, result: Value) {
        self.inner.on_activity_completed(ctx, activity_id, result)
    }

    fn on_activity_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) {
        self.inner.on_activity_failed(ctx, activity_id, error)
    }

    fn on_timer_fired(&mut self, ctx: &mut WorkflowContext, timer_id: &str) {
        self.inner.on_timer_fired(ctx, timer_id)
    }

    fn on_signal(&mut self, ctx: &mut WorkflowContext, signal: &WorkflowSignal) {
        self.inner.on_signal(ctx, signal)
    }

    fn on_cancel_requested(&mut self, ctx: &mut WorkflowContext, reason: &str) {
        self.inner.on_cancel_requested(ctx, reason)
    }

    fn query(&self, name: &str, args: &Value) -> Option<Value> {
        self.inner.query(name, args)
    }
}

/// Factory function type for creating workflows from JSON input
pub type WorkflowFactory =
    Arc<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

/// Registry of workflow factories
///
/// Registration happens once at startup; duplicates are rejected there so a
/// misconfigured worker never starts polling.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow type
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register::<GreetingWorkflow>()?;
    /// ```
    pub fn register<W: Workflow>(&mut self) -> Result<(), RegistryError> {
        if self.factories.contains_key(W::TYPE) {
            return Err(RegistryError::DuplicateWorkflowType(W::TYPE.to_string()));
        }

        let factory: WorkflowFactory = Arc::new(|input: Value| {
            let typed_input: W::Input = serde_json::from_value(input)?;
            let workflow = W::new(typed_input);
            Ok(Box::new(WorkflowWrapper { inner: workflow }) as Box<dyn AnyWorkflow>)
        });

        self.factories.insert(W::TYPE.to_string(), factory);
        Ok(())
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Create a workflow instance from type name and JSON input
    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;

        factory(input).map_err(RegistryError::Deserialization)
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Registered workflow type names, sorted
    pub fn workflow_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.workflow_types())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("workflow type registered twice: {0}")]
    DuplicateWorkflowType(String),

    #[error("activity type registered twice: {0}")]
    DuplicateActivityType(String),

    /// Failed to deserialize workflow input
    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// A worker was configured without anything to run
    #[error("no workflow or activity types registered")]
    Empty,
}
