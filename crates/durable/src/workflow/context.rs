//! Explicit context handed to workflow code

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::{ActivityOptions, WorkflowCommand, WorkflowError};
use crate::activity::Activity;
use crate::persistence::InstanceId;

/// Per-replay context passed to every [`Workflow`](super::Workflow) handler
///
/// Workflow code never touches the store. It records intent here; the
/// engine matches the recorded commands against history and persists the
/// new ones. `now()` is the timestamp of the event being applied, so it is
/// stable across replays.
#[derive(Debug)]
pub struct WorkflowContext {
    instance: InstanceId,
    workflow_type: String,
    now: DateTime<Utc>,
    replaying: bool,
    commands: Vec<WorkflowCommand>,
}

impl WorkflowContext {
    pub fn new(instance: InstanceId, workflow_type: impl Into<String>) -> Self {
        Self {
            instance,
            workflow_type: workflow_type.into(),
            now: Utc::now(),
            replaying: false,
            commands: Vec::new(),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.instance.workflow_id
    }

    pub fn run_id(&self) -> Uuid {
        self.instance.run_id
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// Deterministic clock: the append time of the event being handled
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// True while handling events that were already recorded before this task
    ///
    /// Useful to suppress duplicate logging; never branch business logic on it.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// Schedule an activity by type name with explicit options
    pub fn schedule_activity(
        &mut self,
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: Value,
        options: ActivityOptions,
    ) {
        self.commands.push(WorkflowCommand::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        });
    }

    /// Schedule a typed activity with default options
    pub fn schedule<A: Activity>(&mut self, activity_id: impl Into<String>, input: &A::Input) {
        self.schedule_with::<A>(activity_id, input, ActivityOptions::default());
    }

    /// Schedule a typed activity with explicit options
    pub fn schedule_with<A: Activity>(
        &mut self,
        activity_id: impl Into<String>,
        input: &A::Input,
        options: ActivityOptions,
    ) {
        if let Some(input) = self.to_json(input, "activity input") {
            self.schedule_activity(activity_id, A::TYPE, input, options);
        }
    }

    pub fn start_timer(&mut self, timer_id: impl Into<String>, duration: Duration) {
        self.commands.push(WorkflowCommand::timer(timer_id, duration));
    }

    /// Cancel a pending timer; ignored if it already fired
    pub fn cancel_timer(&mut self, timer_id: impl Into<String>) {
        self.commands.push(WorkflowCommand::CancelTimer {
            timer_id: timer_id.into(),
        });
    }

    /// Ask a running activity to stop; it observes this through its heartbeats
    pub fn request_cancel_activity(&mut self, activity_id: impl Into<String>) {
        self.commands.push(WorkflowCommand::RequestCancelActivity {
            activity_id: activity_id.into(),
        });
    }

    /// Complete the workflow with a result
    pub fn complete<T: Serialize>(&mut self, result: &T) {
        if let Some(result) = self.to_json(result, "workflow result") {
            self.commands.push(WorkflowCommand::complete(result));
        }
    }

    pub fn fail(&mut self, error: WorkflowError) {
        self.commands.push(WorkflowCommand::fail(error));
    }

    /// Acknowledge a cancellation request and close the run as cancelled
    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.commands.push(WorkflowCommand::CancelWorkflow {
            reason: reason.into(),
        });
    }

    /// Close this run and start a new one under the same workflow id
    pub fn continue_as_new<T: Serialize>(&mut self, input: &T) {
        if let Some(input) = self.to_json(input, "continue-as-new input") {
            self.commands.push(WorkflowCommand::ContinueAsNew { input });
        }
    }

    /// Commands recorded by the current handler so far
    pub fn pending_commands(&self) -> &[WorkflowCommand] {
        &self.commands
    }

    pub(crate) fn set_position(&mut self, now: DateTime<Utc>, replaying: bool) {
        self.now = now;
        self.replaying = replaying;
    }

    pub(crate) fn take_commands(&mut self) -> Vec<WorkflowCommand> {
        std::mem::take(&mut self.commands)
    }

    // Serialization failures fail the workflow instead of panicking in user code.
    fn to_json<T: Serialize>(&mut self, value: &T, what: &str) -> Option<Value> {
        match serde_json::to_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                self.commands.push(WorkflowCommand::fail(
                    WorkflowError::new(format!("failed to serialize {what}: {e}"))
                        .with_code("serialization"),
                ));
                None
            }
        }
    }
}
